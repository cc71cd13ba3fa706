//! Mailbox access — provider traits, the Gmail implementation, and attachment extraction.

pub mod extractor;
pub mod gmail;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailboxError;

pub use extractor::AttachmentExtractor;
pub use gmail::{GmailConfig, GmailConnector};

/// One page of thread ids from a search.
#[derive(Debug, Clone, Default)]
pub struct ThreadPage {
    pub thread_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailThread {
    pub id: String,
    pub messages: Vec<MailMessage>,
}

#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    /// Provider-assigned receive time; used as the image capture time.
    pub internal_date: DateTime<Utc>,
    /// Leaf parts of the message, already flattened.
    pub parts: Vec<MessagePart>,
}

/// A leaf MIME part. Only parts with a non-empty filename are attachments.
#[derive(Debug, Clone, Default)]
pub struct MessagePart {
    pub filename: String,
    /// Set when the body must be fetched separately.
    pub attachment_id: Option<String>,
    /// URL-safe base64 body, when the provider returned it inline.
    pub inline_data: Option<String>,
}

impl MessagePart {
    pub fn is_attachment(&self) -> bool {
        !self.filename.is_empty()
    }
}

/// An authenticated mailbox session.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Search threads matching `query`, one page at a time.
    async fn list_threads(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, MailboxError>;

    async fn get_thread(&self, thread_id: &str) -> Result<MailThread, MailboxError>;

    /// Attachment body as URL-safe base64.
    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<String, MailboxError>;
}

/// Opens mailbox sessions. Each extraction run owns its session and drops it when done.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    type Session: Mailbox;

    async fn open_session(&self) -> Result<Self::Session, MailboxError>;
}
