//! Attachment extraction — turns mailbox threads into a deduplicated image batch.

use std::collections::HashSet;

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::MailboxError;
use crate::mailbox::{Mailbox, MailboxConnector, MailMessage, MessagePart};
use crate::model::ImageAttachment;

/// URL-safe alphabet, padding optional.
const ATTACHMENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Provider search query for everything received since the day before `since`.
///
/// The provider only filters by day, so results still need the precise
/// timestamp check in [`AttachmentExtractor::extract`].
pub fn search_query(since: DateTime<Utc>) -> String {
    let day = since - Duration::days(1);
    format!("after:{}", day.format("%Y/%m/%d"))
}

/// Decode attachment data, accepting both URL-safe and standard alphabets.
pub fn decode_attachment_data(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let normalized: String = encoded
        .trim()
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    ATTACHMENT_BASE64.decode(normalized)
}

/// Pulls image attachments newer than a watermark out of a mailbox.
pub struct AttachmentExtractor<C> {
    connector: C,
}

impl<C: MailboxConnector> AttachmentExtractor<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Every attachment on messages received strictly after `since`.
    ///
    /// Opens a fresh session for the call. Mailbox errors abort the whole
    /// extraction; an undecodable attachment is skipped.
    pub async fn extract(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashSet<ImageAttachment>, MailboxError> {
        let session = self.connector.open_session().await?;
        let query = search_query(since);
        info!(%since, query = %query, "Searching mailbox");

        // Pass 1: list every matching thread before fetching any of them.
        let mut thread_ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = session.list_threads(&query, page_token.as_deref()).await?;
            thread_ids.extend(page.thread_ids);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        debug!(threads = thread_ids.len(), "Thread listing complete");

        // Pass 2: fetch threads and collect attachments.
        let mut attachments = HashSet::new();
        for thread_id in &thread_ids {
            let thread = session.get_thread(thread_id).await?;
            for message in &thread.messages {
                if message.internal_date <= since {
                    continue;
                }
                collect_message(&session, message, &mut attachments).await?;
            }
        }

        info!(
            threads = thread_ids.len(),
            attachments = attachments.len(),
            "Attachment extraction complete"
        );
        Ok(attachments)
    }
}

async fn collect_message<M: Mailbox>(
    session: &M,
    message: &MailMessage,
    out: &mut HashSet<ImageAttachment>,
) -> Result<(), MailboxError> {
    for part in message.parts.iter().filter(|p| p.is_attachment()) {
        let Some(encoded) = part_body(session, &message.id, part).await? else {
            debug!(message_id = %message.id, filename = %part.filename, "Attachment part has no body");
            continue;
        };

        match decode_attachment_data(&encoded) {
            Ok(data) => {
                out.insert(ImageAttachment::new(
                    &message.id,
                    &part.filename,
                    data,
                    message.internal_date,
                ));
            }
            Err(e) => {
                let err = MailboxError::AttachmentDecode {
                    message_id: message.id.clone(),
                    attachment_id: part.filename.clone(),
                    reason: e.to_string(),
                };
                warn!(error = %err, "Skipping attachment");
            }
        }
    }
    Ok(())
}

async fn part_body<M: Mailbox>(
    session: &M,
    message_id: &str,
    part: &MessagePart,
) -> Result<Option<String>, MailboxError> {
    if let Some(attachment_id) = &part.attachment_id {
        return session
            .get_attachment(message_id, attachment_id)
            .await
            .map(Some);
    }
    Ok(part.inline_data.clone())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::mailbox::{MailThread, ThreadPage};

    #[derive(Default)]
    struct FakeMailbox {
        pages: Vec<ThreadPage>,
        threads: HashMap<String, MailThread>,
        attachments: HashMap<(String, String), String>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Mailbox for Arc<FakeMailbox> {
        async fn list_threads(
            &self,
            query: &str,
            page_token: Option<&str>,
        ) -> Result<ThreadPage, MailboxError> {
            self.calls.lock().unwrap().push(format!("list {query} {page_token:?}"));
            let idx = page_token.map(|t| t.parse::<usize>().unwrap()).unwrap_or(0);
            Ok(self.pages[idx].clone())
        }

        async fn get_thread(&self, thread_id: &str) -> Result<MailThread, MailboxError> {
            self.calls.lock().unwrap().push(format!("thread {thread_id}"));
            self.threads
                .get(thread_id)
                .cloned()
                .ok_or_else(|| MailboxError::InvalidResponse {
                    reason: format!("no thread {thread_id}"),
                })
        }

        async fn get_attachment(
            &self,
            message_id: &str,
            attachment_id: &str,
        ) -> Result<String, MailboxError> {
            self.attachments
                .get(&(message_id.to_string(), attachment_id.to_string()))
                .cloned()
                .ok_or_else(|| MailboxError::Transient {
                    reason: "attachment unavailable".into(),
                })
        }
    }

    struct FakeConnector(Arc<FakeMailbox>);

    #[async_trait]
    impl MailboxConnector for FakeConnector {
        type Session = Arc<FakeMailbox>;

        async fn open_session(&self) -> Result<Self::Session, MailboxError> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    fn part(filename: &str, attachment_id: &str) -> MessagePart {
        MessagePart {
            filename: filename.into(),
            attachment_id: Some(attachment_id.into()),
            inline_data: None,
        }
    }

    fn message(id: &str, date: DateTime<Utc>, parts: Vec<MessagePart>) -> MailMessage {
        MailMessage {
            id: id.into(),
            internal_date: date,
            parts,
        }
    }

    fn single_thread(messages: Vec<MailMessage>) -> FakeMailbox {
        let mut mailbox = FakeMailbox {
            pages: vec![ThreadPage {
                thread_ids: vec!["t1".into()],
                next_page_token: None,
            }],
            ..Default::default()
        };
        mailbox.threads.insert(
            "t1".into(),
            MailThread {
                id: "t1".into(),
                messages,
            },
        );
        mailbox
    }

    #[test]
    fn search_query_backs_off_one_day() {
        assert_eq!(search_query(at(2, 0)), "after:2024/01/01");
        assert_eq!(
            search_query(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            "after:2024/02/29"
        );
    }

    #[test]
    fn decodes_url_safe_and_standard_alphabets() {
        let bytes = vec![0xFB, 0xFF, 0xBF];
        assert_eq!(decode_attachment_data("-_-_").unwrap(), bytes);
        assert_eq!(decode_attachment_data("+/+/").unwrap(), bytes);
    }

    #[test]
    fn decodes_with_or_without_padding() {
        assert_eq!(decode_attachment_data("aGk=").unwrap(), b"hi");
        assert_eq!(decode_attachment_data("aGk").unwrap(), b"hi");
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_attachment_data("not base64!!").is_err());
    }

    #[tokio::test]
    async fn duplicate_message_filename_pairs_collapse() {
        let mut mailbox = single_thread(vec![
            message("m1", at(2, 10), vec![part("a.jpg", "att1")]),
            message("m1", at(2, 10), vec![part("a.jpg", "att1")]),
        ]);
        mailbox
            .attachments
            .insert(("m1".into(), "att1".into()), "aGk".into());

        let extractor = AttachmentExtractor::new(FakeConnector(Arc::new(mailbox)));
        let found = extractor.extract(at(1, 0)).await.unwrap();

        assert_eq!(found.len(), 1);
        let only = found.iter().next().unwrap();
        assert_eq!(only.id, "m1a.jpg");
        assert_eq!(only.data, b"hi");
    }

    #[tokio::test]
    async fn messages_at_or_before_watermark_are_skipped() {
        let watermark = at(2, 10);
        let mut mailbox = single_thread(vec![
            message("old", at(2, 9), vec![part("a.jpg", "x")]),
            message("same", watermark, vec![part("a.jpg", "x")]),
            message("new", at(2, 11), vec![part("a.jpg", "x")]),
        ]);
        for id in ["old", "same", "new"] {
            mailbox
                .attachments
                .insert((id.into(), "x".into()), "aGk".into());
        }

        let extractor = AttachmentExtractor::new(FakeConnector(Arc::new(mailbox)));
        let found = extractor.extract(watermark).await.unwrap();

        let ids: Vec<_> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["newa.jpg"]);
    }

    #[tokio::test]
    async fn parts_without_filename_are_ignored() {
        let mut mailbox = single_thread(vec![message(
            "m1",
            at(2, 10),
            vec![
                MessagePart {
                    filename: String::new(),
                    attachment_id: None,
                    inline_data: Some("aGk".into()),
                },
                MessagePart {
                    filename: "inline.jpg".into(),
                    attachment_id: None,
                    inline_data: Some("aGk".into()),
                },
            ],
        )]);
        mailbox.attachments.clear();

        let extractor = AttachmentExtractor::new(FakeConnector(Arc::new(mailbox)));
        let found = extractor.extract(at(1, 0)).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found.iter().next().unwrap().id, "m1inline.jpg");
    }

    #[tokio::test]
    async fn listing_finishes_before_any_thread_fetch() {
        let mut mailbox = FakeMailbox {
            pages: vec![
                ThreadPage {
                    thread_ids: vec!["t1".into()],
                    next_page_token: Some("1".into()),
                },
                ThreadPage {
                    thread_ids: vec!["t2".into()],
                    next_page_token: None,
                },
            ],
            ..Default::default()
        };
        for id in ["t1", "t2"] {
            mailbox.threads.insert(
                id.into(),
                MailThread {
                    id: id.into(),
                    messages: Vec::new(),
                },
            );
        }
        let mailbox = Arc::new(mailbox);
        let calls = Arc::clone(&mailbox.calls);

        let extractor = AttachmentExtractor::new(FakeConnector(mailbox));
        let found = extractor.extract(at(2, 0)).await.unwrap();
        assert!(found.is_empty());

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "list after:2024/01/01 None",
                "list after:2024/01/01 Some(\"1\")",
                "thread t1",
                "thread t2",
            ]
        );
    }

    #[tokio::test]
    async fn transient_error_aborts_extraction() {
        let mailbox = single_thread(vec![message("m1", at(2, 10), vec![part("a.jpg", "gone")])]);

        let extractor = AttachmentExtractor::new(FakeConnector(Arc::new(mailbox)));
        let err = extractor.extract(at(1, 0)).await.unwrap_err();
        assert!(matches!(err, MailboxError::Transient { .. }));
    }
}
