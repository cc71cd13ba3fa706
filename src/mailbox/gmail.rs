//! Gmail REST mailbox.
//!
//! Sessions authenticate with an OAuth2 access token. Unattended runs exchange
//! a stored refresh token; without one, an operator at a terminal can grant
//! consent once and store the refresh token that comes back.

use std::io::IsTerminal;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};

use crate::error::{ConfigError, MailboxError};
use crate::mailbox::{MailMessage, MailThread, Mailbox, MailboxConnector, MessagePart, ThreadPage};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
const REDIRECT_URI: &str = "http://localhost";
/// Threads requested per list call.
const PAGE_SIZE: &str = "500";

/// Gmail OAuth client settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub refresh_token: Option<SecretString>,
    pub api_base: String,
    pub token_url: String,
    pub auth_url: String,
    pub timeout: Duration,
}

impl GmailConfig {
    pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            refresh_token: None,
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("GMAIL_CLIENT_ID".into()))?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("GMAIL_CLIENT_SECRET".into()))?;

        let mut config = Self::new(client_id, SecretString::from(client_secret));
        config.refresh_token = std::env::var("GMAIL_REFRESH_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(SecretString::from);
        Ok(config)
    }

    /// Consent page an operator opens to authorize read-only mailbox access.
    pub fn consent_url(&self) -> Result<reqwest::Url, MailboxError> {
        reqwest::Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", REDIRECT_URI),
                ("response_type", "code"),
                ("scope", READONLY_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| MailboxError::Auth {
            reason: format!("invalid auth URL: {e}"),
        })
    }
}

/// Opens authenticated Gmail sessions.
pub struct GmailConnector {
    config: GmailConfig,
    client: reqwest::Client,
}

impl GmailConnector {
    pub fn new(config: GmailConfig) -> Result<Self, MailboxError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MailboxError::Transient {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    async fn exchange(&self, params: &[(&str, &str)]) -> Result<TokenResponse, MailboxError> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // Google answers a revoked or unknown grant with 400 invalid_grant.
            if matches!(
                status,
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) {
                return Err(MailboxError::Auth {
                    reason: format!("token exchange rejected ({status}): {}", truncate(&body)),
                });
            }
            return Err(status_error(status, &body));
        }

        resp.json().await.map_err(|e| MailboxError::InvalidResponse {
            reason: format!("token response: {e}"),
        })
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &SecretString,
    ) -> Result<SecretString, MailboxError> {
        let token = self
            .exchange(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .await?;
        debug!("Gmail access token refreshed");
        Ok(SecretString::from(token.access_token))
    }

    /// First-time consent: print the consent URL and read the code from the terminal.
    async fn interactive_authorize(&self) -> Result<SecretString, MailboxError> {
        let url = self.config.consent_url()?;
        eprintln!("Gmail authorization required.");
        eprintln!("  1. Open: {url}");
        eprintln!("  2. Approve access, then copy the `code` parameter from the redirect URL.");
        eprint!("  Code: ");

        let mut code = String::new();
        tokio::io::BufReader::new(tokio::io::stdin())
            .read_line(&mut code)
            .await
            .map_err(|e| MailboxError::Auth {
                reason: format!("failed to read authorization code: {e}"),
            })?;
        let code = code.trim();
        if code.is_empty() {
            return Err(MailboxError::Auth {
                reason: "no authorization code entered".into(),
            });
        }

        let token = self
            .exchange(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("redirect_uri", REDIRECT_URI),
                ("grant_type", "authorization_code"),
            ])
            .await?;

        match &token.refresh_token {
            Some(refresh) => {
                eprintln!("Authorized. Store this for unattended runs:");
                eprintln!("  export GMAIL_REFRESH_TOKEN={refresh}");
            }
            None => eprintln!("Authorized, but no refresh token was issued; consent is needed again next run."),
        }
        Ok(SecretString::from(token.access_token))
    }
}

#[async_trait]
impl MailboxConnector for GmailConnector {
    type Session = GmailSession;

    async fn open_session(&self) -> Result<GmailSession, MailboxError> {
        let access_token = match &self.config.refresh_token {
            Some(refresh) => self.refresh_access_token(refresh).await?,
            None if std::io::stdin().is_terminal() => self.interactive_authorize().await?,
            None => {
                return Err(MailboxError::Auth {
                    reason: "no GMAIL_REFRESH_TOKEN configured and no terminal for interactive consent"
                        .into(),
                });
            }
        };
        info!("Gmail session opened");

        Ok(GmailSession {
            client: self.client.clone(),
            api_base: self.config.api_base.trim_end_matches('/').to_string(),
            access_token,
        })
    }
}

/// An authenticated Gmail session. Dropped at the end of each extraction.
pub struct GmailSession {
    client: reqwest::Client,
    api_base: String,
    access_token: SecretString,
}

impl GmailSession {
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, MailboxError> {
        let resp = self
            .client
            .get(format!("{}/{path}", self.api_base))
            .bearer_auth(self.access_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        resp.json().await.map_err(|e| MailboxError::InvalidResponse {
            reason: format!("{path}: {e}"),
        })
    }
}

#[async_trait]
impl Mailbox for GmailSession {
    async fn list_threads(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<ThreadPage, MailboxError> {
        let mut params = vec![("q", query), ("maxResults", PAGE_SIZE)];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let list: ThreadList = self.get_json("threads", &params).await?;

        Ok(ThreadPage {
            thread_ids: list.threads.into_iter().map(|t| t.id).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_thread(&self, thread_id: &str) -> Result<MailThread, MailboxError> {
        let thread: GmailThread = self
            .get_json(&format!("threads/{thread_id}"), &[("format", "full")])
            .await?;
        thread.into_mail_thread()
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<String, MailboxError> {
        let body: PartBody = self
            .get_json(
                &format!("messages/{message_id}/attachments/{attachment_id}"),
                &[],
            )
            .await?;
        body.data.ok_or_else(|| MailboxError::InvalidResponse {
            reason: format!("attachment {attachment_id} on {message_id} has no data"),
        })
    }
}

// ── Error mapping ───────────────────────────────────────────────────

fn transport_error(e: reqwest::Error) -> MailboxError {
    MailboxError::Transient {
        reason: e.to_string(),
    }
}

fn status_error(status: StatusCode, body: &str) -> MailboxError {
    let reason = format!("HTTP {status}: {}", truncate(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => MailboxError::Auth { reason },
        StatusCode::TOO_MANY_REQUESTS => MailboxError::Transient { reason },
        s if s.is_server_error() => MailboxError::Transient { reason },
        _ => MailboxError::InvalidResponse { reason },
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadList {
    #[serde(default)]
    threads: Vec<ThreadRef>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ThreadRef {
    id: String,
}

#[derive(Deserialize)]
struct GmailThread {
    id: String,
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

impl GmailThread {
    fn into_mail_thread(self) -> Result<MailThread, MailboxError> {
        let messages = self
            .messages
            .into_iter()
            .map(GmailMessage::into_mail_message)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MailThread {
            id: self.id,
            messages,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    /// Epoch milliseconds, as a decimal string.
    internal_date: String,
    payload: Option<GmailPart>,
}

impl GmailMessage {
    fn into_mail_message(self) -> Result<MailMessage, MailboxError> {
        let internal_date = self
            .internal_date
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| MailboxError::InvalidResponse {
                reason: format!(
                    "message {} has invalid internalDate '{}'",
                    self.id, self.internal_date
                ),
            })?;

        let mut parts = Vec::new();
        if let Some(payload) = self.payload {
            payload.flatten_into(&mut parts);
        }

        Ok(MailMessage {
            id: self.id,
            internal_date,
            parts,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    filename: String,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

impl GmailPart {
    /// Collect leaf parts depth-first, in document order.
    fn flatten_into(self, out: &mut Vec<MessagePart>) {
        if !self.parts.is_empty() {
            for child in self.parts {
                child.flatten_into(out);
            }
            return;
        }
        let (attachment_id, inline_data) = match self.body {
            Some(body) => (body.attachment_id, body.data),
            None => (None, None),
        };
        out.push(MessagePart {
            filename: self.filename,
            attachment_id,
            inline_data,
        });
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    attachment_id: Option<String>,
    data: Option<String>,
}
