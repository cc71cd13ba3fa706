//! Error types for the wildboar pipeline.

use std::path::PathBuf;

/// Top-level error type for the pipeline binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Blob storage error: {0}")]
    Blob(#[from] BlobError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Processing error: {0}")]
    Process(#[from] ProcessError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob not found: {key}")]
    NotFound { key: String },

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("Blob locator does not belong to this store: {0}")]
    ForeignLocator(String),

    #[error("Signed URLs are not configured for this store")]
    SigningDisabled,

    #[error("Signed URL is invalid or expired")]
    SignatureRejected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// Credentials invalid or missing. Fatal for the ingestion run.
    #[error("Mailbox authentication failed: {reason}")]
    Auth { reason: String },

    /// Network or provider hiccup. The caller decides whether to retry.
    #[error("Mailbox request failed: {reason}")]
    Transient { reason: String },

    #[error("Invalid response from mailbox provider: {reason}")]
    InvalidResponse { reason: String },

    #[error("Attachment {attachment_id} on message {message_id} is not valid base64: {reason}")]
    AttachmentDecode {
        message_id: String,
        attachment_id: String,
        reason: String,
    },
}

/// Classification engine errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// The model artifact could not be loaded. Fatal at startup.
    #[error("Failed to load model artifact {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },

    #[error("Inference failed for model {model}: {reason}")]
    Inference { model: String, reason: String },

    #[error("Invalid prediction from model {model}: {reason}")]
    InvalidPrediction { model: String, reason: String },
}

/// Errors that abort an ingestion run before any attachment is handled.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to read watermark: {0}")]
    Watermark(#[source] DatabaseError),

    #[error("Attachment extraction failed: {0}")]
    Extraction(#[from] MailboxError),
}

/// Errors that abort a processing run before the per-record loop starts.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to query unprocessed records: {0}")]
    Query(#[source] DatabaseError),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
