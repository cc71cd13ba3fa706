//! Core data types — attachments extracted from mail and durable image records.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Format of the partition key (capture date). Changing it orphans existing rows.
pub const PARTITION_KEY_FORMAT: &str = "%Y-%m-%d";

/// Render a date as a partition key.
pub fn partition_key_for(date: NaiveDate) -> String {
    date.format(PARTITION_KEY_FORMAT).to_string()
}

/// Fixed-width UTC timestamp used for persisted `captured_at` values.
///
/// Fixed width keeps lexical order equal to chronological order in the store.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// An image attachment pulled out of a mailbox message.
///
/// Identity is the `id` alone (`message_id + filename`): the same logical
/// attachment seen twice collapses to one entry in a set.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub id: String,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl ImageAttachment {
    pub fn new(
        message_id: &str,
        filename: &str,
        data: Vec<u8>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{message_id}{filename}"),
            data,
            timestamp,
        }
    }
}

impl PartialEq for ImageAttachment {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ImageAttachment {}

impl Hash for ImageAttachment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Classification result attached to a processed record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub contains_wildboar: bool,
    /// Score of the top predicted label, in `[0, 1]`.
    pub confidence: f64,
}

impl Detection {
    pub fn new(contains_wildboar: bool, confidence: f64) -> Self {
        Self {
            contains_wildboar,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A persisted row describing one ingested image and its classification state.
///
/// The detection fields only exist together: a record is either unprocessed
/// (no detection) or processed (both fields set).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub row_key: String,
    pub captured_at: DateTime<Utc>,
    pub blob_url: String,
    detection: Option<Detection>,
}

impl ImageRecord {
    /// A fresh, unprocessed record with a new globally unique row key.
    pub fn new_unprocessed(captured_at: DateTime<Utc>, blob_url: impl Into<String>) -> Self {
        Self {
            row_key: Uuid::new_v4().to_string(),
            captured_at,
            blob_url: blob_url.into(),
            detection: None,
        }
    }

    /// Rebuild a record from stored fields.
    pub fn from_parts(
        row_key: impl Into<String>,
        captured_at: DateTime<Utc>,
        blob_url: impl Into<String>,
        detection: Option<Detection>,
    ) -> Self {
        Self {
            row_key: row_key.into(),
            captured_at,
            blob_url: blob_url.into(),
            detection,
        }
    }

    /// Capture date in `yyyy-MM-dd`. Always derived, never stored independently.
    pub fn partition_key(&self) -> String {
        partition_key_for(self.captured_at.date_naive())
    }

    pub fn is_processed(&self) -> bool {
        self.detection.is_some()
    }

    pub fn contains_wildboar(&self) -> Option<bool> {
        self.detection.map(|d| d.contains_wildboar)
    }

    pub fn confidence_score(&self) -> Option<f64> {
        self.detection.map(|d| d.confidence)
    }

    pub fn detection(&self) -> Option<Detection> {
        self.detection
    }

    /// Transition to the processed state.
    pub fn mark_processed(&mut self, detection: Detection) {
        self.detection = Some(detection);
    }
}
