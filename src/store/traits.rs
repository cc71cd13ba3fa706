//! Storage traits — the record store and the blob store the pipeline runs against.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{BlobError, DatabaseError};
use crate::model::ImageRecord;

/// Filter for a single capture-date partition, used by the query API.
#[derive(Debug, Clone)]
pub struct DateQuery {
    pub date: NaiveDate,
    /// Inclusive lower bound on the capture hour (0-23).
    pub start_hour: Option<u32>,
    /// Inclusive upper bound on the capture hour (0-23).
    pub end_hour: Option<u32>,
    pub contains_wildboar: Option<bool>,
    /// Only processed records scoring at least this much.
    pub min_confidence: Option<f64>,
    pub page_size: usize,
    /// Opaque token returned by the previous page.
    pub continuation_token: Option<String>,
}

impl DateQuery {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            start_hour: None,
            end_hour: None,
            contains_wildboar: None,
            min_confidence: None,
            page_size: 50,
            continuation_token: None,
        }
    }
}

/// One page of records plus the token for the next page, if any.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<ImageRecord>,
    pub continuation_token: Option<String>,
}

/// Durable table of image records.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Latest `captured_at` across all records, or `None` if the store is empty.
    async fn most_recent_captured_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Insert a record, replacing any existing row with the same keys.
    async fn upsert(&self, record: &ImageRecord) -> Result<(), DatabaseError>;

    /// All records not yet classified, oldest capture first.
    async fn query_unprocessed(&self) -> Result<Vec<ImageRecord>, DatabaseError>;

    /// Write only the detection fields of an existing record, atomically.
    async fn merge_update(&self, record: &ImageRecord) -> Result<(), DatabaseError>;

    /// Look up a single record by its keys.
    async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<ImageRecord>, DatabaseError>;

    /// A page of records from one capture-date partition.
    async fn records_for_date(&self, query: &DateQuery) -> Result<RecordPage, DatabaseError>;

    /// Records captured within `[start, end]`, ordered by capture time.
    async fn records_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        contains_wildboar: Option<bool>,
        min_confidence: Option<f64>,
    ) -> Result<Vec<ImageRecord>, DatabaseError>;
}

/// Byte storage for raw images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, overwriting any previous blob. Returns the locator.
    async fn put(&self, key: &str, data: &[u8]) -> Result<String, BlobError>;

    /// Read back the bytes behind a locator returned by `put`.
    async fn get(&self, locator: &str) -> Result<Vec<u8>, BlobError>;

    /// A read-only URL for the blob that stops working after `expiry`.
    fn signed_url(&self, locator: &str, expiry: Duration) -> Result<String, BlobError>;
}
