//! libSQL backend — async `ImageStore` implementation.
//!
//! Supports local file and in-memory databases. All timestamps are stored as
//! fixed-width RFC 3339 text so that string order equals time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::model::{Detection, ImageRecord, format_timestamp, partition_key_for};
use crate::store::migrations;
use crate::store::traits::{DateQuery, ImageStore, RecordPage};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Image store opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn fetch_records(
        &self,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<ImageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_records: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const RECORD_COLUMNS: &str =
    "row_key, captured_at, blob_url, is_processed, contains_wildboar, confidence_score";

/// Map a libsql Row to an ImageRecord.
///
/// Column order matches RECORD_COLUMNS:
/// 0:row_key, 1:captured_at, 2:blob_url, 3:is_processed, 4:contains_wildboar, 5:confidence_score
fn row_to_record(row: &libsql::Row) -> Result<ImageRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Serialization(format!("row_to_record: {e}"));

    let row_key: String = row.get(0).map_err(read)?;
    let captured_str: String = row.get(1).map_err(read)?;
    let blob_url: String = row.get(2).map_err(read)?;
    let is_processed: i64 = row.get(3).map_err(read)?;
    let contains_wildboar: Option<i64> = row.get::<i64>(4).ok();
    let confidence: Option<f64> = row.get::<f64>(5).ok();

    let captured_at = parse_datetime(&captured_str).ok_or_else(|| {
        DatabaseError::Serialization(format!(
            "row {row_key}: unreadable captured_at '{captured_str}'"
        ))
    })?;

    let detection = match (is_processed, contains_wildboar, confidence) {
        (0, None, None) => None,
        (1, Some(flag), Some(score)) => Some(Detection::new(flag != 0, score)),
        _ => {
            return Err(DatabaseError::Serialization(format!(
                "row {row_key}: detection fields inconsistent with is_processed={is_processed}"
            )));
        }
    };

    Ok(ImageRecord::from_parts(row_key, captured_at, blob_url, detection))
}

/// Parse an RFC 3339 string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn opt_bool(b: Option<bool>) -> libsql::Value {
    match b {
        Some(b) => libsql::Value::Integer(i64::from(b)),
        None => libsql::Value::Null,
    }
}

fn opt_real(f: Option<f64>) -> libsql::Value {
    match f {
        Some(f) => libsql::Value::Real(f),
        None => libsql::Value::Null,
    }
}

/// Continuation tokens are the decimal row offset of the next page.
///
/// Offsets must fit SQLite's signed 64-bit OFFSET.
fn decode_token(token: Option<&str>) -> Result<i64, DatabaseError> {
    match token {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|offset| *offset >= 0)
            .ok_or_else(|| {
                DatabaseError::Serialization(format!("invalid continuation token '{raw}'"))
            }),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ImageStore for LibSqlBackend {
    async fn most_recent_captured_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT MAX(captured_at) FROM image_records", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("most_recent_captured_at: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("most_recent_captured_at: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        // MAX over an empty table yields NULL.
        let latest: Option<String> = row.get::<String>(0).ok();

        match latest {
            None => Ok(None),
            Some(s) => parse_datetime(&s).map(Some).ok_or_else(|| {
                DatabaseError::Serialization(format!("unreadable captured_at '{s}'"))
            }),
        }
    }

    async fn upsert(&self, record: &ImageRecord) -> Result<(), DatabaseError> {
        let now = format_timestamp(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO image_records (partition_key, row_key, captured_at, blob_url,
                    is_processed, contains_wildboar, confidence_score, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT (partition_key, row_key) DO UPDATE SET
                    captured_at = excluded.captured_at,
                    blob_url = excluded.blob_url,
                    is_processed = excluded.is_processed,
                    contains_wildboar = excluded.contains_wildboar,
                    confidence_score = excluded.confidence_score,
                    updated_at = excluded.updated_at",
                params![
                    record.partition_key(),
                    record.row_key.clone(),
                    format_timestamp(record.captured_at),
                    record.blob_url.clone(),
                    i64::from(record.is_processed()),
                    opt_bool(record.contains_wildboar()),
                    opt_real(record.confidence_score()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert: {e}")))?;

        debug!(row_key = %record.row_key, "Image record upserted");
        Ok(())
    }

    async fn query_unprocessed(&self) -> Result<Vec<ImageRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM image_records
             WHERE is_processed = 0
             ORDER BY captured_at ASC, row_key ASC"
        );
        self.fetch_records(&sql, Vec::new()).await
    }

    async fn merge_update(&self, record: &ImageRecord) -> Result<(), DatabaseError> {
        let Some(detection) = record.detection() else {
            return Err(DatabaseError::Constraint(format!(
                "merge_update: record {} has no detection",
                record.row_key
            )));
        };

        let affected = self
            .conn()
            .execute(
                "UPDATE image_records
                 SET is_processed = 1, contains_wildboar = ?1, confidence_score = ?2, updated_at = ?3
                 WHERE partition_key = ?4 AND row_key = ?5",
                params![
                    i64::from(detection.contains_wildboar),
                    detection.confidence,
                    format_timestamp(Utc::now()),
                    record.partition_key(),
                    record.row_key.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("merge_update: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "image_record".into(),
                id: record.row_key.clone(),
            });
        }
        Ok(())
    }

    async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<ImageRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM image_records WHERE partition_key = ?1 AND row_key = ?2"
        );
        let values = vec![
            libsql::Value::Text(partition_key.to_string()),
            libsql::Value::Text(row_key.to_string()),
        ];
        Ok(self.fetch_records(&sql, values).await?.into_iter().next())
    }

    async fn records_for_date(&self, query: &DateQuery) -> Result<RecordPage, DatabaseError> {
        let offset = decode_token(query.continuation_token.as_deref())?;
        let page_size = i64::try_from(query.page_size.max(1)).unwrap_or(i64::MAX - 1);

        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM image_records WHERE partition_key = ?1");
        let mut values = vec![libsql::Value::Text(partition_key_for(query.date))];

        if let Some(start) = query.start_hour {
            values.push(libsql::Value::Integer(i64::from(start)));
            sql.push_str(&format!(
                " AND CAST(substr(captured_at, 12, 2) AS INTEGER) >= ?{}",
                values.len()
            ));
        }
        if let Some(end) = query.end_hour {
            values.push(libsql::Value::Integer(i64::from(end)));
            sql.push_str(&format!(
                " AND CAST(substr(captured_at, 12, 2) AS INTEGER) <= ?{}",
                values.len()
            ));
        }
        if let Some(flag) = query.contains_wildboar {
            values.push(libsql::Value::Integer(i64::from(flag)));
            sql.push_str(&format!(
                " AND is_processed = 1 AND contains_wildboar = ?{}",
                values.len()
            ));
        }

        if let Some(min) = query.min_confidence {
            values.push(libsql::Value::Real(min));
            sql.push_str(&format!(
                " AND is_processed = 1 AND confidence_score >= ?{}",
                values.len()
            ));
        }

        // One extra row tells us whether another page exists.
        values.push(libsql::Value::Integer(page_size + 1));
        let limit_idx = values.len();
        values.push(libsql::Value::Integer(offset));
        let offset_idx = values.len();
        sql.push_str(&format!(
            " ORDER BY captured_at ASC, row_key ASC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        ));

        let mut records = self.fetch_records(&sql, values).await?;
        let continuation_token = if records.len() as i64 > page_size {
            records.truncate(page_size as usize);
            // No next page once the offset would leave i64.
            offset.checked_add(page_size).map(|next| next.to_string())
        } else {
            None
        };

        Ok(RecordPage {
            records,
            continuation_token,
        })
    }

    async fn records_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        contains_wildboar: Option<bool>,
        min_confidence: Option<f64>,
    ) -> Result<Vec<ImageRecord>, DatabaseError> {
        let mut sql = format!(
            "SELECT {RECORD_COLUMNS} FROM image_records WHERE captured_at >= ?1 AND captured_at <= ?2"
        );
        let mut values = vec![
            libsql::Value::Text(format_timestamp(start)),
            libsql::Value::Text(format_timestamp(end)),
        ];

        if let Some(flag) = contains_wildboar {
            values.push(libsql::Value::Integer(i64::from(flag)));
            sql.push_str(&format!(
                " AND is_processed = 1 AND contains_wildboar = ?{}",
                values.len()
            ));
        }
        if let Some(min) = min_confidence {
            values.push(libsql::Value::Real(min));
            sql.push_str(&format!(
                " AND is_processed = 1 AND confidence_score >= ?{}",
                values.len()
            ));
        }
        sql.push_str(" ORDER BY captured_at ASC, row_key ASC");

        self.fetch_records(&sql, values).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, m, 0).unwrap()
    }

    fn make_record(d: u32, h: u32) -> ImageRecord {
        ImageRecord::new_unprocessed(at(d, h, 0), format!("http://blobs/img-{d}-{h}"))
    }

    #[tokio::test]
    async fn empty_store_has_no_watermark() {
        let db = test_db().await;
        assert_eq!(db.most_recent_captured_at().await.unwrap(), None);
    }

    #[tokio::test]
    async fn watermark_is_latest_capture() {
        let db = test_db().await;
        db.upsert(&make_record(2, 9)).await.unwrap();
        db.upsert(&make_record(3, 7)).await.unwrap();
        db.upsert(&make_record(2, 23)).await.unwrap();

        assert_eq!(db.most_recent_captured_at().await.unwrap(), Some(at(3, 7, 0)));
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let db = test_db().await;
        let record = make_record(2, 10);
        db.upsert(&record).await.unwrap();

        let fetched = db
            .get(&record.partition_key(), &record.row_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, record);
        assert!(!fetched.is_processed());
    }

    #[tokio::test]
    async fn get_not_found() {
        let db = test_db().await;
        assert!(db.get("2024-01-02", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_same_keys_replaces() {
        let db = test_db().await;
        let mut record = make_record(2, 10);
        db.upsert(&record).await.unwrap();
        record.blob_url = "http://blobs/replaced".into();
        db.upsert(&record).await.unwrap();

        let all = db.query_unprocessed().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].blob_url, "http://blobs/replaced");
    }

    #[tokio::test]
    async fn unprocessed_excludes_processed_and_orders_by_capture() {
        let db = test_db().await;
        let late = make_record(3, 8);
        let early = make_record(2, 8);
        let mut done = make_record(2, 9);
        db.upsert(&late).await.unwrap();
        db.upsert(&early).await.unwrap();
        db.upsert(&done).await.unwrap();

        done.mark_processed(Detection::new(false, 0.6));
        db.merge_update(&done).await.unwrap();

        let pending = db.query_unprocessed().await.unwrap();
        let keys: Vec<_> = pending.iter().map(|r| r.row_key.as_str()).collect();
        assert_eq!(keys, vec![early.row_key.as_str(), late.row_key.as_str()]);
    }

    #[tokio::test]
    async fn merge_update_writes_detection_only() {
        let db = test_db().await;
        let mut record = make_record(2, 10);
        db.upsert(&record).await.unwrap();

        record.mark_processed(Detection::new(true, 0.87));
        db.merge_update(&record).await.unwrap();

        let fetched = db
            .get(&record.partition_key(), &record.row_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.contains_wildboar(), Some(true));
        assert_eq!(fetched.confidence_score(), Some(0.87));
        assert_eq!(fetched.blob_url, record.blob_url);
    }

    #[tokio::test]
    async fn merge_update_missing_row_is_not_found() {
        let db = test_db().await;
        let mut record = make_record(2, 10);
        record.mark_processed(Detection::new(false, 0.3));

        let err = db.merge_update(&record).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn merge_update_requires_detection() {
        let db = test_db().await;
        let record = make_record(2, 10);
        db.upsert(&record).await.unwrap();

        let err = db.merge_update(&record).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn records_for_date_filters_hours_and_pages() {
        let db = test_db().await;
        for h in 0..6 {
            db.upsert(&make_record(2, h)).await.unwrap();
        }
        db.upsert(&make_record(3, 1)).await.unwrap();

        let mut query = DateQuery::new(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        query.start_hour = Some(1);
        query.end_hour = Some(4);
        query.page_size = 3;

        let first = db.records_for_date(&query).await.unwrap();
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.records[0].captured_at, at(2, 1, 0));
        let token = first.continuation_token.clone().unwrap();

        query.continuation_token = Some(token);
        let second = db.records_for_date(&query).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].captured_at, at(2, 4, 0));
        assert!(second.continuation_token.is_none());
    }

    #[tokio::test]
    async fn records_for_date_rejects_bad_token() {
        let db = test_db().await;
        let mut query = DateQuery::new(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        query.continuation_token = Some("not-a-token".into());

        let err = db.records_for_date(&query).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[tokio::test]
    async fn records_for_date_rejects_out_of_range_tokens() {
        let db = test_db().await;
        for h in [8, 9, 10] {
            db.upsert(&make_record(2, h)).await.unwrap();
        }
        let mut query = DateQuery::new(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        query.page_size = 1;

        for token in [u64::MAX.to_string(), (i64::MAX as u64 + 1).to_string(), "-1".into()] {
            query.continuation_token = Some(token.clone());
            let err = db.records_for_date(&query).await.unwrap_err();
            assert!(
                matches!(err, DatabaseError::Serialization(_)),
                "token {token} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn records_for_date_far_offset_is_an_empty_page() {
        let db = test_db().await;
        db.upsert(&make_record(2, 8)).await.unwrap();
        let mut query = DateQuery::new(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        query.page_size = 1;
        query.continuation_token = Some(i64::MAX.to_string());

        let page = db.records_for_date(&query).await.unwrap();
        assert!(page.records.is_empty());
        assert!(page.continuation_token.is_none());
    }

    #[tokio::test]
    async fn records_in_range_applies_detection_filters() {
        let db = test_db().await;
        let mut boar = make_record(2, 10);
        let mut empty = make_record(2, 11);
        let pending = make_record(2, 12);
        for r in [&boar, &empty, &pending] {
            db.upsert(r).await.unwrap();
        }
        boar.mark_processed(Detection::new(true, 0.9));
        empty.mark_processed(Detection::new(false, 0.8));
        db.merge_update(&boar).await.unwrap();
        db.merge_update(&empty).await.unwrap();

        let all = db
            .records_in_range(at(2, 0, 0), at(2, 23, 59), None, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let boars = db
            .records_in_range(at(2, 0, 0), at(2, 23, 59), Some(true), None)
            .await
            .unwrap();
        assert_eq!(boars.len(), 1);
        assert_eq!(boars[0].row_key, boar.row_key);

        let confident = db
            .records_in_range(at(2, 0, 0), at(2, 23, 59), None, Some(0.85))
            .await
            .unwrap();
        assert_eq!(confident.len(), 1);
    }
}
