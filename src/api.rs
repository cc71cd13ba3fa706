//! Read-only query API over the record store, plus signed blob reads.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error};

use crate::error::{BlobError, DatabaseError};
use crate::model::ImageRecord;
use crate::stats::{self, DetectionSummary};
use crate::store::{BlobStore, DateQuery, FilesystemBlobStore, ImageStore};

const DEFAULT_RANGE_DAYS: i64 = 7;
const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 100;
const GALLERY_URL_MINUTES: u64 = 60;
const DEFAULT_EXPIRY_MINUTES: u64 = 60;
const MAX_EXPIRY_MINUTES: u64 = 1440;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ImageStore>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Build the query API router.
pub fn api_routes(store: Arc<dyn ImageStore>, blobs: Arc<dyn BlobStore>) -> Router {
    let state = AppState { store, blobs };

    Router::new()
        .route("/health", get(health))
        .route("/api/detections", get(get_detections))
        .route("/api/images", get(get_images))
        .route("/api/images/sas", get(get_image_sas))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET]),
        )
}

/// Serve blob bytes behind signed URLs issued by `blobs`.
pub fn blob_routes(blobs: Arc<FilesystemBlobStore>) -> Router {
    Router::new()
        .route("/blobs/{key}", get(get_blob))
        .with_state(blobs)
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Serialization(msg) if msg.contains("continuation token") => {
                Self::bad_request(msg)
            }
            other => {
                error!(error = %other, "Query failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "Failed to query image records".into(),
                }
            }
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(e: BlobError) -> Self {
        let status = match &e {
            BlobError::NotFound { .. } => StatusCode::NOT_FOUND,
            BlobError::InvalidKey(_) | BlobError::ForeignLocator(_) => StatusCode::BAD_REQUEST,
            BlobError::SignatureRejected => StatusCode::FORBIDDEN,
            BlobError::SigningDisabled => StatusCode::SERVICE_UNAVAILABLE,
            BlobError::Io(_) => {
                error!(error = %e, "Blob read failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

// ── Parameter parsing ───────────────────────────────────────────────────

fn parse_opt<T: std::str::FromStr>(name: &str, raw: Option<&str>) -> Result<Option<T>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("Invalid value for {name}: '{s}'"))),
    }
}

fn parse_bool(name: &str, raw: Option<&str>) -> Result<Option<bool>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) if s.eq_ignore_ascii_case("true") => Ok(Some(true)),
        Some(s) if s.eq_ignore_ascii_case("false") => Ok(Some(false)),
        Some(s) => Err(ApiError::bad_request(format!(
            "Invalid value for {name}: '{s}'"
        ))),
    }
}

fn parse_hour(name: &str, raw: Option<&str>) -> Result<Option<u32>, ApiError> {
    let hour = parse_opt::<u32>(name, raw)?;
    if matches!(hour, Some(h) if h > 23) {
        return Err(ApiError::bad_request(format!("{name} must be between 0 and 23")));
    }
    Ok(hour)
}

fn parse_confidence(raw: Option<&str>) -> Result<Option<f64>, ApiError> {
    let min = parse_opt::<f64>("minConfidence", raw)?;
    if matches!(min, Some(c) if !(0.0..=1.0).contains(&c)) {
        return Err(ApiError::bad_request("minConfidence must be between 0 and 1"));
    }
    Ok(min)
}

/// Accept a full RFC 3339 timestamp or a bare `yyyy-MM-dd` date.
///
/// A bare date means the start of that day, or its end when `end_of_day` is set.
fn parse_instant(
    name: &str,
    raw: Option<&str>,
    end_of_day: bool,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(s) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        ApiError::bad_request(format!("Invalid value for {name}: '{s}' (expected yyyy-MM-dd)"))
    })?;
    let start = date.and_time(NaiveTime::MIN).and_utc();
    Ok(Some(if end_of_day {
        start + TimeDelta::days(1) - TimeDelta::microseconds(1)
    } else {
        start
    }))
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "wildboar-pipeline"
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectionParams {
    start_date: Option<String>,
    end_date: Option<String>,
    min_confidence: Option<String>,
}

async fn get_detections(
    State(state): State<AppState>,
    Query(params): Query<DetectionParams>,
) -> Result<Json<DetectionSummary>, ApiError> {
    let end = parse_instant("endDate", params.end_date.as_deref(), true)?.unwrap_or_else(Utc::now);
    let start = parse_instant("startDate", params.start_date.as_deref(), false)?
        .unwrap_or(end - TimeDelta::days(DEFAULT_RANGE_DAYS));
    if start > end {
        return Err(ApiError::bad_request("startDate must not be after endDate"));
    }
    let min_confidence = parse_confidence(params.min_confidence.as_deref())?;

    let records = state.store.records_in_range(start, end, None, None).await?;
    debug!(records = records.len(), %start, %end, "Detection query");
    Ok(Json(stats::summarize(&records, start, end, min_confidence)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageParams {
    date: Option<String>,
    start_hour: Option<String>,
    end_hour: Option<String>,
    contains_wildboar: Option<String>,
    min_confidence: Option<String>,
    page_size: Option<String>,
    continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageDto {
    id: String,
    captured_at: DateTime<Utc>,
    contains_wildboar: bool,
    confidence_score: f64,
    image_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageGalleryResponse {
    images: Vec<ImageDto>,
    continuation_token: Option<String>,
    total_count: usize,
}

async fn get_images(
    State(state): State<AppState>,
    Query(params): Query<ImageParams>,
) -> Result<Json<ImageGalleryResponse>, ApiError> {
    let raw_date = params
        .date
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Date parameter is required (format: yyyy-MM-dd)"))?;
    let date = NaiveDate::parse_from_str(raw_date.trim(), "%Y-%m-%d").map_err(|_| {
        ApiError::bad_request(format!("Invalid date '{raw_date}' (format: yyyy-MM-dd)"))
    })?;

    let page_size = parse_opt::<usize>("pageSize", params.page_size.as_deref())?
        .unwrap_or(DEFAULT_PAGE_SIZE);
    if page_size == 0 {
        return Err(ApiError::bad_request("pageSize must be positive"));
    }

    let query = DateQuery {
        date,
        start_hour: parse_hour("startHour", params.start_hour.as_deref())?,
        end_hour: parse_hour("endHour", params.end_hour.as_deref())?,
        contains_wildboar: parse_bool("containsWildboar", params.contains_wildboar.as_deref())?,
        min_confidence: parse_confidence(params.min_confidence.as_deref())?,
        page_size: page_size.min(MAX_PAGE_SIZE),
        continuation_token: params.continuation_token.filter(|t| !t.is_empty()),
    };

    let page = state.store.records_for_date(&query).await?;
    let images: Vec<ImageDto> = page
        .records
        .iter()
        .map(|r| image_dto(state.blobs.as_ref(), r))
        .collect();

    Ok(Json(ImageGalleryResponse {
        total_count: images.len(),
        images,
        continuation_token: page.continuation_token,
    }))
}

fn image_dto(blobs: &dyn BlobStore, record: &ImageRecord) -> ImageDto {
    let expiry = Duration::from_secs(GALLERY_URL_MINUTES * 60);
    let image_url = blobs
        .signed_url(&record.blob_url, expiry)
        .unwrap_or_else(|e| {
            debug!(row_key = %record.row_key, error = %e, "Serving unsigned blob URL");
            record.blob_url.clone()
        });

    ImageDto {
        id: record.row_key.clone(),
        captured_at: record.captured_at,
        contains_wildboar: record.contains_wildboar().unwrap_or(false),
        confidence_score: record.confidence_score().unwrap_or(0.0),
        image_url,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SasParams {
    blob_url: Option<String>,
    expiry_minutes: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SasResponse {
    image_url: String,
    expires_at: DateTime<Utc>,
}

async fn get_image_sas(
    State(state): State<AppState>,
    Query(params): Query<SasParams>,
) -> Result<Json<SasResponse>, ApiError> {
    let blob_url = params
        .blob_url
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("blobUrl parameter is required"))?;
    let minutes = parse_opt::<u64>("expiryMinutes", params.expiry_minutes.as_deref())?
        .unwrap_or(DEFAULT_EXPIRY_MINUTES);
    if minutes == 0 {
        return Err(ApiError::bad_request("expiryMinutes must be positive"));
    }
    let minutes = minutes.min(MAX_EXPIRY_MINUTES);

    let image_url = state
        .blobs
        .signed_url(&blob_url, Duration::from_secs(minutes * 60))?;

    Ok(Json(SasResponse {
        image_url,
        expires_at: Utc::now() + TimeDelta::minutes(minutes as i64),
    }))
}

#[derive(Debug, Deserialize)]
struct SignedParams {
    expires: i64,
    sig: String,
}

async fn get_blob(
    State(blobs): State<Arc<FilesystemBlobStore>>,
    Path(key): Path<String>,
    Query(params): Query<SignedParams>,
) -> Result<Response, ApiError> {
    let data = blobs.read_signed(&key, params.expires, &params.sig).await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], data).into_response())
}
