//! Processing orchestrator — classifies unprocessed records with bounded retry.

pub mod retry;
pub mod statistics;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::Classifier;
use crate::config::ProcessingConfig;
use crate::error::ProcessError;
use crate::model::{Detection, ImageRecord};
use crate::store::{BlobStore, ImageStore};

pub use retry::{AttemptError, AttemptOutcome, ErrorKind, RetryPolicy, RetryReport};
pub use statistics::ProcessingStatistics;

pub struct ProcessingOrchestrator {
    store: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
    classifier: Arc<dyn Classifier>,
    policy: RetryPolicy,
}

impl ProcessingOrchestrator {
    pub fn new(
        store: Arc<dyn ImageStore>,
        blobs: Arc<dyn BlobStore>,
        classifier: Arc<dyn Classifier>,
        config: &ProcessingConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            classifier,
            policy: RetryPolicy::new(config.max_retries, config.backoff_base),
        }
    }

    /// Classify every unprocessed record, one at a time.
    ///
    /// Only the initial query is fatal. Records that exhaust their retries
    /// stay unprocessed for the next run. Cancellation stops the run early
    /// and returns the partial statistics.
    pub async fn run_processing(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProcessingStatistics, ProcessError> {
        let started = Instant::now();
        let records = self
            .store
            .query_unprocessed()
            .await
            .map_err(ProcessError::Query)?;

        let mut stats = ProcessingStatistics::new(records.len());
        if records.is_empty() {
            info!("No unprocessed images");
            return Ok(stats);
        }
        info!(
            count = records.len(),
            model = self.classifier.model_name(),
            "Starting processing"
        );

        for record in &records {
            if cancel.is_cancelled() {
                warn!("Cancellation requested, stopping processing");
                stats.cancelled = true;
                break;
            }

            let report = retry::run_with_retry(self.policy, cancel, &record.row_key, || {
                self.process_record(record)
            })
            .await;
            stats.record(&report);

            match report.outcome {
                AttemptOutcome::Succeeded(detection) => debug!(
                    row_key = %record.row_key,
                    contains_wildboar = detection.contains_wildboar,
                    confidence = detection.confidence,
                    "Image processed"
                ),
                AttemptOutcome::Failed => warn!(
                    row_key = %record.row_key,
                    attempts = report.errors.len(),
                    "Image processing failed, will retry next run"
                ),
                AttemptOutcome::Cancelled => {
                    warn!(row_key = %record.row_key, "Cancelled during backoff");
                    break;
                }
            }
        }

        stats.duration = started.elapsed();
        log_summary(&stats);
        Ok(stats)
    }

    /// One attempt: download, classify, then write the detection back.
    async fn process_record(&self, record: &ImageRecord) -> Result<Detection, AttemptError> {
        let image = self
            .blobs
            .get(&record.blob_url)
            .await
            .map_err(|e| AttemptError::new(ErrorKind::BlobDownload, e))?;

        let prediction = self
            .classifier
            .classify(&image)
            .await
            .map_err(|e| AttemptError::new(ErrorKind::Classification, e))?;
        let detection = prediction.detection(self.classifier.target_label());

        let mut updated = record.clone();
        updated.mark_processed(detection);
        self.store
            .merge_update(&updated)
            .await
            .map_err(|e| AttemptError::new(ErrorKind::RecordUpdate, e))?;

        Ok(detection)
    }
}

fn log_summary(stats: &ProcessingStatistics) {
    info!(
        total = stats.total,
        success = stats.success,
        failure = stats.failure,
        wildboar_detected = stats.wildboar_detected,
        duration_secs = stats.duration.as_secs_f64(),
        cancelled = stats.cancelled,
        "Processing complete"
    );
    for (kind, count) in &stats.error_counts {
        info!(kind = %kind, count, "Processing errors");
    }
    match serde_json::to_string(stats) {
        Ok(json) => info!(summary = %json, "Processing summary"),
        Err(e) => warn!(error = %e, "Failed to serialize processing summary"),
    }
}
