//! Ingestion orchestrator — mailbox attachments into the blob and record stores.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::mailbox::{AttachmentExtractor, MailboxConnector};
use crate::model::{ImageAttachment, ImageRecord};
use crate::store::{BlobStore, ImageStore};

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub watermark: DateTime<Utc>,
    pub found: usize,
    pub stored: usize,
    pub failed: usize,
}

impl IngestionReport {
    fn empty(watermark: DateTime<Utc>) -> Self {
        Self {
            watermark,
            found: 0,
            stored: 0,
            failed: 0,
        }
    }
}

pub struct IngestionOrchestrator<C> {
    extractor: AttachmentExtractor<C>,
    store: Arc<dyn ImageStore>,
    blobs: Arc<dyn BlobStore>,
    config: IngestConfig,
}

impl<C: MailboxConnector> IngestionOrchestrator<C> {
    pub fn new(
        extractor: AttachmentExtractor<C>,
        store: Arc<dyn ImageStore>,
        blobs: Arc<dyn BlobStore>,
        config: IngestConfig,
    ) -> Self {
        Self {
            extractor,
            store,
            blobs,
            config,
        }
    }

    /// Pull new attachments and store each one as an unprocessed record.
    ///
    /// Store or mailbox failures before the per-attachment loop abort the
    /// run. Inside the loop each attachment succeeds or fails on its own.
    pub async fn run_ingestion(&self) -> Result<IngestionReport, IngestError> {
        let watermark = match self
            .store
            .most_recent_captured_at()
            .await
            .map_err(IngestError::Watermark)?
        {
            Some(latest) => latest,
            None => {
                let fallback = Utc::now() - Duration::days(self.config.lookback_days);
                info!(lookback_days = self.config.lookback_days, "Store is empty, using lookback watermark");
                fallback
            }
        };
        info!(%watermark, "Starting ingestion");

        let attachments = self.extractor.extract(watermark).await?;
        if attachments.is_empty() {
            info!("No new images found");
            return Ok(IngestionReport::empty(watermark));
        }

        // Capture order keeps the watermark a consistent prefix if the run dies midway.
        let mut batch: Vec<ImageAttachment> = attachments.into_iter().collect();
        batch.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut report = IngestionReport {
            found: batch.len(),
            ..IngestionReport::empty(watermark)
        };

        for attachment in &batch {
            if self.store_attachment(attachment).await {
                report.stored += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            found = report.found,
            stored = report.stored,
            failed = report.failed,
            "Ingestion complete"
        );
        Ok(report)
    }

    async fn store_attachment(&self, attachment: &ImageAttachment) -> bool {
        let locator = match self.blobs.put(&attachment.id, &attachment.data).await {
            Ok(locator) => locator,
            Err(e) => {
                warn!(attachment_id = %attachment.id, error = %e, "Blob upload failed");
                return false;
            }
        };

        let record = ImageRecord::new_unprocessed(attachment.timestamp, locator.as_str());
        match self.store.upsert(&record).await {
            Ok(()) => {
                info!(
                    attachment_id = %attachment.id,
                    row_key = %record.row_key,
                    partition_key = %record.partition_key(),
                    "Image ingested"
                );
                true
            }
            Err(e) => {
                // The blob stays; the locator is logged so it can be reconciled.
                warn!(
                    attachment_id = %attachment.id,
                    blob_url = %locator,
                    error = %e,
                    "Record write failed after blob upload"
                );
                false
            }
        }
    }
}
