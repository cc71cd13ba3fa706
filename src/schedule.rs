//! Cron-driven ingest→process cycles.
//!
//! Cycles run sequentially on one task, so two runs never overlap and the
//! stores see a single writer.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ConfigError, Error};
use crate::ingest::{IngestionOrchestrator, IngestionReport};
use crate::mailbox::MailboxConnector;
use crate::process::{ProcessingOrchestrator, ProcessingStatistics};

/// What one ingest→process cycle did.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// `None` when ingestion failed before storing anything.
    pub ingestion: Option<IngestionReport>,
    pub ingestion_error: Option<String>,
    pub processing: ProcessingStatistics,
}

impl CycleReport {
    pub fn stored(&self) -> usize {
        self.ingestion.as_ref().map_or(0, |r| r.stored)
    }

    pub fn has_failures(&self) -> bool {
        self.ingestion_error.is_some()
            || self.ingestion.as_ref().is_some_and(|r| r.failed > 0)
            || self.processing.has_failures()
    }
}

/// Both orchestrators, wired to the same stores.
pub struct Pipeline<C> {
    ingestion: IngestionOrchestrator<C>,
    processing: ProcessingOrchestrator,
}

impl<C: MailboxConnector> Pipeline<C> {
    pub fn new(ingestion: IngestionOrchestrator<C>, processing: ProcessingOrchestrator) -> Self {
        Self {
            ingestion,
            processing,
        }
    }

    /// Ingest, then process every unprocessed record.
    ///
    /// Processing always runs, so records left over by earlier runs are
    /// retried even when ingestion finds nothing or fails. Only a failed
    /// unprocessed-record query makes the cycle itself fail.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, Error> {
        let (ingestion, ingestion_error) = match self.ingestion.run_ingestion().await {
            Ok(report) => (Some(report), None),
            Err(e) => {
                error!(error = %e, "Ingestion failed, processing backlog only");
                (None, Some(e.to_string()))
            }
        };

        let processing = self.processing.run_processing(cancel).await?;
        Ok(CycleReport {
            ingestion,
            ingestion_error,
            processing,
        })
    }
}

/// Parse a six-field (seconds-first) cron expression.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "WILDBOAR_SCHEDULE".into(),
        message: format!("invalid cron expression '{expr}': {e}"),
    })
}

/// Time from `now` until the schedule next fires after it.
pub fn next_delay(schedule: &Schedule, now: DateTime<Utc>) -> Option<(DateTime<Utc>, Duration)> {
    let next = schedule.after(&now).next()?;
    let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
    Some((next, wait))
}

/// Fire `cycle` on every schedule tick until `cancel` fires.
///
/// Returns the number of cycles run. A cycle that is already running when
/// `cancel` fires is awaited, and is expected to observe the same token.
pub async fn run_scheduled<F, Fut>(
    schedule: &Schedule,
    cancel: &CancellationToken,
    mut cycle: F,
) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut runs = 0;

    loop {
        let Some((next, wait)) = next_delay(schedule, Utc::now()) else {
            info!("Schedule has no upcoming fire times, stopping");
            break;
        };
        debug!(next = %next, wait_secs = wait.as_secs(), "Waiting for next scheduled run");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        cycle().await;
        runs += 1;

        if cancel.is_cancelled() {
            break;
        }
    }

    info!(runs, "Scheduler stopped");
    runs
}

/// Run `pipeline` on `schedule`, logging each cycle's outcome.
///
/// Cycle failures are logged and the scheduler keeps going.
pub async fn schedule_pipeline<C: MailboxConnector>(
    pipeline: &Pipeline<C>,
    schedule: &Schedule,
    cancel: &CancellationToken,
) -> usize {
    run_scheduled(schedule, cancel, || async {
        match pipeline.run_cycle(cancel).await {
            Ok(report) if report.has_failures() => {
                error!(
                    ingest_failed = report.ingestion.as_ref().map_or(0, |r| r.failed),
                    ingest_error = report.ingestion_error.as_deref().unwrap_or("none"),
                    process_failed = report.processing.failure,
                    "Scheduled run finished with failures"
                );
            }
            Ok(report) => {
                info!(
                    stored = report.stored(),
                    processed = report.processing.success,
                    "Scheduled run finished"
                );
            }
            Err(e) => error!(error = %e, "Scheduled run failed"),
        }
    })
    .await
}
