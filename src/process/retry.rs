//! Bounded retry with exponential backoff and cancellable waits.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::Detection;

/// Which step of an attempt failed. Keys of the error histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BlobDownload,
    Classification,
    RecordUpdate,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BlobDownload => "blob_download",
            ErrorKind::Classification => "classification",
            ErrorKind::RecordUpdate => "record_update",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt: the step that failed and why.
#[derive(Debug, Clone)]
pub struct AttemptError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: ErrorKind, err: impl fmt::Display) -> Self {
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    /// Wait before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded(Detection),
    /// Every attempt failed.
    Failed,
    /// Cancelled while waiting to retry.
    Cancelled,
}

/// What one record's retry loop observed.
#[derive(Debug, Clone)]
pub struct RetryReport {
    pub outcome: AttemptOutcome,
    /// Kind of every failed attempt, in order.
    pub errors: Vec<ErrorKind>,
    /// Every backoff wait that was started, in order.
    pub delays: Vec<Duration>,
}

/// Run `attempt` until it succeeds, retries run out, or `cancel` fires during a wait.
pub async fn run_with_retry<F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut attempt: F,
) -> RetryReport
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Detection, AttemptError>>,
{
    let mut errors = Vec::new();
    let mut delays = Vec::new();

    for n in 0..=policy.max_retries {
        if n > 0 {
            let delay = policy.delay_for(n);
            delays.push(delay);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RetryReport { outcome: AttemptOutcome::Cancelled, errors, delays };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match attempt().await {
            Ok(detection) => {
                return RetryReport {
                    outcome: AttemptOutcome::Succeeded(detection),
                    errors,
                    delays,
                };
            }
            Err(e) => {
                warn!(
                    record = label,
                    attempt = n + 1,
                    max_attempts = policy.max_retries + 1,
                    kind = %e.kind,
                    error = %e.message,
                    "Attempt failed"
                );
                errors.push(e.kind);
            }
        }
    }

    RetryReport {
        outcome: AttemptOutcome::Failed,
        errors,
        delays,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1))
    }

    #[test]
    fn delays_double_from_base() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let p = policy();
        assert!(p.delay_for(200) >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn error_kind_names() {
        assert_eq!(ErrorKind::BlobDownload.to_string(), "blob_download");
        assert_eq!(ErrorKind::RecordUpdate.as_str(), "record_update");
    }

    #[tokio::test(start_paused = true)]
    async fn fail_fail_succeed_waits_one_then_two_seconds() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let report = run_with_retry(policy(), &cancel, "r1", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AttemptError::new(ErrorKind::Classification, "model timeout"))
            } else {
                Ok(Detection::new(true, 0.9))
            }
        })
        .await;

        assert_eq!(report.outcome, AttemptOutcome::Succeeded(Detection::new(true, 0.9)));
        assert_eq!(report.delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(report.errors, vec![ErrorKind::Classification; 2]);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let report = run_with_retry(policy(), &cancel, "r1", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AttemptError::new(ErrorKind::BlobDownload, "gone"))
        })
        .await;

        assert_eq!(report.outcome, AttemptOutcome::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.errors.len(), 4);
        assert_eq!(
            report.delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_single_attempt() {
        let cancel = CancellationToken::new();
        let report = run_with_retry(
            RetryPolicy::new(0, Duration::from_secs(1)),
            &cancel,
            "r1",
            || async { Err(AttemptError::new(ErrorKind::RecordUpdate, "locked")) },
        )
        .await;

        assert_eq!(report.outcome, AttemptOutcome::Failed);
        assert!(report.delays.is_empty());
        assert_eq!(report.errors, vec![ErrorKind::RecordUpdate]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let report = run_with_retry(policy(), &cancel, "r1", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            Err(AttemptError::new(ErrorKind::Classification, "busy"))
        })
        .await;

        assert_eq!(report.outcome, AttemptOutcome::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.errors, vec![ErrorKind::Classification]);
    }
}
