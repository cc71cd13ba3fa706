//! Per-run processing summary.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::process::retry::{AttemptOutcome, RetryReport};

fn as_secs_f64<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Counters for one processing run. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStatistics {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub wildboar_detected: usize,
    #[serde(rename = "duration_secs", serialize_with = "as_secs_f64")]
    pub duration: Duration,
    /// Failed attempts per error kind, including attempts that were later retried.
    pub error_counts: BTreeMap<String, u32>,
    pub cancelled: bool,
}

impl ProcessingStatistics {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Fold one record's retry report into the counters.
    pub fn record(&mut self, report: &RetryReport) {
        for kind in &report.errors {
            *self.error_counts.entry(kind.to_string()).or_insert(0) += 1;
        }
        match report.outcome {
            AttemptOutcome::Succeeded(detection) => {
                self.success += 1;
                if detection.contains_wildboar {
                    self.wildboar_detected += 1;
                }
            }
            AttemptOutcome::Failed => self.failure += 1,
            AttemptOutcome::Cancelled => self.cancelled = true,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failure > 0
    }
}
