//! Detection statistics over stored records, grouped by capture hour.

use std::collections::BTreeMap;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;

use crate::model::ImageRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionPoint {
    /// Start of the capture hour.
    pub timestamp: DateTime<Utc>,
    pub count: usize,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSummary {
    pub detections: Vec<DetectionPoint>,
    pub total_images: usize,
    pub wildboar_images: usize,
    pub date_range: DateRange,
}

/// Truncate a timestamp to the start of its hour.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts)
}

/// Summarize `records` captured within `[start, end]`.
///
/// `total_images` counts every record; detections count only wildboar
/// sightings scoring at least `min_confidence`.
pub fn summarize(
    records: &[ImageRecord],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    min_confidence: Option<f64>,
) -> DetectionSummary {
    let threshold = min_confidence.unwrap_or(0.0);
    let mut buckets: BTreeMap<DateTime<Utc>, (usize, f64)> = BTreeMap::new();
    let mut wildboar_images = 0;

    for record in records {
        let Some(detection) = record.detection() else {
            continue;
        };
        if !detection.contains_wildboar || detection.confidence < threshold {
            continue;
        }
        wildboar_images += 1;
        let entry = buckets.entry(hour_bucket(record.captured_at)).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += detection.confidence;
    }

    let detections = buckets
        .into_iter()
        .map(|(timestamp, (count, sum))| DetectionPoint {
            timestamp,
            count,
            average_confidence: sum / count as f64,
        })
        .collect();

    DetectionSummary {
        detections,
        total_images: records.len(),
        wildboar_images,
        date_range: DateRange {
            start: start.format("%Y-%m-%d").to_string(),
            end: end.format("%Y-%m-%d").to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::Detection;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap()
    }

    fn processed(h: u32, m: u32, boar: bool, confidence: f64) -> ImageRecord {
        let mut r = ImageRecord::new_unprocessed(at(h, m), "u");
        r.mark_processed(Detection::new(boar, confidence));
        r
    }

    #[test]
    fn hour_bucket_truncates() {
        assert_eq!(hour_bucket(at(10, 47)), at(10, 0));
    }

    #[test]
    fn groups_wildboar_by_hour_with_average() {
        let records = vec![
            processed(10, 5, true, 0.8),
            processed(10, 50, true, 0.6),
            processed(11, 0, true, 0.9),
            processed(11, 30, false, 0.95),
            ImageRecord::new_unprocessed(at(12, 0), "u"),
        ];

        let summary = summarize(&records, at(0, 0), at(23, 0), None);
        assert_eq!(summary.total_images, 5);
        assert_eq!(summary.wildboar_images, 3);
        assert_eq!(summary.detections.len(), 2);
        assert_eq!(summary.detections[0].timestamp, at(10, 0));
        assert_eq!(summary.detections[0].count, 2);
        assert!((summary.detections[0].average_confidence - 0.7).abs() < 1e-9);
        assert_eq!(summary.date_range.start, "2024-01-02");
    }

    #[test]
    fn min_confidence_filters_detections_not_totals() {
        let records = vec![processed(10, 0, true, 0.5), processed(10, 10, true, 0.9)];
        let summary = summarize(&records, at(0, 0), at(23, 0), Some(0.75));
        assert_eq!(summary.total_images, 2);
        assert_eq!(summary.wildboar_images, 1);
        assert_eq!(summary.detections[0].average_confidence, 0.9);
    }

    #[test]
    fn serializes_camel_case() {
        let summary = summarize(&[], at(0, 0), at(1, 0), None);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["totalImages"], 0);
        assert!(json["detections"].as_array().unwrap().is_empty());
    }
}
