//! Resampling of irregular readings into fixed-resolution buckets.
//!
//! Input must already be sorted by timestamp ascending. Each bucket is a run
//! of consecutive readings sharing the same window start, so unsorted input
//! produces split or repeated buckets rather than an error.

use crate::telemetry::types::{AggregatePoint, EnergySummary, Resolution, TelemetrySnapshot};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    Timelike, Utc,
};

#[derive(Debug, Clone)]
struct Bucket {
    bucket_start: DateTime<Utc>,
    resolution: Resolution,
    sample_count: u32,
    production_sum: f64,
    consumption_sum: f64,
    import_sum: f64,
    import_count: u32,
    export_sum: f64,
    export_count: u32,
}

impl Bucket {
    fn open(bucket_start: DateTime<Utc>, resolution: Resolution) -> Self {
        Self {
            bucket_start,
            resolution,
            sample_count: 0,
            production_sum: 0.0,
            consumption_sum: 0.0,
            import_sum: 0.0,
            import_count: 0,
            export_sum: 0.0,
            export_count: 0,
        }
    }

    fn push(&mut self, reading: &TelemetrySnapshot) {
        self.sample_count = self.sample_count.saturating_add(1);
        self.production_sum += reading.production;
        self.consumption_sum += reading.consumption;

        // Split by the sign of each reading so opposite flows never cancel.
        if reading.grid_flow > 0.0 {
            self.import_sum += reading.grid_flow;
            self.import_count = self.import_count.saturating_add(1);
        } else if reading.grid_flow < 0.0 {
            self.export_sum += -reading.grid_flow;
            self.export_count = self.export_count.saturating_add(1);
        }
    }

    fn finalize(self) -> AggregatePoint {
        let samples = f64::from(self.sample_count.max(1));
        AggregatePoint {
            bucket_start: self.bucket_start,
            resolution: self.resolution,
            sample_count: self.sample_count,
            mean_production: self.production_sum / samples,
            mean_consumption: self.consumption_sum / samples,
            net_export: mean_or_zero(self.export_sum, self.export_count),
            net_import: mean_or_zero(self.import_sum, self.import_count),
        }
    }
}

fn mean_or_zero(sum: f64, count: u32) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / f64::from(count)
    }
}

/// Buckets readings on UTC calendar boundaries.
pub fn aggregate(readings: &[TelemetrySnapshot], resolution: Resolution) -> Vec<AggregatePoint> {
    aggregate_with_offset(readings, resolution, Utc.fix())
}

/// Buckets readings on the calendar boundaries of a fixed UTC offset.
pub fn aggregate_with_offset(
    readings: &[TelemetrySnapshot],
    resolution: Resolution,
    offset: FixedOffset,
) -> Vec<AggregatePoint> {
    let mut points = Vec::new();
    let mut current: Option<Bucket> = None;
    let mut out_of_order = false;

    for reading in readings {
        let bucket_start = bucket_start(reading.timestamp, resolution, offset);
        match current.as_mut() {
            Some(bucket) if bucket.bucket_start == bucket_start => bucket.push(reading),
            Some(bucket) => {
                if bucket_start < bucket.bucket_start {
                    out_of_order = true;
                }
                let mut next = Bucket::open(bucket_start, resolution);
                next.push(reading);
                if let Some(closed) = current.replace(next) {
                    points.push(closed.finalize());
                }
            }
            None => {
                let mut next = Bucket::open(bucket_start, resolution);
                next.push(reading);
                current = Some(next);
            }
        }
    }

    if let Some(bucket) = current {
        points.push(bucket.finalize());
    }

    if out_of_order {
        tracing::warn!(
            resolution = resolution.as_str(),
            readings = readings.len(),
            "aggregate received readings out of time order; bucket order is undefined"
        );
    }

    points
}

/// Start of the window containing `timestamp`, expressed in UTC.
pub fn bucket_start(
    timestamp: DateTime<Utc>,
    resolution: Resolution,
    offset: FixedOffset,
) -> DateTime<Utc> {
    let offset_seconds = i64::from(offset.local_minus_utc());
    let local = timestamp.naive_utc() + Duration::seconds(offset_seconds);
    let local_floor = floor_local(local, resolution);
    (local_floor - Duration::seconds(offset_seconds)).and_utc()
}

fn floor_local(local: NaiveDateTime, resolution: Resolution) -> NaiveDateTime {
    let date = local.date();
    match resolution {
        Resolution::Hour => date.and_hms_opt(local.hour(), 0, 0).unwrap_or(local),
        Resolution::Day => date.and_time(NaiveTime::MIN),
        Resolution::Week => {
            let days_from_monday = i64::from(date.weekday().num_days_from_monday());
            (date - Duration::days(days_from_monday)).and_time(NaiveTime::MIN)
        }
        Resolution::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
            .unwrap_or(date)
            .and_time(NaiveTime::MIN),
    }
}

/// Period totals over raw readings. Totals are sums of instantaneous values;
/// callers that need energy must integrate first.
pub fn summarize(readings: &[TelemetrySnapshot]) -> EnergySummary {
    if readings.is_empty() {
        return EnergySummary::default();
    }

    let mut summary = EnergySummary::default();
    for reading in readings {
        summary.sample_count = summary.sample_count.saturating_add(1);
        summary.total_production += reading.production;
        summary.total_consumption += reading.consumption;
        if reading.grid_flow > 0.0 {
            summary.total_import += reading.grid_flow;
        } else if reading.grid_flow < 0.0 {
            summary.total_export += -reading.grid_flow;
        }
        summary.peak_production = summary.peak_production.max(reading.production);
    }

    summary.average_production = summary.total_production / f64::from(summary.sample_count);
    summary.self_consumption_rate = if summary.total_production > 0.0 {
        (summary.total_production - summary.total_export) / summary.total_production * 100.0
    } else {
        0.0
    };
    summary
}
