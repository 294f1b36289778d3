//! Motion histograms over device active logs.
//!
//! Only the live buffer of each device is charted; archived sets are not read.
//! Lines with `false` movement are skipped. A line whose timestamp cannot be
//! parsed is counted in [`Chart::malformed_lines`] and charted at the
//! aggregation instant.

use std::collections::BTreeMap;
use std::sync::Arc;

use csv::ReaderBuilder;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;

use motionwatch_types::{TimeMeasure, parse_movement, parse_timestamp};

use crate::error::Result;
use crate::logs::EventLogStore;

/// Histogram of one device's motion events at one granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub device_name: String,
    pub time_measure: TimeMeasure,
    /// Event count per bucket index. Index 0 is the oldest bucket; every
    /// index is present.
    pub buckets: BTreeMap<usize, u64>,
    /// Lines that could not be fully parsed.
    pub malformed_lines: u64,
}

impl Chart {
    fn empty(device_name: &str, time_measure: TimeMeasure, count: usize) -> Self {
        Self {
            device_name: device_name.to_string(),
            time_measure,
            buckets: (0..count).map(|i| (i, 0)).collect(),
            malformed_lines: 0,
        }
    }

    /// Sum of all bucket counts.
    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }
}

/// Read-only consumer of [`EventLogStore`] that buckets events by time.
#[derive(Clone)]
pub struct ChartAggregator {
    logs: Arc<EventLogStore>,
}

impl ChartAggregator {
    pub fn new(logs: Arc<EventLogStore>) -> Self {
        Self { logs }
    }

    /// Chart every device with an active log as of now.
    pub fn aggregate(&self, measure: TimeMeasure) -> Result<Vec<Chart>> {
        self.aggregate_at(measure, OffsetDateTime::now_utc())
    }

    /// Chart every device with an active log as of `now`.
    ///
    /// [`TimeMeasure::All`] yields an hour chart and a day chart per device.
    pub fn aggregate_at(&self, measure: TimeMeasure, now: OffsetDateTime) -> Result<Vec<Chart>> {
        let mut charts = Vec::new();

        for device in self.logs.active_devices()? {
            let contents = self.logs.read_active(&device)?;
            for &granularity in measure.granularities() {
                charts.push(chart_log(&device, &contents, granularity, now));
            }
        }

        Ok(charts)
    }
}

/// Bucket the lines of one active log.
fn chart_log(device: &str, contents: &[u8], measure: TimeMeasure, now: OffsetDateTime) -> Chart {
    let Some((width, count)) = measure.buckets() else {
        return Chart::empty(device, measure, 0);
    };
    let mut chart = Chart::empty(device, measure, count);

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(contents);

    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                debug!("Unreadable line in {} log: {}", device, e);
                chart.malformed_lines += 1;
                continue;
            }
        };

        if record.len() != 4 {
            debug!("Skipping line with {} fields in {} log", record.len(), device);
            chart.malformed_lines += 1;
            continue;
        }

        let mut malformed = false;

        match parse_movement(&record[3]) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                debug!("{} in {} log", e, device);
                malformed = true;
            }
        }

        let timestamp = match parse_timestamp(&record[1], &record[2]) {
            Ok(ts) => ts,
            Err(e) => {
                debug!("{} in {} log, charting at now", e, device);
                malformed = true;
                now
            }
        };

        if malformed {
            chart.malformed_lines += 1;
        }

        if let Some(index) = bucket_index(timestamp, now, width, count)
            && let Some(slot) = chart.buckets.get_mut(&index)
        {
            *slot += 1;
        }
    }

    chart
}

/// Bucket for `timestamp` in a window of `count` buckets of `width` ending at
/// `now`.
///
/// Bucket `i` covers `[now - (count - i) * width, now - (count - i - 1) * width)`.
/// Timestamps at or after `now` land in the newest bucket; timestamps before
/// the window return `None`.
pub fn bucket_index(
    timestamp: OffsetDateTime,
    now: OffsetDateTime,
    width: time::Duration,
    count: usize,
) -> Option<usize> {
    if count == 0 || width <= time::Duration::ZERO {
        return None;
    }
    if timestamp >= now {
        return Some(count - 1);
    }

    // Walk from the newest bucket back
    let mut end = now;
    for index in (0..count).rev() {
        let start = end - width;
        if timestamp >= start && timestamp < end {
            return Some(index);
        }
        end = start;
    }

    None
}
