//! Usage aggregation over a query window.
//!
//! This module turns the readings and events of a window into the numbers a
//! dashboard shows: totals, comparison with the previous period, peak flow,
//! category breakdown, a bucketed flow series and the anomaly summary.
//! Everything here is a pure function of its inputs.

use crate::core::event::WaterEvent;
use crate::core::format::{format_clock_time, format_event, FormattedEvent};
use crate::core::window::{Granularity, TimeWindow};
use crate::readings::types::ml_to_liters_string;
use crate::readings::{rates, Reading};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Description used when an anomalous event carries none.
pub const DEFAULT_ANOMALY_DESCRIPTION: &str = "Possible leak detected";

/// Label for events that were never classified.
const UNCLASSIFIED_LABEL: &str = "unclassified";

/// Display and unit settings for aggregation.
#[derive(Debug, Clone, Copy)]
pub struct AggregateOptions {
    pub tz: Tz,
    /// Interval assumed for the first reading of the window
    pub nominal_interval: Duration,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            tz: chrono_tz::UTC,
            nominal_interval: Duration::seconds(60),
        }
    }
}

/// Volume attributed to one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUsage {
    pub name: String,
    /// One-decimal liters with unit, e.g. "12.4 L"
    pub volume: String,
    pub volume_ml: u64,
    /// Share of the category base, one decimal
    pub percentage: f64,
    pub event_count: usize,
}

/// One point of the chart series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPoint {
    /// Bucket start
    pub time: DateTime<Utc>,
    /// Mean instantaneous rate of the bucket's readings, L/min
    pub value: f64,
}

/// The aggregation result for one window. Built fresh per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub time_range: Granularity,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Liters, one decimal; "0" when the window has no readings
    pub total_usage: String,
    pub total_usage_ml: u64,
    /// Percent change against the previous equal-length window
    pub usage_comparison: i64,
    /// Largest single reading in liters, one decimal
    pub peak_flow: String,
    pub peak_flow_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_flow_category: Option<String>,
    pub event_count: usize,
    pub category_count: usize,
    pub anomaly_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_description: Option<String>,
    pub flow_data: Vec<FlowPoint>,
    /// Newest first
    pub events: Vec<FormattedEvent>,
    /// Largest share first
    pub categories: Vec<CategoryUsage>,
}

/// Aggregate a window.
///
/// `readings` and `events` may extend beyond the window; only readings with
/// a timestamp in `[start, end)` and events starting in it are used.
/// `previous_readings` feeds the period comparison and is restricted to the
/// preceding equal-length window.
pub fn aggregate(
    window: &TimeWindow,
    granularity: Granularity,
    readings: &[Reading],
    previous_readings: &[Reading],
    events: &[WaterEvent],
    options: &AggregateOptions,
) -> UsageSummary {
    let mut window_readings: Vec<Reading> = readings
        .iter()
        .filter(|r| window.contains(r.timestamp))
        .copied()
        .collect();
    window_readings.sort_by_key(|r| r.timestamp);

    let mut window_events: Vec<&WaterEvent> = events
        .iter()
        .filter(|e| window.contains(e.start_time))
        .collect();
    window_events.sort_by_key(|e| e.start_time);

    let preceding = previous_readings
        .iter()
        .chain(readings.iter())
        .map(|r| r.timestamp)
        .filter(|t| *t < window.start())
        .max();

    let total_ml = sum_ml(&window_readings);
    let previous_window = window.previous();
    let previous_ml: u64 = previous_readings
        .iter()
        .filter(|r| previous_window.contains(r.timestamp))
        .map(|r| r.value as u64)
        .sum();

    let peak = find_peak(&window_readings);
    let (peak_flow, peak_flow_time, peak_flow_category) = match peak {
        Some(reading) => (
            ml_to_liters_string(reading.value as u64),
            format_clock_time(reading.timestamp, options.tz),
            window_events
                .iter()
                .find(|e| e.contains(reading.timestamp))
                .filter(|e| e.is_classified())
                .map(|e| e.category.clone()),
        ),
        None => ("0".to_string(), String::new(), None),
    };

    let categories = category_breakdown(&window_events, total_ml);

    let anomalous: Vec<&&WaterEvent> = window_events.iter().filter(|e| e.anomaly).collect();
    let anomaly_description = anomalous.first().map(|e| {
        e.anomaly_description
            .clone()
            .unwrap_or_else(|| DEFAULT_ANOMALY_DESCRIPTION.to_string())
    });

    let mut formatted: Vec<FormattedEvent> = window_events
        .iter()
        .map(|e| format_event(e, options.tz, granularity))
        .collect();
    formatted.reverse();

    UsageSummary {
        time_range: granularity,
        start_date: window.start(),
        end_date: window.end(),
        total_usage: if window_readings.is_empty() {
            "0".to_string()
        } else {
            ml_to_liters_string(total_ml)
        },
        total_usage_ml: total_ml,
        usage_comparison: usage_comparison(total_ml, previous_ml),
        peak_flow,
        peak_flow_time,
        peak_flow_category,
        event_count: window_events.len(),
        category_count: categories.len(),
        anomaly_count: anomalous.len(),
        anomaly_description,
        flow_data: flow_series(
            &window_readings,
            preceding,
            granularity.bucket_width(),
            options.nominal_interval,
        ),
        events: formatted,
        categories,
    }
}

/// Sum of reading volumes in mL.
pub fn sum_ml(readings: &[Reading]) -> u64 {
    readings.iter().map(|r| r.value as u64).sum()
}

/// Rounded percent change; zero when there is no previous usage.
pub fn usage_comparison(current_ml: u64, previous_ml: u64) -> i64 {
    if previous_ml == 0 {
        return 0;
    }
    let change = (current_ml as f64 - previous_ml as f64) / previous_ml as f64 * 100.0;
    change.round() as i64
}

/// The largest reading; the earliest one wins ties.
pub fn find_peak(readings: &[Reading]) -> Option<&Reading> {
    readings.iter().fold(None, |best: Option<&Reading>, r| match best {
        Some(b) if b.value >= r.value => Some(b),
        _ => Some(r),
    })
}

/// Group events by category.
///
/// A category's percentage is its event volume divided by
/// `max(total event volume, total_reading_ml)`. When every reading in the
/// window belongs to an event the shares sum to 100. Any reading volume
/// outside events makes the shares sum to less than 100. Events whose raw
/// readings were not stored never push the sum past 100.
pub fn category_breakdown(events: &[&WaterEvent], total_reading_ml: u64) -> Vec<CategoryUsage> {
    let mut groups: BTreeMap<&str, (u64, usize)> = BTreeMap::new();
    for event in events {
        let name = if event.is_classified() {
            event.category.as_str()
        } else {
            UNCLASSIFIED_LABEL
        };
        let entry = groups.entry(name).or_insert((0, 0));
        entry.0 += event.volume_ml;
        entry.1 += 1;
    }

    let event_total: u64 = groups.values().map(|(ml, _)| ml).sum();
    let base = event_total.max(total_reading_ml);

    let mut categories: Vec<CategoryUsage> = groups
        .into_iter()
        .map(|(name, (volume_ml, event_count))| CategoryUsage {
            name: name.to_string(),
            volume: format!("{} L", ml_to_liters_string(volume_ml)),
            volume_ml,
            percentage: if base == 0 {
                0.0
            } else {
                round1(volume_ml as f64 / base as f64 * 100.0)
            },
            event_count,
        })
        .collect();

    // Stable sort keeps alphabetical order among equal shares
    categories.sort_by(|a, b| b.percentage.total_cmp(&a.percentage));
    categories
}

/// Bucket readings into fixed-width, epoch-aligned buckets and average the
/// instantaneous rate of each bucket's readings. Empty buckets are omitted.
///
/// `preceding` is the timestamp of the last reading before `readings`, so
/// the first rate matches the one the segmenter saw.
pub fn flow_series(
    readings: &[Reading],
    preceding: Option<DateTime<Utc>>,
    bucket_width: Duration,
    nominal_interval: Duration,
) -> Vec<FlowPoint> {
    let width_ms = bucket_width.num_milliseconds().max(1);
    let mut points = Vec::new();
    let mut current: Option<(i64, f64, usize)> = None;

    for (reading, rate) in rates(readings, preceding, nominal_interval) {
        let bucket_start = reading.timestamp.timestamp_millis().div_euclid(width_ms) * width_ms;
        if let Some((start, total, count)) = current.as_mut() {
            if *start == bucket_start {
                *total += rate;
                *count += 1;
                continue;
            }
        }
        if let Some(done) = current.replace((bucket_start, rate, 1)) {
            points.extend(finish_bucket(done));
        }
    }
    if let Some(done) = current {
        points.extend(finish_bucket(done));
    }

    points
}

fn finish_bucket((start_ms, total_rate, count): (i64, f64, usize)) -> Option<FlowPoint> {
    let time = Utc.timestamp_millis_opt(start_ms).single()?;
    Some(FlowPoint {
        time,
        value: total_rate / count as f64 / 1000.0,
    })
}

/// Round to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
