//! Human-readable formatting of events for dashboards.

use crate::core::event::WaterEvent;
use crate::core::window::Granularity;
use crate::readings::types::ml_to_liters_string;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Flow-rate label used when peak and average differ.
pub const VARIED_FLOW: &str = "Varied";

/// An event prepared for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedEvent {
    pub id: u64,
    /// Localized start time
    pub time: String,
    pub category: String,
    pub duration: String,
    pub volume: String,
    pub flow_rate: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub anomaly: bool,
}

/// Format a duration as `"Xh Ym"` from one hour upwards, else `"Xm Ys"`.
pub fn format_duration(secs: u64) -> String {
    if secs >= 3600 {
        let minutes = (secs + 30) / 60;
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// A single L/min value when the flow was uniform, else "Varied".
pub fn format_flow_rate(peak_ml_per_min: u32, avg_ml_per_min: u32) -> String {
    if peak_ml_per_min == avg_ml_per_min {
        format!("{:.1} L/min", avg_ml_per_min as f64 / 1000.0)
    } else {
        VARIED_FLOW.to_string()
    }
}

/// Localized month/day/time; week views also show the weekday.
pub fn format_local_time(t: DateTime<Utc>, tz: Tz, granularity: Granularity) -> String {
    let local = t.with_timezone(&tz);
    match granularity {
        Granularity::Week => local.format("%a %-m/%-d %H:%M").to_string(),
        _ => local.format("%-m/%-d %H:%M").to_string(),
    }
}

/// Localized `HH:MM`.
pub fn format_clock_time(t: DateTime<Utc>, tz: Tz) -> String {
    t.with_timezone(&tz).format("%H:%M").to_string()
}

/// Prepare an event for display.
pub fn format_event(event: &WaterEvent, tz: Tz, granularity: Granularity) -> FormattedEvent {
    FormattedEvent {
        id: event.id,
        time: format_local_time(event.start_time, tz, granularity),
        category: event.category.clone(),
        duration: format_duration(event.duration_seconds),
        volume: format!("{} L", ml_to_liters_string(event.volume_ml)),
        flow_rate: format_flow_rate(
            event.peak_flow_rate_ml_per_min,
            event.avg_flow_rate_ml_per_min,
        ),
        start_time: event.start_time,
        end_time: event.end_time,
        anomaly: event.anomaly,
    }
}
