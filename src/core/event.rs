//! Water usage events.
//!
//! An event moves through three states: open (owned by the segmenter while
//! flow continues), closed (flow stopped, statistics final) and classified
//! (category and anomaly verdict attached, persisted with an id).

use crate::readings::{FlowSample, MeterId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category label of an event that has not been classified yet.
pub const UNCLASSIFIED: &str = "";

/// An event still accumulating readings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenEvent {
    pub start_time: DateTime<Utc>,
    /// Timestamp of the latest above-threshold reading
    pub last_time: DateTime<Utc>,
    pub volume_ml: u64,
    pub peak_rate_ml_per_min: f64,
    pub flow_data: Vec<FlowSample>,
}

impl OpenEvent {
    pub fn start(sample: FlowSample, value_ml: u32) -> Self {
        Self {
            start_time: sample.time,
            last_time: sample.time,
            volume_ml: value_ml as u64,
            peak_rate_ml_per_min: sample.rate_ml_per_min,
            flow_data: vec![sample],
        }
    }

    pub fn extend(&mut self, sample: FlowSample, value_ml: u32) {
        self.last_time = sample.time;
        self.volume_ml += value_ml as u64;
        self.peak_rate_ml_per_min = self.peak_rate_ml_per_min.max(sample.rate_ml_per_min);
        self.flow_data.push(sample);
    }

    pub fn sample_count(&self) -> usize {
        self.flow_data.len()
    }

    /// Finalize the event at the timestamp of the reading that ended the flow.
    pub fn close(self, end_time: DateTime<Utc>) -> ClosedEvent {
        let duration_secs = (end_time - self.start_time).num_seconds().max(0) as u64;
        let avg_flow_rate = if duration_secs == 0 {
            self.peak_rate_ml_per_min.round() as u32
        } else {
            (self.volume_ml as f64 / (duration_secs as f64 / 60.0)).round() as u32
        };

        ClosedEvent {
            start_time: self.start_time,
            end_time,
            duration_secs,
            volume_ml: self.volume_ml,
            peak_flow_rate: self.peak_rate_ml_per_min.round() as u32,
            avg_flow_rate,
            flow_data: self.flow_data,
        }
    }
}

/// An event whose flow has stopped; statistics are final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedEvent {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: u64,
    pub volume_ml: u64,
    /// mL/min
    pub peak_flow_rate: u32,
    /// mL/min
    pub avg_flow_rate: u32,
    pub flow_data: Vec<FlowSample>,
}

/// A persisted event with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaterEvent {
    pub id: u64,
    pub meter_id: MeterId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub volume_ml: u64,
    pub peak_flow_rate_ml_per_min: u32,
    pub avg_flow_rate_ml_per_min: u32,
    pub category: String,
    /// 0-100
    pub confidence: u8,
    pub anomaly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_description: Option<String>,
    pub flow_data: Vec<FlowSample>,
}

impl WaterEvent {
    /// Build an unclassified event from a closed one; the store assigns the id.
    pub fn from_closed(meter_id: MeterId, closed: ClosedEvent) -> Self {
        Self {
            id: 0,
            meter_id,
            start_time: closed.start_time,
            end_time: closed.end_time,
            duration_seconds: closed.duration_secs,
            volume_ml: closed.volume_ml,
            peak_flow_rate_ml_per_min: closed.peak_flow_rate,
            avg_flow_rate_ml_per_min: closed.avg_flow_rate,
            category: UNCLASSIFIED.to_string(),
            confidence: 0,
            anomaly: false,
            anomaly_description: None,
            flow_data: closed.flow_data,
        }
    }

    pub fn is_classified(&self) -> bool {
        !self.category.is_empty()
    }

    /// Whether `t` falls inside `[start_time, end_time]`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start_time && t <= self.end_time
    }
}
