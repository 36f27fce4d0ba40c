//! Meter readings and derived flow samples.
//!
//! A reading carries the volume (in milliliters) accumulated since the
//! previous reading of the same meter. Flow rates are derived by dividing
//! that volume by the elapsed interval, so the interval has to be known.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single household meter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeterId(String);

impl MeterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MeterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One timestamped volume sample from the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// When the meter reported
    pub timestamp: DateTime<Utc>,
    /// Milliliters accumulated since the previous reading
    pub value: u32,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>, value: u32) -> Self {
        Self { timestamp, value }
    }
}

/// A (time, rate) point of an event's flow profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSample {
    pub time: DateTime<Utc>,
    /// Instantaneous rate in mL/min
    pub rate_ml_per_min: f64,
}

impl FlowSample {
    /// Rate converted to L/min for display.
    pub fn rate_l_per_min(&self) -> f64 {
        self.rate_ml_per_min / 1000.0
    }
}

/// Convert a reading volume accumulated over `interval` into mL/min.
///
/// A non-positive interval yields a rate of zero rather than infinity.
pub fn flow_rate_ml_per_min(value_ml: u32, interval: Duration) -> f64 {
    let secs = interval.num_milliseconds() as f64 / 1000.0;
    if secs <= 0.0 {
        return 0.0;
    }
    value_ml as f64 * 60.0 / secs
}

/// Pair each reading with its instantaneous rate.
///
/// The interval of a reading is the gap to the reading before it. The first
/// reading measures from `preceding`, the timestamp of the last reading
/// before the slice, and uses `nominal_interval` when there is none.
pub fn rates<'a>(
    readings: &'a [Reading],
    preceding: Option<DateTime<Utc>>,
    nominal_interval: Duration,
) -> impl Iterator<Item = (&'a Reading, f64)> + 'a {
    readings.iter().enumerate().map(move |(i, reading)| {
        let prev = match i.checked_sub(1) {
            Some(p) => Some(readings[p].timestamp),
            None => preceding,
        };
        let interval = match prev {
            Some(prev) => reading.timestamp - prev,
            None => nominal_interval,
        };
        (reading, flow_rate_ml_per_min(reading.value, interval))
    })
}

/// Convert milliliters to a one-decimal liter string.
pub fn ml_to_liters_string(ml: u64) -> String {
    format!("{:.1}", ml as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap() + Duration::minutes(min)
    }

    #[test]
    fn test_rate_per_minute_interval() {
        assert_eq!(flow_rate_ml_per_min(500, Duration::minutes(1)), 500.0);
        assert_eq!(flow_rate_ml_per_min(500, Duration::seconds(30)), 1000.0);
        assert_eq!(flow_rate_ml_per_min(500, Duration::seconds(0)), 0.0);
    }

    #[test]
    fn test_rates_infer_interval_from_previous_reading() {
        let readings = vec![
            Reading::new(at(0), 100),
            Reading::new(at(2), 100),
            Reading::new(at(3), 100),
        ];
        let computed: Vec<f64> = rates(&readings, None, Duration::minutes(1))
            .map(|(_, r)| r)
            .collect();
        assert_eq!(computed, vec![100.0, 50.0, 100.0]);
    }

    #[test]
    fn test_first_rate_measures_from_preceding_reading() {
        let readings = vec![Reading::new(at(5), 100), Reading::new(at(6), 100)];
        let computed: Vec<f64> = rates(&readings, Some(at(1)), Duration::minutes(1))
            .map(|(_, r)| r)
            .collect();
        assert_eq!(computed, vec![25.0, 100.0]);
    }

    #[test]
    fn test_liters_string() {
        assert_eq!(ml_to_liters_string(1640), "1.6");
        assert_eq!(ml_to_liters_string(0), "0.0");
        assert_eq!(ml_to_liters_string(12_345), "12.3");
    }

    #[test]
    fn test_meter_id_serializes_as_string() {
        let id = MeterId::new("kitchen");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"kitchen\"");
    }
}
