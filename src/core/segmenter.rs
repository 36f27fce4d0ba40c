//! Event segmentation of a single meter's reading stream.
//!
//! Readings above the flow threshold are accumulated into an open event.
//! The first reading at or below the threshold closes it; events with too
//! few samples are discarded as sensor noise.

use crate::config::SegmenterConfig;
use crate::core::event::{ClosedEvent, OpenEvent};
use crate::readings::{flow_rate_ml_per_min, FlowSample, Reading};
use chrono::{DateTime, Duration, Utc};

/// Segmentation failures. The offending reading is dropped and the
/// segmenter state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    #[error("reading at {timestamp} is not later than the last processed reading at {last}")]
    OutOfOrderReading {
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// What a single reading did to the segmenter.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentStep {
    /// No flow and no open event
    Idle,
    /// Flow started; a new event is open
    Opened,
    /// Flow continued on the open event
    Extended,
    /// Flow stopped and the event was long enough to keep
    Closed(ClosedEvent),
    /// Flow stopped but the event had too few samples
    Discarded { samples: usize },
}

/// Segmenter state for one meter.
///
/// Holds at most one open event. Readings must arrive in strictly
/// increasing timestamp order.
#[derive(Debug, Clone)]
pub struct MeterSegmenter {
    flow_threshold_ml: u32,
    min_samples: usize,
    nominal_interval: Duration,
    open: Option<OpenEvent>,
    last_reading_at: Option<DateTime<Utc>>,
}

impl MeterSegmenter {
    /// Create a new segmenter with the given parameters.
    pub fn new(config: &SegmenterConfig) -> Self {
        Self {
            flow_threshold_ml: config.flow_threshold_ml,
            min_samples: config.min_samples.max(1),
            nominal_interval: config.nominal_interval(),
            open: None,
            last_reading_at: None,
        }
    }

    /// Continue a stream whose earlier readings were processed elsewhere;
    /// only readings after `last` will be accepted.
    pub fn resume_after(mut self, last: Option<DateTime<Utc>>) -> Self {
        self.last_reading_at = last;
        self
    }

    /// Whether a reading counts as flow. The threshold itself is no flow.
    pub fn is_flow(&self, reading: &Reading) -> bool {
        reading.value > self.flow_threshold_ml
    }

    /// Process the next reading.
    ///
    /// This will:
    /// 1. Reject readings not later than the last processed one
    /// 2. Open or extend an event on above-threshold flow
    /// 3. Close (or discard) the open event when flow stops
    pub fn process_reading(&mut self, reading: &Reading) -> Result<SegmentStep, SegmentError> {
        if let Some(last) = self.last_reading_at {
            if reading.timestamp <= last {
                return Err(SegmentError::OutOfOrderReading {
                    timestamp: reading.timestamp,
                    last,
                });
            }
        }

        let interval = self
            .last_reading_at
            .map(|last| reading.timestamp - last)
            .unwrap_or(self.nominal_interval);
        self.last_reading_at = Some(reading.timestamp);

        if self.is_flow(reading) {
            let sample = FlowSample {
                time: reading.timestamp,
                rate_ml_per_min: flow_rate_ml_per_min(reading.value, interval),
            };

            return Ok(match self.open {
                Some(ref mut open) => {
                    open.extend(sample, reading.value);
                    SegmentStep::Extended
                }
                None => {
                    self.open = Some(OpenEvent::start(sample, reading.value));
                    SegmentStep::Opened
                }
            });
        }

        Ok(match self.open.take() {
            None => SegmentStep::Idle,
            Some(open) if open.sample_count() < self.min_samples => SegmentStep::Discarded {
                samples: open.sample_count(),
            },
            Some(open) => SegmentStep::Closed(open.close(reading.timestamp)),
        })
    }

    /// The event currently accumulating, if any.
    pub fn open_event(&self) -> Option<&OpenEvent> {
        self.open.as_ref()
    }

    /// Timestamp of the last accepted reading.
    pub fn last_reading_at(&self) -> Option<DateTime<Utc>> {
        self.last_reading_at
    }

    /// Drop the open event and forget the reading history.
    pub fn reset(&mut self) {
        self.open = None;
        self.last_reading_at = None;
    }
}

/// Run an ordered batch of readings through a fresh segmenter and collect
/// the closed events. Out-of-order readings are skipped.
pub fn segment_readings(config: &SegmenterConfig, readings: &[Reading]) -> Vec<ClosedEvent> {
    let mut segmenter = MeterSegmenter::new(config);
    readings
        .iter()
        .filter_map(|r| match segmenter.process_reading(r) {
            Ok(SegmentStep::Closed(event)) => Some(event),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn readings(values: &[u32]) -> Vec<Reading> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Reading::new(at(i as i64), v))
            .collect()
    }

    #[test]
    fn test_single_event_scenario() {
        let events = segment_readings(
            &SegmenterConfig::default(),
            &readings(&[0, 500, 600, 550, 0]),
        );

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.start_time, at(1));
        assert_eq!(event.end_time, at(4));
        assert_eq!(event.volume_ml, 1650);
        assert_eq!(event.duration_secs, 180);
        assert_eq!(event.avg_flow_rate, 550);
        assert_eq!(event.peak_flow_rate, 600);
        assert_eq!(event.flow_data.len(), 3);
    }

    #[test]
    fn test_two_sample_burst_is_discarded() {
        let mut segmenter = MeterSegmenter::new(&SegmenterConfig::default());
        let input = readings(&[0, 400, 400, 0]);

        let steps: Vec<SegmentStep> = input
            .iter()
            .map(|r| segmenter.process_reading(r).unwrap())
            .collect();

        assert_eq!(steps[1], SegmentStep::Opened);
        assert_eq!(steps[2], SegmentStep::Extended);
        assert_eq!(steps[3], SegmentStep::Discarded { samples: 2 });
        assert!(segmenter.open_event().is_none());
    }

    #[test]
    fn test_threshold_value_is_no_flow() {
        let config = SegmenterConfig::default();
        let segmenter = MeterSegmenter::new(&config);
        assert!(!segmenter.is_flow(&Reading::new(at(0), 67)));
        assert!(segmenter.is_flow(&Reading::new(at(0), 68)));

        // Readings at exactly the threshold close the event
        let events = segment_readings(&config, &readings(&[68, 68, 68, 67]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].volume_ml, 204);

        // ...and never open one
        let events = segment_readings(&config, &readings(&[67, 67, 67, 67, 0]));
        assert!(events.is_empty());
    }

    #[test]
    fn test_out_of_order_reading_is_rejected_without_corrupting_state() {
        let mut segmenter = MeterSegmenter::new(&SegmenterConfig::default());
        segmenter.process_reading(&Reading::new(at(1), 500)).unwrap();
        segmenter.process_reading(&Reading::new(at(2), 500)).unwrap();

        let err = segmenter
            .process_reading(&Reading::new(at(2), 900))
            .unwrap_err();
        assert_eq!(
            err,
            SegmentError::OutOfOrderReading {
                timestamp: at(2),
                last: at(2)
            }
        );
        assert!(segmenter.process_reading(&Reading::new(at(0), 900)).is_err());

        let open = segmenter.open_event().unwrap();
        assert_eq!(open.volume_ml, 1000);
        assert_eq!(open.sample_count(), 2);
        assert_eq!(segmenter.last_reading_at(), Some(at(2)));
    }

    #[test]
    fn test_rate_uses_actual_interval() {
        let config = SegmenterConfig::default();
        let input = vec![
            Reading::new(at(0), 0),
            Reading::new(at(0) + Duration::seconds(30), 300),
            Reading::new(at(1), 300),
            Reading::new(at(2), 300),
            Reading::new(at(3), 0),
        ];
        let events = segment_readings(&config, &input);
        let rates: Vec<f64> = events[0]
            .flow_data
            .iter()
            .map(|s| s.rate_ml_per_min)
            .collect();
        assert_eq!(rates, vec![600.0, 600.0, 300.0]);
        assert_eq!(events[0].peak_flow_rate, 600);
    }

    #[test]
    fn test_first_reading_uses_nominal_interval() {
        let config = SegmenterConfig {
            sample_interval: std::time::Duration::from_secs(30),
            ..SegmenterConfig::default()
        };
        let mut segmenter = MeterSegmenter::new(&config);
        segmenter.process_reading(&Reading::new(at(0), 100)).unwrap();
        assert_eq!(segmenter.open_event().unwrap().flow_data[0].rate_ml_per_min, 200.0);
    }

    #[test]
    fn test_segmentation_is_deterministic() {
        let input = readings(&[0, 120, 340, 90, 0, 0, 700, 800, 900, 1000, 10, 80, 80, 80, 0]);
        let config = SegmenterConfig::default();
        let first = segment_readings(&config, &input);
        let second = segment_readings(&config, &input);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_volume_conservation() {
        let input = readings(&[0, 120, 340, 90, 0, 0, 700, 800, 900, 1000, 10]);
        for event in segment_readings(&SegmenterConfig::default(), &input) {
            let expected: u64 = input
                .iter()
                .filter(|r| r.timestamp >= event.start_time && r.timestamp < event.end_time)
                .map(|r| r.value as u64)
                .sum();
            assert_eq!(event.volume_ml, expected);
            assert!(event
                .flow_data
                .iter()
                .all(|s| s.time >= event.start_time && s.time <= event.end_time));
        }
    }

    #[test]
    fn test_resumed_segmenter_rejects_older_readings() {
        let mut segmenter =
            MeterSegmenter::new(&SegmenterConfig::default()).resume_after(Some(at(5)));
        assert!(segmenter.process_reading(&Reading::new(at(5), 500)).is_err());
        segmenter.process_reading(&Reading::new(at(7), 500)).unwrap();
        // Interval measured from the resumed timestamp
        assert_eq!(segmenter.open_event().unwrap().flow_data[0].rate_ml_per_min, 250.0);
    }

    #[test]
    fn test_reset_clears_open_event() {
        let mut segmenter = MeterSegmenter::new(&SegmenterConfig::default());
        segmenter.process_reading(&Reading::new(at(1), 500)).unwrap();
        segmenter.reset();
        assert!(segmenter.open_event().is_none());
        assert!(segmenter.last_reading_at().is_none());
        assert!(segmenter.process_reading(&Reading::new(at(0), 0)).is_ok());
    }
}
