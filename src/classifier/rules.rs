//! Local rule-based classifier.
//!
//! Matches an event's duration and flow statistics against typical
//! household fixture profiles. Used when no remote classifier is
//! configured, and as a deterministic stand-in in tests.

use super::{
    Anomaly, AnomalyReport, Classification, ClassifierError, FlowClassifier, Severity,
    FALLBACK_CATEGORY, FALLBACK_CONFIDENCE,
};
use crate::readings::FlowSample;
use async_trait::async_trait;
use statrs::statistics::Statistics;

/// Continuous flow longer than this is reported as an anomaly.
const LONG_RUNNING_SECS: f64 = 2.0 * 3600.0;

/// Coefficient of variation below which flow counts as steady.
const STEADY_CV: f64 = 0.25;

/// Coefficient of variation above which flow counts as cycling.
const VARIED_CV: f64 = 0.35;

/// Summary statistics of a flow profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowStats {
    /// Estimated event length, seconds
    pub duration_secs: f64,
    /// Mean rate, L/min
    pub mean_l_per_min: f64,
    /// Standard deviation over mean; zero for fewer than two samples
    pub variation: f64,
}

impl FlowStats {
    pub fn from_flow(flow: &[FlowSample]) -> Option<Self> {
        let (first, last) = (flow.first()?, flow.last()?);

        let rates: Vec<f64> = flow.iter().map(|s| s.rate_l_per_min()).collect();
        let mean = rates.iter().mean();

        let variation = if rates.len() < 2 || mean <= 0.0 {
            0.0
        } else {
            rates.iter().std_dev() / mean
        };

        // The last sample covers one more interval past its timestamp
        let gaps: Vec<f64> = flow
            .windows(2)
            .map(|w| (w[1].time - w[0].time).num_milliseconds() as f64 / 1000.0)
            .collect();
        let step = if gaps.is_empty() { 60.0 } else { gaps.iter().mean() };
        let span = (last.time - first.time).num_milliseconds() as f64 / 1000.0;

        Some(Self {
            duration_secs: span + step,
            mean_l_per_min: mean,
            variation,
        })
    }

    fn is_steady(&self) -> bool {
        self.variation < STEADY_CV
    }

    fn is_varied(&self) -> bool {
        self.variation > VARIED_CV
    }
}

/// Classifier matching fixture profiles by duration and flow statistics.
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify synchronously.
    pub fn classify_profile(&self, flow: &[FlowSample]) -> Classification {
        let Some(stats) = FlowStats::from_flow(flow) else {
            return Classification::new(FALLBACK_CATEGORY, FALLBACK_CONFIDENCE, "Empty flow profile.");
        };
        let minutes = stats.duration_secs / 60.0;
        let rate = stats.mean_l_per_min;

        let matched = if stats.duration_secs <= 60.0 && (8.0..=12.0).contains(&rate) {
            Some(("toilet", 75, "Short burst at cistern refill rate."))
        } else if stats.duration_secs <= 180.0 && (2.0..=8.0).contains(&rate) {
            Some(("faucet", 70, "Short draw at tap flow rate."))
        } else if (3.0..=15.0).contains(&minutes) && (5.0..=12.0).contains(&rate) && stats.is_steady() {
            Some(("shower", 75, "Several minutes of steady medium-high flow."))
        } else if (30.0..=60.0).contains(&minutes) && stats.is_varied() {
            Some(("dishwasher", 60, "Cycling flow over half an hour to an hour."))
        } else if (60.0..=90.0).contains(&minutes) && stats.is_varied() {
            Some(("washing_machine", 60, "Cycling flow over one to one and a half hours."))
        } else if minutes >= 15.0 && stats.is_steady() {
            Some(("irrigation", 65, "Long run at a constant rate."))
        } else {
            None
        };

        match matched {
            Some((category, confidence, reasoning)) => {
                Classification::new(category, confidence, reasoning)
            }
            None => Classification::new(
                FALLBACK_CATEGORY,
                FALLBACK_CONFIDENCE,
                "No known fixture profile matched.",
            ),
        }
    }

    /// Report flow that runs far longer than any household fixture.
    pub fn anomalies_of(&self, flow: &[FlowSample]) -> AnomalyReport {
        match FlowStats::from_flow(flow) {
            Some(stats) if stats.duration_secs > LONG_RUNNING_SECS => AnomalyReport {
                anomalies: vec![Anomaly {
                    kind: "long_running".to_string(),
                    severity: Severity::Medium,
                    start_time: flow.first().map(|s| s.time),
                    end_time: flow.last().map(|s| s.time),
                }],
                details: "Water ran continuously for more than two hours.".to_string(),
            },
            _ => AnomalyReport::none(),
        }
    }
}

#[async_trait]
impl FlowClassifier for RuleClassifier {
    fn name(&self) -> &str {
        "rules"
    }

    async fn classify(&self, flow: &[FlowSample]) -> Result<Classification, ClassifierError> {
        Ok(self.classify_profile(flow))
    }

    async fn detect_anomalies(&self, flow: &[FlowSample]) -> Result<AnomalyReport, ClassifierError> {
        Ok(self.anomalies_of(flow))
    }
}
