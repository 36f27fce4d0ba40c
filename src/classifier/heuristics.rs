//! Cheap local checks applied before any classifier is consulted.

use super::{Anomaly, AnomalyReport, Classification, Severity, FALLBACK_CATEGORY};
use crate::readings::FlowSample;

/// Rates strictly below this (and above zero) count as leak-like, mL/min.
pub const LEAK_MAX_RATE_ML_PER_MIN: f64 = 200.0;

/// Consecutive leak-like samples needed to flag a possible leak.
pub const LEAK_MIN_SAMPLES: usize = 10;

/// Rates strictly above this count as unusually high, mL/min.
pub const HIGH_FLOW_RATE_ML_PER_MIN: f64 = 15_000.0;

/// High-rate samples (anywhere in the profile) needed to flag high flow.
pub const HIGH_FLOW_MIN_SAMPLES: usize = 3;

const LEAK_DETAILS: &str = "Continuous low flow detected, possibly indicating a leak.";
const HIGH_FLOW_DETAILS: &str =
    "Unusually high water flow detected, possibly indicating a burst pipe or open tap.";

/// A heuristic that fired, with the samples that triggered it.
#[derive(Debug, Clone, PartialEq)]
pub enum HeuristicFinding {
    PossibleLeak { samples: Vec<FlowSample> },
    HighFlow { samples: Vec<FlowSample> },
}

impl HeuristicFinding {
    /// Category assigned without consulting a classifier.
    pub fn classification(&self) -> Classification {
        match self {
            HeuristicFinding::PossibleLeak { samples } => Classification::new(
                "leak",
                70,
                format!("{} consecutive low-flow samples", samples.len()),
            ),
            HeuristicFinding::HighFlow { samples } => Classification::new(
                FALLBACK_CATEGORY,
                50,
                format!("{} samples above 15 L/min", samples.len()),
            ),
        }
    }

    pub fn anomaly_report(&self) -> AnomalyReport {
        let (kind, severity, details, samples) = match self {
            HeuristicFinding::PossibleLeak { samples } => {
                ("possible_leak", Severity::Medium, LEAK_DETAILS, samples)
            }
            HeuristicFinding::HighFlow { samples } => {
                ("high_flow", Severity::High, HIGH_FLOW_DETAILS, samples)
            }
        };
        AnomalyReport {
            anomalies: vec![Anomaly {
                kind: kind.to_string(),
                severity,
                start_time: samples.first().map(|s| s.time),
                end_time: samples.last().map(|s| s.time),
            }],
            details: details.to_string(),
        }
    }
}

fn is_leak_like(sample: &FlowSample) -> bool {
    sample.rate_ml_per_min > 0.0 && sample.rate_ml_per_min < LEAK_MAX_RATE_ML_PER_MIN
}

/// Run both heuristics; a possible leak takes precedence over high flow.
pub fn detect_heuristic(flow: &[FlowSample]) -> Option<HeuristicFinding> {
    let longest_leak_run = flow
        .split(|s| !is_leak_like(s))
        .max_by_key(|run| run.len())
        .unwrap_or(&[]);
    if longest_leak_run.len() >= LEAK_MIN_SAMPLES {
        return Some(HeuristicFinding::PossibleLeak {
            samples: longest_leak_run.to_vec(),
        });
    }

    let high: Vec<FlowSample> = flow
        .iter()
        .filter(|s| s.rate_ml_per_min > HIGH_FLOW_RATE_ML_PER_MIN)
        .copied()
        .collect();
    if high.len() >= HIGH_FLOW_MIN_SAMPLES {
        return Some(HeuristicFinding::HighFlow { samples: high });
    }

    None
}
