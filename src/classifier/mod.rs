//! Event classification.
//!
//! A closed event's flow profile is given a category and an anomaly verdict
//! by a [`FlowClassifier`]. The [`ClassifierAdapter`] wraps any classifier
//! with local heuristics, a hard timeout and deterministic fallbacks.

pub mod adapter;
pub mod heuristics;
pub mod rules;

#[cfg(feature = "remote")]
pub mod remote;

pub use adapter::{ClassifierAdapter, Verdict, VerdictSource};
pub use heuristics::{detect_heuristic, HeuristicFinding};
pub use rules::RuleClassifier;

#[cfg(feature = "remote")]
pub use remote::RemoteClassifier;

use crate::config::ClassifierConfig;
use crate::core::aggregator::CategoryUsage;
use crate::core::tips::Recommendation;
use crate::readings::FlowSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Category used when nothing better is known.
pub const FALLBACK_CATEGORY: &str = "other";

/// Confidence reported with the fallback category.
pub const FALLBACK_CONFIDENCE: u8 = 50;

pub const FALLBACK_REASONING: &str = "Unable to categorize event.";

/// A category label with confidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    /// 0-100
    pub confidence: u8,
    pub reasoning: String,
}

impl Classification {
    pub fn new(category: impl Into<String>, confidence: u8, reasoning: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            confidence: confidence.min(100),
            reasoning: reasoning.into(),
        }
    }

    /// The deterministic answer used when classification is unavailable.
    pub fn fallback() -> Self {
        Self::new(FALLBACK_CATEGORY, FALLBACK_CONFIDENCE, FALLBACK_REASONING)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One abnormal stretch of flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Anomaly verdict for a flow profile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnomalyReport {
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
    #[serde(default)]
    pub details: String,
}

impl AnomalyReport {
    /// No anomalies.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_anomalous(&self) -> bool {
        !self.anomalies.is_empty()
    }

    /// Description to store on an event, if the report flags anything.
    pub fn description(&self) -> Option<String> {
        if !self.is_anomalous() {
            return None;
        }
        if self.details.trim().is_empty() {
            self.anomalies.first().map(|a| a.kind.replace('_', " "))
        } else {
            Some(self.details.clone())
        }
    }
}

/// Usage data handed to a classifier that can suggest tips.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageContext {
    pub total_usage_ml: u64,
    pub usage_comparison: i64,
    pub categories: Vec<CategoryUsage>,
}

/// Classifier errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),
    #[error("classifier network error: {0}")]
    Network(String),
    #[error("classifier server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("classifier serialization error: {0}")]
    Serialization(String),
    #[error("classifier config error: {0}")]
    Config(String),
}

/// Something that can label a flow profile.
///
/// Implementations may be slow or fail; callers go through
/// [`ClassifierAdapter`], which bounds and recovers every call.
#[async_trait]
pub trait FlowClassifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn classify(&self, flow: &[FlowSample]) -> Result<Classification, ClassifierError>;

    async fn detect_anomalies(&self, flow: &[FlowSample]) -> Result<AnomalyReport, ClassifierError>;

    /// Personalized tips. Classifiers without this capability report
    /// themselves unavailable and the static rule table is used instead.
    async fn recommend(&self, _usage: &UsageContext) -> Result<Vec<Recommendation>, ClassifierError> {
        Err(ClassifierError::Unavailable(format!(
            "{} does not generate recommendations",
            self.name()
        )))
    }
}

/// Build the adapter described by the configuration: the remote service
/// when an endpoint is configured, the local rules otherwise.
pub fn adapter_from_config(config: &ClassifierConfig) -> Result<ClassifierAdapter, ClassifierError> {
    Ok(match remote_delegate(config)? {
        Some(delegate) => ClassifierAdapter::new(delegate, config.timeout),
        None => ClassifierAdapter::local(config.timeout),
    })
}

#[cfg(feature = "remote")]
fn remote_delegate(config: &ClassifierConfig) -> Result<Option<Arc<dyn FlowClassifier>>, ClassifierError> {
    match config.endpoint {
        Some(ref endpoint) => {
            let remote = RemoteClassifier::new(endpoint.clone(), config.timeout)?;
            tracing::info!(url = %endpoint.url(), client_id = remote.client_id(), "Using remote classifier");
            let delegate: Arc<dyn FlowClassifier> = Arc::new(remote);
            Ok(Some(delegate))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "remote"))]
fn remote_delegate(config: &ClassifierConfig) -> Result<Option<Arc<dyn FlowClassifier>>, ClassifierError> {
    if config.endpoint.is_some() {
        tracing::warn!("Classifier endpoint configured but built without the `remote` feature; using local rules");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_without_endpoint_is_local() {
        let adapter = adapter_from_config(&ClassifierConfig::default()).unwrap();
        assert_eq!(adapter.delegate_name(), "rules");
        assert_eq!(adapter.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_fallback_values() {
        let fallback = Classification::fallback();
        assert_eq!(fallback.category, "other");
        assert_eq!(fallback.confidence, 50);
        assert_eq!(fallback.reasoning, "Unable to categorize event.");
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(Classification::new("shower", 140, "").confidence, 100);
    }

    #[test]
    fn test_report_description() {
        assert!(AnomalyReport::none().description().is_none());

        let report = AnomalyReport {
            anomalies: vec![Anomaly {
                kind: "possible_leak".to_string(),
                severity: Severity::Medium,
                start_time: None,
                end_time: None,
            }],
            details: String::new(),
        };
        assert_eq!(report.description().as_deref(), Some("possible leak"));
    }

    #[test]
    fn test_anomaly_json_shape() {
        let json = serde_json::to_value(Anomaly {
            kind: "high_flow".to_string(),
            severity: Severity::High,
            start_time: None,
            end_time: None,
        })
        .unwrap();
        assert_eq!(json["type"], "high_flow");
        assert_eq!(json["severity"], "high");
        assert!(json.get("startTime").is_none());
    }
}
