//! Bounded, fail-safe access to a classifier.
//!
//! Every call goes through the same steps:
//! 1. Local heuristics; when one fires, no classifier is called
//! 2. The delegate classifier, bounded by a hard timeout
//! 3. On any failure, the deterministic fallback, with the error kept
//!    in the returned [`Verdict`]

use super::heuristics::{detect_heuristic, HeuristicFinding};
use super::rules::RuleClassifier;
use super::{AnomalyReport, Classification, ClassifierError, FlowClassifier, UsageContext};
use crate::core::tips::{generate_tips, validate_recommendations, Recommendation};
use crate::readings::FlowSample;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictSource {
    /// A local heuristic fired; no classifier was called
    Heuristic,
    /// The delegate classifier answered
    Delegate,
    /// External analysis is disabled; local rules answered
    Local,
    /// The delegate failed or timed out; fixed fallback values
    Fallback,
}

/// A result that is always usable, with the failure (if any) attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict<T> {
    pub value: T,
    pub source: VerdictSource,
    pub error: Option<ClassifierError>,
}

impl<T> Verdict<T> {
    fn answered(value: T, source: VerdictSource) -> Self {
        Self {
            value,
            source,
            error: None,
        }
    }

    fn fallback(value: T, error: ClassifierError) -> Self {
        Self {
            value,
            source: VerdictSource::Fallback,
            error: Some(error),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.source == VerdictSource::Fallback
    }
}

/// Classification and anomaly verdicts for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventVerdict {
    pub classification: Verdict<Classification>,
    pub anomalies: Verdict<AnomalyReport>,
}

impl EventVerdict {
    pub fn heuristic(&self) -> bool {
        self.classification.source == VerdictSource::Heuristic
    }

    pub fn any_fallback(&self) -> bool {
        self.classification.is_fallback() || self.anomalies.is_fallback()
    }
}

/// Wraps a [`FlowClassifier`] with heuristics, timeout and fallbacks.
#[derive(Clone)]
pub struct ClassifierAdapter {
    delegate: Arc<dyn FlowClassifier>,
    local: RuleClassifier,
    timeout: Duration,
}

impl ClassifierAdapter {
    pub fn new(delegate: Arc<dyn FlowClassifier>, timeout: Duration) -> Self {
        Self {
            delegate,
            local: RuleClassifier::new(),
            timeout,
        }
    }

    /// Adapter over the local rule classifier only.
    pub fn local(timeout: Duration) -> Self {
        Self::new(Arc::new(RuleClassifier::new()), timeout)
    }

    pub fn delegate_name(&self) -> &str {
        self.delegate.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Categorize a flow profile.
    pub async fn classify(&self, flow: &[FlowSample], allow_delegate: bool) -> Verdict<Classification> {
        if let Some(finding) = detect_heuristic(flow) {
            return Verdict::answered(finding.classification(), VerdictSource::Heuristic);
        }
        self.classify_with_delegate(flow, allow_delegate).await
    }

    /// Check a flow profile for anomalies.
    pub async fn detect_anomalies(
        &self,
        flow: &[FlowSample],
        allow_delegate: bool,
    ) -> Verdict<AnomalyReport> {
        if let Some(finding) = detect_heuristic(flow) {
            return Verdict::answered(finding.anomaly_report(), VerdictSource::Heuristic);
        }
        self.anomalies_with_delegate(flow, allow_delegate).await
    }

    /// Classify a closed event. The heuristics run once; the two delegate
    /// calls run concurrently, each under its own timeout.
    pub async fn evaluate(&self, flow: &[FlowSample], allow_delegate: bool) -> EventVerdict {
        if let Some(finding) = detect_heuristic(flow) {
            log_finding(&finding);
            return EventVerdict {
                classification: Verdict::answered(finding.classification(), VerdictSource::Heuristic),
                anomalies: Verdict::answered(finding.anomaly_report(), VerdictSource::Heuristic),
            };
        }

        let (classification, anomalies) = tokio::join!(
            self.classify_with_delegate(flow, allow_delegate),
            self.anomalies_with_delegate(flow, allow_delegate)
        );
        EventVerdict {
            classification,
            anomalies,
        }
    }

    /// Tips for a usage summary: the delegate's list when it has a usable
    /// one, otherwise the static rule table.
    pub async fn recommend(
        &self,
        usage: &UsageContext,
        allow_delegate: bool,
    ) -> Verdict<Vec<Recommendation>> {
        let rule_tips = || generate_tips(&usage.categories);
        if !allow_delegate {
            return Verdict::answered(rule_tips(), VerdictSource::Local);
        }

        match self.bounded(self.delegate.recommend(usage)).await {
            Ok(tips) => match validate_recommendations(tips) {
                Some(tips) => Verdict::answered(tips, VerdictSource::Delegate),
                None => Verdict::fallback(
                    rule_tips(),
                    ClassifierError::Serialization("no usable recommendations".to_string()),
                ),
            },
            Err(e) => {
                debug!(classifier = self.delegate.name(), error = %e, "Using rule-table tips");
                Verdict::fallback(rule_tips(), e)
            }
        }
    }

    async fn classify_with_delegate(
        &self,
        flow: &[FlowSample],
        allow_delegate: bool,
    ) -> Verdict<Classification> {
        if !allow_delegate {
            return Verdict::answered(self.local.classify_profile(flow), VerdictSource::Local);
        }
        match self.bounded(self.delegate.classify(flow)).await {
            Ok(classification) => Verdict::answered(classification, VerdictSource::Delegate),
            Err(e) => {
                warn!(classifier = self.delegate.name(), error = %e, "Classification unavailable, using fallback");
                Verdict::fallback(Classification::fallback(), e)
            }
        }
    }

    async fn anomalies_with_delegate(
        &self,
        flow: &[FlowSample],
        allow_delegate: bool,
    ) -> Verdict<AnomalyReport> {
        if !allow_delegate {
            return Verdict::answered(self.local.anomalies_of(flow), VerdictSource::Local);
        }
        match self.bounded(self.delegate.detect_anomalies(flow)).await {
            Ok(report) => Verdict::answered(report, VerdictSource::Delegate),
            Err(e) => {
                warn!(classifier = self.delegate.name(), error = %e, "Anomaly detection unavailable, using fallback");
                Verdict::fallback(AnomalyReport::none(), e)
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ClassifierError>
    where
        F: Future<Output = Result<T, ClassifierError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClassifierError::Timeout(self.timeout)),
        }
    }
}

fn log_finding(finding: &HeuristicFinding) {
    match finding {
        HeuristicFinding::PossibleLeak { samples } => {
            debug!(samples = samples.len(), "Possible leak heuristic fired")
        }
        HeuristicFinding::HighFlow { samples } => {
            debug!(samples = samples.len(), "High flow heuristic fired")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    #[async_trait]
    impl FlowClassifier for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn classify(&self, _flow: &[FlowSample]) -> Result<Classification, ClassifierError> {
            Err(ClassifierError::Network("connection refused".to_string()))
        }

        async fn detect_anomalies(&self, _flow: &[FlowSample]) -> Result<AnomalyReport, ClassifierError> {
            Err(ClassifierError::Network("connection refused".to_string()))
        }
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FlowClassifier for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn classify(&self, _flow: &[FlowSample]) -> Result<Classification, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Classification::new("shower", 90, "counted"))
        }

        async fn detect_anomalies(&self, _flow: &[FlowSample]) -> Result<AnomalyReport, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AnomalyReport::none())
        }
    }

    struct Slow;

    #[async_trait]
    impl FlowClassifier for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn classify(&self, _flow: &[FlowSample]) -> Result<Classification, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Classification::new("shower", 90, "too late"))
        }

        async fn detect_anomalies(&self, _flow: &[FlowSample]) -> Result<AnomalyReport, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AnomalyReport::none())
        }
    }

    fn flow(rates: &[f64]) -> Vec<FlowSample> {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        rates
            .iter()
            .enumerate()
            .map(|(i, &rate)| FlowSample {
                time: base + chrono::Duration::minutes(i as i64),
                rate_ml_per_min: rate,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failure_yields_fallback_with_error() {
        let adapter = ClassifierAdapter::new(Arc::new(Failing), Duration::from_secs(1));
        let verdict = adapter.evaluate(&flow(&[500.0, 600.0, 550.0]), true).await;

        assert_eq!(verdict.classification.value, Classification::fallback());
        assert!(verdict.classification.is_fallback());
        assert!(matches!(
            verdict.classification.error,
            Some(ClassifierError::Network(_))
        ));
        assert!(!verdict.anomalies.value.is_anomalous());
        assert!(verdict.any_fallback());
    }

    #[tokio::test]
    async fn test_heuristic_skips_delegate() {
        let counting = Arc::new(Counting::default());
        let adapter = ClassifierAdapter::new(counting.clone(), Duration::from_secs(1));

        let verdict = adapter.evaluate(&flow(&[100.0; 15]), true).await;
        assert!(verdict.heuristic());
        assert_eq!(verdict.classification.value.category, "leak");
        assert_eq!(verdict.anomalies.value.anomalies[0].kind, "possible_leak");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);

        let verdict = adapter.evaluate(&flow(&[500.0, 600.0, 550.0]), true).await;
        assert_eq!(verdict.classification.source, VerdictSource::Delegate);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_analysis_never_calls_delegate() {
        let counting = Arc::new(Counting::default());
        let adapter = ClassifierAdapter::new(counting.clone(), Duration::from_secs(1));

        let verdict = adapter.evaluate(&flow(&[9000.0; 8]), false).await;
        assert_eq!(verdict.classification.source, VerdictSource::Local);
        assert_eq!(verdict.classification.value.category, "shower");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_delegate_times_out() {
        let adapter = ClassifierAdapter::new(Arc::new(Slow), Duration::from_millis(100));
        let verdict = adapter.classify(&flow(&[500.0, 600.0, 550.0]), true).await;

        assert!(verdict.is_fallback());
        assert_eq!(
            verdict.error,
            Some(ClassifierError::Timeout(Duration::from_millis(100)))
        );
    }

    #[tokio::test]
    async fn test_recommend_falls_back_to_rule_table() {
        let adapter = ClassifierAdapter::new(Arc::new(Failing), Duration::from_secs(1));
        let usage = UsageContext {
            total_usage_ml: 0,
            usage_comparison: 0,
            categories: Vec::new(),
        };

        let verdict = adapter.recommend(&usage, true).await;
        assert!(verdict.is_fallback());
        assert!(matches!(verdict.error, Some(ClassifierError::Unavailable(_))));
        assert_eq!(verdict.value.len(), 2);

        let local = adapter.recommend(&usage, false).await;
        assert_eq!(local.source, VerdictSource::Local);
    }
}
