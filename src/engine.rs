//! The water usage engine.
//!
//! Owns one segmenter per meter, the classifier adapter, the store and the
//! diagnostics counters, and exposes every operation the CLI and the HTTP
//! server need.
//!
//! Each meter's segmenter sits behind its own mutex: readings of one meter
//! are processed strictly in order while different meters proceed in
//! parallel. The mutex is released before a closed event is classified, so
//! a slow classifier never holds up ingestion.

use crate::classifier::adapter::EventVerdict;
use crate::classifier::{
    AnomalyReport, Classification, ClassifierAdapter, UsageContext, Verdict,
};
use crate::config::{Config, SegmenterConfig};
use crate::core::aggregator::{aggregate, AggregateOptions, UsageSummary};
use crate::core::chains::{analyze_chain, ChainAnalysis, ChainLink};
use crate::core::event::{ClosedEvent, WaterEvent};
use crate::core::segmenter::{MeterSegmenter, SegmentError, SegmentStep};
use crate::core::tips::Recommendation;
use crate::core::window::{Granularity, QueryError, TimeWindow};
use crate::diagnostics::{DiagnosticsStats, SharedDiagnosticsLog};
use crate::readings::{FlowSample, MeterId, Reading};
use crate::store::{EventFilter, Removed, Settings, SettingsPatch, Store, StoreError};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Errors surfaced to callers. Everything else is recovered and logged.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown meter '{0}'")]
    UnknownMeter(MeterId),
    #[error("event {0} not found")]
    EventNotFound(u64),
    #[error("invalid time window: end {end} is before start {start}")]
    InvalidTimeWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("config error: {0}")]
    Config(String),
}

impl From<QueryError> for EngineError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidTimeWindow { start, end } => {
                EngineError::InvalidTimeWindow { start, end }
            }
            QueryError::UnknownGranularity(g) => {
                EngineError::Config(format!("unknown granularity '{g}'"))
            }
        }
    }
}

/// What ingesting one reading did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// No flow and no open event
    Idle,
    /// Flow started
    Opened,
    /// Flow continued
    Extended,
    /// Flow stopped before the event had enough samples
    Discarded { samples: usize },
    /// Flow stopped; the event was classified and stored
    EventClosed { event: Box<WaterEvent> },
    /// The reading was out of order and dropped
    Dropped { reason: String },
}

/// A usage summary with tips.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    #[serde(flatten)]
    pub summary: UsageSummary,
    pub recommendations: Vec<Recommendation>,
}

/// Ingestion and query facade over all meters.
pub struct WaterUsageEngine {
    segmenter_config: SegmenterConfig,
    segmenters: RwLock<HashMap<MeterId, Arc<Mutex<MeterSegmenter>>>>,
    store: RwLock<Store>,
    classifier: ClassifierAdapter,
    diagnostics: SharedDiagnosticsLog,
    tz: Tz,
    store_path: Option<PathBuf>,
}

impl WaterUsageEngine {
    /// Create an in-memory engine.
    pub fn new(
        segmenter_config: SegmenterConfig,
        classifier: ClassifierAdapter,
        diagnostics: SharedDiagnosticsLog,
        tz: Tz,
    ) -> Self {
        Self {
            segmenter_config,
            segmenters: RwLock::new(HashMap::new()),
            store: RwLock::new(Store::new()),
            classifier,
            diagnostics,
            tz,
            store_path: None,
        }
    }

    /// Create an engine backed by the store file under the configured data
    /// directory, loading whatever it already holds.
    pub fn open(
        config: &Config,
        classifier: ClassifierAdapter,
        diagnostics: SharedDiagnosticsLog,
    ) -> Result<Self, EngineError> {
        let tz = config.tz().map_err(|e| EngineError::Config(e.to_string()))?;
        let store_path = config.store_path();
        let store = Store::open(&store_path)?;
        info!(path = %store_path.display(), "Opened store");

        Ok(Self {
            store: RwLock::new(store),
            store_path: Some(store_path),
            ..Self::new(config.segmenter.clone(), classifier, diagnostics, tz)
        })
    }

    /// Persist the store and the diagnostics counters.
    pub async fn save(&self) -> Result<(), EngineError> {
        if let Some(ref path) = self.store_path {
            self.store.read().await.save(path)?;
            debug!(path = %path.display(), "Saved store");
        }
        self.diagnostics.save().map_err(StoreError::from)?;
        Ok(())
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn classifier(&self) -> &ClassifierAdapter {
        &self.classifier
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Feed one reading to its meter's segmenter.
    ///
    /// Out-of-order readings are logged, counted and dropped. When the
    /// reading closes an event, the event is classified and stored before
    /// this returns.
    pub async fn ingest_reading(
        &self,
        meter: &MeterId,
        timestamp: DateTime<Utc>,
        value: u32,
    ) -> Result<IngestOutcome, EngineError> {
        let reading = Reading::new(timestamp, value);
        let segmenter = self.segmenter_for(meter).await;

        let (step, settings) = {
            let mut segmenter = segmenter.lock().await;
            let step = match segmenter.process_reading(&reading) {
                Ok(step) => step,
                Err(e @ SegmentError::OutOfOrderReading { .. }) => {
                    warn!(meter = %meter, timestamp = %reading.timestamp, error = %e, "Dropping out-of-order reading");
                    self.diagnostics.record_out_of_order();
                    return Ok(IngestOutcome::Dropped {
                        reason: e.to_string(),
                    });
                }
            };

            // Stored under the meter lock so the store sees readings in order
            let mut store = self.store.write().await;
            let settings = store.settings_or_default(meter);
            if settings.store_raw_data {
                store.readings.insert(meter, reading);
            }
            (step, settings)
        };
        self.diagnostics.record_reading_ingested();

        Ok(match step {
            SegmentStep::Idle => IngestOutcome::Idle,
            SegmentStep::Opened => IngestOutcome::Opened,
            SegmentStep::Extended => IngestOutcome::Extended,
            SegmentStep::Discarded { samples } => {
                debug!(meter = %meter, samples, "Discarding noisy event");
                self.diagnostics.record_noisy_event();
                IngestOutcome::Discarded { samples }
            }
            SegmentStep::Closed(closed) => IngestOutcome::EventClosed {
                event: Box::new(self.finish_event(meter, closed, &settings).await),
            },
        })
    }

    async fn segmenter_for(&self, meter: &MeterId) -> Arc<Mutex<MeterSegmenter>> {
        if let Some(segmenter) = self.segmenters.read().await.get(meter) {
            return segmenter.clone();
        }

        // Resume after the newest stored reading so a restart cannot accept
        // readings older than what is already stored
        let last = self
            .store
            .read()
            .await
            .readings
            .last(meter)
            .map(|r| r.timestamp);

        let mut segmenters = self.segmenters.write().await;
        segmenters
            .entry(meter.clone())
            .or_insert_with(|| {
                debug!(meter = %meter, "Creating segmenter");
                Arc::new(Mutex::new(
                    MeterSegmenter::new(&self.segmenter_config).resume_after(last),
                ))
            })
            .clone()
    }

    async fn finish_event(
        &self,
        meter: &MeterId,
        closed: ClosedEvent,
        settings: &Settings,
    ) -> WaterEvent {
        let mut event = WaterEvent::from_closed(meter.clone(), closed);
        let verdict = self
            .classifier
            .evaluate(&event.flow_data, settings.allow_ai_analysis)
            .await;
        self.record_verdict(&verdict);

        let EventVerdict {
            classification,
            anomalies,
        } = verdict;
        event.category = classification.value.category;
        event.confidence = classification.value.confidence;
        if anomalies.value.is_anomalous() {
            event.anomaly = true;
            event.anomaly_description = anomalies.value.description();
        }

        let stored = self.store.write().await.events.insert(event).clone();
        self.diagnostics.record_event_closed();
        info!(
            meter = %meter,
            id = stored.id,
            volume_ml = stored.volume_ml,
            duration_secs = stored.duration_seconds,
            category = %stored.category,
            anomaly = stored.anomaly,
            "Event closed"
        );
        stored
    }

    fn record_verdict(&self, verdict: &EventVerdict) {
        if verdict.heuristic() && verdict.anomalies.value.is_anomalous() {
            self.diagnostics.record_heuristic_anomaly();
        }
        if verdict.any_fallback() {
            self.diagnostics.record_classification_fallback();
        }
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    /// Categorize a flow profile, honoring the meter's analysis opt-in.
    pub async fn classify(&self, meter: &MeterId, flow: &[FlowSample]) -> Verdict<Classification> {
        let allow = self.settings_snapshot(meter).await.allow_ai_analysis;
        let verdict = self.classifier.classify(flow, allow).await;
        if verdict.is_fallback() {
            self.diagnostics.record_classification_fallback();
        }
        verdict
    }

    /// Check a flow profile for anomalies, honoring the meter's opt-in.
    pub async fn detect_anomalies(
        &self,
        meter: &MeterId,
        flow: &[FlowSample],
    ) -> Verdict<AnomalyReport> {
        let allow = self.settings_snapshot(meter).await.allow_ai_analysis;
        let verdict = self.classifier.detect_anomalies(flow, allow).await;
        if verdict.is_fallback() {
            self.diagnostics.record_classification_fallback();
        }
        verdict
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Aggregate a meter's usage over `[start, end)`.
    pub async fn query_usage(
        &self,
        meter: &MeterId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<UsageSummary, EngineError> {
        let window = TimeWindow::new(start, end)?;
        self.ensure_known(meter).await?;

        let previous_window = window.previous();
        let (readings, previous, events) = {
            let store = self.store.read().await;
            (
                store.readings.in_window(meter, &window).to_vec(),
                store.readings.in_window(meter, &previous_window).to_vec(),
                store.events.in_window(meter, &window),
            )
        };

        let options = AggregateOptions {
            tz: self.tz,
            nominal_interval: self.segmenter_config.nominal_interval(),
        };
        Ok(aggregate(
            &window,
            granularity,
            &readings,
            &previous,
            &events,
            &options,
        ))
    }

    /// Usage summary plus tips.
    pub async fn usage_report(
        &self,
        meter: &MeterId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<UsageReport, EngineError> {
        let summary = self.query_usage(meter, start, end, granularity).await?;
        let recommendations = self.recommend_for(meter, &summary).await;
        Ok(UsageReport {
            summary,
            recommendations,
        })
    }

    /// Conservation tips for a meter's usage over `[start, end)`.
    pub async fn recommendations(
        &self,
        meter: &MeterId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Recommendation>, EngineError> {
        let summary = self
            .query_usage(meter, start, end, Granularity::default())
            .await?;
        Ok(self.recommend_for(meter, &summary).await)
    }

    async fn recommend_for(&self, meter: &MeterId, summary: &UsageSummary) -> Vec<Recommendation> {
        let allow = self.settings_snapshot(meter).await.allow_ai_analysis;
        let context = UsageContext {
            total_usage_ml: summary.total_usage_ml,
            usage_comparison: summary.usage_comparison,
            categories: summary.categories.clone(),
        };
        self.classifier.recommend(&context, allow).await.value
    }

    /// A meter's events, newest first.
    pub async fn list_events(
        &self,
        meter: &MeterId,
        filter: &EventFilter,
    ) -> Result<Vec<WaterEvent>, EngineError> {
        if let (Some(start), Some(end)) = (filter.start_date, filter.end_date) {
            TimeWindow::new(start, end)?;
        }
        self.ensure_known(meter).await?;
        Ok(self.store.read().await.events.list(meter, filter))
    }

    pub async fn get_event(&self, id: u64) -> Result<WaterEvent, EngineError> {
        self.store
            .read()
            .await
            .events
            .get(id)
            .cloned()
            .ok_or(EngineError::EventNotFound(id))
    }

    pub async fn set_category(&self, id: u64, category: &str) -> Result<WaterEvent, EngineError> {
        let mut store = self.store.write().await;
        let event = store
            .events
            .set_category(id, category)
            .cloned()
            .ok_or(EngineError::EventNotFound(id))?;
        info!(id, category, "Event recategorized");
        Ok(event)
    }

    pub async fn set_anomaly_flag(
        &self,
        id: u64,
        anomaly: bool,
        reason: Option<&str>,
    ) -> Result<WaterEvent, EngineError> {
        let mut store = self.store.write().await;
        let event = store
            .events
            .set_anomaly_flag(id, anomaly, reason)
            .cloned()
            .ok_or(EngineError::EventNotFound(id))?;
        info!(id, anomaly, "Event anomaly flag set");
        Ok(event)
    }

    /// Check whether the given stored events form a known routine.
    pub async fn analyze_chain(&self, ids: &[u64]) -> Result<ChainAnalysis, EngineError> {
        let store = self.store.read().await;
        let links = ids
            .iter()
            .map(|&id| {
                store
                    .events
                    .get(id)
                    .map(ChainLink::from)
                    .ok_or(EngineError::EventNotFound(id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(analyze_chain(&links))
    }

    // ------------------------------------------------------------------
    // Settings and retention
    // ------------------------------------------------------------------

    /// A meter's settings, created with defaults on first access.
    pub async fn settings(&self, meter: &MeterId) -> Settings {
        self.store.write().await.settings(meter).clone()
    }

    pub async fn update_settings(&self, meter: &MeterId, patch: &SettingsPatch) -> Settings {
        let settings = self.store.write().await.update_settings(meter, patch).clone();
        info!(meter = %meter, "Settings updated");
        settings
    }

    pub async fn reset_settings(&self, meter: &MeterId) -> Settings {
        let settings = self.store.write().await.reset_settings(meter).clone();
        info!(meter = %meter, "Settings reset to defaults");
        settings
    }

    /// Forget everything about a meter, including any open event.
    pub async fn delete_all_user_data(&self, meter: &MeterId) -> Removed {
        let segmenter = self.segmenters.write().await.remove(meter);
        if let Some(segmenter) = segmenter {
            segmenter.lock().await.reset();
        }
        let removed = self.store.write().await.delete_meter(meter);
        info!(
            meter = %meter,
            readings = removed.readings,
            events = removed.events,
            "Deleted all user data"
        );
        removed
    }

    /// Drop a meter's readings and events older than its retention period,
    /// measured back from `now`.
    pub async fn purge_expired(
        &self,
        meter: &MeterId,
        now: DateTime<Utc>,
    ) -> Result<Removed, EngineError> {
        self.ensure_known(meter).await?;
        let mut store = self.store.write().await;
        let cutoff = store.settings_or_default(meter).retention_cutoff(now);
        let removed = store.purge_before(meter, cutoff);
        info!(
            meter = %meter,
            cutoff = %cutoff,
            readings = removed.readings,
            events = removed.events,
            "Purged expired data"
        );
        Ok(removed)
    }

    pub fn diagnostics(&self) -> DiagnosticsStats {
        self.diagnostics.stats()
    }

    pub fn diagnostics_log(&self) -> &SharedDiagnosticsLog {
        &self.diagnostics
    }

    /// Whether the meter has reported or stored anything.
    pub async fn knows(&self, meter: &MeterId) -> bool {
        self.segmenters.read().await.contains_key(meter) || self.store.read().await.knows(meter)
    }

    async fn ensure_known(&self, meter: &MeterId) -> Result<(), EngineError> {
        if self.knows(meter).await {
            Ok(())
        } else {
            Err(EngineError::UnknownMeter(meter.clone()))
        }
    }

    async fn settings_snapshot(&self, meter: &MeterId) -> Settings {
        self.store.read().await.settings_or_default(meter)
    }
}
