//! Water Usage Agent - event segmentation and usage analytics for household
//! water meters.
//!
//! The agent turns a stream of per-interval meter readings into discrete
//! water-use events, labels each event with a fixture category, flags
//! anomalies such as leaks, and answers usage queries over time windows.
//!
//! # Data Handling
//!
//! - **Per-meter settings**: raw reading storage and external analysis are
//!   opt-outs stored per meter
//! - **Local fallback**: events are always classified, locally when the
//!   external classifier is disabled or unavailable
//! - **Retention**: readings and events older than the retention period can
//!   be purged, and all data of a meter can be deleted at once
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Water Usage Agent                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │  Readings   │──▶│  Segmenter  │──▶│ Classifier  │       │
//! │  │ (per meter) │   │ (per meter) │   │  Adapter    │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │         │                                    │              │
//! │         ▼                                    ▼              │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │    Store    │──▶│ Aggregator  │──▶│    Tips     │       │
//! │  │   (JSON)    │   │  (windows)  │   │  (rules)    │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use water_usage_agent::{
//!     classifier::ClassifierAdapter, config::SegmenterConfig,
//!     diagnostics::create_shared_log, readings::MeterId, WaterUsageEngine,
//! };
//!
//! # async fn demo() -> Result<(), water_usage_agent::EngineError> {
//! let engine = WaterUsageEngine::new(
//!     SegmenterConfig::default(),
//!     ClassifierAdapter::local(std::time::Duration::from_secs(10)),
//!     create_shared_log(),
//!     chrono_tz::UTC,
//! );
//!
//! let meter = MeterId::new("kitchen");
//! let outcome = engine.ingest_reading(&meter, chrono::Utc::now(), 500).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod engine;
pub mod readings;
pub mod store;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use classifier::{
    adapter_from_config, Classification, ClassifierAdapter, ClassifierError, FlowClassifier,
    RuleClassifier,
};
pub use config::{ClassifierConfig, Config, ConfigError, SegmenterConfig};
pub use core::{
    Granularity, MeterSegmenter, Recommendation, SegmentError, TimeWindow, UsageSummary,
    WaterEvent,
};
pub use diagnostics::{DiagnosticsLog, DiagnosticsStats, SharedDiagnosticsLog};
pub use engine::{EngineError, IngestOutcome, UsageReport, WaterUsageEngine};
pub use readings::{FlowSample, MeterId, Reading};
pub use store::{EventFilter, Settings, SettingsPatch};

#[cfg(feature = "remote")]
pub use classifier::RemoteClassifier;

#[cfg(feature = "server")]
pub use server::{ServerConfig, run as run_server};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
