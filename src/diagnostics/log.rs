//! Ingestion counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Counters for the current process, optionally persisted across runs.
#[derive(Debug)]
pub struct DiagnosticsLog {
    /// Readings accepted by a segmenter
    readings_ingested: AtomicU64,
    /// Readings dropped for arriving out of order
    out_of_order_dropped: AtomicU64,
    /// Events closed and stored
    events_closed: AtomicU64,
    /// Events dropped for having too few samples
    noisy_events_discarded: AtomicU64,
    /// Events flagged by a local heuristic
    heuristic_anomalies: AtomicU64,
    /// Classifier calls answered with fallback values
    classification_fallbacks: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self {
            readings_ingested: AtomicU64::new(0),
            out_of_order_dropped: AtomicU64::new(0),
            events_closed: AtomicU64::new(0),
            noisy_events_discarded: AtomicU64::new(0),
            heuristic_anomalies: AtomicU64::new(0),
            classification_fallbacks: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that resumes from, and saves to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            warn!(error = %e, "Could not load previous diagnostics");
        }

        log
    }

    pub fn record_reading_ingested(&self) {
        self.readings_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_closed(&self) {
        self.events_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_noisy_event(&self) {
        self.noisy_events_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heuristic_anomaly(&self) {
        self.heuristic_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_classification_fallback(&self) {
        self.classification_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> DiagnosticsStats {
        DiagnosticsStats {
            readings_ingested: self.readings_ingested.load(Ordering::Relaxed),
            out_of_order_dropped: self.out_of_order_dropped.load(Ordering::Relaxed),
            events_closed: self.events_closed.load(Ordering::Relaxed),
            noisy_events_discarded: self.noisy_events_discarded.load(Ordering::Relaxed),
            heuristic_anomalies: self.heuristic_anomalies.load(Ordering::Relaxed),
            classification_fallbacks: self.classification_fallbacks.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Ingest Diagnostics:\n\
             - Readings ingested: {}\n\
             - Out-of-order readings dropped: {}\n\
             - Events closed: {}\n\
             - Noisy events discarded: {}\n\
             - Heuristic anomalies: {}\n\
             - Classification fallbacks: {}\n\
             - Session duration: {} seconds",
            stats.readings_ingested,
            stats.out_of_order_dropped,
            stats.events_closed,
            stats.noisy_events_discarded,
            stats.heuristic_anomalies,
            stats.classification_fallbacks,
            stats.session_duration_secs
        )
    }

    /// Save counters to disk. A no-op without a persistence path.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let stats = self.stats();
        let persisted = PersistedCounters {
            readings_ingested: stats.readings_ingested,
            out_of_order_dropped: stats.out_of_order_dropped,
            events_closed: stats.events_closed,
            noisy_events_discarded: stats.noisy_events_discarded,
            heuristic_anomalies: stats.heuristic_anomalies,
            classification_fallbacks: stats.classification_fallbacks,
            last_updated: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedCounters =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;

        self.readings_ingested
            .store(persisted.readings_ingested, Ordering::Relaxed);
        self.out_of_order_dropped
            .store(persisted.out_of_order_dropped, Ordering::Relaxed);
        self.events_closed
            .store(persisted.events_closed, Ordering::Relaxed);
        self.noisy_events_discarded
            .store(persisted.noisy_events_discarded, Ordering::Relaxed);
        self.heuristic_anomalies
            .store(persisted.heuristic_anomalies, Ordering::Relaxed);
        self.classification_fallbacks
            .store(persisted.classification_fallbacks, Ordering::Relaxed);
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.readings_ingested.store(0, Ordering::Relaxed);
        self.out_of_order_dropped.store(0, Ordering::Relaxed);
        self.events_closed.store(0, Ordering::Relaxed);
        self.noisy_events_discarded.store(0, Ordering::Relaxed);
        self.heuristic_anomalies.store(0, Ordering::Relaxed);
        self.classification_fallbacks.store(0, Ordering::Relaxed);
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsStats {
    pub readings_ingested: u64,
    pub out_of_order_dropped: u64,
    pub events_closed: u64,
    pub noisy_events_discarded: u64,
    pub heuristic_anomalies: u64,
    pub classification_fallbacks: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// On-disk format.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCounters {
    readings_ingested: u64,
    out_of_order_dropped: u64,
    events_closed: u64,
    noisy_events_discarded: u64,
    heuristic_anomalies: u64,
    classification_fallbacks: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared diagnostics log.
pub type SharedDiagnosticsLog = Arc<DiagnosticsLog>;

pub fn create_shared_log() -> SharedDiagnosticsLog {
    Arc::new(DiagnosticsLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedDiagnosticsLog {
    Arc::new(DiagnosticsLog::with_persistence(path))
}
