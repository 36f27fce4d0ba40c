//! In-memory storage with JSON persistence.
//!
//! The store holds raw readings, persisted events and settings for every
//! meter. It is saved and loaded as a single JSON document.

pub mod events;
pub mod readings;
pub mod settings;

pub use events::{EventFilter, EventStore, MANUAL_ANOMALY_DESCRIPTION};
pub use readings::ReadingStore;
pub use settings::{Settings, SettingsPatch};

use crate::readings::MeterId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Counts of removed records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Removed {
    pub readings: usize,
    pub events: usize,
}

/// Everything the agent persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Store {
    pub readings: ReadingStore,
    pub events: EventStore,
    #[serde(default)]
    settings: BTreeMap<MeterId, Settings>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from disk, or an empty one when the file is missing.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            debug!(path = %path.display(), "No store file, starting empty");
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Write the store to disk, replacing the previous file.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json =
            serde_json::to_string(self).map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Write then rename so a crash never leaves a truncated store
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Whether anything is stored for a meter.
    pub fn knows(&self, meter: &MeterId) -> bool {
        self.readings.has_meter(meter)
            || self.settings.contains_key(meter)
            || self.events.count(meter) > 0
    }

    /// Settings of a meter, created with defaults on first access.
    pub fn settings(&mut self, meter: &MeterId) -> &Settings {
        self.settings.entry(meter.clone()).or_default()
    }

    /// Settings of a meter without creating them.
    pub fn settings_or_default(&self, meter: &MeterId) -> Settings {
        self.settings.get(meter).cloned().unwrap_or_default()
    }

    pub fn update_settings(&mut self, meter: &MeterId, patch: &SettingsPatch) -> &Settings {
        let settings = self.settings.entry(meter.clone()).or_default();
        settings.apply(patch);
        settings
    }

    pub fn reset_settings(&mut self, meter: &MeterId) -> &Settings {
        let settings = self.settings.entry(meter.clone()).or_default();
        *settings = Settings::default();
        settings
    }

    /// Drop readings and events older than `cutoff`.
    pub fn purge_before(&mut self, meter: &MeterId, cutoff: DateTime<Utc>) -> Removed {
        Removed {
            readings: self.readings.purge_before(meter, cutoff),
            events: self.events.purge_before(meter, cutoff),
        }
    }

    /// Remove every record of a meter, settings included.
    pub fn delete_meter(&mut self, meter: &MeterId) -> Removed {
        self.settings.remove(meter);
        Removed {
            readings: self.readings.remove_meter(meter),
            events: self.events.remove_meter(meter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::WaterEvent;
    use crate::readings::Reading;
    use chrono::TimeZone;

    fn sample_event(meter: &MeterId) -> WaterEvent {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 7, 1, 0).unwrap();
        WaterEvent {
            id: 0,
            meter_id: meter.clone(),
            start_time: start,
            end_time: start + chrono::Duration::minutes(3),
            duration_seconds: 180,
            volume_ml: 1650,
            peak_flow_rate_ml_per_min: 600,
            avg_flow_rate_ml_per_min: 550,
            category: "faucet".to_string(),
            confidence: 70,
            anomaly: false,
            anomaly_description: None,
            flow_data: Vec::new(),
        }
    }

    #[test]
    fn test_save_and_open() {
        let path = std::env::temp_dir().join(format!("water-usage-store-{}.json", uuid::Uuid::new_v4()));
        let meter = MeterId::new("m1");

        let mut store = Store::new();
        store
            .readings
            .insert(&meter, Reading::new(Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap(), 500));
        store.events.insert(sample_event(&meter));
        store.update_settings(
            &meter,
            &SettingsPatch {
                share_with_utility: Some(true),
                ..SettingsPatch::default()
            },
        );
        store.save(&path).unwrap();

        let mut reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.readings.count(&meter), 1);
        assert_eq!(reopened.events.get(1).map(|e| e.volume_ml), Some(1650));
        assert!(reopened.settings(&meter).share_with_utility);

        // Ids keep counting after a reload
        assert_eq!(reopened.events.insert(sample_event(&meter)).id, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let path = std::env::temp_dir().join("water-usage-store-does-not-exist.json");
        let store = Store::open(&path).unwrap();
        assert_eq!(store.events.count(&MeterId::new("m1")), 0);
    }

    #[test]
    fn test_delete_meter_removes_settings() {
        let meter = MeterId::new("m1");
        let mut store = Store::new();
        store.update_settings(
            &meter,
            &SettingsPatch {
                allow_ai_analysis: Some(false),
                ..SettingsPatch::default()
            },
        );
        store.events.insert(sample_event(&meter));

        let removed = store.delete_meter(&meter);
        assert_eq!(removed.events, 1);
        assert!(store.settings(&meter).allow_ai_analysis);
    }
}
