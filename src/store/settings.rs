//! Per-meter user settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Privacy and retention preferences of a household.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Days of detailed data to keep
    #[serde(rename = "dataRetention")]
    pub data_retention_days: u32,
    /// Keep raw readings, not only events
    pub store_raw_data: bool,
    /// Allow the external classifier to see flow profiles
    pub allow_ai_analysis: bool,
    pub share_anonymized_data: bool,
    pub share_with_utility: bool,
    pub participate_in_community: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_retention_days: 90,
            store_raw_data: true,
            allow_ai_analysis: true,
            share_anonymized_data: true,
            share_with_utility: false,
            participate_in_community: false,
        }
    }
}

/// A partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(rename = "dataRetention")]
    pub data_retention_days: Option<u32>,
    pub store_raw_data: Option<bool>,
    pub allow_ai_analysis: Option<bool>,
    pub share_anonymized_data: Option<bool>,
    pub share_with_utility: Option<bool>,
    pub participate_in_community: Option<bool>,
}

/// Longest retention a meter can ask for, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

impl Settings {
    /// Apply a patch. Retention is clamped to `1..=MAX_RETENTION_DAYS`.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(days) = patch.data_retention_days {
            self.data_retention_days = days.clamp(1, MAX_RETENTION_DAYS);
        }
        if let Some(v) = patch.store_raw_data {
            self.store_raw_data = v;
        }
        if let Some(v) = patch.allow_ai_analysis {
            self.allow_ai_analysis = v;
        }
        if let Some(v) = patch.share_anonymized_data {
            self.share_anonymized_data = v;
        }
        if let Some(v) = patch.share_with_utility {
            self.share_with_utility = v;
        }
        if let Some(v) = patch.participate_in_community {
            self.participate_in_community = v;
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.data_retention_days as i64)
    }

    /// Oldest timestamp kept when purging at `now`. A retention reaching
    /// past the representable range keeps everything.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.data_retention_days, 90);
        assert!(settings.store_raw_data);
        assert!(settings.allow_ai_analysis);
        assert!(settings.share_anonymized_data);
        assert!(!settings.share_with_utility);
        assert!(!settings.participate_in_community);
    }

    #[test]
    fn test_partial_update() {
        let mut settings = Settings::default();
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"allowAiAnalysis": false, "dataRetention": 0}"#).unwrap();
        settings.apply(&patch);

        assert!(!settings.allow_ai_analysis);
        assert_eq!(settings.data_retention_days, 1);
        assert!(settings.store_raw_data);
    }

    #[test]
    fn test_retention_upper_bound() {
        let mut settings = Settings::default();
        settings.apply(&SettingsPatch {
            data_retention_days: Some(u32::MAX),
            ..SettingsPatch::default()
        });
        assert_eq!(settings.data_retention_days, MAX_RETENTION_DAYS);
    }

    #[test]
    fn test_cutoff_with_unclamped_retention() {
        // Loaded from disk without passing through apply
        let settings = Settings {
            data_retention_days: u32::MAX,
            ..Settings::default()
        };
        let now = Utc::now();
        assert_eq!(settings.retention_cutoff(now), DateTime::<Utc>::MIN_UTC);

        let settings = Settings::default();
        assert_eq!(settings.retention_cutoff(now), now - chrono::Duration::days(90));
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["dataRetention"], 90);
        assert_eq!(json["participateInCommunity"], false);
    }
}
