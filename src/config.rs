//! Configuration for the water usage agent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Event segmentation parameters
    pub segmenter: SegmenterConfig,

    /// External classifier settings
    pub classifier: ClassifierConfig,

    /// IANA timezone used for display timestamps
    pub timezone: String,

    /// Path for the event store and diagnostics
    pub data_path: PathBuf,

    /// Port for the HTTP server
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("water-usage-agent");

        Self {
            segmenter: SegmenterConfig::default(),
            classifier: ClassifierConfig::default(),
            timezone: "UTC".to_string(),
            data_path: data_dir,
            server_port: 5080,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file, falling back to defaults
    /// when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("water-usage-agent")
            .join("config.json")
    }

    /// Ensure the data directory exists.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    /// Path of the persisted event store.
    pub fn store_path(&self) -> PathBuf {
        self.data_path.join("store.json")
    }

    /// Path of the persisted diagnostics counters.
    pub fn diagnostics_path(&self) -> PathBuf {
        self.data_path.join("diagnostics.json")
    }

    /// Parsed display timezone.
    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::InvalidValue(format!("unknown timezone '{}'", self.timezone)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.segmenter.sample_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "segmenter.sample_interval_secs must be positive".to_string(),
            ));
        }
        if self.segmenter.min_samples == 0 {
            return Err(ConfigError::InvalidValue(
                "segmenter.min_samples must be at least 1".to_string(),
            ));
        }
        self.tz()?;
        Ok(())
    }
}

/// Parameters of the event segmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Readings strictly above this volume (mL per interval) count as flow
    pub flow_threshold_ml: u32,

    /// Events with fewer above-threshold samples are discarded as noise
    pub min_samples: usize,

    /// Nominal sampling interval, used when the previous reading is unknown
    #[serde(rename = "sample_interval_secs", with = "duration_serde")]
    pub sample_interval: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            flow_threshold_ml: 67,
            min_samples: 3,
            sample_interval: Duration::from_secs(60),
        }
    }
}

impl SegmenterConfig {
    /// Nominal interval as a chrono duration.
    pub fn nominal_interval(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.sample_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

/// Settings for the external classification capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Hard timeout on each external call
    #[serde(rename = "timeout_secs", with = "duration_serde")]
    pub timeout: Duration,

    /// Remote classifier endpoint; local rules are used when absent
    pub endpoint: Option<EndpointConfig>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            endpoint: None,
        }
    }
}

/// Location and credentials of a remote classifier service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
