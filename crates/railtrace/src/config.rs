//! Configuration management for railtrace.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::queue::{OverflowPolicy, QueueSettings};
use crate::sampler::{SamplingMode, SyntheticOrigin};
use crate::sink::DEFAULT_ACTION;
use crate::strategy::ProbeSettings;
use crate::sync::DEFAULT_LEASE_TTL;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "railtrace";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "records.db";

/// Prefix for environment overrides. Nested keys use `__`, e.g.
/// `RAILTRACE_SYNC__ENDPOINT`.
pub const ENV_PREFIX: &str = "RAILTRACE_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `RAILTRACE_`)
/// 2. TOML config file at `~/.config/railtrace/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Sampling configuration.
    pub recording: RecordingConfig,
    /// Queue bounds and thresholds.
    pub queue: QueueConfig,
    /// Sink configuration.
    pub sync: SyncConfig,
    /// Execution strategy configuration.
    pub runtime: RuntimeConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/railtrace/records.db`
    pub database_path: Option<PathBuf>,
    /// Maximum number of records kept, delivered or not.
    pub max_records: usize,
    /// Days to keep delivered records. Set to 0 to keep them until evicted.
    pub retain_delivered_days: u32,
    /// How long to wait on a database locked by another context.
    pub busy_timeout_ms: u64,
}

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Default sampling interval in milliseconds.
    pub interval_ms: u64,
    /// Behaviour when no live fix is available.
    pub mode: SamplingMode,
    /// Centre of synthetic points.
    pub origin: SyntheticOrigin,
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Size of the recent view and the retry buffer.
    pub max_queue_size: usize,
    /// Pending count that triggers a sync.
    pub sync_threshold: usize,
    /// What to drop when the retry buffer is full.
    pub overflow_policy: OverflowPolicy,
}

/// Sink configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Collector URL. Syncs fail until this is set.
    pub endpoint: Option<String>,
    /// Collector action name.
    pub action: String,
    /// Host sync loop period in seconds.
    pub sync_interval_secs: u64,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum records per batch.
    pub max_batch_size: usize,
}

/// Execution strategy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Allow the background sync worker.
    pub background_sync: bool,
    /// Background worker periodic sync in seconds.
    pub periodic_sync_interval_secs: u64,
    /// Allow the dedicated sampling thread.
    pub dedicated_worker: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            max_records: 10_000,
            retain_delivered_days: 7,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            mode: SamplingMode::Strict,
            origin: SyntheticOrigin::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            sync_threshold: 10,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            action: DEFAULT_ACTION.to_string(),
            sync_interval_secs: 30,
            timeout_secs: 30,
            max_batch_size: 500,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            background_sync: true,
            periodic_sync_interval_secs: 60 * 60,
            dedicated_worker: true,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `RAILTRACE_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("recording.interval_ms", self.recording.interval_ms),
            ("sync.sync_interval_secs", self.sync.sync_interval_secs),
            ("sync.timeout_secs", self.sync.timeout_secs),
            (
                "runtime.periodic_sync_interval_secs",
                self.runtime.periodic_sync_interval_secs,
            ),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                return Err(invalid(format!("{key} must be greater than 0")));
            }
        }

        let nonzero_sizes = [
            ("storage.max_records", self.storage.max_records),
            ("queue.max_queue_size", self.queue.max_queue_size),
            ("queue.sync_threshold", self.queue.sync_threshold),
            ("sync.max_batch_size", self.sync.max_batch_size),
        ];
        for (key, value) in nonzero_sizes {
            if value == 0 {
                return Err(invalid(format!("{key} must be greater than 0")));
            }
        }

        if self.sync_timeout() >= DEFAULT_LEASE_TTL {
            return Err(invalid(format!(
                "sync.timeout_secs must be less than {} (the sync lease lifetime)",
                DEFAULT_LEASE_TTL.as_secs()
            )));
        }

        if self.queue.sync_threshold > self.queue.max_queue_size {
            return Err(invalid(format!(
                "sync_threshold ({}) cannot be greater than max_queue_size ({})",
                self.queue.sync_threshold, self.queue.max_queue_size
            )));
        }

        if self.queue.max_queue_size > self.storage.max_records {
            return Err(invalid(format!(
                "max_queue_size ({}) cannot be greater than max_records ({})",
                self.queue.max_queue_size, self.storage.max_records
            )));
        }

        if let Some(endpoint) = &self.sync.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(invalid(format!(
                    "sync.endpoint must be an http(s) URL: {endpoint}"
                )));
            }
        }

        if self.sync.action.trim().is_empty() {
            return Err(invalid("sync.action cannot be empty"));
        }

        for (key, value) in [
            ("recording.origin.latitude", self.recording.origin.latitude),
            ("recording.origin.longitude", self.recording.origin.longitude),
        ] {
            if !value.is_finite() {
                return Err(invalid(format!("{key} must be a finite number")));
            }
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the default sampling interval as a Duration.
    #[must_use]
    pub fn recording_interval(&self) -> Duration {
        Duration::from_millis(self.recording.interval_ms)
    }

    /// Get the host sync loop period as a Duration.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.sync_interval_secs)
    }

    /// Get the sink request timeout as a Duration.
    #[must_use]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout_secs)
    }

    /// Get the background worker period as a Duration.
    #[must_use]
    pub fn periodic_sync_interval(&self) -> Duration {
        Duration::from_secs(self.runtime.periodic_sync_interval_secs)
    }

    /// Get the database lock wait as a Duration.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    /// Get the delivered-record retention, if any.
    #[must_use]
    pub fn retain_delivered(&self) -> Option<chrono::Duration> {
        if self.storage.retain_delivered_days == 0 {
            None
        } else {
            Some(chrono::Duration::days(i64::from(
                self.storage.retain_delivered_days,
            )))
        }
    }

    /// Queue bounds for the queue manager.
    #[must_use]
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_records: self.storage.max_records,
            max_queue_size: self.queue.max_queue_size,
            sync_threshold: self.queue.sync_threshold,
            overflow_policy: self.queue.overflow_policy,
        }
    }

    /// Strategy switches for the capability probe.
    #[must_use]
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            background_sync: self.runtime.background_sync,
            dedicated_worker: self.runtime.dedicated_worker,
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.recording.interval_ms, 10_000);
        assert_eq!(config.recording.mode, SamplingMode::Strict);
        assert_eq!(config.queue.max_queue_size, 100);
        assert_eq!(config.queue.sync_threshold, 10);
        assert!(config.sync.endpoint.is_none());
        assert_eq!(config.sync.action, "saveData");
        assert!(config.runtime.background_sync);
        assert!(config.runtime.dedicated_worker);
    }

    #[test]
    fn test_default_storage_config() {
        let storage = StorageConfig::default();

        assert!(storage.database_path.is_none());
        assert_eq!(storage.max_records, 10_000);
        assert_eq!(storage.retain_delivered_days, 7);
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = Config::default();
        config.recording.interval_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("interval_ms"));
    }

    #[test]
    fn test_validate_zero_threshold() {
        let mut config = Config::default();
        config.queue.sync_threshold = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sync_threshold"));
    }

    #[test]
    fn test_validate_threshold_above_queue_size() {
        let mut config = Config::default();
        config.queue.sync_threshold = 200;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("cannot be greater than max_queue_size"));
    }

    #[test]
    fn test_validate_timeout_within_lease() {
        let mut config = Config::default();
        config.sync.timeout_secs = DEFAULT_LEASE_TTL.as_secs();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sync lease lifetime"));
    }

    #[test]
    fn test_validate_endpoint_scheme() {
        let mut config = Config::default();
        config.sync.endpoint = Some("ftp://example.com/upload".to_string());
        assert!(config.validate().is_err());

        config.sync.endpoint = Some("https://script.example.com/exec".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_path_default() {
        let config = Config::default();
        let path = config.database_path();

        assert!(path.to_string_lossy().contains("records.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_durations() {
        let config = Config::default();

        assert_eq!(config.recording_interval(), Duration::from_secs(10));
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.periodic_sync_interval(), Duration::from_secs(3600));
        assert_eq!(config.sync_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_retain_delivered() {
        let mut config = Config::default();
        assert_eq!(config.retain_delivered(), Some(chrono::Duration::days(7)));

        config.storage.retain_delivered_days = 0;
        assert!(config.retain_delivered().is_none());
    }

    #[test]
    fn test_queue_settings() {
        let settings = Config::default().queue_settings();
        assert_eq!(settings, QueueSettings::default());
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("railtrace"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.recording, RecordingConfig::default());
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[recording]
interval_ms = 2000
mode = "synthetic"

[recording.origin]
latitude = 51.5
longitude = -0.12

[queue]
overflow_policy = "drop_newest"

[sync]
endpoint = "https://collector.example.com/exec"
"#
        )
        .unwrap();

        let config = Config::load_from(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.recording.interval_ms, 2000);
        assert_eq!(config.recording.mode, SamplingMode::Synthetic);
        assert!((config.recording.origin.latitude - 51.5).abs() < f64::EPSILON);
        assert_eq!(config.queue.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(
            config.sync.endpoint.as_deref(),
            Some("https://collector.example.com/exec")
        );
        assert_eq!(config.queue.sync_threshold, 10);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nsync_threshold = 0").unwrap();

        let err = Config::load_from(Some(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));
    }

    #[test]
    fn test_config_serialize() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("max_records"));
        assert!(json.contains("\"mode\":\"strict\""));
        assert!(json.contains("\"overflow_policy\":\"drop_oldest\""));
    }
}
