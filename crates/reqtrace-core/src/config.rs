//! Configuration management for reqtrace
//!
//! Handles loading and validation of reqtrace.toml configuration files.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Persistence settings
    #[serde(default)]
    pub persist: PersistConfig,

    /// Capture correlation settings
    #[serde(default)]
    pub correlate: CorrelateConfig,

    /// Session aggregation settings
    #[serde(default)]
    pub session: SessionConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> String {
    "~/.local/share/reqtrace".to_string()
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Maximum number of records retained by count-based eviction
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Number of writes between eviction passes
    #[serde(default = "default_evict_batch")]
    pub evict_batch: u32,

    /// Maximum record age before the retention sweep removes it (hours)
    #[serde(default = "default_sweep_max_age_hours")]
    pub sweep_max_age_hours: u64,

    /// Interval between retention sweeps (minutes)
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            evict_batch: default_evict_batch(),
            sweep_max_age_hours: default_sweep_max_age_hours(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
        }
    }
}

fn default_max_records() -> usize {
    1000
}

fn default_evict_batch() -> u32 {
    20
}

fn default_sweep_max_age_hours() -> u64 {
    24
}

fn default_sweep_interval_minutes() -> u64 {
    60
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistConfig {
    /// Database file path
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Debounce quiet period between store mutation and flush (ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,

    /// Key under which the record snapshot is stored
    #[serde(default = "default_records_key")]
    pub records_key: String,

    /// Key under which auxiliary snapshot metadata is stored
    #[serde(default = "default_meta_key")]
    pub meta_key: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            debounce_ms: default_debounce_ms(),
            records_key: default_records_key(),
            meta_key: default_meta_key(),
        }
    }
}

fn default_db_path() -> String {
    "~/.local/share/reqtrace/reqtrace.db".to_string()
}

fn default_debounce_ms() -> i64 {
    1000
}

fn default_records_key() -> String {
    "request_records".to_string()
}

fn default_meta_key() -> String {
    "snapshot_meta".to_string()
}

/// Capture correlation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelateConfig {
    /// Matching window around a capture timestamp for URL-based correlation (ms)
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
}

impl Default for CorrelateConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
        }
    }
}

fn default_window_ms() -> i64 {
    30_000
}

/// Session aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Padding applied to both ends of the session time window (ms)
    #[serde(default = "default_padding_ms")]
    pub padding_ms: i64,

    /// Hostname/path markers that classify a session as staging
    #[serde(default = "default_staging_markers")]
    pub staging_markers: Vec<String>,

    /// Header names checked (case-insensitively) for the correlation token
    #[serde(default = "default_token_headers")]
    pub token_headers: Vec<String>,

    /// Header names checked for the workstation identifier
    #[serde(default = "default_workstation_headers")]
    pub workstation_headers: Vec<String>,

    /// Header names checked for the UTC offset
    #[serde(default = "default_offset_headers")]
    pub offset_headers: Vec<String>,

    /// URL substrings (lowercase) marking a login/identity exchange
    #[serde(default = "default_login_markers")]
    pub login_markers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            padding_ms: default_padding_ms(),
            staging_markers: default_staging_markers(),
            token_headers: default_token_headers(),
            workstation_headers: default_workstation_headers(),
            offset_headers: default_offset_headers(),
            login_markers: default_login_markers(),
        }
    }
}

fn default_padding_ms() -> i64 {
    5 * 60 * 1000
}

fn default_staging_markers() -> Vec<String> {
    vec![
        "staging".to_string(),
        "uat".to_string(),
        "preprod".to_string(),
        "sandbox".to_string(),
    ]
}

fn default_token_headers() -> Vec<String> {
    vec![
        "x-session-token".to_string(),
        "x-correlation-id".to_string(),
    ]
}

fn default_workstation_headers() -> Vec<String> {
    vec!["x-workstation-id".to_string()]
}

fn default_offset_headers() -> Vec<String> {
    vec!["x-utc-offset".to_string(), "x-timezone".to_string()]
}

fn default_login_markers() -> Vec<String> {
    vec![
        "logonuser".to_string(),
        "login".to_string(),
        "signin".to_string(),
        "authenticate".to_string(),
    ]
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    /// when no file exists.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::path::Path::new("reqtrace.toml");
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.max_records == 0 {
            return Err(ConfigError::ValidationError(
                "store.max_records must be at least 1".to_string(),
            ));
        }
        if self.store.evict_batch == 0 {
            return Err(ConfigError::ValidationError(
                "store.evict_batch must be at least 1".to_string(),
            ));
        }
        if self.persist.debounce_ms < 0 {
            return Err(ConfigError::ValidationError(
                "persist.debounce_ms must be non-negative".to_string(),
            ));
        }
        if self.persist.records_key == self.persist.meta_key {
            return Err(ConfigError::ValidationError(
                "persist.records_key and persist.meta_key must differ".to_string(),
            ));
        }
        if self.correlate.window_ms < 0 {
            return Err(ConfigError::ValidationError(
                "correlate.window_ms must be non-negative".to_string(),
            ));
        }
        if self.session.padding_ms < 0 {
            return Err(ConfigError::ValidationError(
                "session.padding_ms must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}
