//! Agent configuration
//!
//! Options are read from a configuration section whose keys match the
//! PascalCase names below. Missing keys fall back to defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Backup/restore agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BackupRestoreConfig {
    /// Timeout in seconds for coordination service and metadata calls
    #[serde(rename = "ApiTimeout")]
    pub api_timeout_secs: u64,
    /// Timeout in seconds for artifact upload/download
    #[serde(rename = "StoreApiTimeout")]
    pub store_api_timeout_secs: u64,
    /// Initial retry interval in seconds
    #[serde(rename = "ApiRetryInterval")]
    pub api_retry_interval_secs: u64,
    /// Maximum retry interval in seconds
    #[serde(rename = "MaxApiRetryInterval")]
    pub max_api_retry_interval_secs: u64,
    /// Attempts before giving up
    pub max_api_retry_count: u32,
    /// Archive backup folders before upload
    pub enable_compression: bool,
    /// Symmetric jitter window applied to scheduled backups
    pub jitter_in_backups_seconds: u64,
    /// Replica set size of the coordination service; zero disables the agent
    pub target_replica_set_size: u32,
    /// Root folder for local working directories
    pub work_folder: Option<PathBuf>,
}

impl Default for BackupRestoreConfig {
    fn default() -> Self {
        Self {
            api_timeout_secs: 60,
            store_api_timeout_secs: 1800,
            api_retry_interval_secs: 5,
            max_api_retry_interval_secs: 60,
            max_api_retry_count: 5,
            enable_compression: true,
            jitter_in_backups_seconds: 10,
            target_replica_set_size: 0,
            work_folder: None,
        }
    }
}

impl BackupRestoreConfig {
    /// Parse a JSON configuration section
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration section from disk
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Build from raw key/value pairs as stored in a configuration section.
    /// Unknown keys are ignored, known keys must parse.
    pub fn from_section(section: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        fn read<T: FromStr>(
            section: &HashMap<String, String>,
            key: &str,
        ) -> Result<Option<T>, ConfigError> {
            match section.get(key).map(|v| v.trim()) {
                None | Some("") => Ok(None),
                Some(value) => value.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
            }
        }

        if let Some(v) = read(section, "ApiTimeout")? {
            config.api_timeout_secs = v;
        }
        if let Some(v) = read(section, "StoreApiTimeout")? {
            config.store_api_timeout_secs = v;
        }
        if let Some(v) = read(section, "ApiRetryInterval")? {
            config.api_retry_interval_secs = v;
        }
        if let Some(v) = read(section, "MaxApiRetryInterval")? {
            config.max_api_retry_interval_secs = v;
        }
        if let Some(v) = read(section, "MaxApiRetryCount")? {
            config.max_api_retry_count = v;
        }
        if let Some(v) = read(section, "EnableCompression")? {
            config.enable_compression = v;
        }
        if let Some(v) = read(section, "JitterInBackupsSeconds")? {
            config.jitter_in_backups_seconds = v;
        }
        if let Some(v) = read(section, "TargetReplicaSetSize")? {
            config.target_replica_set_size = v;
        }
        if let Some(v) = read::<PathBuf>(section, "WorkFolder")? {
            config.work_folder = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_api_retry_count == 0 {
            return Err(ConfigError::Invalid("MaxApiRetryCount must be at least 1".into()));
        }
        if self.max_api_retry_interval_secs < self.api_retry_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "MaxApiRetryInterval ({}) is below ApiRetryInterval ({})",
                self.max_api_retry_interval_secs, self.api_retry_interval_secs
            )));
        }
        if self.api_timeout_secs == 0 || self.store_api_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Whether the backup/restore service is configured for this cluster
    pub fn is_service_configured(&self) -> bool {
        self.target_replica_set_size != 0
    }

    /// Timeout for coordination service and metadata calls
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Timeout for artifact store calls
    pub fn store_api_timeout(&self) -> Duration {
        Duration::from_secs(self.store_api_timeout_secs)
    }

    /// Initial retry interval
    pub fn api_retry_interval(&self) -> Duration {
        Duration::from_secs(self.api_retry_interval_secs)
    }

    /// Retry interval cap
    pub fn max_api_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_api_retry_interval_secs)
    }

    /// Jitter window for scheduled backups
    pub fn jitter_window(&self) -> Duration {
        Duration::from_secs(self.jitter_in_backups_seconds)
    }

    /// Root folder for working directories
    pub fn work_folder(&self) -> PathBuf {
        self.work_folder.clone().unwrap_or_else(std::env::temp_dir)
    }
}
