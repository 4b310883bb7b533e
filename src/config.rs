//! Engine Configuration
//!
//! Loaded from a YAML file. Every field has a default, so an empty file or
//! no file at all yields a working configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notification::BatchConfig;
use crate::workflow::validator::DEFAULT_LOG_FILE;

/// Default address the peer host listens on.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:5000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Settings for the status notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    /// Pending notifications that force a flush
    pub max_batch_size: usize,
    /// Milliseconds between flushes
    pub flush_interval_ms: u64,
    /// Endpoint notifications are posted to; logged locally when unset
    pub endpoint: Option<String>,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        let batch = BatchConfig::default();
        Self {
            max_batch_size: batch.max_batch_size,
            flush_interval_ms: batch.flush_interval.as_millis() as u64,
            endpoint: None,
        }
    }
}

impl NotifierSettings {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

/// Runtime settings for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory run directories are created under
    pub work_root: PathBuf,
    /// Address the peer host binds to
    pub listen: String,
    /// File the log endpoint appends to
    pub log_file: PathBuf,
    /// Timeout for every outbound request; unbounded when unset
    pub request_timeout_secs: Option<u64>,
    /// Concurrent branches per fan-out batch; unbounded when unset
    pub max_fan_out: Option<usize>,
    pub notifications: NotifierSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("."),
            listen: DEFAULT_LISTEN.to_string(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            request_timeout_secs: None,
            max_fan_out: None,
            notifications: NotifierSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
