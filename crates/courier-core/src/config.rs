//! Configuration: JSON file, then `COURIER_*` environment overrides.
//!
//! Unknown JSON sections (server, uploaders, ...) are ignored so an existing
//! deployment file can be reused as-is.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::DispatcherConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CourierConfig {
    pub database: DatabaseConfig,
    pub workers: WorkersConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./uploads.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkersConfig {
    pub max_concurrent: usize,
    pub queue_buffer: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_buffer: crate::pool::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub poll_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub stuck_threshold_secs: u64,
    pub retention_days: u32,
    pub claim_batch_size: usize,
    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            cleanup_interval_secs: 60 * 60,
            stuck_threshold_secs: 30 * 60,
            retention_days: 7,
            claim_batch_size: 1,
            default_max_attempts: 3,
        }
    }
}

impl CourierConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Apply `COURIER_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unset keys leave the current
    /// value untouched; set but unparsable keys are an error.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("COURIER_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        override_parsed(&lookup, "COURIER_MAX_CONCURRENT", &mut self.workers.max_concurrent)?;
        override_parsed(&lookup, "COURIER_QUEUE_BUFFER", &mut self.workers.queue_buffer)?;

        let queue = &mut self.queue;
        override_parsed(&lookup, "COURIER_POLL_INTERVAL_SECS", &mut queue.poll_interval_secs)?;
        override_parsed(
            &lookup,
            "COURIER_CLEANUP_INTERVAL_SECS",
            &mut queue.cleanup_interval_secs,
        )?;
        override_parsed(
            &lookup,
            "COURIER_STUCK_THRESHOLD_SECS",
            &mut queue.stuck_threshold_secs,
        )?;
        override_parsed(&lookup, "COURIER_RETENTION_DAYS", &mut queue.retention_days)?;
        override_parsed(&lookup, "COURIER_CLAIM_BATCH_SIZE", &mut queue.claim_batch_size)?;
        override_parsed(
            &lookup,
            "COURIER_DEFAULT_MAX_ATTEMPTS",
            &mut queue.default_max_attempts,
        )?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("workers.maxConcurrent", self.workers.max_concurrent as u64),
            ("workers.queueBuffer", self.workers.queue_buffer as u64),
            ("queue.pollIntervalSecs", self.queue.poll_interval_secs),
            ("queue.cleanupIntervalSecs", self.queue.cleanup_interval_secs),
            ("queue.stuckThresholdSecs", self.queue.stuck_threshold_secs),
            ("queue.claimBatchSize", self.queue.claim_batch_size as u64),
            ("queue.defaultMaxAttempts", u64::from(self.queue.default_max_attempts)),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{key} must be at least 1")));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            pool_size: self.workers.max_concurrent,
            queue_capacity: self.workers.queue_buffer,
            poll_interval: Duration::from_secs(self.queue.poll_interval_secs),
            cleanup_interval: Duration::from_secs(self.queue.cleanup_interval_secs),
            stuck_threshold: Duration::from_secs(self.queue.stuck_threshold_secs),
            retention_days: self.queue.retention_days,
            claim_batch_size: self.queue.claim_batch_size,
            default_max_attempts: self.queue.default_max_attempts,
        }
    }
}

fn override_parsed<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value: raw.clone() })?;
    Ok(())
}
