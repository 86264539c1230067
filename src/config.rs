//! Fleet configuration
//!
//! All timeouts are stored in milliseconds so the struct round-trips through
//! plain JSON; accessors hand out `Duration`s.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

const MAX_RETRY_CEILING: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Transport-level connect handshake timeout
    pub connect_timeout_ms: u64,

    /// Discovery scan duration before it stops on its own
    pub scan_timeout_ms: u64,

    /// Single-device locate scan used before connecting
    pub locate_timeout_ms: u64,

    /// Upper bound for one transport download or backend upload call
    pub task_timeout_ms: u64,

    /// Re-attempts of a transfer job after the first attempt
    pub max_retries: u32,

    /// First backoff delay; doubles on each retry
    pub backoff_base_ms: u64,

    /// Backoff cap
    pub backoff_max_ms: u64,

    /// Ask the device to delete files once the backend accepted them
    pub remote_cleanup: bool,

    /// Re-probe the campaign after a completed job
    pub verify_after_completion: bool,

    /// Upload queue throttle (0 = unlimited)
    pub queue_uploads_per_second: u32,

    /// Root directory for retrieved files
    pub artifact_dir: PathBuf,

    /// SQLite URL for the durable store, or ":memory:"
    pub store_path: String,

    /// Event bus buffer size
    pub event_capacity: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            scan_timeout_ms: 30_000,
            locate_timeout_ms: 10_000,
            task_timeout_ms: 60_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            remote_cleanup: true,
            verify_after_completion: true,
            queue_uploads_per_second: 0,
            artifact_dir: PathBuf::from("artifacts"),
            store_path: "sqlite://fieldsync.db?mode=rwc".to_string(),
            event_capacity: 256,
        }
    }
}

impl FleetConfig {
    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let config: FleetConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("scan_timeout_ms", self.scan_timeout_ms),
            ("locate_timeout_ms", self.locate_timeout_ms),
            ("task_timeout_ms", self.task_timeout_ms),
            ("backoff_base_ms", self.backoff_base_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.max_retries > MAX_RETRY_CEILING {
            return Err(ConfigError::Invalid(format!(
                "max_retries {} exceeds {MAX_RETRY_CEILING}",
                self.max_retries
            )));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "backoff_base_ms must not exceed backoff_max_ms".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be non-zero".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn locate_timeout(&self) -> Duration {
        Duration::from_millis(self.locate_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Config for tests and demos: in-memory store, artifacts under `dir`
    pub fn ephemeral(dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: dir.into(),
            store_path: ":memory:".to_string(),
            ..Default::default()
        }
    }
}
