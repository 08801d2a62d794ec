//! Configuration for the snapshot store and the remote sync loop.
//!
//! Both structs deserialize from JSON with every field optional, so native
//! hosts can pass `{}` and get the defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and retry policy for [`DebouncedSync`](crate::remote_sync::DebouncedSync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last change before a remote write starts.
    pub debounce_ms: u64,

    /// Attempts per write before the status becomes `error`. Values below 1
    /// are treated as 1.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub retry_delay_ms: u64,

    /// Double the retry delay after every failed attempt.
    pub exponential_backoff: bool,

    /// Upper bound for the backed-off delay.
    pub max_retry_delay_ms: u64,

    /// Per-attempt timeout; a timed-out attempt is retried like a failed one.
    pub attempt_timeout_ms: Option<u64>,

    /// Ask the platform to confirm closing while changes are unsaved.
    pub prompt_on_exit: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 1000,
            exponential_backoff: true,
            max_retry_delay_ms: 30_000,
            attempt_timeout_ms: None,
            prompt_on_exit: true,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff {
            return Duration::from_millis(self.retry_delay_ms);
        }
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay = self.retry_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay_ms.max(self.retry_delay_ms)))
    }
}

/// Where and how local snapshots are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base path of the primary store; `.lmdb` is appended.
    pub path: PathBuf,

    /// LMDB map size in bytes.
    pub map_size: usize,

    /// Namespace prepended to every document key.
    pub feature: String,

    /// Directory for the file fallback, `<path>.fallback` when unset.
    pub fallback_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("drafts"),
            map_size: 10 * 1024 * 1024,
            feature: "draft".to_string(),
            fallback_dir: None,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, feature: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            feature: feature.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.fallback_dir.clone().unwrap_or_else(|| {
            let mut name = self.path.as_os_str().to_os_string();
            name.push(".fallback");
            PathBuf::from(name)
        })
    }
}
