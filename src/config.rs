//! Engine tuning knobs
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per store call before a `Transient` error is surfaced.
    pub max_attempts: u32,
    /// Backoff before the first retry, doubled after every failure.
    pub backoff_ms: u64,
    /// How far apart an optimistic entry and its stored row may be and still pair up.
    pub dedup_window_ms: u64,
    /// Upper bound a [`crate::session::ThreadSession`] blocks for when waiting on the feed.
    pub feed_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
            dedup_window_ms: 30_000,
            feed_poll_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        if config.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.dedup_window_ms.min(i64::MAX as u64) as i64)
    }

    pub fn feed_poll(&self) -> Duration {
        Duration::from_millis(self.feed_poll_ms)
    }
}
