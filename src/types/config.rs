//! Configuration structures.
//!
//! Configuration is loaded from JSON files; every section has defaults so a
//! partial file is enough.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::Result;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Table store access.
    #[serde(default)]
    pub store: StoreConfig,

    /// Agent runtime tuning.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

/// Table store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Job table name.
    pub jobs_table: String,

    /// Agent registry table name.
    pub agents_table: String,

    /// Blob reference table name.
    pub files_table: String,

    /// Backoff between throttled retries.
    pub retry: RetryPolicy,

    /// Items requested per scan page.
    pub scan_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            jobs_table: "jobs".to_string(),
            agents_table: "agents".to_string(),
            files_table: "files".to_string(),
            retry: RetryPolicy::default(),
            scan_page_size: 100,
        }
    }
}

/// Bounded exponential backoff: pauses are `min_pause * scale^i` while below `max_pause`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub min_pause: Duration,

    #[serde(with = "humantime_serde")]
    pub max_pause: Duration,

    pub scale: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_pause: Duration::from_millis(500),
            max_pause: Duration::from_secs(10_000),
            scale: 2,
        }
    }
}

impl RetryPolicy {
    /// The full pause schedule; its length is the retry budget.
    pub fn pauses(&self) -> Vec<Duration> {
        let mut pauses = Vec::new();
        if self.min_pause.is_zero() {
            return pauses;
        }
        let mut pause = self.min_pause;
        while pause < self.max_pause {
            pauses.push(pause);
            match pause.checked_mul(self.scale.max(2)) {
                Some(next) => pause = next,
                None => break,
            }
        }
        pauses
    }

    /// A policy that never waits, for in-process stores.
    pub fn immediate(attempts: usize) -> Self {
        Self {
            min_pause: Duration::from_nanos(1),
            max_pause: Duration::from_nanos(1 << attempts.min(60)),
            scale: 2,
        }
    }
}

/// Agent runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Sleep between listen cycles when no job was accepted.
    #[serde(with = "humantime_serde")]
    pub poll_period: Duration,

    /// Grace period between interrupting a task and killing it.
    #[serde(with = "humantime_serde")]
    pub release_delay: Duration,

    /// Suffix of captured task output artifacts.
    pub output_suffix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_secs(60),
            release_delay: Duration::from_secs(300),
            output_suffix: ".o".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
