//! Runtime Configuration
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Durations are expressed in milliseconds to keep the
//! serialized form readable.
//!
//! ```rust
//! use ripple_core::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_json(r#"{ "queue": { "unique_delay_ms": 20 } }"#).unwrap();
//! assert_eq!(config.queue.unique_delay_ms, 20);
//! assert!(config.capture.serialize_first_runs);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level configuration for a [`Runtime`](crate::reactive::Runtime).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Dependency capture settings.
    pub capture: CaptureConfig,
    /// Delays used by the task queues.
    pub queue: QueueConfig,
}

impl RuntimeConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set whether auto-capture first runs are serialized system-wide.
    pub fn with_serialized_first_runs(mut self, serialize: bool) -> Self {
        self.capture.serialize_first_runs = serialize;
        self
    }

    /// Set the default post-task delay of FIFO queues.
    pub fn with_fifo_delay(mut self, delay: Duration) -> Self {
        self.queue.fifo_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the delay that precedes every run of a unique queue.
    pub fn with_unique_delay(mut self, delay: Duration) -> Self {
        self.queue.unique_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Dependency capture settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Serialize the first run of every auto-capture effect through one
    /// system-wide lane, so two first runs never capture at the same time.
    pub serialize_first_runs: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            serialize_first_runs: true,
        }
    }
}

/// Queue delays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delay after each FIFO task before the next one starts.
    pub fifo_delay_ms: u64,
    /// Delay before every run of a unique queue key.
    pub unique_delay_ms: u64,
}

impl QueueConfig {
    /// FIFO post-task delay as a [`Duration`].
    pub fn fifo_delay(&self) -> Duration {
        Duration::from_millis(self.fifo_delay_ms)
    }

    /// Unique queue pre-run delay as a [`Duration`].
    pub fn unique_delay(&self) -> Duration {
        Duration::from_millis(self.unique_delay_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            fifo_delay_ms: 0,
            unique_delay_ms: 5,
        }
    }
}
