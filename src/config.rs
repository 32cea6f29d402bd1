//! Tunables for the stream lifecycle.
//!
//! Embedding SDKs normally run with the defaults; the knobs exist so test
//! rigs and constrained deployments can tighten them.

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

/// Exponential backoff parameters for stream restarts.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay before the second retry (the first retry is immediate),
    /// milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,

    /// Ceiling for the delay, milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.factor < 1.0 {
            return Err(ConfigError::Message(format!(
                "backoff: factor({}) must be >= 1.0",
                self.factor
            )));
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Message(format!(
                "backoff: initial_delay_ms({}) must not exceed max_delay_ms({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }

        Ok(())
    }
}

/// Stream-level tunables shared by the watch and write streams.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct StreamConfig {
    /// How long an open stream may sit with no activity before it is closed
    /// cleanly to release transport resources, milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "stream: idle_timeout_ms cannot be 0".to_string(),
            ));
        }

        self.backoff.validate()
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_backoff_factor() -> f64 {
    1.5
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}
