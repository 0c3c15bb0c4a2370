//! # Configuration
//!
//! Operational knobs for the coordination core: connection retry budgets,
//! transition worker bounds, pipeline cadence, and messaging defaults.
//! Values come from `Default`, a config file, or `FLOCK_*` environment
//! overrides, in that order.

use serde::{Deserialize, Serialize};

use crate::error::{FlockError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlockConfig {
    pub connection: ConnectionConfig,
    pub engine: EngineConfig,
    pub pipeline: PipelineConfig,
    pub messaging: MessagingConfig,
}

/// Manager connection and session-recovery behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Attempts before `connect()` gives up and surfaces a connection error.
    pub connect_retry_limit: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

/// Participant-side transition execution bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on transitions in flight across all partition keys.
    /// Per-key execution is always serialized regardless of this value.
    pub max_concurrent_transitions: usize,
}

/// Controller pipeline cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Interval for the leader-only periodic rebalance timer task.
    pub periodic_rebalance_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Timeout stamped on generated messages; expired undelivered messages
    /// are pruned and regenerated by the controller.
    pub default_timeout_ms: u64,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            engine: EngineConfig::default(),
            pipeline: PipelineConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_retry_limit: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transitions: 40,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            periodic_rebalance_interval_ms: 30_000,
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
        }
    }
}

impl FlockConfig {
    /// Load from an optional TOML/YAML/JSON file plus `FLOCK_*` environment
    /// overrides (e.g. `FLOCK_CONNECTION__CONNECT_RETRY_LIMIT=3`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FLOCK")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| FlockError::Configuration(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| FlockError::Configuration(e.to_string()))
    }

    /// Backoff delay for the given retry attempt, capped at the configured
    /// maximum.
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let base = self.connection.backoff_base_ms;
        let shifted = base.saturating_mul(1u64 << attempt.min(20));
        shifted.min(self.connection.backoff_max_ms)
    }
}
