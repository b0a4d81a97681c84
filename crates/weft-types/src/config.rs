//! Engine configuration types.
//!
//! `EngineConfig` represents the `weft.toml` file in the data directory. All
//! fields have defaults so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

use crate::flow::FailurePolicy;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of compiled graphs kept in the graph cache.
    #[serde(default = "default_graph_cache_capacity")]
    pub graph_cache_capacity: usize,

    /// Linear backoff unit: attempt `n` waits `backoff_base_ms * n`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Failure policy for flows that do not declare one.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Write a checkpoint after every settled step (the final checkpoint is
    /// always written).
    #[serde(default = "default_true")]
    pub checkpoint_every_step: bool,

    /// Upper bound on concurrently executing steps per run. Unbounded when absent.
    #[serde(default)]
    pub max_parallel_steps: Option<usize>,

    #[serde(default)]
    pub simplify: SimplifyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_graph_cache_capacity() -> usize {
    100
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph_cache_capacity: default_graph_cache_capacity(),
            backoff_base_ms: default_backoff_base_ms(),
            failure_policy: FailurePolicy::default(),
            checkpoint_every_step: true,
            max_parallel_steps: None,
            simplify: SimplifyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Limits applied to a tool payload for the simplified fallback attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplifyConfig {
    /// Strings longer than this many characters are truncated.
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,
    /// Arrays are capped to this many elements.
    #[serde(default = "default_max_array_len")]
    pub max_array_len: usize,
}

fn default_max_string_len() -> usize {
    1000
}

fn default_max_array_len() -> usize {
    10
}

impl Default for SimplifyConfig {
    fn default() -> Self {
        Self {
            max_string_len: default_max_string_len(),
            max_array_len: default_max_array_len(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}
