//! Engine configuration types.
//!
//! `EngineConfig` represents the `engine.toml` file in the data directory. It
//! controls parallelism caps, offload thresholds, timeouts and the default
//! activity retry policy. All fields have defaults.

use serde::{Deserialize, Serialize};

use crate::error::ActivityErrorKind;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrent sub-executions in a parallel map-reduce.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Serialized payloads larger than this are moved to the blob store.
    #[serde(default = "default_offload_threshold_bytes")]
    pub offload_threshold_bytes: usize,

    /// History length at which the runtime suggests continue-as-new.
    #[serde(default = "default_history_event_limit")]
    pub history_event_limit: usize,

    /// Start-to-close timeout for a step activity.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Start-to-close timeout for expression evaluation activities.
    #[serde(default = "default_evaluate_timeout_secs")]
    pub evaluate_timeout_secs: u64,

    /// How long `wait_for_input` waits before timing out. `None` waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_input_timeout_secs: Option<u64>,

    /// Default retry policy attached to activities.
    #[serde(default)]
    pub retry: RetryPolicyConfig,
}

fn default_max_parallelism() -> usize {
    100
}

fn default_offload_threshold_bytes() -> usize {
    64 * 1024
}

fn default_history_event_limit() -> usize {
    10_000
}

fn default_step_timeout_secs() -> u64 {
    600
}

fn default_evaluate_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            offload_threshold_bytes: default_offload_threshold_bytes(),
            history_event_limit: default_history_event_limit(),
            step_timeout_secs: default_step_timeout_secs(),
            evaluate_timeout_secs: default_evaluate_timeout_secs(),
            wait_for_input_timeout_secs: None,
            retry: RetryPolicyConfig::default(),
        }
    }
}

/// Exponential backoff retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Error kinds that fail immediately without another attempt.
    #[serde(default = "default_non_retryable")]
    pub non_retryable: Vec<ActivityErrorKind>,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_backoff_coefficient() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_non_retryable() -> Vec<ActivityErrorKind> {
    vec![
        ActivityErrorKind::Validation,
        ActivityErrorKind::Expression,
        ActivityErrorKind::NotFound,
        ActivityErrorKind::Cancelled,
    ]
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            max_interval_ms: default_max_interval_ms(),
            non_retryable: default_non_retryable(),
        }
    }
}
