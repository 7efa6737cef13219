//! Shared retry policy for externally visible calls.
//!
//! One `RetryPolicy` is built from `RetryPolicyConfig` when the engine is
//! wired and handed to every activity and child execution. Step types never
//! define their own.

use std::collections::HashSet;
use std::time::Duration;

use taskloom_types::config::RetryPolicyConfig;
use taskloom_types::error::ActivityErrorKind;

use super::activity::ActivityError;

/// Exponential backoff with a capped interval and non-retryable error classes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_interval: Duration,
    backoff_coefficient: f64,
    max_interval: Duration,
    non_retryable: HashSet<ActivityErrorKind>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            backoff_coefficient: config.backoff_coefficient.max(1.0),
            max_interval: Duration::from_millis(config.max_interval_ms),
            non_retryable: config.non_retryable.iter().copied().collect(),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, kind: ActivityErrorKind) -> bool {
        !self.non_retryable.contains(&kind)
    }

    /// Whether another attempt should follow failed attempt number `attempt`
    /// (1-based).
    pub fn should_retry(&self, attempt: u32, error: &ActivityError) -> bool {
        attempt < self.max_attempts && self.is_retryable(error.kind())
    }

    /// Delay before the attempt following failed attempt number `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_interval.as_millis() as f64 * self.backoff_coefficient.powi(exponent);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryPolicyConfig::default())
    }
}
