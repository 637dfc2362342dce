//! Retry scheduling.
//!
//! `backoff(class, attempt) = base(class) * 2^attempt`, capped at `max_delay`.
//! No jitter: the delay is a pure function of its inputs and never decreases
//! as the attempt number grows.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::notification::providers::FailureClass;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Provider attempts per delivery record, first attempt included.
    pub max_attempts: u32,
    /// Upper bound for any single delay, in seconds.
    pub max_delay_secs: u64,
    pub throttled_base_ms: u64,
    pub timeout_base_ms: u64,
    pub server_error_base_ms: u64,
    pub network_base_ms: u64,
    /// Delay between confirmation polls for accepted messages.
    pub status_poll_secs: u64,
    /// Polls before an unconfirmed message fails with `TIMEOUT:CONFIRMATION`.
    pub max_status_polls: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_delay_secs: 3600,
            throttled_base_ms: 2_000,
            timeout_base_ms: 5_000,
            server_error_base_ms: 10_000,
            network_base_ms: 15_000,
            status_poll_secs: 30,
            max_status_polls: 20,
        }
    }
}

/// Computes retry delays.
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.config.max_delay_secs)
    }

    fn base_delay(&self, class: FailureClass) -> Option<Duration> {
        let ms = match class {
            FailureClass::Throttled => self.config.throttled_base_ms,
            FailureClass::Timeout => self.config.timeout_base_ms,
            FailureClass::ServerError => self.config.server_error_base_ms,
            FailureClass::Network => self.config.network_base_ms,
            FailureClass::InvalidRecipient | FailureClass::Rejected => return None,
        };
        Some(Duration::from_millis(ms))
    }

    /// Delay before the next attempt, or `None` for terminal classes.
    pub fn backoff(&self, class: FailureClass, attempt: u32) -> Option<Duration> {
        let base = self.base_delay(class)?;
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = base.checked_mul(factor).unwrap_or(Duration::MAX);
        Some(delay.min(self.max_delay()))
    }

    pub fn status_poll_delay(&self) -> Duration {
        Duration::from_secs(self.config.status_poll_secs)
    }

    pub fn max_status_polls(&self) -> u32 {
        self.config.max_status_polls
    }
}
