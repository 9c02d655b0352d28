//! Per-endpoint retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on any single backoff delay, in seconds.
pub const MAX_BACKOFF_SECONDS: u64 = 300;

/// How many times, and how patiently, a delivery is retried.
///
/// `max_retries` counts attempts in total: a delivery whose attempt count
/// reaches it is failed permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_retries: u32,
    /// Base delay between attempts, in seconds.
    pub base_delay_seconds: u64,
    /// Double the delay after each failed attempt.
    pub exponential_backoff: bool,
}

impl RetryPolicy {
    /// Creates a new policy.
    pub fn new(max_retries: u32, base_delay_seconds: u64, exponential_backoff: bool) -> Self {
        Self {
            max_retries,
            base_delay_seconds,
            exponential_backoff,
        }
    }

    /// Sets the maximum attempts.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Sets the base delay.
    pub fn base_delay_seconds(mut self, seconds: u64) -> Self {
        self.base_delay_seconds = seconds;
        self
    }

    /// Sets whether the delay grows exponentially.
    pub fn exponential(mut self, exponential: bool) -> Self {
        self.exponential_backoff = exponential;
        self
    }

    /// Delay before the attempt following failed attempt number `attempt`.
    ///
    /// `base * 2^(attempt-1)` when exponential, `base` otherwise, capped at
    /// [`MAX_BACKOFF_SECONDS`]. Attempt numbers start at 1; 0 is treated as 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let seconds = if self.exponential_backoff {
            let exponent = attempt.max(1) - 1;
            let multiplier = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
            self.base_delay_seconds.saturating_mul(multiplier)
        } else {
            self.base_delay_seconds
        };

        Duration::from_secs(seconds.min(MAX_BACKOFF_SECONDS))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_seconds: 60,
            exponential_backoff: true,
        }
    }
}
