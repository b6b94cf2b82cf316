//! Retry policy for failed task attempts.
//!
//! Only a non-zero agent exit is retried. Backoff doubles each attempt:
//! attempt 1 waits the base delay, attempt 2 twice that, and so on.

use std::time::Duration;

/// Upper bound on the doubling exponent so large attempt counts cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    /// Create from config (`max_retries`, `retry_backoff_sec`).
    pub fn from_config(config: &crate::Config) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs(config.retry_backoff_sec),
        )
    }

    /// Whether another attempt is allowed after `attempt_count` retries.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        should_retry(attempt_count, self.max_retries)
    }

    /// Delay before retry number `attempt_number` (1-based).
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        backoff_duration(attempt_number, self.base_backoff)
    }
}

pub fn should_retry(attempt_count: u32, max_retries: u32) -> bool {
    attempt_count < max_retries
}

/// `base * 2^(attempt_number - 1)`; attempt 0 is treated as attempt 1.
pub fn backoff_duration(attempt_number: u32, base: Duration) -> Duration {
    let shift = attempt_number.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    base.saturating_mul(1u32 << shift)
}

/// Human-readable delay for log lines: "5s", "1.5s", "50ms".
pub fn format_delay(delay: Duration) -> String {
    if delay.as_millis() < 1000 {
        format!("{}ms", delay.as_millis())
    } else if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{:.1}s", delay.as_secs_f64())
    }
}
