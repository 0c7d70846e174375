//! Retry policy with capped exponential backoff.
//!
//! A failed attempt is retried up to `max_retries` times. Before retry `n`
//! (1-based) the worker waits `min(base_delay * 2^(n-1), max_delay)` on the
//! attempt's cancellation token, so a cancel during backoff aborts promptly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Upper bound accepted for `max_retries`
const MAX_RETRIES_LIMIT: u32 = 100;

/// Backoff growth factor between consecutive retries
const BACKOFF_FACTOR: u64 = 2;

/// How many times, and how patiently, a failed task is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,
    /// Cap on any single delay (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(QueueError::validation(
                "max_retries",
                format!("must be at most {}, got {}", MAX_RETRIES_LIMIT, self.max_retries),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(QueueError::validation(
                "max_delay_ms",
                format!(
                    "cap {}ms is below the base delay {}ms",
                    self.max_delay_ms, self.base_delay_ms
                ),
            ));
        }
        Ok(())
    }

    /// Total attempts allowed, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63);
        let factor = BACKOFF_FACTOR.saturating_pow(exponent);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}
