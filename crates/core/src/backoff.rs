//! Retry policy and the bounded exponential backoff curve.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard cap on any single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Attempts above this are clamped before exponentiation.
pub const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Delay before re-running a job whose previous try was `attempt` (0-based).
///
/// `min(300s, base * 2^min(attempt, 10))`. Pure and total: a huge `base`
/// saturates instead of overflowing and still lands on the cap.
pub fn compute_backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of ledger submissions allowed for one record (>= 1).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Calculate the delay after a failed try numbered `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        compute_backoff(self.base_delay, attempt)
    }

    /// Whether a job about to become `next_attempt` has used up its budget.
    pub fn is_exhausted(&self, next_attempt: u32) -> bool {
        next_attempt >= self.max_attempts
    }
}
