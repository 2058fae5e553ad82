//! Caller-side retry policy for publishing.
//!
//! The bus never retries a publish on its own. A caller that accepts the risk of
//! duplicates (consumers are expected to be idempotent) opts in with a
//! `RetryPolicy`: at most `max_attempts` tries, waiting `first × factor^n`
//! (capped at `max`) between them.

use std::time::Duration;

/// How often and how patiently to retry a failed publish.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retry.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Backoff used internally while reconnecting or waiting for a coordinator.
pub(crate) fn reconnect_backoff() -> RetryPolicy {
    RetryPolicy {
        max_attempts: u32::MAX,
        first: Duration::from_millis(50),
        max: Duration::from_secs(2),
        factor: 2.0,
    }
}
