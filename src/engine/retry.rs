use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration for a step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after every further failure.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Next move for a step after an attempt finishes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// The attempt succeeded; move the cursor forward.
    Advance,
    /// The attempt failed with budget left; re-enqueue after the delay.
    RetryAfter(Duration),
    /// The attempt failed and the budget is spent; the run fails.
    Exhausted,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff_ms,
            backoff_multiplier,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::default()
    }

    /// Delay to wait after `attempt` (1-based) fails:
    /// `initial_backoff_ms * backoff_multiplier^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        if ms.is_finite() && ms > 0.0 {
            Duration::from_millis(ms.round() as u64)
        } else {
            Duration::ZERO
        }
    }

    pub fn transition(&self, attempt: u32, succeeded: bool) -> Transition {
        if succeeded {
            Transition::Advance
        } else if attempt >= self.max_attempts.max(1) {
            Transition::Exhausted
        } else {
            Transition::RetryAfter(self.delay_for(attempt))
        }
    }
}
