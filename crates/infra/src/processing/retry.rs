//! Backoff and attempt limits for retriable processing failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the retry delay grows with the attempt count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base` every time
    Fixed,
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// Retry policy of one processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts (claims) after which a retriable failure becomes terminal.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction (0.0-1.0) of the delay used as a jitter band around it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next try, given how many attempts have been made so far.
    ///
    /// Jitter is deterministic in the attempt number, so two workers retrying the same
    /// attempt pick the same delay and tests stay reproducible.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let cap_ms = self.max_delay.as_millis() as f64;

        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
            // Exponent capped so the float never overflows to infinity.
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(attempt.saturating_sub(1).min(62) as i32),
        };
        let delay_ms = raw_ms.min(cap_ms.max(base_ms));

        let band = delay_ms * self.jitter.clamp(0.0, 1.0);
        let offset = if band > 0.0 {
            let unit = f64::from(attempt.wrapping_mul(17) % 100) / 100.0;
            band * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + offset).max(0.0) as u64)
    }

    /// Whether an object that has been claimed `attempts` times may be tried again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
