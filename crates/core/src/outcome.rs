//! What a domain processor hands back after executing an object.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Successful result of `process()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome<S> {
    /// Status to unlock into (COMPLETED, FAILED or, for multi-step work, PENDING phase).
    pub status: S,
    /// Next eligible time when `status` is PENDING; ignored otherwise.
    pub next_processed: Option<DateTime<Utc>>,
    /// Elapsed time as measured by the processor. The engine's own measurement is
    /// used when absent.
    pub duration: Option<Duration>,
    /// Start the attempt count over (e.g. when advancing to the next step).
    pub reset_attempts: bool,
}

impl<S> ProcessOutcome<S> {
    /// Unlock into `status` with no rescheduling.
    pub fn to_status(status: S) -> Self {
        Self {
            status,
            next_processed: None,
            duration: None,
            reset_attempts: false,
        }
    }

    /// Unlock into a PENDING-phase `status`, eligible again at `at`.
    pub fn reschedule(status: S, at: DateTime<Utc>) -> Self {
        Self {
            status,
            next_processed: Some(at),
            duration: None,
            reset_attempts: false,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_reset_attempts(mut self) -> Self {
        self.reset_attempts = true;
        self
    }
}

/// How a retriable failure is rescheduled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    /// Backoff before the object becomes eligible again.
    pub delay: Duration,
    /// When false the failed attempt does not count against the attempt budget and
    /// the counter is reset.
    pub count_attempt: bool,
}

impl RetryDecision {
    pub fn after(delay: Duration) -> Self {
        Self {
            delay,
            count_attempt: true,
        }
    }

    /// Retry without consuming the attempt budget (e.g. a dependency was offline).
    pub fn uncounted(delay: Duration) -> Self {
        Self {
            delay,
            count_attempt: false,
        }
    }
}
