//! The persisted work-item record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::phase::ProcessingPhase;
use crate::status::ProcessingStatus;

/// Time-bounded exclusive claim on one object by one worker instance.
///
/// Lock name and lock timestamp only ever exist together, so they are one value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    /// Identifier of the worker instance holding the lease.
    pub owner: String,
    /// When the lease was acquired.
    pub locked_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: impl Into<String>, locked_at: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            locked_at,
        }
    }

    /// Whether the lease was taken at or before `cutoff` (sweep eligibility).
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.locked_at <= cutoff
    }
}

/// A persisted unit of asynchronous work carrying status and lease metadata.
///
/// ## Invariants
///
/// - a lease is only held while the status is in the PROCESSING phase
/// - `processed` is set iff the status is in the COMPLETED phase
/// - eligible for claim iff not suspended, PENDING phase and `next_processed <= now`
/// - `processing_attempts` grows by exactly one per successful claim and only drops
///   (to zero) when an unlock asks for a reset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessableObject<Id, S> {
    pub id: Id,
    pub status: S,
    /// Current lease (`lockName` + `locked`), if any.
    pub lease: Option<Lease>,
    /// Earliest time the object may be claimed.
    pub next_processed: DateTime<Utc>,
    /// Most recent processing attempt.
    pub last_processed: Option<DateTime<Utc>>,
    /// Completion time; only set in the COMPLETED phase.
    pub processed: Option<DateTime<Utc>>,
    /// Claims since the last reset.
    pub processing_attempts: u32,
    /// Cumulative milliseconds spent in `process()` across attempts.
    pub processing_time_ms: u64,
    /// Excluded from claiming regardless of status and time.
    pub processing_suspended: bool,
}

/// Field changes an unlock writes, applied identically to the row and to the
/// in-memory copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockChange<S> {
    pub status: S,
    /// Added to `processing_time_ms`.
    pub duration_ms: u64,
    pub last_processed: Option<DateTime<Utc>>,
    pub next_processed: DateTime<Utc>,
    pub processed: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl<Id, S: ProcessingStatus> ProcessableObject<Id, S> {
    /// Create a fresh object that becomes claimable at `next_processed`.
    pub fn new(id: Id, status: S, next_processed: DateTime<Utc>) -> Self {
        Self {
            id,
            status,
            lease: None,
            next_processed,
            last_processed: None,
            processed: None,
            processing_attempts: 0,
            processing_time_ms: 0,
            processing_suspended: false,
        }
    }

    pub fn suspended(mut self) -> Self {
        self.processing_suspended = true;
        self
    }

    pub fn phase(&self) -> ProcessingPhase {
        self.status.phase()
    }

    pub fn lock_name(&self) -> Option<&str> {
        self.lease.as_ref().map(|l| l.owner.as_str())
    }

    pub fn locked(&self) -> Option<DateTime<Utc>> {
        self.lease.as_ref().map(|l| l.locked_at)
    }

    /// Whether a claimer looking at `now` may pick this object up.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.processing_suspended
            && self.phase() == ProcessingPhase::Pending
            && self.lease.is_none()
            && self.next_processed <= now
    }

    /// Mirror a successful claim.
    pub fn apply_claim(&mut self, processing_status: S, lease: Lease, attempts: u32) {
        self.status = processing_status;
        self.lease = Some(lease);
        self.processing_attempts = attempts;
    }

    /// Mirror a successful unlock.
    pub fn apply_unlock(&mut self, change: &UnlockChange<S>) {
        self.status = change.status;
        self.lease = None;
        self.processing_time_ms = self.processing_time_ms.saturating_add(change.duration_ms);
        self.last_processed = change.last_processed;
        self.next_processed = change.next_processed;
        self.processed = change.processed;
        self.processing_attempts = change.attempts;
    }

    /// Mirror a stale-lock reset back to `pending_status`.
    pub fn apply_reset(&mut self, pending_status: S) {
        self.status = pending_status;
        self.lease = None;
    }

    /// Check the record-level invariants.
    pub fn check_invariants(&self) -> DomainResult<()> {
        let phase = self.phase();

        if self.lease.is_some() && phase != ProcessingPhase::Processing {
            return Err(DomainError::invariant(format!(
                "lease held while status {} is in phase {}",
                self.status.code(),
                phase
            )));
        }

        match (phase, self.processed) {
            (ProcessingPhase::Completed, None) => Err(DomainError::invariant(format!(
                "status {} is COMPLETED but processed is empty",
                self.status.code()
            ))),
            (p, Some(_)) if p != ProcessingPhase::Completed => Err(DomainError::invariant(format!(
                "processed is set but status {} is in phase {}",
                self.status.code(),
                p
            ))),
            _ => Ok(()),
        }
    }
}
