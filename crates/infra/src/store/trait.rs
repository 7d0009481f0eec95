use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use leasehold_core::{
    DomainError, Lease, ObjectKey, ProcessableObject, ProcessingStatus, UnlockChange,
};

/// Conditional claim of one row.
///
/// Applied only while the row still matches the snapshot the claimer saw: it has
/// `pending_status`, `expected_attempts` attempts and `next_processed <= now`, holds
/// no lease and is not suspended. On success the row gets `processing_status`, a
/// lease for `owner` taken at `now`, and `expected_attempts + 1` attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest<Id, S> {
    pub id: Id,
    pub pending_status: S,
    pub processing_status: S,
    pub owner: String,
    pub now: DateTime<Utc>,
    pub expected_attempts: u32,
}

impl<Id, S> ClaimRequest<Id, S> {
    /// The lease this claim grants when it wins.
    pub fn lease(&self) -> Lease {
        Lease::new(self.owner.clone(), self.now)
    }

    /// Attempt count written by a winning claim.
    pub fn attempts(&self) -> u32 {
        self.expected_attempts.saturating_add(1)
    }
}

/// Result of one claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt<Id, S> {
    /// This instance now holds the lease.
    Claimed(ProcessableObject<Id, S>),
    /// Nothing eligible right now.
    Idle,
    /// A candidate existed but another claimer got it first.
    Lost,
}

/// Conditional unlock of one row.
///
/// Applied only while the row still carries exactly `lease`. A sweep that already
/// reset the row, or another worker that re-claimed it since, makes the unlock a
/// no-op (0 affected rows) instead of overwriting a fresh claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockRequest<Id, S> {
    pub id: Id,
    pub lease: Lease,
    pub change: UnlockChange<S>,
}

/// Work store operation error.
///
/// These are **infrastructure errors**. Losing a claim race or an unlock whose lease
/// is gone is not an error; those operations report 0 affected rows.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid object: {0}")]
    InvalidObject(#[from] DomainError),

    #[error("invalid table name: {0}")]
    InvalidTableName(String),

    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Shared store of processable objects.
///
/// ## Atomic operations
///
/// - `find_eligible`: candidates for claiming, earliest `next_processed` first
/// - `claim`: compare-and-set from a pending status to its processing status
/// - `claim_next`: pick and claim the earliest candidate
/// - `reset_stale_locks`: bulk-revert leases older than a cutoff
/// - `unlock`: persist an outcome, conditional on the caller's lease
///
/// `claim`, `reset_stale_locks` and `unlock` return the number of affected rows.
///
/// ## Implementation Requirements
///
/// Implementations must make each operation atomic with respect to every other
/// operation on the same row, and must never let two claims for one row both report
/// success.
#[async_trait]
pub trait WorkStore<Id, S>: Send + Sync
where
    Id: ObjectKey,
    S: ProcessingStatus,
{
    /// Objects with a status in `pending_statuses`, `next_processed <= now` and not
    /// suspended, ordered by `next_processed` ascending, at most `limit` of them.
    async fn find_eligible(
        &self,
        pending_statuses: &[S],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessableObject<Id, S>>, StoreError>;

    /// Conditionally lock one object. `Ok(0)` means another claimer won.
    async fn claim(&self, request: &ClaimRequest<Id, S>) -> Result<u64, StoreError>;

    /// Claim the earliest eligible object whose status is the pending side of one of
    /// `transitions` (pending, processing), moving it to the paired processing status.
    ///
    /// The default runs `find_eligible` then `claim`; a concurrent claimer can slip in
    /// between, which is reported as [`ClaimAttempt::Lost`]. Stores that can pick and
    /// lock in one statement should override it so concurrent callers get disjoint rows.
    async fn claim_next(
        &self,
        transitions: &[(S, S)],
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimAttempt<Id, S>, StoreError> {
        let pending: Vec<S> = transitions.iter().map(|(pending, _)| *pending).collect();
        let Some(mut object) = self.find_eligible(&pending, now, 1).await?.pop() else {
            return Ok(ClaimAttempt::Idle);
        };
        let Some(processing_status) = transitions
            .iter()
            .find(|(pending, _)| *pending == object.status)
            .map(|(_, processing)| *processing)
        else {
            return Ok(ClaimAttempt::Lost);
        };

        let request = ClaimRequest {
            id: object.id.clone(),
            pending_status: object.status,
            processing_status,
            owner: owner.to_string(),
            now,
            expected_attempts: object.processing_attempts,
        };
        if self.claim(&request).await? == 0 {
            return Ok(ClaimAttempt::Lost);
        }

        object.apply_claim(processing_status, request.lease(), request.attempts());
        Ok(ClaimAttempt::Claimed(object))
    }

    /// Revert every row in `processing_status` locked at or before `cutoff` to
    /// `pending_status`, clearing the lease. `next_processed` is left untouched.
    async fn reset_stale_locks(
        &self,
        processing_status: S,
        pending_status: S,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Persist an outcome and release the lease. `Ok(0)` means the lease was lost.
    async fn unlock(&self, request: &UnlockRequest<Id, S>) -> Result<u64, StoreError>;

    /// Add a new object. Fails on duplicate ids and on invariant violations.
    async fn insert(&self, object: ProcessableObject<Id, S>) -> Result<(), StoreError>;

    /// Load one object.
    async fn get(&self, id: &Id) -> Result<Option<ProcessableObject<Id, S>>, StoreError>;

    /// Set or clear the suspension flag. Returns the number of affected rows.
    async fn set_suspended(&self, id: &Id, suspended: bool) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T, Id, S> WorkStore<Id, S> for Arc<T>
where
    T: WorkStore<Id, S> + ?Sized,
    Id: ObjectKey,
    S: ProcessingStatus,
{
    async fn find_eligible(
        &self,
        pending_statuses: &[S],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessableObject<Id, S>>, StoreError> {
        (**self).find_eligible(pending_statuses, now, limit).await
    }

    async fn claim(&self, request: &ClaimRequest<Id, S>) -> Result<u64, StoreError> {
        (**self).claim(request).await
    }

    async fn claim_next(
        &self,
        transitions: &[(S, S)],
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimAttempt<Id, S>, StoreError> {
        (**self).claim_next(transitions, owner, now).await
    }

    async fn reset_stale_locks(
        &self,
        processing_status: S,
        pending_status: S,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self)
            .reset_stale_locks(processing_status, pending_status, cutoff)
            .await
    }

    async fn unlock(&self, request: &UnlockRequest<Id, S>) -> Result<u64, StoreError> {
        (**self).unlock(request).await
    }

    async fn insert(&self, object: ProcessableObject<Id, S>) -> Result<(), StoreError> {
        (**self).insert(object).await
    }

    async fn get(&self, id: &Id) -> Result<Option<ProcessableObject<Id, S>>, StoreError> {
        (**self).get(id).await
    }

    async fn set_suspended(&self, id: &Id, suspended: bool) -> Result<u64, StoreError> {
        (**self).set_suspended(id, suspended).await
    }
}
