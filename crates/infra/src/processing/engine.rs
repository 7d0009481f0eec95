//! Generic claim → process → unlock cycle.
//!
//! `Engine` composes an [`ObjectProcessor`] (domain logic) with a [`WorkStore`]
//! (persistence). It never holds a lock of its own: every state change is one of
//! the store's conditional operations, so any number of engines, in any number of
//! processes, can share one store.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use leasehold_core::{
    DomainError, Lease, ObjectKey, ProcessableObject, ProcessingError, ProcessingPhase,
    ProcessingStatus, UnlockChange,
};

use crate::clock::{Clock, SystemClock};
pub use crate::store::ClaimAttempt;
use crate::store::{StoreError, UnlockRequest, WorkStore};

use super::processor::ObjectProcessor;

/// Floor for retry delays, so a retried object is never immediately eligible again.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Engine-level error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("processor already registered: {0}")]
    DuplicateProcessor(String),

    #[error("processor already running: {0}")]
    AlreadyRunning(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// What happened to a claimed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Retriable failure; back to pending with a backoff.
    Retried,
    /// Processor returned a pending status (multi-step domains).
    Rescheduled,
    Failed,
    /// The lease was gone at unlock time; the outcome was not written.
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct ProcessingReport<Id, S> {
    /// In-memory copy after the cycle (unchanged when the lease was lost).
    pub object: ProcessableObject<Id, S>,
    pub disposition: Disposition,
}

pub struct Engine<Id, S, P, St> {
    processor: Arc<P>,
    store: St,
    clock: Arc<dyn Clock>,
    owner: String,
    _marker: PhantomData<fn() -> (Id, S)>,
}

impl<Id, S, P, St> Engine<Id, S, P, St>
where
    Id: ObjectKey,
    S: ProcessingStatus,
    P: ObjectProcessor<Id, S>,
    St: WorkStore<Id, S>,
{
    /// `owner` is written into the lease of every object this engine claims.
    pub fn new(processor: Arc<P>, store: St, owner: impl Into<String>) -> Self {
        Self {
            processor,
            store,
            clock: Arc::new(SystemClock),
            owner: owner.into(),
            _marker: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Find the earliest eligible object and try to claim it.
    pub async fn claim_next(&self) -> Result<ClaimAttempt<Id, S>, EngineError> {
        let now = self.clock.now();
        let mapping = self.processor.status_mapping();

        let transitions = self
            .processor
            .pending_statuses()
            .into_iter()
            .map(|pending| {
                mapping
                    .processing_for(pending)
                    .map(|processing| (pending, processing))
                    .ok_or_else(|| {
                        DomainError::invalid_mapping(format!(
                            "no processing status mapped for pending status {}",
                            pending.code()
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let attempt = self.store.claim_next(&transitions, &self.owner, now).await?;
        match &attempt {
            ClaimAttempt::Claimed(object) => debug!(
                processor = self.processor.name(),
                object_id = %object.id,
                status = object.status.code(),
                attempts = object.processing_attempts,
                "claimed object"
            ),
            ClaimAttempt::Lost => debug!(processor = self.processor.name(), "lost claim race"),
            ClaimAttempt::Idle => {}
        }
        Ok(attempt)
    }

    /// Claim one object, or `None` when nothing is eligible or the race was lost.
    pub async fn claim_next_processable_object(
        &self,
    ) -> Result<Option<ProcessableObject<Id, S>>, EngineError> {
        match self.claim_next().await? {
            ClaimAttempt::Claimed(object) => Ok(Some(object)),
            ClaimAttempt::Idle | ClaimAttempt::Lost => Ok(None),
        }
    }

    /// Persist a new status for a claimed object and release its lease.
    ///
    /// `next_processed` defaults to now for pending statuses and stays unchanged
    /// otherwise. Returns `false` when the lease was lost in the meantime; the write
    /// is then discarded and `object` is left as it was.
    pub async fn unlock_processable_object(
        &self,
        object: &mut ProcessableObject<Id, S>,
        new_status: S,
        duration: Duration,
        next_processed: Option<DateTime<Utc>>,
        reset_attempts: bool,
    ) -> Result<bool, EngineError> {
        let now = self.clock.now();
        self.unlock_at(object, new_status, duration, next_processed, reset_attempts, now)
            .await
    }

    /// Run the processor on a claimed object and persist whatever came out of it.
    ///
    /// Domain errors never escape: they become a retry or a failure status. An
    /// `Err` here means the store (or the processor's own configuration) is broken.
    pub async fn process_claimed(
        &self,
        mut object: ProcessableObject<Id, S>,
    ) -> Result<ProcessingReport<Id, S>, EngineError> {
        let failed_status = object.status;
        let max_attempts = self.processor.max_processing_attempts();

        let started = Instant::now();
        let result = if object.processing_attempts > max_attempts {
            // Revived by the sweep after its last allowed attempt never unlocked.
            Err(ProcessingError::fatal(format!(
                "processing attempts exhausted ({} of {max_attempts})",
                object.processing_attempts
            )))
        } else {
            match AssertUnwindSafe(self.processor.process(&object))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(ProcessingError::fatal(format!(
                    "processor panicked: {}",
                    panic_message(&*panic)
                ))),
            }
        };
        let elapsed = started.elapsed();
        let now = self.clock.now();

        let result = match result {
            Ok(outcome) if outcome.status.phase() == ProcessingPhase::Processing => {
                Err(ProcessingError::fatal(format!(
                    "processor returned in-flight status {}",
                    outcome.status.code()
                )))
            }
            other => other,
        };

        let (disposition, written) = match result {
            Ok(outcome) => {
                let disposition = match outcome.status.phase() {
                    ProcessingPhase::Completed => Disposition::Completed,
                    ProcessingPhase::Failed => Disposition::Failed,
                    _ => Disposition::Rescheduled,
                };
                let written = self
                    .unlock_at(
                        &mut object,
                        outcome.status,
                        outcome.duration.unwrap_or(elapsed),
                        outcome.next_processed,
                        outcome.reset_attempts,
                        now,
                    )
                    .await?;
                (disposition, written)
            }
            Err(error) => {
                self.handle_failure(&mut object, failed_status, error, elapsed, now)
                    .await?
            }
        };

        let disposition = if written {
            disposition
        } else {
            Disposition::LeaseLost
        };

        debug!(
            processor = self.processor.name(),
            object_id = %object.id,
            status = object.status.code(),
            attempts = object.processing_attempts,
            disposition = ?disposition,
            "processed object"
        );
        Ok(ProcessingReport {
            object,
            disposition,
        })
    }

    /// One full cycle: claim, process, unlock. `None` when nothing was claimed.
    pub async fn process_next(&self) -> Result<Option<ProcessingReport<Id, S>>, EngineError> {
        match self.claim_next_processable_object().await? {
            Some(object) => self.process_claimed(object).await.map(Some),
            None => Ok(None),
        }
    }

    /// Revert leases older than `lock_timeout` for every pair of the status mapping.
    pub async fn reset_stale_locks(&self, lock_timeout: Duration) -> Result<u64, EngineError> {
        let timeout = chrono::Duration::from_std(lock_timeout)
            .map_err(|e| EngineError::Runtime(format!("lock timeout out of range: {e}")))?;
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(timeout)
            .ok_or_else(|| EngineError::Runtime("lock timeout out of range".to_string()))?;

        let mut total = 0;
        for (pending, processing) in self.processor.status_mapping().pairs() {
            total += self
                .store
                .reset_stale_locks(processing, pending, cutoff)
                .await?;
        }
        Ok(total)
    }

    /// Exclude an object from claiming, or make it claimable again.
    ///
    /// A lease already held is not affected; suspension only stops future claims.
    pub async fn set_suspended(&self, id: &Id, suspended: bool) -> Result<(), EngineError> {
        if self.store.set_suspended(id, suspended).await? == 0 {
            return Err(StoreError::NotFound(id.to_string()).into());
        }
        info!(
            processor = self.processor.name(),
            object_id = %id,
            suspended,
            "changed suspension"
        );
        Ok(())
    }

    /// Hand a claimed but unstarted object back to its pending status.
    ///
    /// Schedule, attempts and `last_processed` are kept as they are. Returns `false`
    /// when the lease was already gone.
    pub async fn release(&self, object: &mut ProcessableObject<Id, S>) -> Result<bool, EngineError> {
        let lease = lease_of(object)?;
        let change = UnlockChange {
            status: self.pending_for(object.status)?,
            duration_ms: 0,
            last_processed: object.last_processed,
            next_processed: object.next_processed,
            processed: None,
            attempts: object.processing_attempts,
        };
        self.write_unlock(object, lease, change).await
    }

    async fn handle_failure(
        &self,
        object: &mut ProcessableObject<Id, S>,
        failed_status: S,
        error: ProcessingError,
        elapsed: Duration,
        now: DateTime<Utc>,
    ) -> Result<(Disposition, bool), EngineError> {
        let max_attempts = self.processor.max_processing_attempts();

        if error.is_retriable() && object.processing_attempts < max_attempts {
            let decision = self
                .processor
                .determine_retry_handling(object, failed_status, &error);
            let delay = decision.delay.max(MIN_RETRY_DELAY);
            let next = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .ok_or_else(|| {
                    EngineError::Runtime(format!("retry delay out of range: {delay:?}"))
                })?;
            let pending = self.pending_for(failed_status)?;

            debug!(
                processor = self.processor.name(),
                object_id = %object.id,
                attempts = object.processing_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying object"
            );
            let written = self
                .unlock_at(object, pending, elapsed, Some(next), !decision.count_attempt, now)
                .await?;
            return Ok((Disposition::Retried, written));
        }

        let status = self
            .processor
            .determine_failure_status(object, failed_status, &error);
        if status.phase() != ProcessingPhase::Failed {
            return Err(DomainError::invalid_mapping(format!(
                "failure status {} is in phase {}, expected FAILED",
                status.code(),
                status.phase()
            ))
            .into());
        }

        warn!(
            processor = self.processor.name(),
            object_id = %object.id,
            status = status.code(),
            attempts = object.processing_attempts,
            error = %error,
            "object failed"
        );
        let written = self
            .unlock_at(object, status, elapsed, None, false, now)
            .await?;
        Ok((Disposition::Failed, written))
    }

    async fn unlock_at(
        &self,
        object: &mut ProcessableObject<Id, S>,
        new_status: S,
        duration: Duration,
        next_processed: Option<DateTime<Utc>>,
        reset_attempts: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let lease = lease_of(object)?;

        let target = new_status.phase();
        if !object.phase().can_transition_to(target) {
            return Err(DomainError::invariant(format!(
                "illegal transition {} -> {} for object {}",
                object.status.code(),
                new_status.code(),
                object.id
            ))
            .into());
        }

        let change = UnlockChange {
            status: new_status,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            last_processed: Some(now),
            next_processed: next_processed.unwrap_or(match target {
                ProcessingPhase::Pending => now,
                _ => object.next_processed,
            }),
            processed: (target == ProcessingPhase::Completed).then_some(now),
            attempts: if reset_attempts {
                0
            } else {
                object.processing_attempts
            },
        };
        self.write_unlock(object, lease, change).await
    }

    async fn write_unlock(
        &self,
        object: &mut ProcessableObject<Id, S>,
        lease: Lease,
        change: UnlockChange<S>,
    ) -> Result<bool, EngineError> {
        let request = UnlockRequest {
            id: object.id.clone(),
            lease,
            change,
        };

        if self.store.unlock(&request).await? == 0 {
            warn!(
                processor = self.processor.name(),
                object_id = %object.id,
                status = request.change.status.code(),
                "lease lost before unlock, outcome discarded"
            );
            return Ok(false);
        }

        object.apply_unlock(&request.change);
        Ok(true)
    }

    fn pending_for(&self, processing: S) -> Result<S, EngineError> {
        self.processor
            .status_mapping()
            .pending_for(processing)
            .ok_or_else(|| {
                DomainError::invalid_mapping(format!(
                    "no pending status mapped for processing status {}",
                    processing.code()
                ))
                .into()
            })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

fn lease_of<Id: ObjectKey, S: ProcessingStatus>(
    object: &ProcessableObject<Id, S>,
) -> Result<Lease, DomainError> {
    object
        .lease
        .clone()
        .ok_or_else(|| DomainError::invariant(format!("object {} holds no lease", object.id)))
}
