use async_trait::async_trait;

use leasehold_core::{
    ObjectKey, ProcessOutcome, ProcessableObject, ProcessingError, ProcessingStatus,
    RetryDecision, StatusMapping,
};

use super::retry::RetryPolicy;

/// Domain logic for one kind of processable object.
///
/// The engine owns claiming, unlocking and error conversion; an implementation only
/// says which statuses it works on and what to do with a claimed object.
///
/// ## Contract for `process`
///
/// - Called with an object the engine has just claimed (status in the PROCESSING
///   phase, lease held by this instance).
/// - `Ok(outcome)` must carry a status in the COMPLETED, PENDING or FAILED phase. A
///   PROCESSING-phase status is treated as a fatal error.
/// - `Err(ProcessingError::Retriable(_))` is retried with backoff until
///   `max_processing_attempts` is reached; `Err(ProcessingError::Fatal(_))` is routed
///   straight to `determine_failure_status`.
#[async_trait]
pub trait ObjectProcessor<Id, S>: Send + Sync + 'static
where
    Id: ObjectKey,
    S: ProcessingStatus,
{
    /// Stable name, used for logs, stats and the default lock owner.
    fn name(&self) -> &str;

    /// Pending → processing pairs this processor claims.
    fn status_mapping(&self) -> &StatusMapping<S>;

    async fn process(
        &self,
        object: &ProcessableObject<Id, S>,
    ) -> Result<ProcessOutcome<S>, ProcessingError>;

    /// FAILED-phase status for a fatal error or for exhausted attempts.
    ///
    /// `failed_status` is the PROCESSING-phase status the object was in.
    fn determine_failure_status(
        &self,
        object: &ProcessableObject<Id, S>,
        failed_status: S,
        error: &ProcessingError,
    ) -> S;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    fn max_processing_attempts(&self) -> u32 {
        self.retry_policy().max_attempts
    }

    /// Statuses the claimer searches. Defaults to every pending status of the mapping.
    fn pending_statuses(&self) -> Vec<S> {
        self.status_mapping().pending_statuses()
    }

    /// Backoff for a retriable failure.
    fn determine_retry_handling(
        &self,
        object: &ProcessableObject<Id, S>,
        _failed_status: S,
        _error: &ProcessingError,
    ) -> RetryDecision {
        RetryDecision::after(
            self.retry_policy()
                .delay_for_attempt(object.processing_attempts),
        )
    }
}
