//! Shared fixtures for unit tests: a small document-conversion status taxonomy.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leasehold_core::{
    ProcessOutcome, ProcessableObject, ProcessingError, ProcessingPhase, ProcessingStatus,
    RetryDecision, StatusMapping,
};

use crate::processing::{ObjectProcessor, RetryPolicy};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DocStatus {
    Queued,
    Converting,
    Converted,
    Rejected,
}

impl ProcessingStatus for DocStatus {
    fn phase(&self) -> ProcessingPhase {
        match self {
            DocStatus::Queued => ProcessingPhase::Pending,
            DocStatus::Converting => ProcessingPhase::Processing,
            DocStatus::Converted => ProcessingPhase::Completed,
            DocStatus::Rejected => ProcessingPhase::Failed,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            DocStatus::Queued => "QUEUED",
            DocStatus::Converting => "CONVERTING",
            DocStatus::Converted => "CONVERTED",
            DocStatus::Rejected => "REJECTED",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "QUEUED" => Some(DocStatus::Queued),
            "CONVERTING" => Some(DocStatus::Converting),
            "CONVERTED" => Some(DocStatus::Converted),
            "REJECTED" => Some(DocStatus::Rejected),
            _ => None,
        }
    }
}

pub fn doc_mapping() -> StatusMapping<DocStatus> {
    StatusMapping::new([(DocStatus::Queued, DocStatus::Converting)])
        .expect("static mapping is valid")
}

/// Fixed reference instant (T0) used across tests.
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn queued(id: u64, at: DateTime<Utc>) -> ProcessableObject<u64, DocStatus> {
    ProcessableObject::new(id, DocStatus::Queued, at)
}

pub type DocResult = Result<ProcessOutcome<DocStatus>, ProcessingError>;

/// Processor that replays a fixed script of results, then completes everything.
pub struct ScriptedProcessor {
    mapping: StatusMapping<DocStatus>,
    policy: RetryPolicy,
    failure_status: DocStatus,
    script: Mutex<VecDeque<DocResult>>,
    calls: AtomicUsize,
    panics: bool,
    uncounted_retries: bool,
}

impl ScriptedProcessor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            mapping: doc_mapping(),
            policy,
            failure_status: DocStatus::Rejected,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            panics: false,
            uncounted_retries: false,
        }
    }

    pub fn then(self, result: DocResult) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn with_failure_status(mut self, status: DocStatus) -> Self {
        self.failure_status = status;
        self
    }

    /// Panic inside `process` on every call.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Retriable failures do not consume the attempt budget.
    pub fn with_uncounted_retries(mut self) -> Self {
        self.uncounted_retries = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectProcessor<u64, DocStatus> for ScriptedProcessor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn status_mapping(&self) -> &StatusMapping<DocStatus> {
        &self.mapping
    }

    async fn process(
        &self,
        _object: &ProcessableObject<u64, DocStatus>,
    ) -> Result<ProcessOutcome<DocStatus>, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("converter crashed");
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(ProcessOutcome::to_status(DocStatus::Converted)))
    }

    fn determine_failure_status(
        &self,
        _object: &ProcessableObject<u64, DocStatus>,
        _failed_status: DocStatus,
        _error: &ProcessingError,
    ) -> DocStatus {
        self.failure_status
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone()
    }

    fn determine_retry_handling(
        &self,
        object: &ProcessableObject<u64, DocStatus>,
        _failed_status: DocStatus,
        _error: &ProcessingError,
    ) -> RetryDecision {
        let delay = self.policy.delay_for_attempt(object.processing_attempts);
        if self.uncounted_retries {
            RetryDecision::uncounted(delay)
        } else {
            RetryDecision::after(delay)
        }
    }
}
