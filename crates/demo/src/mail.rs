//! Outbound mail: queued messages are handed to a (simulated) SMTP relay.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use leasehold_core::{
    DomainResult, ObjectId, ProcessOutcome, ProcessableObject, ProcessingError, ProcessingPhase,
    ProcessingStatus, StatusMapping,
};
use leasehold_infra::{ObjectProcessor, RetryPolicy};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MailStatus {
    Queued,
    Sending,
    Sent,
    Bounced,
}

impl ProcessingStatus for MailStatus {
    fn phase(&self) -> ProcessingPhase {
        match self {
            MailStatus::Queued => ProcessingPhase::Pending,
            MailStatus::Sending => ProcessingPhase::Processing,
            MailStatus::Sent => ProcessingPhase::Completed,
            MailStatus::Bounced => ProcessingPhase::Failed,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            MailStatus::Queued => "QUEUED",
            MailStatus::Sending => "SENDING",
            MailStatus::Sent => "SENT",
            MailStatus::Bounced => "BOUNCED",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "QUEUED" => Some(MailStatus::Queued),
            "SENDING" => Some(MailStatus::Sending),
            "SENT" => Some(MailStatus::Sent),
            "BOUNCED" => Some(MailStatus::Bounced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub to: String,
    pub subject: String,
}

/// Sends queued messages.
///
/// The relay is simulated: recipients at a `flaky.*` domain get a temporary
/// rejection on their first attempt, addresses without `@` bounce.
pub struct Outbox {
    mapping: StatusMapping<MailStatus>,
    messages: RwLock<HashMap<ObjectId, Message>>,
}

impl Outbox {
    pub fn new() -> DomainResult<Self> {
        Ok(Self {
            mapping: StatusMapping::new([(MailStatus::Queued, MailStatus::Sending)])?,
            messages: RwLock::new(HashMap::new()),
        })
    }

    /// Store the payload for `id`. The processable object itself lives in the work store.
    pub fn enqueue(&self, id: ObjectId, message: Message) {
        self.messages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, message);
    }

    fn message(&self, id: &ObjectId) -> Option<Message> {
        self.messages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

#[async_trait]
impl ObjectProcessor<ObjectId, MailStatus> for Outbox {
    fn name(&self) -> &str {
        "outbox"
    }

    fn status_mapping(&self) -> &StatusMapping<MailStatus> {
        &self.mapping
    }

    async fn process(
        &self,
        object: &ProcessableObject<ObjectId, MailStatus>,
    ) -> Result<ProcessOutcome<MailStatus>, ProcessingError> {
        let message = self
            .message(&object.id)
            .ok_or_else(|| ProcessingError::fatal(format!("no message stored for {}", object.id)))?;

        let Some((_, domain)) = message.to.split_once('@') else {
            return Err(ProcessingError::fatal(format!("invalid recipient '{}'", message.to)));
        };

        tokio::time::sleep(Duration::from_millis(20)).await;

        if domain.starts_with("flaky.") && object.processing_attempts < 2 {
            return Err(ProcessingError::retriable("421 service not available, try later"));
        }

        info!(
            object_id = %object.id,
            to = %message.to,
            subject = %message.subject,
            attempts = object.processing_attempts,
            "mail sent"
        );
        Ok(ProcessOutcome::to_status(MailStatus::Sent))
    }

    fn determine_failure_status(
        &self,
        _object: &ProcessableObject<ObjectId, MailStatus>,
        _failed_status: MailStatus,
        _error: &ProcessingError,
    ) -> MailStatus {
        MailStatus::Bounced
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(4, Duration::from_millis(200), Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use leasehold_infra::{Disposition, Engine, InMemoryWorkStore, ManualClock, WorkStore};
    use std::sync::Arc;

    fn outbox_with(to: &str) -> (Arc<Outbox>, ObjectId) {
        let outbox = Arc::new(Outbox::new().unwrap());
        let id = ObjectId::new();
        outbox.enqueue(
            id,
            Message {
                to: to.to_string(),
                subject: "hello".to_string(),
            },
        );
        (outbox, id)
    }

    #[tokio::test]
    async fn flaky_relay_succeeds_on_second_attempt() {
        let t0 = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let store = InMemoryWorkStore::arc();
        let (outbox, id) = outbox_with("ops@flaky.example.org");
        store
            .insert(ProcessableObject::new(id, MailStatus::Queued, t0))
            .await
            .unwrap();

        let engine = Engine::new(outbox, store.clone(), "test").with_clock(clock.clone());

        let first = engine.process_next().await.unwrap().unwrap();
        assert_eq!(first.disposition, Disposition::Retried);
        assert!(first.object.next_processed > t0);

        clock.advance(chrono::Duration::seconds(5));
        let second = engine.process_next().await.unwrap().unwrap();
        assert_eq!(second.disposition, Disposition::Completed);
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, MailStatus::Sent);
    }

    #[tokio::test]
    async fn malformed_address_bounces() {
        let store = InMemoryWorkStore::arc();
        let (outbox, id) = outbox_with("nobody");
        store
            .insert(ProcessableObject::new(id, MailStatus::Queued, Utc::now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let engine = Engine::new(outbox, store.clone(), "test");
        let report = engine.process_next().await.unwrap().unwrap();
        assert_eq!(report.disposition, Disposition::Failed);
        assert_eq!(report.object.status, MailStatus::Bounced);
        assert_eq!(report.object.processing_attempts, 1);
    }
}
