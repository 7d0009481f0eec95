//! Two-step image pipeline: resize, then publish.
//!
//! Each step is its own pending → processing pair, so a resized image goes back to
//! the pool and may be published by a different worker (or process).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use leasehold_core::{
    DomainResult, ObjectId, ProcessOutcome, ProcessableObject, ProcessingError, ProcessingPhase,
    ProcessingStatus, StatusMapping,
};
use leasehold_infra::{ObjectProcessor, RetryPolicy};

const MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageStatus {
    Uploaded,
    Resizing,
    Resized,
    Publishing,
    Published,
    Broken,
}

impl ProcessingStatus for ImageStatus {
    fn phase(&self) -> ProcessingPhase {
        match self {
            ImageStatus::Uploaded | ImageStatus::Resized => ProcessingPhase::Pending,
            ImageStatus::Resizing | ImageStatus::Publishing => ProcessingPhase::Processing,
            ImageStatus::Published => ProcessingPhase::Completed,
            ImageStatus::Broken => ProcessingPhase::Failed,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ImageStatus::Uploaded => "UPLOADED",
            ImageStatus::Resizing => "RESIZING",
            ImageStatus::Resized => "RESIZED",
            ImageStatus::Publishing => "PUBLISHING",
            ImageStatus::Published => "PUBLISHED",
            ImageStatus::Broken => "BROKEN",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "UPLOADED" => Some(ImageStatus::Uploaded),
            "RESIZING" => Some(ImageStatus::Resizing),
            "RESIZED" => Some(ImageStatus::Resized),
            "PUBLISHING" => Some(ImageStatus::Publishing),
            "PUBLISHED" => Some(ImageStatus::Published),
            "BROKEN" => Some(ImageStatus::Broken),
            _ => None,
        }
    }
}

pub struct Thumbnailer {
    mapping: StatusMapping<ImageStatus>,
    uploads: RwLock<HashMap<ObjectId, u64>>,
}

impl Thumbnailer {
    pub fn new() -> DomainResult<Self> {
        Ok(Self {
            mapping: StatusMapping::new([
                (ImageStatus::Uploaded, ImageStatus::Resizing),
                (ImageStatus::Resized, ImageStatus::Publishing),
            ])?,
            uploads: RwLock::new(HashMap::new()),
        })
    }

    /// Record the size of an uploaded image.
    pub fn upload(&self, id: ObjectId, bytes: u64) {
        self.uploads
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, bytes);
    }

    fn size_of(&self, id: &ObjectId) -> Option<u64> {
        self.uploads
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }
}

#[async_trait]
impl ObjectProcessor<ObjectId, ImageStatus> for Thumbnailer {
    fn name(&self) -> &str {
        "thumbnails"
    }

    fn status_mapping(&self) -> &StatusMapping<ImageStatus> {
        &self.mapping
    }

    async fn process(
        &self,
        object: &ProcessableObject<ObjectId, ImageStatus>,
    ) -> Result<ProcessOutcome<ImageStatus>, ProcessingError> {
        match object.status {
            ImageStatus::Resizing => {
                let bytes = self
                    .size_of(&object.id)
                    .ok_or_else(|| ProcessingError::fatal("upload missing"))?;
                if bytes == 0 || bytes > MAX_UPLOAD_BYTES {
                    return Err(ProcessingError::fatal(format!("unsupported upload size {bytes}")));
                }

                // Roughly proportional to the image size.
                tokio::time::sleep(Duration::from_millis(5 + bytes / (256 * 1024))).await;
                debug!(object_id = %object.id, bytes, "resized");

                // The publish step gets its own attempt budget.
                Ok(ProcessOutcome::to_status(ImageStatus::Resized).with_reset_attempts())
            }
            ImageStatus::Publishing => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                debug!(object_id = %object.id, "published");
                Ok(ProcessOutcome::to_status(ImageStatus::Published))
            }
            other => Err(ProcessingError::fatal(format!(
                "not a processing status: {}",
                other.code()
            ))),
        }
    }

    fn determine_failure_status(
        &self,
        _object: &ProcessableObject<ObjectId, ImageStatus>,
        _failed_status: ImageStatus,
        _error: &ProcessingError,
    ) -> ImageStatus {
        ImageStatus::Broken
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(3, Duration::from_millis(100), Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use leasehold_infra::{Disposition, Engine, InMemoryWorkStore, WorkStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn resize_then_publish() {
        let thumbnailer = Arc::new(Thumbnailer::new().unwrap());
        let id = ObjectId::new();
        thumbnailer.upload(id, 512 * 1024);

        let store = InMemoryWorkStore::arc();
        store
            .insert(ProcessableObject::new(
                id,
                ImageStatus::Uploaded,
                Utc::now() - ChronoDuration::seconds(1),
            ))
            .await
            .unwrap();
        let engine = Engine::new(thumbnailer, store.clone(), "test");

        let resized = engine.process_next().await.unwrap().unwrap();
        assert_eq!(resized.disposition, Disposition::Rescheduled);
        assert_eq!(resized.object.status, ImageStatus::Resized);
        assert_eq!(resized.object.processing_attempts, 0);

        let published = engine.process_next().await.unwrap().unwrap();
        assert_eq!(published.disposition, Disposition::Completed);
        assert_eq!(published.object.processing_attempts, 1);
        assert!(published.object.processed.is_some());
        assert!(published.object.processing_time_ms >= 10);

        assert!(engine.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_upload_is_broken() {
        let thumbnailer = Arc::new(Thumbnailer::new().unwrap());
        let id = ObjectId::new();
        thumbnailer.upload(id, 0);

        let store = InMemoryWorkStore::arc();
        store
            .insert(ProcessableObject::new(
                id,
                ImageStatus::Uploaded,
                Utc::now() - ChronoDuration::seconds(1),
            ))
            .await
            .unwrap();
        let engine = Engine::new(thumbnailer, store.clone(), "test");

        let report = engine.process_next().await.unwrap().unwrap();
        assert_eq!(report.disposition, Disposition::Failed);
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, ImageStatus::Broken);
    }
}
