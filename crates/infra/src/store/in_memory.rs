use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use leasehold_core::{Lease, ObjectKey, ProcessableObject, ProcessingStatus};

use super::r#trait::{ClaimAttempt, ClaimRequest, StoreError, UnlockRequest, WorkStore};

/// In-memory work store.
///
/// Intended for tests/dev and single-process deployments. Each operation runs under
/// the map's write lock, which gives the same per-row atomicity a conditional SQL
/// `UPDATE` does.
#[derive(Debug)]
pub struct InMemoryWorkStore<Id, S> {
    objects: RwLock<HashMap<Id, ProcessableObject<Id, S>>>,
}

impl<Id, S> Default for InMemoryWorkStore<Id, S> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }
}

impl<Id: ObjectKey, S: ProcessingStatus> InMemoryWorkStore<Id, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Copy of every stored object (unordered).
    pub fn snapshot(&self) -> Result<Vec<ProcessableObject<Id, S>>, StoreError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl<Id, S> WorkStore<Id, S> for InMemoryWorkStore<Id, S>
where
    Id: ObjectKey,
    S: ProcessingStatus,
{
    async fn find_eligible(
        &self,
        pending_statuses: &[S],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessableObject<Id, S>>, StoreError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        let mut candidates: Vec<_> = objects
            .values()
            .filter(|o| {
                !o.processing_suspended
                    && o.lease.is_none()
                    && o.next_processed <= now
                    && pending_statuses.contains(&o.status)
            })
            .cloned()
            .collect();

        candidates.sort_by_key(|o| o.next_processed);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn claim(&self, request: &ClaimRequest<Id, S>) -> Result<u64, StoreError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let Some(object) = objects.get_mut(&request.id) else {
            return Ok(0);
        };

        if object.status != request.pending_status
            || object.lease.is_some()
            || object.processing_suspended
            || object.processing_attempts != request.expected_attempts
            || object.next_processed > request.now
        {
            return Ok(0);
        }

        object.apply_claim(request.processing_status, request.lease(), request.attempts());
        Ok(1)
    }

    async fn claim_next(
        &self,
        transitions: &[(S, S)],
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimAttempt<Id, S>, StoreError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let candidate = objects
            .values_mut()
            .filter(|o| !o.processing_suspended && o.lease.is_none() && o.next_processed <= now)
            .filter_map(|o| {
                let processing = transitions
                    .iter()
                    .find(|(pending, _)| *pending == o.status)
                    .map(|(_, processing)| *processing)?;
                Some((o, processing))
            })
            .min_by_key(|(o, _)| o.next_processed);

        let Some((object, processing)) = candidate else {
            return Ok(ClaimAttempt::Idle);
        };

        let attempts = object.processing_attempts.saturating_add(1);
        object.apply_claim(processing, Lease::new(owner, now), attempts);
        Ok(ClaimAttempt::Claimed(object.clone()))
    }

    async fn reset_stale_locks(
        &self,
        processing_status: S,
        pending_status: S,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let mut reset = 0;
        for object in objects.values_mut() {
            let stale = object.status == processing_status
                && object.lease.as_ref().is_some_and(|l| l.is_stale(cutoff));
            if stale {
                object.apply_reset(pending_status);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn unlock(&self, request: &UnlockRequest<Id, S>) -> Result<u64, StoreError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let Some(object) = objects.get_mut(&request.id) else {
            return Ok(0);
        };

        if object.lease.as_ref() != Some(&request.lease) {
            return Ok(0);
        }

        object.apply_unlock(&request.change);
        Ok(1)
    }

    async fn insert(&self, object: ProcessableObject<Id, S>) -> Result<(), StoreError> {
        object.check_invariants()?;

        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        if objects.contains_key(&object.id) {
            return Err(StoreError::AlreadyExists(object.id.to_string()));
        }
        objects.insert(object.id.clone(), object);
        Ok(())
    }

    async fn get(&self, id: &Id) -> Result<Option<ProcessableObject<Id, S>>, StoreError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(id).cloned())
    }

    async fn set_suspended(&self, id: &Id, suspended: bool) -> Result<u64, StoreError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        match objects.get_mut(id) {
            Some(object) => {
                object.processing_suspended = suspended;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}
