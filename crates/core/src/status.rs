//! Status contract and the pending → processing claim mapping.

use core::fmt::Debug;
use core::hash::Hash;

use crate::error::{DomainError, DomainResult};
use crate::phase::ProcessingPhase;

/// A concrete, domain-defined status value.
///
/// Every status declares exactly one [`ProcessingPhase`]. Statuses are persisted as
/// stable text codes, so `from_code(s.code()) == Some(s)` must hold for every value.
pub trait ProcessingStatus: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// The phase this status belongs to.
    fn phase(&self) -> ProcessingPhase;

    /// Stable storage code (e.g. `"CONVERSION_PENDING"`).
    fn code(&self) -> &'static str;

    /// Inverse of [`ProcessingStatus::code`].
    fn from_code(code: &str) -> Option<Self>;
}

/// Pending → processing mapping supplied by a domain.
///
/// Used forwards to pick the status a claim moves an object into, and inverted to
/// pick the status a stale lock reverts to. Built once and validated up front, then
/// passed by reference to whoever needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMapping<S> {
    pairs: Vec<(S, S)>,
}

impl<S: ProcessingStatus> StatusMapping<S> {
    /// Build a mapping from `(pending, processing)` pairs.
    ///
    /// Rejects empty mappings, pairs whose phases are wrong, a pending status mapped
    /// twice, and two pending statuses sharing one processing status (the inverse
    /// would be ambiguous).
    pub fn new(pairs: impl IntoIterator<Item = (S, S)>) -> DomainResult<Self> {
        let mut validated: Vec<(S, S)> = Vec::new();

        for (pending, processing) in pairs {
            if pending.phase() != ProcessingPhase::Pending {
                return Err(DomainError::invalid_mapping(format!(
                    "{} is in phase {}, expected PENDING",
                    pending.code(),
                    pending.phase()
                )));
            }
            if processing.phase() != ProcessingPhase::Processing {
                return Err(DomainError::invalid_mapping(format!(
                    "{} is in phase {}, expected PROCESSING",
                    processing.code(),
                    processing.phase()
                )));
            }
            if validated.iter().any(|(p, _)| *p == pending) {
                return Err(DomainError::invalid_mapping(format!(
                    "{} is mapped more than once",
                    pending.code()
                )));
            }
            if validated.iter().any(|(_, q)| *q == processing) {
                return Err(DomainError::invalid_mapping(format!(
                    "{} is the target of more than one pending status",
                    processing.code()
                )));
            }
            validated.push((pending, processing));
        }

        if validated.is_empty() {
            return Err(DomainError::invalid_mapping("mapping has no entries"));
        }

        Ok(Self { pairs: validated })
    }

    /// Status a claim moves `pending` into.
    pub fn processing_for(&self, pending: S) -> Option<S> {
        self.pairs.iter().find(|(p, _)| *p == pending).map(|(_, q)| *q)
    }

    /// Status a stale lease on `processing` reverts to.
    pub fn pending_for(&self, processing: S) -> Option<S> {
        self.pairs.iter().find(|(_, q)| *q == processing).map(|(p, _)| *p)
    }

    /// All claimable statuses, in declaration order.
    pub fn pending_statuses(&self) -> Vec<S> {
        self.pairs.iter().map(|(p, _)| *p).collect()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (S, S)> + '_ {
        self.pairs.iter().copied()
    }
}
