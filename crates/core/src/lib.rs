//! `leasehold-core` — the processable-object model.
//!
//! This crate contains **pure model** primitives (no storage or runtime concerns):
//! identifiers, the phase/status contract, the persisted work-item record and the
//! outcome types a domain processor hands back to the engine.

pub mod error;
pub mod id;
pub mod object;
pub mod outcome;
pub mod phase;
pub mod status;

pub use error::{DomainError, DomainResult, ProcessingError};
pub use id::{ObjectId, ObjectKey};
pub use object::{Lease, ProcessableObject, UnlockChange};
pub use outcome::{ProcessOutcome, RetryDecision};
pub use phase::ProcessingPhase;
pub use status::{ProcessingStatus, StatusMapping};
