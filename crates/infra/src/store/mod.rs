//! Persistent work store boundary.
//!
//! The store row is the only shared mutable resource between workers (and between
//! processes in a fleet). Every mutation goes through one of the atomic operations of
//! [`WorkStore`]; no other locking is used.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryWorkStore;
pub use postgres::PostgresWorkStore;
pub use r#trait::{ClaimAttempt, ClaimRequest, StoreError, UnlockRequest, WorkStore};
