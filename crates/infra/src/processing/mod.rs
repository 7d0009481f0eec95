//! Claim/process/unlock engine and the worker pool around it.
//!
//! ## Components
//!
//! - `ObjectProcessor`: domain logic for one kind of object (statuses, work, failure mapping)
//! - `Engine`: the generic cycle over a `WorkStore`
//! - `BackgroundProcessor`: feeder, workers and stale-lock sweeper for one engine
//! - `ProcessorRegistry`: named processors started and stopped together
//! - `RetryPolicy`: backoff for retriable failures

pub mod background;
pub mod engine;
pub mod processor;
pub mod registry;
pub mod retry;

pub use background::{BackgroundProcessor, ManagedProcessor, ProcessorStats};
pub use engine::{ClaimAttempt, Disposition, Engine, EngineError, ProcessingReport};
pub use processor::ObjectProcessor;
pub use registry::ProcessorRegistry;
pub use retry::{BackoffStrategy, RetryPolicy};
