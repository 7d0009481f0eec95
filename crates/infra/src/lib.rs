//! Infrastructure layer: work stores, the processing engine and its worker pool.

pub mod clock;
pub mod config;
pub mod processing;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackgroundProcessorConfig, ConfigError};
pub use processing::{
    BackgroundProcessor, BackoffStrategy, ClaimAttempt, Disposition, Engine, EngineError,
    ManagedProcessor, ObjectProcessor, ProcessingReport, ProcessorRegistry, ProcessorStats,
    RetryPolicy,
};
pub use store::{
    ClaimRequest, InMemoryWorkStore, PostgresWorkStore, StoreError, UnlockRequest, WorkStore,
};

#[cfg(test)]
pub(crate) mod test_support;
