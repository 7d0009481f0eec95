//! Model error types.

use thiserror::Error;

/// Result type used across the model layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Model-level error.
///
/// Deterministic failures only: a record or mapping that breaks one of the
/// processable-object invariants. Storage and runtime failures live in infra.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A processable-object invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status mapping was inconsistent with the declared phases.
    #[error("invalid status mapping: {0}")]
    InvalidMapping(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_mapping(msg: impl Into<String>) -> Self {
        Self::InvalidMapping(msg.into())
    }
}

/// Failure signalled by a domain processor while executing one object.
///
/// The engine never propagates this to the worker loop: a retriable error turns into
/// a rescheduled PENDING status, a fatal one into a terminal FAILED status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// Transient failure (I/O, timeouts, a peer being down). Eligible for retry.
    #[error("retriable processing failure: {0}")]
    Retriable(String),

    /// Permanent failure (validation, corrupt input). Never retried.
    #[error("fatal processing failure: {0}")]
    Fatal(String),
}

impl ProcessingError {
    pub fn retriable(msg: impl Into<String>) -> Self {
        Self::Retriable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, ProcessingError::Retriable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProcessingError::Retriable(msg) | ProcessingError::Fatal(msg) => msg,
        }
    }
}
