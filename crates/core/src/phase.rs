//! The four processing phases every concrete status belongs to.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a processable object.
///
/// Concrete status names are domain-specific; the phase is what the engine reasons
/// about. The only legal edges are:
///
/// ```text
/// PENDING ──claim──▶ PROCESSING ──▶ COMPLETED
///                        │    └────▶ FAILED
///                        └─────────▶ PENDING (retry / stale lock reset)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPhase {
    /// Waiting to be claimed once `next_processed` has passed.
    Pending,
    /// Claimed by a worker holding a lease.
    Processing,
    /// Finished successfully (terminal).
    Completed,
    /// Finished unsuccessfully (terminal).
    Failed,
}

impl ProcessingPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingPhase::Completed | ProcessingPhase::Failed)
    }

    /// Whether moving from `self` to `next` is an edge of the state machine.
    pub fn can_transition_to(self, next: ProcessingPhase) -> bool {
        use ProcessingPhase::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Processing, Pending)
        )
    }
}

impl core::fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ProcessingPhase::Pending => "PENDING",
            ProcessingPhase::Processing => "PROCESSING",
            ProcessingPhase::Completed => "COMPLETED",
            ProcessingPhase::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
