//! Domain types for the stepchain executor.
//!
//! This module contains the core data structures:
//! - Context: Per-execution mutable state
//! - StepResult: Result envelope returned by steps and executions
//! - Snapshot: Resumable checkpoint
//! - ExecutionReport: Trace of a single execution

pub mod context;
pub mod report;
pub mod result;
pub mod snapshot;

// Re-export commonly used types
pub use context::Context;
pub use report::{CompensationFault, ExecutionReport, Halt, StepRecord, StepStatus};
pub use result::{
    ErrorEntry, StepResult, STATUS_BAD_REQUEST, STATUS_CANCELLED, STATUS_INTERNAL_ERROR,
};
pub use snapshot::Snapshot;
