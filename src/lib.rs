//! stepchain - guarded step-chain executor
//!
//! Runs a request through an ordered chain of async steps sharing one
//! mutable context.
//!
//! # Architecture
//!
//! - Each step may carry a guard, a retry policy and compensations
//! - A failing step unwinds every compensation registered up to it
//! - A finalize step runs after every traversal and may replace the result
//! - With recovery enabled, each execution is checkpointed under an
//!   idempotency key: a successful key replays, a failed key resumes at the
//!   step that failed
//!
//! # Modules
//!
//! - `core`: Pipeline, orchestration, policies, rollback, snapshot stores
//! - `domain`: Data structures (Context, StepResult, Snapshot, ExecutionReport)
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Compute the idempotency key of a request
//! echo '{"order": 42}' | stepchain hash
//!
//! # Inspect the checkpoint stored for it
//! stepchain snapshot show <key>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::core::{
    Compensation, FieldViolation, FileSnapshotStore, Finalize, MemorySnapshotStore, Pipeline,
    PipelineError, Policy, RetryPolicy, SnapshotStore, Step, Validator,
};
pub use domain::{Context, ErrorEntry, ExecutionReport, Halt, Snapshot, StepResult};
