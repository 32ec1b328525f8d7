//! Core execution logic.
//!
//! This module contains:
//! - Step contracts: Step, Finalize, Compensation, Validator
//! - Policy: retry policies attached to steps
//! - Rollback: the compensation registry
//! - Orchestrator: chain traversal
//! - SnapshotStore: resumable checkpoints keyed by idempotency key
//! - Pipeline: the builder and the `execute` entry point

pub mod error;
mod orchestrator;
pub mod pipeline;
pub mod policy;
mod rollback;
pub mod snapshot_store;
pub mod step;

// Re-export commonly used types
pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineBuilder, RollbackStage, StepStage};
pub use policy::{Policy, ResultPredicate, RetryPolicy, StepPolicy};
pub use snapshot_store::{
    key_digest, request_hash, FileSnapshotStore, MemorySnapshotStore, SnapshotStore,
};
pub use step::{always, Compensation, FieldViolation, Finalize, Guard, Step, Validator};
