//! Infrastructure errors surfaced by the pipeline.
//!
//! Step failures, faults and validation rejections are not errors at this
//! level: they come back as a [`crate::domain::StepResult`]. These variants
//! cover what prevents the pipeline from producing a result at all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline '{pipeline}' has no steps")]
    EmptyChain { pipeline: String },

    #[error("Step id '{step_id}' is used more than once in pipeline '{pipeline}'")]
    DuplicateStep { pipeline: String, step_id: String },

    #[error("Failed to hash request: {0}")]
    RequestHash(#[from] serde_json::Error),

    #[error("Snapshot store failed to {operation} key '{key}': {source}")]
    Snapshot {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl PipelineError {
    pub(crate) fn snapshot(operation: &'static str, key: &str, error: anyhow::Error) -> Self {
        Self::Snapshot {
            operation,
            key: key.to_string(),
            source: error.into(),
        }
    }
}
