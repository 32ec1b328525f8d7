//! Contracts for the units a pipeline is assembled from.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{Context, ErrorEntry, StepResult};

use super::policy::StepPolicy;

/// Guard deciding whether a node runs: `(context, request) -> bool`
pub type Guard<R, S> = Arc<dyn Fn(&Context<R, S>, &R) -> bool + Send + Sync>;

/// Guard that always passes
pub fn always<R: 'static, S: 'static>() -> Guard<R, S> {
    Arc::new(|_: &Context<R, S>, _: &R| true)
}

/// One unit of chain logic.
///
/// Returning `Ok` with a failed [`StepResult`] is a regular step failure and
/// may trigger rollback. Returning `Err` is a fault: it is retried only by an
/// attached fault policy and otherwise ends the traversal with an internal
/// error result.
#[async_trait]
pub trait Step<R, S>: Send + Sync {
    /// Identifier, unique within a pipeline
    fn id(&self) -> &str;

    /// Run the step against the execution context
    async fn execute(&self, ctx: &mut Context<R, S>) -> Result<StepResult>;
}

/// The guaranteed-run step of a pipeline.
///
/// `Ok(Some(result))` replaces the result computed by the chain.
#[async_trait]
pub trait Finalize<R, S>: Send + Sync {
    async fn finalize(&self, ctx: &mut Context<R, S>) -> Result<Option<StepResult>>;
}

/// Compensating action registered with `rollback`
#[async_trait]
pub trait Compensation<R>: Send + Sync {
    fn id(&self) -> &str;

    /// Undo effects for the given request. Best effort: errors are recorded,
    /// never propagated.
    async fn compensate(&self, request: &R) -> Result<()>;
}

/// A field-level rule violation reported by a [`Validator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn into_error(self) -> ErrorEntry {
        ErrorEntry::new(self.message).with_field(self.field)
    }
}

/// Pre-chain request validation; an empty list means the request is valid
pub trait Validator<R>: Send + Sync {
    fn validate(&self, request: &R) -> Vec<FieldViolation>;
}

impl<R, F> Validator<R> for F
where
    F: Fn(&R) -> Vec<FieldViolation> + Send + Sync,
{
    fn validate(&self, request: &R) -> Vec<FieldViolation> {
        self(request)
    }
}

/// A step placed in the chain, with its guard, policy and rollback link.
///
/// Nodes live in an arena; the next node is the following index.
pub(crate) struct StepNode<R, S> {
    pub step: Box<dyn Step<R, S>>,
    pub guard: Guard<R, S>,
    pub policy: Option<StepPolicy>,
    pub rollback_index: Option<usize>,
}

impl<R: 'static, S: 'static> StepNode<R, S> {
    pub fn new(step: Box<dyn Step<R, S>>) -> Self {
        Self {
            step,
            guard: always(),
            policy: None,
            rollback_index: None,
        }
    }

    pub fn id(&self) -> &str {
        self.step.id()
    }

    pub fn passes(&self, ctx: &Context<R, S>) -> bool {
        (self.guard)(ctx, &ctx.request)
    }
}
