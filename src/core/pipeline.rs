//! Pipeline composition and the `execute` entry point.
//!
//! A pipeline is assembled with [`PipelineBuilder`]. Adding a step returns a
//! [`StepStage`] scoped to that step, so `when`, `with_policy` and
//! `rollback` always attach to the step just added; `rollback` in turn
//! returns a [`RollbackStage`] whose `when` rebinds that entry's guard.
//!
//! ```rust,ignore
//! let pipeline = Pipeline::builder("checkout")
//!     .validator(validate_order)
//!     .step(ReserveStock)
//!     .rollback(ReleaseStock)
//!     .step(ChargeCard)
//!     .when(|_, order: &Order| order.total > 0)
//!     .with_policy(RetryPolicy::default())
//!     .step(SendReceipt)
//!     .finalize(WrapResponse)
//!     .recover_by_hash(store)
//!     .build()?;
//!
//! let result = pipeline.execute_with_key(order, "order-42").await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Span};
use uuid::Uuid;

use crate::domain::{
    Context, ExecutionReport, Halt, Snapshot, StepResult, STATUS_BAD_REQUEST,
};

use super::error::PipelineError;
use super::orchestrator::Orchestrator;
use super::policy::{Policy, StepPolicy};
use super::rollback::RollbackRegistry;
use super::snapshot_store::{request_hash, SnapshotStore};
use super::step::{Compensation, FieldViolation, Finalize, Step, StepNode, Validator};

/// A built, immutable step chain.
///
/// `Pipeline` holds no per-execution state, so one instance can serve
/// concurrent callers behind an `Arc`.
pub struct Pipeline<R, S> {
    name: String,
    nodes: Vec<StepNode<R, S>>,
    rollbacks: RollbackRegistry<R, S>,
    finalize: Option<FinalizeNode<R, S>>,
    validator: Option<Box<dyn Validator<R>>>,
    recovery: Option<Recovery<R, S>>,
}

/// The finalize step with its optional fault policy
struct FinalizeNode<R, S> {
    step: Box<dyn Finalize<R, S>>,
    policy: Option<Arc<dyn Policy>>,
}

struct Recovery<R, S> {
    store: Arc<dyn SnapshotStore<R, S>>,
    locks: KeyedLocks,
}

impl<R, S> Pipeline<R, S>
where
    R: Serialize + Send + Sync + 'static,
    S: Default + Send + Sync + 'static,
{
    /// Start building a pipeline
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<R, S> {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step ids in chain order
    pub fn step_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id()).collect()
    }

    /// Number of registered rollback entries
    pub fn rollback_count(&self) -> usize {
        self.rollbacks.len()
    }

    /// Whether snapshot-based resume is enabled
    pub fn recovery_enabled(&self) -> bool {
        self.recovery.is_some()
    }

    /// Execute with an idempotency key derived from the request
    pub async fn execute(&self, request: R) -> Result<StepResult, PipelineError> {
        self.execute_with_report(request, None, &CancellationToken::new())
            .await
            .map(|(result, _)| result)
    }

    /// Execute under a caller-supplied idempotency key.
    ///
    /// An empty key falls back to the request hash.
    pub async fn execute_with_key(
        &self,
        request: R,
        idempotency_key: &str,
    ) -> Result<StepResult, PipelineError> {
        self.execute_with_report(request, Some(idempotency_key), &CancellationToken::new())
            .await
            .map(|(result, _)| result)
    }

    /// Execute, stopping at the next node boundary or retry delay once
    /// `cancel` fires
    pub async fn execute_cancellable(
        &self,
        request: R,
        idempotency_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, PipelineError> {
        self.execute_with_report(request, idempotency_key, cancel)
            .await
            .map(|(result, _)| result)
    }

    /// Execute and return the trace alongside the result
    #[instrument(
        skip(self, request, idempotency_key, cancel),
        fields(
            pipeline = %self.name,
            execution_id = tracing::field::Empty,
            key = tracing::field::Empty
        )
    )]
    pub async fn execute_with_report(
        &self,
        request: R,
        idempotency_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(StepResult, ExecutionReport), PipelineError> {
        let mut report = ExecutionReport::new(Uuid::new_v4());
        Span::current().record("execution_id", tracing::field::display(report.execution_id));

        if let Some(validator) = &self.validator {
            let violations = validator.validate(&request);
            if !violations.is_empty() {
                info!(violations = violations.len(), "Request rejected by validator");
                report.halt = Halt::Rejected {
                    violations: violations.len(),
                };
                report.completed_at = Some(chrono::Utc::now());

                let errors = violations
                    .into_iter()
                    .map(FieldViolation::into_error)
                    .collect();
                return Ok((StepResult::with_errors(STATUS_BAD_REQUEST, errors), report));
            }
        }

        let key = match idempotency_key {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => request_hash(&request)?,
        };
        Span::current().record("key", key.as_str());
        report.idempotency_key = Some(key.clone());

        let Some(recovery) = &self.recovery else {
            info!("Starting execution");
            let (result, _ctx) = self
                .run_chain(Context::new(request), None, cancel, &mut report)
                .await;
            return Ok((result, report));
        };

        // Identical requests in this process run one at a time
        let _key_guard = recovery.locks.acquire(&key).await;

        let snapshot = recovery
            .store
            .get(&key)
            .await
            .map_err(|e| PipelineError::snapshot("read", &key, e))?;

        let (ctx, resume_from) = match snapshot {
            Some(snapshot) if snapshot.success => {
                info!("Replaying successful execution from snapshot");
                report.halt = Halt::Replayed;
                report.last_step_id = snapshot.last_step_id.clone();
                report.completed_at = Some(chrono::Utc::now());
                return Ok((snapshot.replay_response(), report));
            }
            Some(snapshot) => {
                info!(resume_from = ?snapshot.last_step_id, "Resuming failed execution");
                (snapshot.context.rebind(request), snapshot.last_step_id)
            }
            None => {
                info!("Starting execution");
                (Context::new(request), None)
            }
        };
        report.resumed_from = resume_from.clone();

        let (result, ctx) = self
            .run_chain(ctx, resume_from.as_deref(), cancel, &mut report)
            .await;

        let snapshot = Snapshot::new(result.is_success(), ctx.current_step_id.clone(), ctx);
        recovery
            .store
            .set(&key, snapshot)
            .await
            .map_err(|e| PipelineError::snapshot("write", &key, e))?;

        Ok((result, report))
    }

    /// Orchestrate the chain, then run the finalize step
    async fn run_chain(
        &self,
        mut ctx: Context<R, S>,
        resume_from: Option<&str>,
        cancel: &CancellationToken,
        report: &mut ExecutionReport,
    ) -> (StepResult, Context<R, S>) {
        let traversal = Orchestrator::new(&self.nodes, &self.rollbacks)
            .traverse(&mut ctx, resume_from, cancel)
            .await;

        let mut result = traversal
            .result
            .or_else(|| ctx.response.clone())
            .unwrap_or_else(StepResult::empty);

        if let Some(finalize) = &self.finalize {
            ctx.response = Some(result.clone());
            match finalize.run(&mut ctx, cancel).await {
                Ok(Some(replacement)) => result = replacement,
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Finalize step failed");
                    result = StepResult::internal_error(
                        "finalize_fault",
                        format!("Finalize step failed: {:#}", e),
                    );
                }
            }
            report.finalized = true;
        }
        ctx.response = Some(result.clone());

        if traversal.halt.is_completed() {
            info!(
                success = result.success,
                status = result.status_code,
                last_step = ?ctx.current_step_id,
                "Execution finished"
            );
        } else {
            warn!(
                halt = ?traversal.halt,
                status = result.status_code,
                last_step = ?ctx.current_step_id,
                "Execution halted"
            );
        }

        report.halt = traversal.halt;
        report.steps = traversal.steps;
        report.compensations = traversal.compensations;
        report.compensation_faults = traversal.compensation_faults;
        report.last_step_id = ctx.current_step_id.clone();
        report.completed_at = Some(chrono::Utc::now());

        (result, ctx)
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder<R, S> {
    name: String,
    nodes: Vec<StepNode<R, S>>,
    rollbacks: RollbackRegistry<R, S>,
    finalize: Option<FinalizeNode<R, S>>,
    validator: Option<Box<dyn Validator<R>>>,
    store: Option<Arc<dyn SnapshotStore<R, S>>>,
}

impl<R, S> PipelineBuilder<R, S>
where
    R: Serialize + Send + Sync + 'static,
    S: Default + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            rollbacks: RollbackRegistry::new(),
            finalize: None,
            validator: None,
            store: None,
        }
    }

    /// Append a step to the end of the chain.
    ///
    /// The step inherits the latest rollback index registered so far, so its
    /// failure unwinds every compensation registered before it.
    pub fn step(mut self, step: impl Step<R, S> + 'static) -> StepStage<R, S> {
        let mut node = StepNode::new(Box::new(step));
        node.rollback_index = self.rollbacks.last_index();
        self.nodes.push(node);
        StepStage {
            index: self.nodes.len() - 1,
            builder: self,
        }
    }

    /// Set the step that runs after every traversal (replaces any previous one)
    pub fn finalize(mut self, finalize: impl Finalize<R, S> + 'static) -> Self {
        self.finalize = Some(FinalizeNode {
            step: Box::new(finalize),
            policy: None,
        });
        self
    }

    /// Set the finalize step, retrying it when it returns an error
    pub fn finalize_with_policy(
        mut self,
        finalize: impl Finalize<R, S> + 'static,
        policy: impl Policy + 'static,
    ) -> Self {
        self.finalize = Some(FinalizeNode {
            step: Box::new(finalize),
            policy: Some(Arc::new(policy)),
        });
        self
    }

    /// Set the pre-chain validator (replaces any previous one)
    pub fn validator(mut self, validator: impl Validator<R> + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Enable snapshot-based resume backed by `store`
    pub fn recover_by_hash(mut self, store: Arc<dyn SnapshotStore<R, S>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Pipeline<R, S>, PipelineError> {
        if self.nodes.is_empty() {
            return Err(PipelineError::EmptyChain {
                pipeline: self.name,
            });
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id()) {
                return Err(PipelineError::DuplicateStep {
                    step_id: node.id().to_string(),
                    pipeline: self.name.clone(),
                });
            }
        }

        Ok(Pipeline {
            name: self.name,
            nodes: self.nodes,
            rollbacks: self.rollbacks,
            finalize: self.finalize,
            validator: self.validator,
            recovery: self.store.map(|store| Recovery {
                store,
                locks: KeyedLocks::default(),
            }),
        })
    }
}

/// Builder stage scoped to the step that was just added
pub struct StepStage<R, S> {
    builder: PipelineBuilder<R, S>,
    index: usize,
}

impl<R, S> StepStage<R, S>
where
    R: Serialize + Send + Sync + 'static,
    S: Default + Send + Sync + 'static,
{
    fn node(&mut self) -> &mut StepNode<R, S> {
        &mut self.builder.nodes[self.index]
    }

    /// Run this step only when `condition(context, request)` holds
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Context<R, S>, &R) -> bool + Send + Sync + 'static,
    {
        self.node().guard = Arc::new(condition);
        self
    }

    /// Retry the step when it returns an error
    pub fn with_policy(mut self, policy: impl Policy + 'static) -> Self {
        self.node().policy = Some(StepPolicy::OnFault(Arc::new(policy)));
        self
    }

    /// Retry the step until its result satisfies `accept`
    pub fn retry_until<F>(mut self, policy: impl Policy + 'static, accept: F) -> Self
    where
        F: Fn(&StepResult) -> bool + Send + Sync + 'static,
    {
        self.node().policy = Some(StepPolicy::Until {
            policy: Arc::new(policy),
            predicate: Arc::new(accept),
        });
        self
    }

    /// Register a compensation owned by this step.
    ///
    /// The entry copies the step's current guard. If this step later fails,
    /// this entry and every earlier one run.
    pub fn rollback(mut self, compensation: impl Compensation<R> + 'static) -> RollbackStage<R, S> {
        let guard = self.node().guard.clone();
        let index = self
            .builder
            .rollbacks
            .push(self.index, guard, Box::new(compensation));
        self.node().rollback_index = Some(index);

        RollbackStage {
            builder: self.builder,
            step_index: self.index,
        }
    }

    pub fn step(self, step: impl Step<R, S> + 'static) -> StepStage<R, S> {
        self.builder.step(step)
    }

    pub fn finalize(self, finalize: impl Finalize<R, S> + 'static) -> PipelineBuilder<R, S> {
        self.builder.finalize(finalize)
    }

    pub fn finalize_with_policy(
        self,
        finalize: impl Finalize<R, S> + 'static,
        policy: impl Policy + 'static,
    ) -> PipelineBuilder<R, S> {
        self.builder.finalize_with_policy(finalize, policy)
    }

    pub fn validator(self, validator: impl Validator<R> + 'static) -> PipelineBuilder<R, S> {
        self.builder.validator(validator)
    }

    pub fn recover_by_hash(self, store: Arc<dyn SnapshotStore<R, S>>) -> PipelineBuilder<R, S> {
        self.builder.recover_by_hash(store)
    }

    pub fn build(self) -> Result<Pipeline<R, S>, PipelineError> {
        self.builder.build()
    }
}

/// Builder stage scoped to the rollback entry that was just registered
pub struct RollbackStage<R, S> {
    builder: PipelineBuilder<R, S>,
    step_index: usize,
}

impl<R, S> RollbackStage<R, S>
where
    R: Serialize + Send + Sync + 'static,
    S: Default + Send + Sync + 'static,
{
    /// Replace the guard copied from the owning step
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Context<R, S>, &R) -> bool + Send + Sync + 'static,
    {
        if let Some(entry) = self.builder.rollbacks.last_mut() {
            entry.guard = Arc::new(condition);
        }
        self
    }

    /// Register another compensation owned by the same step
    pub fn rollback(self, compensation: impl Compensation<R> + 'static) -> RollbackStage<R, S> {
        StepStage {
            builder: self.builder,
            index: self.step_index,
        }
        .rollback(compensation)
    }

    pub fn step(self, step: impl Step<R, S> + 'static) -> StepStage<R, S> {
        self.builder.step(step)
    }

    pub fn finalize(self, finalize: impl Finalize<R, S> + 'static) -> PipelineBuilder<R, S> {
        self.builder.finalize(finalize)
    }

    pub fn finalize_with_policy(
        self,
        finalize: impl Finalize<R, S> + 'static,
        policy: impl Policy + 'static,
    ) -> PipelineBuilder<R, S> {
        self.builder.finalize_with_policy(finalize, policy)
    }

    pub fn validator(self, validator: impl Validator<R> + 'static) -> PipelineBuilder<R, S> {
        self.builder.validator(validator)
    }

    pub fn recover_by_hash(self, store: Arc<dyn SnapshotStore<R, S>>) -> PipelineBuilder<R, S> {
        self.builder.recover_by_hash(store)
    }

    pub fn build(self) -> Result<Pipeline<R, S>, PipelineError> {
        self.builder.build()
    }
}

impl<R, S> FinalizeNode<R, S>
where
    R: Send + Sync,
    S: Send + Sync,
{
    /// Run the finalize step, retrying faults while the policy allows.
    ///
    /// Once `cancel` fires no further attempt is made.
    async fn run(
        &self,
        ctx: &mut Context<R, S>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<StepResult>> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match self.step.finalize(ctx).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            let Some(policy) = &self.policy else {
                return Err(error);
            };
            if !policy.should_retry(attempt) || cancel.is_cancelled() {
                return Err(error);
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %format!("{:#}", error),
                "Retrying finalize step"
            );

            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                return Err(error);
            }
        }
    }
}

/// Per-key async mutexes, dropped from the map once nobody holds or awaits them
#[derive(Default)]
struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> KeyGuard {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;

        KeyGuard {
            locks: self.locks.clone(),
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

struct KeyGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Step<String, ()> for Named {
        fn id(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: &mut Context<String, ()>) -> Result<StepResult> {
            Ok(StepResult::empty())
        }
    }

    struct Undo;

    #[async_trait]
    impl Compensation<String> for Undo {
        fn id(&self) -> &str {
            "undo"
        }

        async fn compensate(&self, _request: &String) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_build_rejects_empty_chain() {
        let result = PipelineBuilder::<String, ()>::new("empty").build();
        assert!(matches!(result, Err(PipelineError::EmptyChain { .. })));
    }

    #[test]
    fn test_build_rejects_duplicate_ids() {
        let result = Pipeline::builder("dup")
            .step(Named("a"))
            .step(Named("a"))
            .build();

        assert!(matches!(
            result,
            Err(PipelineError::DuplicateStep { ref step_id, .. }) if step_id == "a"
        ));
    }

    #[test]
    fn test_rollback_records_index_on_owning_step() {
        let pipeline = Pipeline::builder("rb")
            .step(Named("a"))
            .rollback(Undo)
            .step(Named("b"))
            .step(Named("c"))
            .rollback(Undo)
            .rollback(Undo)
            .build()
            .unwrap();

        assert_eq!(pipeline.step_ids(), vec!["a", "b", "c"]);
        assert_eq!(pipeline.rollback_count(), 3);
        assert_eq!(pipeline.nodes[0].rollback_index, Some(1));
        // Inherited from the entry registered by "a"
        assert_eq!(pipeline.nodes[1].rollback_index, Some(1));
        assert_eq!(pipeline.nodes[2].rollback_index, Some(3));
        assert!(!pipeline.recovery_enabled());
    }

    #[test]
    fn test_steps_before_first_rollback_have_no_index() {
        let pipeline = Pipeline::builder("rb")
            .step(Named("a"))
            .step(Named("b"))
            .rollback(Undo)
            .build()
            .unwrap();

        assert_eq!(pipeline.nodes[0].rollback_index, None);
        assert_eq!(pipeline.nodes[1].rollback_index, Some(1));
    }

    #[test]
    fn test_rollback_copies_step_guard() {
        let mut pipeline = Pipeline::builder("guards")
            .step(Named("a"))
            .when(|_, req: &String| req == "go")
            .rollback(Undo)
            .build()
            .unwrap();

        let go = Context::new("go".to_string());
        let stop = Context::new("stop".to_string());
        let entry = pipeline.rollbacks.last_mut().unwrap();

        assert_eq!(entry.step_index, 0);
        assert!((entry.guard)(&go, &go.request));
        assert!(!(entry.guard)(&stop, &stop.request));
    }

    #[test]
    fn test_rollback_when_rebinds_entry_guard_only() {
        let mut pipeline = Pipeline::builder("guards")
            .step(Named("a"))
            .rollback(Undo)
            .when(|_, _: &String| false)
            .build()
            .unwrap();

        let ctx = Context::new("any".to_string());
        assert!(pipeline.nodes[0].passes(&ctx));

        let entry = pipeline.rollbacks.last_mut().unwrap();
        assert!(!(entry.guard)(&ctx, &ctx.request));
    }

    #[tokio::test]
    async fn test_keyed_locks_are_released() {
        let locks = KeyedLocks::default();

        {
            let _guard = locks.acquire("k").await;
            assert_eq!(locks.locks.len(), 1);
        }

        assert!(locks.locks.is_empty());
    }
}
