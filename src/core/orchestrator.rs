//! Chain traversal.
//!
//! Walks the node arena in order, evaluating guards, invoking steps through
//! their retry policy, and unwinding the rollback registry when a step that
//! owns a rollback index fails.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    CompensationFault, Context, ErrorEntry, Halt, StepRecord, StepResult, StepStatus,
    STATUS_CANCELLED,
};

use super::policy::{Policy, StepPolicy};
use super::rollback::RollbackRegistry;
use super::step::StepNode;

/// What a traversal produced
#[derive(Debug)]
pub(crate) struct Traversal {
    /// Last result produced during this traversal
    pub result: Option<StepResult>,
    pub halt: Halt,
    pub steps: Vec<StepRecord>,
    pub compensations: Vec<String>,
    pub compensation_faults: Vec<CompensationFault>,
}

impl Traversal {
    fn new() -> Self {
        Self {
            result: None,
            halt: Halt::Completed,
            steps: Vec::new(),
            compensations: Vec::new(),
            compensation_faults: Vec::new(),
        }
    }
}

/// Outcome of invoking one step, retries included
enum Invocation {
    Done { result: StepResult, attempts: u32 },
    Exhausted { result: StepResult, attempts: u32 },
    Faulted { message: String, attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Traverses a chain against one execution context
pub(crate) struct Orchestrator<'a, R, S> {
    nodes: &'a [StepNode<R, S>],
    rollbacks: &'a RollbackRegistry<R, S>,
}

impl<'a, R, S> Orchestrator<'a, R, S>
where
    R: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    pub fn new(nodes: &'a [StepNode<R, S>], rollbacks: &'a RollbackRegistry<R, S>) -> Self {
        Self { nodes, rollbacks }
    }

    /// Run the chain from the head, seeking `resume_from` first if given
    #[instrument(skip(self, ctx, cancel), fields(nodes = self.nodes.len()))]
    pub async fn traverse(
        &self,
        ctx: &mut Context<R, S>,
        resume_from: Option<&str>,
        cancel: &CancellationToken,
    ) -> Traversal {
        let mut traversal = Traversal::new();
        let mut seeking = resume_from;

        if let Some(target) = seeking {
            if !self.nodes.iter().any(|n| n.id() == target) {
                warn!(resume_from = target, "Resume point not in chain; restarting from head");
                seeking = None;
            }
        }

        for node in self.nodes {
            let step_id = node.id();

            if cancel.is_cancelled() {
                // Point at the node that would run next so a resume skips completed work
                let next = seeking.unwrap_or(step_id);
                ctx.current_step_id = Some(next.to_string());
                return self.cancelled(traversal, ctx, 0);
            }

            if let Some(target) = seeking {
                if step_id != target {
                    debug!(step = step_id, "Already done before resume point, skipping");
                    traversal
                        .steps
                        .push(StepRecord::new(step_id, StepStatus::Resumed, 0));
                    continue;
                }
                info!(step = step_id, "Reached resume point");
                seeking = None;
            }

            if !node.passes(ctx) {
                debug!(step = step_id, "Guard false, skipping");
                traversal
                    .steps
                    .push(StepRecord::new(step_id, StepStatus::Skipped, 0));
                continue;
            }

            ctx.current_step_id = Some(step_id.to_string());
            let step_start = Instant::now();

            match self.invoke(node, ctx, cancel).await {
                Invocation::Done { result, attempts } if result.is_success() => {
                    debug!(
                        step = step_id,
                        attempts,
                        duration_ms = step_start.elapsed().as_millis() as u64,
                        "Step completed"
                    );
                    traversal
                        .steps
                        .push(StepRecord::new(step_id, StepStatus::Completed, attempts));
                    ctx.response = Some(result.clone());
                    traversal.result = Some(result);
                }
                Invocation::Done { result, attempts } => {
                    warn!(
                        step = step_id,
                        status = result.status_code,
                        rollback_index = ?node.rollback_index,
                        "Step reported failure"
                    );
                    traversal
                        .steps
                        .push(StepRecord::new(step_id, StepStatus::Failed, attempts));

                    if let Some(index) = node.rollback_index {
                        let unwind = self.rollbacks.unwind(index, ctx).await;
                        traversal.compensations = unwind.ran;
                        traversal.compensation_faults = unwind.faults;
                    }

                    ctx.response = Some(result.clone());
                    traversal.result = Some(result);
                    traversal.halt = Halt::StepFailed {
                        step_id: step_id.to_string(),
                        rollback_index: node.rollback_index,
                    };
                    return traversal;
                }
                Invocation::Exhausted { mut result, attempts } => {
                    error!(step = step_id, attempts, "Retry policy exhausted");
                    traversal
                        .steps
                        .push(StepRecord::new(step_id, StepStatus::Exhausted, attempts));

                    result.success = false;
                    result.errors.push(
                        ErrorEntry::new(format!(
                            "Step '{}' gave up after {} attempts",
                            step_id, attempts
                        ))
                        .with_code("policy_exhausted"),
                    );

                    ctx.response = Some(result.clone());
                    traversal.result = Some(result);
                    traversal.halt = Halt::PolicyExhausted {
                        step_id: step_id.to_string(),
                        attempts,
                    };
                    return traversal;
                }
                Invocation::Faulted { message, attempts } => {
                    error!(step = step_id, attempts, error = %message, "Step faulted");
                    traversal
                        .steps
                        .push(StepRecord::new(step_id, StepStatus::Faulted, attempts));

                    let result = StepResult::internal_error(
                        "unrecoverable_fault",
                        format!("Step '{}' failed: {}", step_id, message),
                    );
                    ctx.response = Some(result.clone());
                    traversal.result = Some(result);
                    traversal.halt = Halt::Faulted {
                        step_id: step_id.to_string(),
                        message,
                    };
                    return traversal;
                }
                Invocation::Cancelled { attempts } => {
                    return self.cancelled(traversal, ctx, attempts);
                }
            }
        }

        traversal
    }

    /// Invoke a step, retrying as its policy allows
    async fn invoke(
        &self,
        node: &StepNode<R, S>,
        ctx: &mut Context<R, S>,
        cancel: &CancellationToken,
    ) -> Invocation {
        let step_id = node.id();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let (policy, reason): (&dyn Policy, String) = match node.step.execute(ctx).await {
                Ok(result) => match &node.policy {
                    Some(StepPolicy::Until { policy, predicate }) if !predicate(&result) => {
                        if !policy.should_retry(attempt) {
                            return Invocation::Exhausted {
                                result,
                                attempts: attempt,
                            };
                        }
                        (
                            &**policy,
                            format!("result not accepted (status {})", result.status_code),
                        )
                    }
                    _ => {
                        return Invocation::Done {
                            result,
                            attempts: attempt,
                        }
                    }
                },
                Err(e) => match &node.policy {
                    Some(StepPolicy::OnFault(policy)) if policy.should_retry(attempt) => {
                        (&**policy, format!("{:#}", e))
                    }
                    _ => {
                        return Invocation::Faulted {
                            message: format!("{:#}", e),
                            attempts: attempt,
                        }
                    }
                },
            };

            let delay = policy.delay_for_attempt(attempt);

            warn!(
                step = step_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Retrying step"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Invocation::Cancelled { attempts: attempt };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled(
        &self,
        mut traversal: Traversal,
        ctx: &mut Context<R, S>,
        attempts: u32,
    ) -> Traversal {
        warn!(step = ?ctx.current_step_id, attempts, "Execution cancelled");

        let result = StepResult::failure(
            STATUS_CANCELLED,
            ErrorEntry::new("Execution cancelled").with_code("cancelled"),
        );
        ctx.response = Some(result.clone());
        traversal.result = Some(result);
        traversal.halt = Halt::Cancelled {
            step_id: ctx.current_step_id.clone(),
        };
        traversal
    }
}
