//! Rollback registry: compensations bound to chain positions.
//!
//! Entries get 1-based indices in registration order. Each step records the
//! latest index registered at or before it; when that step fails, every
//! entry with an index at or below it runs, lowest index first.

use tracing::{debug, instrument, warn};

use crate::domain::{CompensationFault, Context};

use super::step::{Compensation, Guard};

pub(crate) struct RollbackEntry<R, S> {
    /// 1-based position in registration order
    pub index: usize,

    /// Arena position of the step that registered this entry
    pub step_index: usize,

    /// Copy of the owning step's guard, rebindable with `when`
    pub guard: Guard<R, S>,

    pub action: Box<dyn Compensation<R>>,
}

/// Outcome of unwinding the registry
#[derive(Debug, Default)]
pub(crate) struct Unwind {
    /// Entries invoked, in invocation order
    pub ran: Vec<String>,
    pub faults: Vec<CompensationFault>,
}

pub(crate) struct RollbackRegistry<R, S> {
    entries: Vec<RollbackEntry<R, S>>,
}

impl<R, S> Default for RollbackRegistry<R, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, S> RollbackRegistry<R, S> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a compensation and return its index
    pub fn push(
        &mut self,
        step_index: usize,
        guard: Guard<R, S>,
        action: Box<dyn Compensation<R>>,
    ) -> usize {
        let index = self.entries.len() + 1;
        self.entries.push(RollbackEntry {
            index,
            step_index,
            guard,
            action,
        });
        index
    }

    pub fn last_mut(&mut self) -> Option<&mut RollbackEntry<R, S>> {
        self.entries.last_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Index of the most recently registered entry
    pub fn last_index(&self) -> Option<usize> {
        self.entries.last().map(|e| e.index)
    }

    /// Run every entry with `index <= upto` in ascending order.
    ///
    /// Entries whose guard rejects the current context are passed over.
    /// Compensation errors are collected and never stop later entries.
    #[instrument(skip_all, fields(upto = upto))]
    pub async fn unwind(&self, upto: usize, ctx: &Context<R, S>) -> Unwind {
        let mut outcome = Unwind::default();

        for entry in self.entries.iter().take_while(|e| e.index <= upto) {
            let id = entry.action.id();

            if !(entry.guard)(ctx, &ctx.request) {
                debug!(rollback = id, index = entry.index, "Rollback guard false, skipping");
                continue;
            }

            debug!(
                rollback = id,
                index = entry.index,
                owner = entry.step_index,
                "Running compensation"
            );
            outcome.ran.push(id.to_string());

            if let Err(e) = entry.action.compensate(&ctx.request).await {
                warn!(rollback = id, index = entry.index, error = %e, "Compensation failed");
                outcome.faults.push(CompensationFault {
                    rollback_id: id.to_string(),
                    index: entry.index,
                    message: format!("{:#}", e),
                });
            }
        }

        outcome
    }
}
