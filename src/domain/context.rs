//! Per-execution state carried through the chain.

use serde::{Deserialize, Serialize};

use super::result::StepResult;

/// Mutable state owned by exactly one execution.
///
/// `R` is the request type and `S` the state the steps accumulate. A fresh
/// context starts with `S::default()`; a resumed one is restored from a
/// snapshot and only gets its request replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context<R, S> {
    /// Request being processed
    pub request: R,

    /// Latest result produced along the chain
    pub response: Option<StepResult>,

    /// Id of the last step whose guard passed (set before the step runs)
    pub current_step_id: Option<String>,

    /// State accumulated by the steps
    pub state: S,
}

impl<R, S: Default> Context<R, S> {
    /// Create a fresh context for a request
    pub fn new(request: R) -> Self {
        Self {
            request,
            response: None,
            current_step_id: None,
            state: S::default(),
        }
    }
}

impl<R, S> Context<R, S> {
    /// Reuse this context for a new request, keeping everything else
    pub fn rebind(mut self, request: R) -> Self {
        self.request = request;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebind_keeps_state_and_step() {
        let mut ctx: Context<String, Vec<String>> = Context::new("first".to_string());
        ctx.state.push("reserved".to_string());
        ctx.current_step_id = Some("charge".to_string());

        let ctx = ctx.rebind("second".to_string());

        assert_eq!(ctx.request, "second");
        assert_eq!(ctx.state, vec!["reserved".to_string()]);
        assert_eq!(ctx.current_step_id.as_deref(), Some("charge"));
    }
}
