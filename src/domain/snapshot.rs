//! Resumable checkpoint of an execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::Context;
use super::result::StepResult;

/// Checkpoint stored under an idempotency key after every execution in
/// recovery mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<R, S> {
    /// Whether the execution that wrote this snapshot succeeded
    pub success: bool,

    /// Step that was being attempted when the execution stopped
    pub last_step_id: Option<String>,

    /// Context as it was when the execution stopped
    pub context: Context<R, S>,

    /// When the snapshot was written
    pub saved_at: DateTime<Utc>,
}

impl<R, S> Snapshot<R, S> {
    pub fn new(success: bool, last_step_id: Option<String>, context: Context<R, S>) -> Self {
        Self {
            success,
            last_step_id,
            context,
            saved_at: Utc::now(),
        }
    }

    /// Response stored in the snapshot, forced to status 200.
    ///
    /// Used for memoized replay of a successful execution.
    pub fn replay_response(&self) -> StepResult {
        self.context
            .response
            .clone()
            .unwrap_or_else(StepResult::empty)
            .with_status(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replay_response_forces_200() {
        let mut ctx: Context<String, ()> = Context::new("req".to_string());
        ctx.response = Some(StepResult::ok(json!({"order": 1})).with_status(201));

        let snapshot = Snapshot::new(true, Some("persist".to_string()), ctx);
        let replay = snapshot.replay_response();

        assert_eq!(replay.status_code, 200);
        assert_eq!(replay.payload["order"], 1);
    }

    #[test]
    fn test_snapshot_serialization() {
        let ctx: Context<String, u32> = Context::new("req".to_string());
        let snapshot = Snapshot::new(false, Some("b".to_string()), ctx);

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: Snapshot<String, u32> = serde_json::from_str(&json).unwrap();

        assert!(!parsed.success);
        assert_eq!(parsed.last_step_id.as_deref(), Some("b"));
        assert_eq!(parsed.context.request, "req");
    }
}
