//! Execution report: what happened during one `execute` call.
//!
//! The report is the observable trace of a traversal. It never feeds back
//! into execution; hosts use it for logging, auditing and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an execution came to an end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "halt")]
pub enum Halt {
    /// Every node was either run or skipped
    Completed,

    /// The validator rejected the request; the chain was never entered
    Rejected { violations: usize },

    /// A successful snapshot was replayed; no step ran
    Replayed,

    /// A step reported failure
    StepFailed {
        step_id: String,
        /// Rollback index unwound, if the step owned one
        rollback_index: Option<usize>,
    },

    /// An outcome policy ran out of attempts
    PolicyExhausted { step_id: String, attempts: u32 },

    /// A step returned an error that no policy absorbed
    Faulted { step_id: String, message: String },

    /// The cancellation token fired
    Cancelled { step_id: Option<String> },
}

impl Halt {
    /// Whether the chain ran to the end
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed | Self::Replayed)
    }
}

/// Status of a node in the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Guard evaluated to false
    Skipped,

    /// Passed over while seeking the resume point
    Resumed,

    /// Ran and reported success
    Completed,

    /// Ran and reported failure
    Failed,

    /// Returned an error
    Faulted,

    /// Outcome policy gave up
    Exhausted,
}

/// One node's entry in the trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    /// Number of invocations (0 when the step did not run)
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(step_id: impl Into<String>, status: StepStatus, attempts: u32) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            attempts,
            at: Utc::now(),
        }
    }
}

/// A compensation that returned an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFault {
    pub rollback_id: String,
    pub index: usize,
    pub message: String,
}

/// Full trace of one `execute` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Unique id of this call, used in log spans
    pub execution_id: Uuid,

    /// Key the snapshot lives under (absent when validation rejected)
    pub idempotency_key: Option<String>,

    /// How the execution ended
    pub halt: Halt,

    /// Step the context pointed at when traversal stopped
    pub last_step_id: Option<String>,

    /// Resume point taken from a failed snapshot
    pub resumed_from: Option<String>,

    /// Per-node trace, in chain order
    pub steps: Vec<StepRecord>,

    /// Rollback entries that ran, in the order they ran
    pub compensations: Vec<String>,

    /// Compensations that failed
    pub compensation_faults: Vec<CompensationFault>,

    /// Whether the finalize step ran
    pub finalized: bool,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionReport {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            idempotency_key: None,
            halt: Halt::Completed,
            last_step_id: None,
            resumed_from: None,
            steps: Vec::new(),
            compensations: Vec::new(),
            compensation_faults: Vec::new(),
            finalized: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Ids of the steps that were actually invoked
    pub fn invoked_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|r| r.attempts > 0)
            .map(|r| r.step_id.as_str())
            .collect()
    }

    /// Status recorded for a step, if it appears in the trace
    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.steps
            .iter()
            .find(|r| r.step_id == step_id)
            .map(|r| r.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoked_steps_excludes_skipped() {
        let mut report = ExecutionReport::new(Uuid::new_v4());
        report.steps.push(StepRecord::new("a", StepStatus::Resumed, 0));
        report.steps.push(StepRecord::new("b", StepStatus::Completed, 1));
        report.steps.push(StepRecord::new("c", StepStatus::Skipped, 0));

        assert_eq!(report.invoked_steps(), vec!["b"]);
        assert_eq!(report.status_of("c"), Some(StepStatus::Skipped));
        assert_eq!(report.status_of("missing"), None);
    }

    #[test]
    fn test_halt_serialization() {
        let halt = Halt::StepFailed {
            step_id: "charge".to_string(),
            rollback_index: Some(1),
        };

        let json = serde_json::to_value(&halt).unwrap();
        assert_eq!(json["halt"], "step_failed");
        assert_eq!(json["step_id"], "charge");
    }
}
