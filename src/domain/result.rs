//! Result envelope returned by steps and by the pipeline itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status used for validation rejections
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Status used when a traversal is cancelled before it completes
pub const STATUS_CANCELLED: u16 = 499;

/// Status used for faults that escaped a step or the finalize step
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Outcome of a single step, and the shape handed back to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Whether the step (or execution) succeeded
    pub success: bool,

    /// HTTP-style status code
    pub status_code: u16,

    /// Errors in the order they were reported
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,

    /// Arbitrary response body
    #[serde(default)]
    pub payload: Value,
}

impl StepResult {
    /// Successful result with status 200
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            status_code: 200,
            errors: Vec::new(),
            payload,
        }
    }

    /// Successful result with no payload
    pub fn empty() -> Self {
        Self::ok(Value::Null)
    }

    /// Failed result carrying a single error
    pub fn failure(status_code: u16, error: ErrorEntry) -> Self {
        Self {
            success: false,
            status_code,
            errors: vec![error],
            payload: Value::Null,
        }
    }

    /// Failed result carrying a list of errors
    pub fn with_errors(status_code: u16, errors: Vec<ErrorEntry>) -> Self {
        Self {
            success: false,
            status_code,
            errors,
            payload: Value::Null,
        }
    }

    /// Internal error produced from a fault that escaped a step
    pub fn internal_error(code: &str, message: impl Into<String>) -> Self {
        Self::failure(
            STATUS_INTERNAL_ERROR,
            ErrorEntry::new(message).with_code(code),
        )
    }

    /// Override the status code
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Replace the payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Check whether the result reports success
    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// One error reported by a step or validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Machine-readable error code
    pub code: Option<String>,

    /// Human-readable message
    pub message: String,

    /// Request field the error refers to
    pub field: Option<String>,
}

impl ErrorEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            field: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}
