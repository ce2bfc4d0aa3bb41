//! Error taxonomy for the durable execution core
//!
//! Engine errors are [`DurableError`]. Errors recorded to the database
//! round-trip through [`SerializedError`], a `{kind, message, payload}`
//! record that preserves enough identity to re-raise a structurally
//! equivalent error on replay.

use serde::{Deserialize, Serialize};

use crate::persistence::app::AppDbError;
use crate::persistence::store::StoreError;

/// Well-known kinds for serialized errors
pub mod kinds {
    /// An error raised by user code inside a step, transaction, or workflow
    pub const APPLICATION: &str = "application";

    /// A step exhausted its configured retry attempts
    pub const MAX_STEP_RETRIES_EXCEEDED: &str = "max_step_retries_exceeded";

    /// A workflow exceeded its allowed recovery attempts
    pub const WORKFLOW_RETRIES_EXCEEDED: &str = "workflow_retries_exceeded";
}

/// Errors from the workflow engine
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    /// Another executor is already running (or has already run) this workflow id
    #[error("conflicting workflow id: {0}")]
    ConflictingWorkflowId(String),

    /// No status row exists for the workflow id
    #[error("workflow does not exist: {0}")]
    NonExistentWorkflow(String),

    /// A registered function could not be resolved by name
    #[error("function not found for workflow {workflow_id}: {name}")]
    FunctionNotFound { workflow_id: String, name: String },

    /// A workflow could not be recovered
    #[error("recovery of workflow {workflow_id} failed: {reason}")]
    Recovery { workflow_id: String, reason: String },

    /// A step failed on every allowed attempt
    #[error("step {step} exhausted its {attempts} attempts")]
    MaxStepRetriesExceeded { step: String, attempts: u32 },

    /// A workflow was re-entered for recovery more times than allowed
    #[error("workflow {workflow_id} exceeded {attempts} recovery attempts")]
    WorkflowRetriesExceeded { workflow_id: String, attempts: u32 },

    /// A persisted operation record has neither output nor error
    #[error("operation record ({workflow_id}, {function_id}) has neither output nor error")]
    CorruptOperationRecord {
        workflow_id: String,
        function_id: u64,
    },

    /// An engine precondition was violated (e.g. a transaction called from a step)
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The caller does not hold any of the roles the function requires
    #[error("function {name} requires one of roles {required:?}")]
    Unauthorized { name: String, required: Vec<String> },

    /// An error raised by user code, possibly reconstructed from a record
    #[error("{0}")]
    Application(SerializedError),

    /// System database error
    #[error(transparent)]
    Store(StoreError),

    /// Application database error
    #[error(transparent)]
    AppDb(#[from] AppDbError),

    /// Payload (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation inside the engine itself
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for DurableError {
    fn from(err: StoreError) -> Self {
        // Duplicate operation keys mean another executor got there first;
        // the caller converges on that execution's result.
        match err {
            StoreError::DuplicateOperation { workflow_id, .. } => {
                Self::ConflictingWorkflowId(workflow_id)
            }
            other => Self::Store(other),
        }
    }
}

/// A recorded error: the stable on-disk shape of any raised error
///
/// Exact runtime-type equivalence is not preserved; the `kind` tag is.
/// Reconstructing a [`SerializedError`] yields the matching
/// [`DurableError`] variant for engine kinds and
/// [`DurableError::Application`] for everything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedError {
    /// Kind tag, one of [`kinds`] or an application-defined value
    pub kind: String,

    /// Human-readable message
    pub message: String,

    /// Kind-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SerializedError {
    /// Create an application-kind error from a message
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            kind: kinds::APPLICATION.to_string(),
            message: message.into(),
            payload: None,
        }
    }

    /// Capture a user error raised inside a step body
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::application(format!("{err:#}"))
    }

    /// Capture an engine error for recording
    pub fn from_durable(err: &DurableError) -> Self {
        match err {
            DurableError::Application(inner) => inner.clone(),
            DurableError::MaxStepRetriesExceeded { step, attempts } => Self {
                kind: kinds::MAX_STEP_RETRIES_EXCEEDED.to_string(),
                message: err.to_string(),
                payload: Some(serde_json::json!({ "step": step, "attempts": attempts })),
            },
            DurableError::WorkflowRetriesExceeded {
                workflow_id,
                attempts,
            } => Self {
                kind: kinds::WORKFLOW_RETRIES_EXCEEDED.to_string(),
                message: err.to_string(),
                payload: Some(
                    serde_json::json!({ "workflow_id": workflow_id, "attempts": attempts }),
                ),
            },
            other => Self::application(other.to_string()),
        }
    }

    /// Reconstruct the raised form of this record
    pub fn into_durable(self) -> DurableError {
        match self.kind.as_str() {
            kinds::MAX_STEP_RETRIES_EXCEEDED => {
                let payload = self.payload.unwrap_or_default();
                DurableError::MaxStepRetriesExceeded {
                    step: payload
                        .get("step")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    attempts: payload.get("attempts").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                }
            }
            kinds::WORKFLOW_RETRIES_EXCEEDED => {
                let payload = self.payload.unwrap_or_default();
                DurableError::WorkflowRetriesExceeded {
                    workflow_id: payload
                        .get("workflow_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    attempts: payload.get("attempts").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                }
            }
            _ => DurableError::Application(self),
        }
    }

    /// Serialize for storage in an output/error column
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "kind": kinds::APPLICATION, "message": self.message })
        })
    }

    /// Deserialize from a stored error column
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
            kind: kinds::APPLICATION.to_string(),
            message: value.to_string(),
            payload: None,
        })
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
