//! SystemDatabase trait definition
//!
//! The system database is the source of truth for workflow statuses,
//! inputs, per-function operation results, messages, and events. The
//! coordination operations (`send`, `recv`, `set_event`, `get_event`)
//! implement their own once-and-only-once bookkeeping against the
//! operation-result table, so replays short-circuit inside the store.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DurableError, SerializedError};

/// Topic used when the caller does not name one.
pub(crate) const DEFAULT_TOPIC: &str = "__default__";

/// Error type for system-database operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// An operation result already exists for this key
    #[error("operation result already recorded for ({workflow_id}, {function_id})")]
    DuplicateOperation {
        workflow_id: String,
        function_id: u64,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Workflow has been initialized but has not reached a terminal state
    Pending,

    /// Workflow completed successfully
    Success,

    /// Workflow failed (includes the retries-exceeded error kind)
    Error,
}

impl WorkflowStatus {
    /// Whether this status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// One row of the workflow-status table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusRecord {
    pub workflow_id: String,
    pub status: WorkflowStatus,

    /// Registered function name, resolves the workflow on recovery
    pub name: String,
    pub class_name: Option<String>,
    pub config_name: Option<String>,

    /// Serialized output; set only on SUCCESS
    pub output: Option<serde_json::Value>,

    /// Serialized error; set only on ERROR
    pub error: Option<serde_json::Value>,

    /// Provenance for multi-process fleets
    pub app_id: Option<String>,
    pub app_version: Option<String>,
    pub executor_id: String,

    /// Serialized request that originated the workflow
    pub request: Option<serde_json::Value>,

    /// Times this id has entered the engine in recovery mode
    pub recovery_attempts: u32,

    pub authenticated_user: Option<String>,
    pub authenticated_roles: Vec<String>,
    pub assumed_role: Option<String>,
}

impl WorkflowStatusRecord {
    /// Terminal outcome of this row, if it has one
    pub fn outcome(&self) -> Option<RecordedOutcome> {
        self.status.is_terminal().then(|| RecordedOutcome {
            output: self.output.clone(),
            error: self.error.clone(),
        })
    }
}

/// One row of the operation-result table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResultRecord {
    pub workflow_id: String,
    pub function_id: u64,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

/// A previously recorded outcome: exactly one field is set once written
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOutcome {
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

impl RecordedOutcome {
    /// Resolve the recorded outcome the way a replay does: re-raise a
    /// recorded error, return a recorded output, and flag records with
    /// neither as corrupt.
    pub fn into_result(
        self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<serde_json::Value, DurableError> {
        if let Some(error) = self.error {
            return Err(SerializedError::from_value(&error).into_durable());
        }
        match self.output {
            Some(output) => Ok(output),
            None => Err(DurableError::CorruptOperationRecord {
                workflow_id: workflow_id.to_string(),
                function_id,
            }),
        }
    }
}

/// Identity of an in-workflow caller of `get_event`
///
/// Carries the two reserved function ids: one for the read itself and one
/// for the durable timeout sleep.
#[derive(Debug, Clone)]
pub struct GetEventCaller {
    pub workflow_id: String,
    pub function_id: u64,
    pub timeout_function_id: u64,
}

/// Store for workflow state, operation results, messages, and events
///
/// Implementations must be thread-safe and support concurrent access from
/// many executors sharing one database.
#[async_trait]
pub trait SystemDatabase: Send + Sync + 'static {
    // =========================================================================
    // Workflow Status & Inputs
    // =========================================================================

    /// Insert a status row if none exists, returning the pre-existing row
    /// otherwise. With `in_recovery`, an existing row's recovery-attempt
    /// counter is incremented (and reflected in the returned record).
    async fn insert_workflow_status(
        &self,
        status: &WorkflowStatusRecord,
        in_recovery: bool,
    ) -> Result<Option<WorkflowStatusRecord>, StoreError>;

    /// Write a status row, inserting it if missing.
    ///
    /// Terminal states are write-once: an update against a row already in
    /// a terminal state is a no-op.
    async fn update_workflow_status(
        &self,
        status: &WorkflowStatusRecord,
    ) -> Result<(), StoreError>;

    /// Fetch a status row
    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRecord>, StoreError>;

    /// Record workflow inputs; at most once per id, later writes are no-ops
    async fn update_workflow_inputs(
        &self,
        workflow_id: &str,
        inputs: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Fetch recorded workflow inputs
    async fn get_workflow_inputs(
        &self,
        workflow_id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Block until the status row reaches a terminal state, then return it
    async fn await_workflow_result(
        &self,
        workflow_id: &str,
    ) -> Result<RecordedOutcome, StoreError>;

    // =========================================================================
    // Operation Results (OAOO)
    // =========================================================================

    /// Record a step outcome. Concurrent writers to the same
    /// `(workflow_id, function_id)` collapse on the uniqueness constraint:
    /// the loser gets [`StoreError::DuplicateOperation`].
    async fn record_operation_result(
        &self,
        result: &OperationResultRecord,
    ) -> Result<(), StoreError>;

    /// Look up a previously recorded operation outcome
    async fn check_operation_execution(
        &self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<Option<RecordedOutcome>, StoreError>;

    /// Durable sleep: records the wake deadline under `function_id` on
    /// first execution and returns the remaining wait, which is zero or
    /// less than the request on replay.
    async fn durable_sleep(
        &self,
        workflow_id: &str,
        function_id: u64,
        duration: Duration,
    ) -> Result<Duration, StoreError>;

    // =========================================================================
    // Messaging & Events
    // =========================================================================

    /// Append a message to the destination's FIFO queue for `topic`
    async fn send(
        &self,
        workflow_id: &str,
        function_id: u64,
        destination_id: &str,
        message: &serde_json::Value,
        topic: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Consume the oldest message for `(workflow_id, topic)`, waiting up to
    /// `timeout`. Returns `None` on timeout; either outcome is recorded
    /// under `function_id` and replayed without waiting.
    async fn recv(
        &self,
        workflow_id: &str,
        function_id: u64,
        timeout_function_id: u64,
        topic: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Upsert `(workflow_id, key) -> value` and wake current waiters
    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: u64,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Read `(target_workflow_id, key)`, waiting up to `timeout` for the
    /// value to appear. With a caller context the read is recorded and
    /// replayable; without one it is an uncorrelated read.
    async fn get_event(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
        caller: Option<GetEventCaller>,
    ) -> Result<Option<serde_json::Value>, StoreError>;
}

pub(crate) fn topic_or_default(topic: Option<&str>) -> String {
    topic.unwrap_or(DEFAULT_TOPIC).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Success,
            WorkflowStatus::Error,
        ] {
            let parsed: WorkflowStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("RUNNING".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_outcome_resolution() {
        let ok = RecordedOutcome {
            output: Some(serde_json::json!(42)),
            error: None,
        };
        assert_eq!(ok.into_result("wf", 1).unwrap(), serde_json::json!(42));

        let err = RecordedOutcome {
            output: None,
            error: Some(SerializedError::application("boom").to_value()),
        };
        assert!(matches!(
            err.into_result("wf", 1),
            Err(DurableError::Application(_))
        ));

        let corrupt = RecordedOutcome {
            output: None,
            error: None,
        };
        assert!(matches!(
            corrupt.into_result("wf", 3),
            Err(DurableError::CorruptOperationRecord { function_id: 3, .. })
        ));
    }

    #[test]
    fn test_null_output_is_a_value() {
        // A recorded null output is a real outcome, not a missing one.
        let outcome = RecordedOutcome {
            output: Some(serde_json::Value::Null),
            error: None,
        };
        assert_eq!(
            outcome.into_result("wf", 1).unwrap(),
            serde_json::Value::Null
        );
    }
}
