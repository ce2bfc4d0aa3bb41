//! Client-facing workflow handles

use tokio::task::JoinHandle;

use crate::engine::executor::WorkflowEngine;
use crate::error::DurableError;
use crate::persistence::store::{RecordedOutcome, WorkflowStatusRecord};

enum HandleKind {
    /// Backed by the in-process task running the workflow
    Task(JoinHandle<Result<serde_json::Value, DurableError>>),

    /// Backed by the database; used for workflows started elsewhere or
    /// recovered by id
    Polling,

    /// The workflow already had a terminal record when the handle was made
    Finished(RecordedOutcome),
}

/// Accessor for an in-flight (or finished) workflow
///
/// Exposes the id, a blocking [`result`](Self::result), and a
/// [`status`](Self::status) snapshot. Task-backed handles resolve from the
/// local execution; polling handles wait on the status row.
pub struct WorkflowHandle {
    engine: WorkflowEngine,
    workflow_id: String,
    kind: HandleKind,
}

impl WorkflowHandle {
    pub(crate) fn task(
        engine: WorkflowEngine,
        workflow_id: String,
        task: JoinHandle<Result<serde_json::Value, DurableError>>,
    ) -> Self {
        Self {
            engine,
            workflow_id,
            kind: HandleKind::Task(task),
        }
    }

    pub(crate) fn polling(engine: WorkflowEngine, workflow_id: String) -> Self {
        Self {
            engine,
            workflow_id,
            kind: HandleKind::Polling,
        }
    }

    pub(crate) fn finished(
        engine: WorkflowEngine,
        workflow_id: String,
        outcome: RecordedOutcome,
    ) -> Self {
        Self {
            engine,
            workflow_id,
            kind: HandleKind::Finished(outcome),
        }
    }

    /// Id of the workflow this handle tracks
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Wait for the workflow to finish and return its output, re-raising a
    /// recorded error if it failed
    pub async fn result(self) -> Result<serde_json::Value, DurableError> {
        match self.kind {
            HandleKind::Task(task) => task.await.map_err(|e| {
                DurableError::Internal(format!(
                    "workflow task for {} aborted: {e}",
                    self.workflow_id
                ))
            })?,
            HandleKind::Polling => {
                let outcome = self
                    .engine
                    .system_db()
                    .await_workflow_result(&self.workflow_id)
                    .await?;
                outcome.into_result(&self.workflow_id, 0)
            }
            HandleKind::Finished(outcome) => outcome.into_result(&self.workflow_id, 0),
        }
    }

    /// Snapshot the persisted status row
    pub async fn status(&self) -> Result<WorkflowStatusRecord, DurableError> {
        self.engine.get_workflow_status(&self.workflow_id).await
    }
}
