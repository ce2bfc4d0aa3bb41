//! Workflow recovery
//!
//! Given a workflow id, rebuild the context from the persisted status and
//! inputs, re-bind class/instance receivers, and re-dispatch through the
//! engine under the original id. Completed sub-operations short-circuit on
//! their records, so only the un-executed tail actually runs.

use tracing::info;

use crate::engine::executor::{StartOptions, WorkflowEngine};
use crate::error::{DurableError, SerializedError};
use crate::persistence::store::WorkflowStatus;
use crate::workflow::context::AuthContext;
use crate::workflow::handle::WorkflowHandle;

impl WorkflowEngine {
    /// Re-dispatch a PENDING workflow by id
    ///
    /// Fails with a recovery error when status or inputs are missing, and
    /// with a function-not-found error when the registered function or
    /// instance cannot be resolved. Each entry through this path counts
    /// against the configured recovery-attempt limit; past the limit the
    /// workflow is marked as a terminal retries-exceeded error.
    pub async fn recover_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowHandle, DurableError> {
        let status = self
            .system_db()
            .get_workflow_status(workflow_id)
            .await?
            .ok_or_else(|| DurableError::Recovery {
                workflow_id: workflow_id.to_string(),
                reason: "workflow status not found".to_string(),
            })?;
        let inputs = self
            .system_db()
            .get_workflow_inputs(workflow_id)
            .await?
            .ok_or_else(|| DurableError::Recovery {
                workflow_id: workflow_id.to_string(),
                reason: "workflow inputs not found".to_string(),
            })?;

        if !self.registry().contains_workflow(&status.name) {
            return Err(DurableError::FunctionNotFound {
                workflow_id: workflow_id.to_string(),
                name: status.name.clone(),
            });
        }

        if status.recovery_attempts >= self.config().max_recovery_attempts {
            let err = DurableError::WorkflowRetriesExceeded {
                workflow_id: workflow_id.to_string(),
                attempts: status.recovery_attempts,
            };
            let mut terminal = status.clone();
            terminal.status = WorkflowStatus::Error;
            terminal.output = None;
            terminal.error = Some(SerializedError::from_durable(&err).to_value());
            self.system_db().update_workflow_status(&terminal).await?;
            return Err(err);
        }

        // Instances were never serialized; resolve the registered binding
        // by the recorded names.
        let instance = match (&status.class_name, &status.config_name) {
            (Some(class_name), Some(config_name)) => Some(
                self.registry()
                    .get_instance(class_name, config_name)
                    .ok_or_else(|| DurableError::FunctionNotFound {
                        workflow_id: workflow_id.to_string(),
                        name: format!("{class_name}/{config_name}"),
                    })?,
            ),
            (Some(class_name), None) => Some(
                self.registry()
                    .get_class(class_name)
                    .ok_or_else(|| DurableError::FunctionNotFound {
                        workflow_id: workflow_id.to_string(),
                        name: class_name.clone(),
                    })?,
            ),
            _ => None,
        };

        let mut options = StartOptions::default().with_workflow_id(workflow_id);
        options.auth = AuthContext {
            authenticated_user: status.authenticated_user.clone(),
            authenticated_roles: status.authenticated_roles.clone(),
            assumed_role: None,
        };
        options.request = status.request.clone();
        options.instance = instance;
        options.config_name = status.config_name.clone();

        info!(
            workflow_id = %workflow_id,
            name = %status.name,
            recovery_attempts = status.recovery_attempts,
            "recovering workflow"
        );
        self.start_workflow_inner(&status.name, inputs, options, true)
            .await
    }
}
