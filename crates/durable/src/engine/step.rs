//! Step engine
//!
//! Wraps a non-transactional side-effecting call with the OAOO check and
//! the step's retry policy. A step that exhausts its attempts records the
//! distinguished retries-exceeded error, not the last attempt's error.

use tracing::{debug, warn, Instrument};

use crate::engine::executor::{check_required_roles, WorkflowEngine};
use crate::error::{DurableError, SerializedError};
use crate::persistence::store::OperationResultRecord;
use crate::workflow::context::WorkflowContext;

/// Context handed to step functions
///
/// Carries the attempt counters and allows nested step calls, which bypass
/// recording: only the outermost step of a workflow is a durable
/// operation.
#[derive(Clone)]
pub struct StepContext {
    engine: WorkflowEngine,
    workflow_id: String,
    step_name: String,
    attempt: u32,
    max_attempts: u32,
}

impl StepContext {
    pub(crate) fn new(
        engine: WorkflowEngine,
        workflow_id: String,
        step_name: String,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            engine,
            workflow_id,
            step_name,
            attempt,
            max_attempts,
        }
    }

    /// Id of the owning workflow
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Name of the executing step
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Current attempt, 1-based
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempts allowed by the step's policy
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether this is the final attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Call another registered step directly, without recording
    ///
    /// Nested steps are not independent durable operations; their effects
    /// belong to the enclosing step's record.
    pub async fn call_step(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, anyhow::Error> {
        let step = self
            .engine
            .registry()
            .get_step(name)
            .ok_or_else(|| anyhow::anyhow!("step {name} is not registered"))?;
        let nested = StepContext::new(
            self.engine.clone(),
            self.workflow_id.clone(),
            name.to_string(),
            1,
            step.policy.allowed_attempts(),
        );
        (step.func)(nested, args).await
    }
}

/// Run a registered step under the calling workflow
pub(crate) async fn invoke_step(
    engine: &WorkflowEngine,
    ctx: &WorkflowContext,
    name: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, DurableError> {
    let step = engine
        .registry()
        .get_step(name)
        .ok_or_else(|| DurableError::FunctionNotFound {
            workflow_id: ctx.workflow_id().to_string(),
            name: name.to_string(),
        })?;

    // Already inside a step: bypass OAOO entirely and call the function.
    if ctx.is_in_step() {
        let nested = StepContext::new(
            engine.clone(),
            ctx.workflow_id().to_string(),
            name.to_string(),
            1,
            step.policy.allowed_attempts(),
        );
        return (step.func)(nested, args)
            .await
            .map_err(|err| DurableError::Application(SerializedError::from_anyhow(&err)));
    }

    check_required_roles(name, &step.required_roles, ctx.auth())?;

    let function_id = ctx.next_function_id();
    let workflow_id = ctx.workflow_id().to_string();
    let span = tracing::info_span!(
        "step",
        workflow_id = %workflow_id,
        name = %name,
        function_id,
        operation_type = "step",
    );

    async {
        if let Some(outcome) = engine
            .system_db()
            .check_operation_execution(&workflow_id, function_id)
            .await?
        {
            debug!("returning recorded step result");
            return outcome.into_result(&workflow_id, function_id);
        }

        let _scope = ctx.enter_step();
        let allowed = step.policy.allowed_attempts();
        let mut interval = step.policy.interval;
        let mut output = None;
        let mut error: Option<DurableError> = None;

        for attempt in 1..=allowed {
            let step_ctx = StepContext::new(
                engine.clone(),
                workflow_id.clone(),
                name.to_string(),
                attempt,
                allowed,
            );
            match (step.func)(step_ctx, args.clone()).await {
                Ok(value) => {
                    output = Some(value);
                    error = None;
                    break;
                }
                Err(err) => {
                    if step.policy.retries_allowed {
                        warn!(
                            attempt,
                            max_attempts = allowed,
                            error = %format!("{err:#}"),
                            retry_interval_seconds = interval.as_secs_f64(),
                            "step attempt failed"
                        );
                        if attempt == allowed {
                            error = Some(DurableError::MaxStepRetriesExceeded {
                                step: name.to_string(),
                                attempts: allowed,
                            });
                        } else {
                            error =
                                Some(DurableError::Application(SerializedError::from_anyhow(&err)));
                            tokio::time::sleep(interval).await;
                            interval = step.policy.next_interval(interval);
                        }
                    } else {
                        error =
                            Some(DurableError::Application(SerializedError::from_anyhow(&err)));
                    }
                }
            }
        }

        let record = OperationResultRecord {
            workflow_id: workflow_id.clone(),
            function_id,
            output: output.clone(),
            error: error
                .as_ref()
                .map(|err| SerializedError::from_durable(err).to_value()),
        };
        engine.system_db().record_operation_result(&record).await?;

        match error {
            Some(err) => Err(err),
            None => Ok(output.unwrap_or(serde_json::Value::Null)),
        }
    }
    .instrument(span)
    .await
}
