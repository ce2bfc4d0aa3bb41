//! Workflow engine
//!
//! The engine initializes workflow records, runs workflow bodies, buffers
//! terminal status writes, and converges conflicting starts of the same
//! workflow id onto a single result.
//!
//! Every execution follows the same path: resolve the registered function,
//! check roles, build a context, persist the PENDING status and inputs
//! (`init_workflow`), then run the body (`execute_workflow`). A terminal
//! record found during init short-circuits the body entirely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::engine::registry::{
    InstanceHandle, RegisteredWorkflow, Registry, TempWorkflowKind, temp_workflow_name,
    TEMP_SEND_WORKFLOW,
};
use crate::error::{DurableError, SerializedError};
use crate::persistence::app::AppDatabase;
use crate::persistence::store::{
    RecordedOutcome, SystemDatabase, WorkflowStatus, WorkflowStatusRecord,
};
use crate::workflow::context::{AuthContext, WorkflowContext};
use crate::workflow::handle::WorkflowHandle;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Application id recorded on every status row
    pub app_id: Option<String>,

    /// Application version recorded on every status row
    pub app_version: Option<String>,

    /// Identity of this executor process
    pub executor_id: String,

    /// How often the background flusher drains buffered status writes
    pub status_flush_interval: Duration,

    /// Recovery attempts allowed per workflow id before it is marked as a
    /// terminal retries-exceeded error
    pub max_recovery_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            executor_id: Uuid::now_v7().to_string(),
            status_flush_interval: Duration::from_millis(500),
            max_recovery_attempts: 50,
        }
    }
}

impl EngineConfig {
    /// Set the application id
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Set the executor id
    pub fn with_executor_id(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = executor_id.into();
        self
    }

    /// Set the status flush interval
    pub fn with_status_flush_interval(mut self, interval: Duration) -> Self {
        self.status_flush_interval = interval;
        self
    }

    /// Set the recovery-attempt limit
    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }
}

/// Options for starting a workflow from outside any workflow
#[derive(Clone, Default)]
pub struct StartOptions {
    /// Explicit workflow id; a fresh unique id is assigned when absent
    pub workflow_id: Option<String>,

    /// Caller identity propagated into the workflow
    pub auth: AuthContext,

    /// Request payload recorded with the status row and restored on recovery
    pub request: Option<serde_json::Value>,

    /// Receiver for method workflows; never serialized
    pub instance: Option<InstanceHandle>,

    /// Config name identifying the instance for recovery re-binding
    pub config_name: Option<String>,
}

impl StartOptions {
    /// Pin the workflow id
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Attach caller identity
    pub fn with_auth(mut self, auth: AuthContext) -> Self {
        self.auth = auth;
        self
    }

    /// Attach the originating request
    pub fn with_request(mut self, request: serde_json::Value) -> Self {
        self.request = Some(request);
        self
    }

    /// Attach a method-workflow receiver
    pub fn with_instance(mut self, instance: InstanceHandle) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Name the instance configuration for recovery
    pub fn with_config_name(mut self, config_name: impl Into<String>) -> Self {
        self.config_name = Some(config_name.into());
        self
    }
}

struct BufferedStatus {
    status: WorkflowStatusRecord,
    /// Inputs of a single-transaction workflow, flushed with its status
    inputs: Option<serde_json::Value>,
}

pub(crate) struct EngineInner {
    registry: Registry,
    system_db: Arc<dyn SystemDatabase>,
    app_db: Arc<dyn AppDatabase>,
    config: EngineConfig,
    status_buffer: Mutex<HashMap<String, BufferedStatus>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) enum InitOutcome {
    /// The PENDING record is in place (or buffered); run the body
    Ready {
        status: WorkflowStatusRecord,
        buffered_inputs: Option<serde_json::Value>,
    },

    /// A terminal record already exists; return it without running
    AlreadyFinished(RecordedOutcome),
}

/// The workflow engine
///
/// Cheap to clone; all clones share one registry, database handles, and
/// status buffer.
///
/// # Example
///
/// ```ignore
/// let mut registry = Registry::new();
/// registry.workflow("hello", |_ctx, args| async move { Ok(args) });
///
/// let engine = WorkflowEngine::launch(
///     registry,
///     Arc::new(MemorySystemDatabase::new()),
///     Arc::new(MemoryAppDatabase::new()),
///     EngineConfig::default(),
/// );
/// let handle = engine.start_workflow("hello", json!("world"), StartOptions::default()).await?;
/// let output = handle.result().await?;
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Freeze the registry, spawn the status flusher, and return the engine
    pub fn launch(
        registry: Registry,
        system_db: Arc<dyn SystemDatabase>,
        app_db: Arc<dyn AppDatabase>,
        config: EngineConfig,
    ) -> Self {
        info!(
            workflows = registry.workflow_count(),
            executor_id = %config.executor_id,
            "launching workflow engine"
        );

        let engine = Self {
            inner: Arc::new(EngineInner {
                registry,
                system_db,
                app_db,
                config,
                status_buffer: Mutex::new(HashMap::new()),
                flusher: Mutex::new(None),
            }),
        };

        let weak = Arc::downgrade(&engine.inner);
        let interval = engine.inner.config.status_flush_interval;
        let flusher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(inner) => EngineInner::flush_buffer(&inner).await,
                    None => break,
                }
            }
        });
        *engine.inner.flusher.lock() = Some(flusher);
        engine
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn system_db(&self) -> &Arc<dyn SystemDatabase> {
        &self.inner.system_db
    }

    pub(crate) fn app_db(&self) -> &Arc<dyn AppDatabase> {
        &self.inner.app_db
    }

    // =========================================================================
    // Public entry points
    // =========================================================================

    /// Run a workflow on the caller's task and return its output
    #[instrument(skip(self, args, options))]
    pub async fn run_workflow(
        &self,
        name: &str,
        args: serde_json::Value,
        options: StartOptions,
    ) -> Result<serde_json::Value, DurableError> {
        self.run_workflow_inner(name, args, options, false).await
    }

    /// Submit a workflow to the executor and return a handle to it
    #[instrument(skip(self, args, options))]
    pub async fn start_workflow(
        &self,
        name: &str,
        args: serde_json::Value,
        options: StartOptions,
    ) -> Result<WorkflowHandle, DurableError> {
        self.start_workflow_inner(name, args, options, false).await
    }

    /// Obtain a polling handle for a workflow started elsewhere
    pub async fn retrieve_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowHandle, DurableError> {
        // Fails fast when no row exists; the conflict-convergence path
        // builds its polling handle directly instead.
        self.get_workflow_status(workflow_id).await?;
        Ok(WorkflowHandle::polling(
            self.clone(),
            workflow_id.to_string(),
        ))
    }

    /// Fetch a workflow's status row
    pub async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowStatusRecord, DurableError> {
        self.inner
            .system_db
            .get_workflow_status(workflow_id)
            .await?
            .ok_or_else(|| DurableError::NonExistentWorkflow(workflow_id.to_string()))
    }

    /// Run a registered step outside any workflow
    ///
    /// Routes through the step's synthetic `"<temp>."` workflow so the call
    /// is recorded under a workflow umbrella like any other.
    pub async fn run_step(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        self.run_temp_workflow(name, args).await
    }

    /// Run a registered transaction outside any workflow
    pub async fn run_transaction(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        self.run_temp_workflow(name, args).await
    }

    /// Send a message from outside any workflow
    pub async fn send(
        &self,
        destination_id: &str,
        message: serde_json::Value,
        topic: Option<&str>,
    ) -> Result<(), DurableError> {
        let args = serde_json::json!({
            "destination_id": destination_id,
            "message": message,
            "topic": topic,
        });
        self.run_workflow(TEMP_SEND_WORKFLOW, args, StartOptions::default())
            .await?;
        Ok(())
    }

    /// Read another workflow's event from outside any workflow
    ///
    /// An uncorrelated read: nothing is recorded and replays are not a
    /// concern.
    pub async fn get_event(
        &self,
        workflow_id: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, DurableError> {
        Ok(self
            .inner
            .system_db
            .get_event(workflow_id, key, timeout, None)
            .await?)
    }

    /// Drain buffered status writes now
    pub async fn flush(&self) {
        EngineInner::flush_buffer(&self.inner).await;
    }

    /// Flush buffered writes and stop the background flusher
    pub async fn shutdown(&self) {
        if let Some(flusher) = self.inner.flusher.lock().take() {
            flusher.abort();
        }
        self.flush().await;
        debug!("workflow engine shut down");
    }

    // =========================================================================
    // Child workflows (called through WorkflowContext)
    // =========================================================================

    pub(crate) async fn run_child_workflow(
        &self,
        parent: &WorkflowContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        let (workflow, ctx, instance) = self.prepare_child(parent, name)?;
        let init = self.init_workflow(&ctx, &workflow, None, &args).await?;
        match init {
            InitOutcome::AlreadyFinished(outcome) => outcome.into_result(ctx.workflow_id(), 0),
            InitOutcome::Ready {
                status,
                buffered_inputs,
            } => {
                self.execute_workflow(ctx, workflow, instance, args, status, buffered_inputs)
                    .await
            }
        }
    }

    pub(crate) async fn start_child_workflow(
        &self,
        parent: &WorkflowContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<WorkflowHandle, DurableError> {
        let (workflow, ctx, instance) = self.prepare_child(parent, name)?;
        self.spawn_execution(workflow, ctx, instance, args, None)
            .await
    }

    // =========================================================================
    // Engine internals
    // =========================================================================

    async fn run_temp_workflow(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        let temp_name = temp_workflow_name(name);
        if !self.inner.registry.contains_workflow(&temp_name) {
            return Err(DurableError::FunctionNotFound {
                workflow_id: "<none>".to_string(),
                name: name.to_string(),
            });
        }
        self.run_workflow(&temp_name, args, StartOptions::default())
            .await
    }

    pub(crate) async fn run_workflow_inner(
        &self,
        name: &str,
        args: serde_json::Value,
        options: StartOptions,
        in_recovery: bool,
    ) -> Result<serde_json::Value, DurableError> {
        let (workflow, ctx, instance, config_name) =
            self.prepare_root(name, options, in_recovery)?;
        let init = self
            .init_workflow(&ctx, &workflow, config_name, &args)
            .await?;
        match init {
            InitOutcome::AlreadyFinished(outcome) => outcome.into_result(ctx.workflow_id(), 0),
            InitOutcome::Ready {
                status,
                buffered_inputs,
            } => {
                self.execute_workflow(ctx, workflow, instance, args, status, buffered_inputs)
                    .await
            }
        }
    }

    pub(crate) async fn start_workflow_inner(
        &self,
        name: &str,
        args: serde_json::Value,
        options: StartOptions,
        in_recovery: bool,
    ) -> Result<WorkflowHandle, DurableError> {
        let (workflow, ctx, instance, config_name) =
            self.prepare_root(name, options, in_recovery)?;
        self.spawn_execution(workflow, ctx, instance, args, config_name)
            .await
    }

    /// Persist PENDING and the inputs, then hand the execution to a task
    async fn spawn_execution(
        &self,
        workflow: Arc<RegisteredWorkflow>,
        ctx: WorkflowContext,
        instance: Option<InstanceHandle>,
        args: serde_json::Value,
        config_name: Option<String>,
    ) -> Result<WorkflowHandle, DurableError> {
        let workflow_id = ctx.workflow_id().to_string();
        let init = self
            .init_workflow(&ctx, &workflow, config_name, &args)
            .await?;
        match init {
            InitOutcome::AlreadyFinished(outcome) => {
                Ok(WorkflowHandle::finished(self.clone(), workflow_id, outcome))
            }
            InitOutcome::Ready {
                status,
                buffered_inputs,
            } => {
                let engine = self.clone();
                let task_workflow_id = workflow_id.clone();
                let task = tokio::spawn(async move {
                    let result = engine
                        .execute_workflow(ctx, workflow, instance, args, status, buffered_inputs)
                        .await;
                    if let Err(err) = &result {
                        error!(workflow_id = %task_workflow_id, %err, "asynchronous workflow failed");
                    }
                    result
                });
                Ok(WorkflowHandle::task(self.clone(), workflow_id, task))
            }
        }
    }

    fn prepare_root(
        &self,
        name: &str,
        options: StartOptions,
        in_recovery: bool,
    ) -> Result<
        (
            Arc<RegisteredWorkflow>,
            WorkflowContext,
            Option<InstanceHandle>,
            Option<String>,
        ),
        DurableError,
    > {
        let workflow = self.resolve_workflow(name, "<none>")?;
        let assumed_role = check_required_roles(name, &workflow.required_roles, &options.auth)?;

        let mut auth = options.auth;
        auth.assumed_role = assumed_role;

        let workflow_id = options
            .workflow_id
            .unwrap_or_else(WorkflowContext::assign_workflow_id);
        let ctx = WorkflowContext::new_root(
            self.clone(),
            workflow_id,
            auth,
            options.request,
            in_recovery,
        );

        let instance = self.resolve_instance(
            &workflow,
            options.instance,
            options.config_name.as_deref(),
        )?;
        Ok((workflow, ctx, instance, options.config_name))
    }

    fn prepare_child(
        &self,
        parent: &WorkflowContext,
        name: &str,
    ) -> Result<
        (
            Arc<RegisteredWorkflow>,
            WorkflowContext,
            Option<InstanceHandle>,
        ),
        DurableError,
    > {
        if parent.is_in_step() {
            return Err(DurableError::InvalidOperation(
                "workflows cannot be started from within a step".to_string(),
            ));
        }

        let workflow = self.resolve_workflow(name, parent.workflow_id())?;
        let assumed_role = check_required_roles(name, &workflow.required_roles, parent.auth())?;

        // The k-th child call gets the deterministic id "{parent}-{k}"
        // unless the parent reserved one explicitly.
        let function_id = parent.next_function_id();
        let child_id = parent
            .take_next_workflow_id()
            .unwrap_or_else(|| format!("{}-{}", parent.workflow_id(), function_id));
        let ctx = parent.create_child(child_id, assumed_role);

        let instance = self.resolve_instance(&workflow, None, None)?;
        Ok((workflow, ctx, instance))
    }

    fn resolve_workflow(
        &self,
        name: &str,
        workflow_id: &str,
    ) -> Result<Arc<RegisteredWorkflow>, DurableError> {
        self.inner
            .registry
            .get_workflow(name)
            .ok_or_else(|| DurableError::FunctionNotFound {
                workflow_id: workflow_id.to_string(),
                name: name.to_string(),
            })
    }

    /// Resolve the receiver for a method workflow: an explicit instance
    /// wins, then the `"{class}/{config}"` binding, then the class binding.
    fn resolve_instance(
        &self,
        workflow: &RegisteredWorkflow,
        explicit: Option<InstanceHandle>,
        config_name: Option<&str>,
    ) -> Result<Option<InstanceHandle>, DurableError> {
        let Some(class_name) = workflow.class_name.as_deref() else {
            return Ok(None);
        };
        if let Some(instance) = explicit {
            return Ok(Some(instance));
        }
        let bound = match config_name {
            Some(config) => self.inner.registry.get_instance(class_name, config),
            None => self.inner.registry.get_class(class_name),
        };
        match bound {
            Some(instance) => Ok(Some(instance)),
            None => Err(DurableError::InvalidOperation(format!(
                "workflow {} requires an instance of class {class_name}, and none is registered",
                workflow.name
            ))),
        }
    }

    /// Compose and persist the initial workflow record
    ///
    /// Status and inputs are written synchronously for everything except
    /// single-transaction workflows, whose inputs ride along with the
    /// terminal status: their first and only operation produces it.
    pub(crate) async fn init_workflow(
        &self,
        ctx: &WorkflowContext,
        workflow: &RegisteredWorkflow,
        config_name: Option<String>,
        args: &serde_json::Value,
    ) -> Result<InitOutcome, DurableError> {
        let config = &self.inner.config;
        let status = WorkflowStatusRecord {
            workflow_id: ctx.workflow_id().to_string(),
            status: WorkflowStatus::Pending,
            name: workflow.name.clone(),
            class_name: workflow.class_name.clone(),
            config_name,
            output: None,
            error: None,
            app_id: config.app_id.clone(),
            app_version: config.app_version.clone(),
            executor_id: config.executor_id.clone(),
            request: ctx.request().cloned(),
            recovery_attempts: 0,
            authenticated_user: ctx.auth().authenticated_user.clone(),
            authenticated_roles: ctx.auth().authenticated_roles.clone(),
            assumed_role: ctx.auth().assumed_role.clone(),
        };

        if workflow.temp_kind == Some(TempWorkflowKind::Transaction) {
            return Ok(InitOutcome::Ready {
                status,
                buffered_inputs: Some(args.clone()),
            });
        }

        // The status row must exist before any operation result refers to
        // it, so these writes are synchronous.
        let existing = self
            .inner
            .system_db
            .insert_workflow_status(&status, ctx.is_recovering())
            .await?;
        if let Some(existing) = existing {
            if let Some(outcome) = existing.outcome() {
                debug!(workflow_id = %ctx.workflow_id(), "workflow already finished, replaying record");
                return Ok(InitOutcome::AlreadyFinished(outcome));
            }
        }
        self.inner
            .system_db
            .update_workflow_inputs(ctx.workflow_id(), args)
            .await?;

        Ok(InitOutcome::Ready {
            status,
            buffered_inputs: None,
        })
    }

    /// Run the workflow body and persist its terminal state
    pub(crate) async fn execute_workflow(
        &self,
        ctx: WorkflowContext,
        workflow: Arc<RegisteredWorkflow>,
        instance: Option<InstanceHandle>,
        args: serde_json::Value,
        mut status: WorkflowStatusRecord,
        buffered_inputs: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, DurableError> {
        let workflow_id = ctx.workflow_id().to_string();
        let span = tracing::info_span!(
            "workflow",
            workflow_id = %workflow_id,
            name = %workflow.name,
            operation_type = "workflow",
        );

        let result = (workflow.func)(ctx, instance, args).instrument(span).await;
        match result {
            Ok(output) => {
                status.status = WorkflowStatus::Success;
                status.output = Some(output.clone());
                self.buffer_status(status, buffered_inputs);
                Ok(output)
            }
            Err(DurableError::ConflictingWorkflowId(_)) => {
                // Another executor is running (or has run) this id; do not
                // record anything, converge on that execution's result.
                warn!(workflow_id = %workflow_id, "workflow id conflict, awaiting existing execution");
                let outcome = self
                    .inner
                    .system_db
                    .await_workflow_result(&workflow_id)
                    .await?;
                outcome.into_result(&workflow_id, 0)
            }
            Err(err) => {
                status.status = WorkflowStatus::Error;
                status.error = Some(SerializedError::from_durable(&err).to_value());
                // Errors are written synchronously; only successes buffer.
                if let Some(inputs) = &buffered_inputs {
                    self.inner
                        .system_db
                        .insert_workflow_status(&status, false)
                        .await?;
                    self.inner
                        .system_db
                        .update_workflow_inputs(&workflow_id, inputs)
                        .await?;
                }
                self.inner.system_db.update_workflow_status(&status).await?;
                Err(err)
            }
        }
    }

    fn buffer_status(
        &self,
        status: WorkflowStatusRecord,
        inputs: Option<serde_json::Value>,
    ) {
        let mut buffer = self.inner.status_buffer.lock();
        buffer.insert(status.workflow_id.clone(), BufferedStatus { status, inputs });
    }
}

impl EngineInner {
    /// Drain the status buffer to the system database; entries that fail
    /// to write are put back for the next pass.
    async fn flush_buffer(inner: &Arc<EngineInner>) {
        let drained: Vec<BufferedStatus> = {
            let mut buffer = inner.status_buffer.lock();
            buffer.drain().map(|(_, entry)| entry).collect()
        };

        for entry in drained {
            if let Err(err) = Self::flush_entry(inner, &entry).await {
                warn!(
                    workflow_id = %entry.status.workflow_id,
                    %err,
                    "failed to flush workflow status, will retry"
                );
                inner
                    .status_buffer
                    .lock()
                    .entry(entry.status.workflow_id.clone())
                    .or_insert(entry);
            }
        }
    }

    async fn flush_entry(
        inner: &Arc<EngineInner>,
        entry: &BufferedStatus,
    ) -> Result<(), DurableError> {
        if let Some(inputs) = &entry.inputs {
            // Single-transaction workflow: the row may not exist yet.
            inner
                .system_db
                .insert_workflow_status(&entry.status, false)
                .await?;
            inner
                .system_db
                .update_workflow_inputs(&entry.status.workflow_id, inputs)
                .await?;
        }
        inner.system_db.update_workflow_status(&entry.status).await?;
        Ok(())
    }
}

/// Check the caller's roles against a function's requirements, returning
/// the role assumed for the call
pub(crate) fn check_required_roles(
    name: &str,
    required: &[String],
    auth: &AuthContext,
) -> Result<Option<String>, DurableError> {
    if required.is_empty() {
        return Ok(None);
    }
    match auth
        .authenticated_roles
        .iter()
        .find(|role| required.contains(*role))
    {
        Some(role) => Ok(Some(role.clone())),
        None => Err(DurableError::Unauthorized {
            name: name.to_string(),
            required: required.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_required_roles() {
        let auth = AuthContext::new("alice", vec!["admin".to_string(), "ops".to_string()]);

        let assumed =
            check_required_roles("wf", &["ops".to_string()], &auth).expect("should authorize");
        assert_eq!(assumed, Some("ops".to_string()));

        assert!(check_required_roles("wf", &[], &auth).unwrap().is_none());

        let denied = check_required_roles("wf", &["root".to_string()], &auth);
        assert!(matches!(denied, Err(DurableError::Unauthorized { .. })));
    }

    #[test]
    fn test_engine_config_builders() {
        let config = EngineConfig::default()
            .with_app_id("orders")
            .with_executor_id("exec-1")
            .with_max_recovery_attempts(3);

        assert_eq!(config.app_id.as_deref(), Some("orders"));
        assert_eq!(config.executor_id, "exec-1");
        assert_eq!(config.max_recovery_attempts, 3);
    }
}
