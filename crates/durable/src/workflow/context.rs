//! Per-invocation workflow context
//!
//! The context is the ambient state of one workflow execution: the
//! workflow id, the monotonically increasing function-id counter keying
//! every recorded sub-operation, the reserved id for the next child
//! workflow, and the auth/request data that travels with the call. Each
//! execution (including each child workflow) gets its own context; clones
//! share the same underlying state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::executor::WorkflowEngine;
use crate::engine::{messaging, step, transaction};
use crate::error::DurableError;
use crate::workflow::handle::WorkflowHandle;

/// Caller identity carried through workflows and restored on recovery
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub authenticated_user: Option<String>,
    pub authenticated_roles: Vec<String>,
    pub assumed_role: Option<String>,
}

impl AuthContext {
    /// An authenticated caller with the given roles
    pub fn new(user: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            authenticated_user: Some(user.into()),
            authenticated_roles: roles,
            assumed_role: None,
        }
    }
}

pub(crate) struct ContextState {
    pub(crate) workflow_id: String,
    pub(crate) parent_workflow_id: Option<String>,
    pub(crate) function_id: AtomicU64,
    pub(crate) next_workflow_id: Mutex<Option<String>>,
    pub(crate) in_step: AtomicBool,
    pub(crate) in_recovery: bool,
    pub(crate) auth: AuthContext,
    pub(crate) request: Option<serde_json::Value>,
}

/// Handle to the current workflow execution
///
/// Passed to every workflow function; all durable sub-operations go
/// through it so their position in the workflow (the function id) is
/// assigned in deterministic body order.
#[derive(Clone)]
pub struct WorkflowContext {
    pub(crate) engine: WorkflowEngine,
    pub(crate) state: Arc<ContextState>,
}

impl WorkflowContext {
    pub(crate) fn new_root(
        engine: WorkflowEngine,
        workflow_id: String,
        auth: AuthContext,
        request: Option<serde_json::Value>,
        in_recovery: bool,
    ) -> Self {
        Self {
            engine,
            state: Arc::new(ContextState {
                workflow_id,
                parent_workflow_id: None,
                function_id: AtomicU64::new(0),
                next_workflow_id: Mutex::new(None),
                in_step: AtomicBool::new(false),
                in_recovery,
                auth,
                request,
            }),
        }
    }

    /// Fork a child context: fresh function-id counter, inherited auth and
    /// request, this workflow as the parent.
    pub(crate) fn create_child(
        &self,
        child_workflow_id: String,
        assumed_role: Option<String>,
    ) -> Self {
        let mut auth = self.state.auth.clone();
        auth.assumed_role = assumed_role;
        Self {
            engine: self.engine.clone(),
            state: Arc::new(ContextState {
                workflow_id: child_workflow_id,
                parent_workflow_id: Some(self.state.workflow_id.clone()),
                function_id: AtomicU64::new(0),
                next_workflow_id: Mutex::new(None),
                in_step: AtomicBool::new(false),
                in_recovery: false,
                auth,
                request: self.state.request.clone(),
            }),
        }
    }

    /// Generate a fresh globally unique workflow id
    pub(crate) fn assign_workflow_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Reserve the next function id; ids start at 1 and follow body order
    pub(crate) fn next_function_id(&self) -> u64 {
        self.state.function_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn take_next_workflow_id(&self) -> Option<String> {
        self.state.next_workflow_id.lock().take()
    }

    pub(crate) fn is_in_step(&self) -> bool {
        self.state.in_step.load(Ordering::SeqCst)
    }

    /// Mark this context as inside a step until the scope drops
    pub(crate) fn enter_step(&self) -> StepScope<'_> {
        let prev = self.state.in_step.swap(true, Ordering::SeqCst);
        StepScope {
            flag: &self.state.in_step,
            prev,
        }
    }

    /// Id of the current workflow
    pub fn workflow_id(&self) -> &str {
        &self.state.workflow_id
    }

    /// Id of the parent workflow, if this is a child
    pub fn parent_workflow_id(&self) -> Option<&str> {
        self.state.parent_workflow_id.as_deref()
    }

    /// Whether this execution was dispatched by recovery
    pub fn is_recovering(&self) -> bool {
        self.state.in_recovery
    }

    /// Caller identity for this execution
    pub fn auth(&self) -> &AuthContext {
        &self.state.auth
    }

    /// The request that originated the workflow, if one was attached
    pub fn request(&self) -> Option<&serde_json::Value> {
        self.state.request.as_ref()
    }

    /// Override the id of the next child workflow started from this one.
    ///
    /// Without an override, the k-th child call gets the deterministic id
    /// `"{workflow_id}-{k}"`, so replays reuse persisted children.
    pub fn set_next_workflow_id(&self, workflow_id: impl Into<String>) {
        *self.state.next_workflow_id.lock() = Some(workflow_id.into());
    }

    // =========================================================================
    // Durable sub-operations
    // =========================================================================

    /// Run a child workflow in place and return its output
    pub async fn run_workflow(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        self.engine.run_child_workflow(self, name, args).await
    }

    /// Start a child workflow on the executor and return its handle
    pub async fn start_workflow(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<WorkflowHandle, DurableError> {
        self.engine.start_child_workflow(self, name, args).await
    }

    /// Run a registered step with once-and-only-once recording
    pub async fn run_step(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        step::invoke_step(&self.engine, self, name, args).await
    }

    /// Run a registered transaction with once-and-only-once recording
    pub async fn run_transaction(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        transaction::invoke_transaction(&self.engine, self, name, args).await
    }

    // =========================================================================
    // Coordination primitives
    // =========================================================================

    /// Append a message to another workflow's queue
    pub async fn send(
        &self,
        destination_id: &str,
        message: serde_json::Value,
        topic: Option<&str>,
    ) -> Result<(), DurableError> {
        messaging::send(&self.engine, self, destination_id, message, topic).await
    }

    /// Wait up to `timeout` for the next message on `topic`; `None` on
    /// timeout. Messages arrive in send order per `(destination, topic)`.
    pub async fn recv(
        &self,
        topic: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, DurableError> {
        messaging::recv(&self.engine, self, topic, timeout).await
    }

    /// Publish `key -> value` on this workflow and wake waiters
    pub async fn set_event(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), DurableError> {
        messaging::set_event(&self.engine, self, key, value).await
    }

    /// Wait up to `timeout` for another workflow's event value
    pub async fn get_event(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, DurableError> {
        messaging::get_event(&self.engine, self, target_workflow_id, key, timeout).await
    }
}

/// Scope marker restoring the in-step flag on exit
pub(crate) struct StepScope<'a> {
    flag: &'a AtomicBool,
    prev: bool,
}

impl Drop for StepScope<'_> {
    fn drop(&mut self) {
        self.flag.store(self.prev, Ordering::SeqCst);
    }
}
