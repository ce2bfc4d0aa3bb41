//! Registry of durable functions
//!
//! Maps logical names to type-erased workflow, step, and transaction
//! functions, plus the class/instance bindings recovery uses to re-attach
//! non-serialized receivers. All registration happens before
//! [`WorkflowEngine::launch`](crate::engine::executor::WorkflowEngine::launch)
//! freezes the registry; lookups afterwards are read-only.
//!
//! Registering a step or transaction also registers a synthetic workflow
//! named `"<temp>.{name}"`, so a bare call outside any workflow still runs
//! under a (single-operation) workflow umbrella.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use tracing::debug;

use crate::engine::step::StepContext;
use crate::error::DurableError;
use crate::persistence::app::{IsolationLevel, TxnError, TxnSession};
use crate::reliability::StepRetryPolicy;
use crate::workflow::context::WorkflowContext;

/// Name of the synthetic workflow that wraps bare `send` calls
pub const TEMP_SEND_WORKFLOW: &str = "<temp>.temp_send_workflow";

/// A registered instance receiver; never serialized, re-bound on recovery
pub type InstanceHandle = Arc<dyn Any + Send + Sync>;

type WorkflowFuture = BoxFuture<'static, Result<serde_json::Value, DurableError>>;

pub(crate) type ErasedWorkflowFn = Arc<
    dyn Fn(WorkflowContext, Option<InstanceHandle>, serde_json::Value) -> WorkflowFuture
        + Send
        + Sync,
>;

pub(crate) type ErasedStepFn = Arc<
    dyn Fn(StepContext, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, anyhow::Error>>
        + Send
        + Sync,
>;

pub(crate) type ErasedTransactionFn = Arc<
    dyn for<'a> Fn(
            &'a mut TxnSession,
            serde_json::Value,
        ) -> BoxFuture<'a, Result<serde_json::Value, TxnError>>
        + Send
        + Sync,
>;

/// Which operation a synthetic temp workflow wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TempWorkflowKind {
    Step,
    Transaction,
    Send,
}

pub(crate) struct RegisteredWorkflow {
    pub(crate) name: String,
    pub(crate) class_name: Option<String>,
    pub(crate) required_roles: Vec<String>,
    pub(crate) temp_kind: Option<TempWorkflowKind>,
    pub(crate) func: ErasedWorkflowFn,
}

pub(crate) struct RegisteredStep {
    pub(crate) name: String,
    pub(crate) policy: StepRetryPolicy,
    pub(crate) required_roles: Vec<String>,
    pub(crate) func: ErasedStepFn,
}

pub(crate) struct RegisteredTransaction {
    pub(crate) name: String,
    pub(crate) isolation: IsolationLevel,
    pub(crate) required_roles: Vec<String>,
    pub(crate) func: ErasedTransactionFn,
}

#[derive(Debug, Deserialize)]
struct SendArgs {
    destination_id: String,
    message: serde_json::Value,
    #[serde(default)]
    topic: Option<String>,
}

/// Name→function tables for everything the engine can run
pub struct Registry {
    workflows: HashMap<String, Arc<RegisteredWorkflow>>,
    steps: HashMap<String, Arc<RegisteredStep>>,
    transactions: HashMap<String, Arc<RegisteredTransaction>>,
    classes: HashMap<String, InstanceHandle>,
    instances: HashMap<String, InstanceHandle>,
}

impl Registry {
    /// Create a registry with the built-in temp send workflow
    pub fn new() -> Self {
        let mut registry = Self {
            workflows: HashMap::new(),
            steps: HashMap::new(),
            transactions: HashMap::new(),
            classes: HashMap::new(),
            instances: HashMap::new(),
        };

        registry.insert_workflow(RegisteredWorkflow {
            name: TEMP_SEND_WORKFLOW.to_string(),
            class_name: None,
            required_roles: vec![],
            temp_kind: Some(TempWorkflowKind::Send),
            func: Arc::new(|ctx, _instance, args| {
                async move {
                    let send_args: SendArgs = serde_json::from_value(args)?;
                    ctx.send(
                        &send_args.destination_id,
                        send_args.message,
                        send_args.topic.as_deref(),
                    )
                    .await?;
                    Ok(serde_json::Value::Null)
                }
                .boxed()
            }),
        });
        registry
    }

    /// Register a workflow function
    pub fn workflow<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(WorkflowContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, DurableError>> + Send + 'static,
    {
        self.workflow_with_roles(name, vec![], f);
    }

    /// Register a workflow function that requires one of the given roles
    pub fn workflow_with_roles<F, Fut>(
        &mut self,
        name: impl Into<String>,
        required_roles: Vec<String>,
        f: F,
    ) where
        F: Fn(WorkflowContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, DurableError>> + Send + 'static,
    {
        let name = name.into();
        self.insert_workflow(RegisteredWorkflow {
            name: name.clone(),
            class_name: None,
            required_roles,
            temp_kind: None,
            func: Arc::new(move |ctx, _instance, args| f(ctx, args).boxed()),
        });
    }

    /// Register a workflow bound to a configured instance
    ///
    /// The instance is passed out-of-band and never serialized; recovery
    /// resolves it from the instance (or class) map by the names recorded
    /// in the status row.
    pub fn method_workflow<F, Fut>(
        &mut self,
        name: impl Into<String>,
        class_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(WorkflowContext, InstanceHandle, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, DurableError>> + Send + 'static,
    {
        let name = name.into();
        let class_name = class_name.into();
        let registered_name = name.clone();
        self.insert_workflow(RegisteredWorkflow {
            name: name.clone(),
            class_name: Some(class_name),
            required_roles: vec![],
            temp_kind: None,
            func: Arc::new(move |ctx, instance, args| match instance {
                Some(instance) => f(ctx, instance, args).boxed(),
                None => {
                    let name = registered_name.clone();
                    async move {
                        Err(DurableError::InvalidOperation(format!(
                            "method workflow {name} invoked without an instance"
                        )))
                    }
                    .boxed()
                }
            }),
        });
    }

    /// Register a step function and its `"<temp>.{name}"` workflow
    pub fn step<F, Fut>(&mut self, name: impl Into<String>, policy: StepRetryPolicy, f: F)
    where
        F: Fn(StepContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, anyhow::Error>> + Send + 'static,
    {
        self.step_with_roles(name, policy, vec![], f);
    }

    /// Register a step function that requires one of the given roles
    pub fn step_with_roles<F, Fut>(
        &mut self,
        name: impl Into<String>,
        policy: StepRetryPolicy,
        required_roles: Vec<String>,
        f: F,
    ) where
        F: Fn(StepContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, anyhow::Error>> + Send + 'static,
    {
        let name = name.into();
        self.steps.insert(
            name.clone(),
            Arc::new(RegisteredStep {
                name: name.clone(),
                policy,
                required_roles,
                func: Arc::new(move |ctx, args| f(ctx, args).boxed()),
            }),
        );
        debug!(step = %name, "registered step");
        self.insert_temp_workflow(name, TempWorkflowKind::Step);
    }

    /// Register a transaction function and its `"<temp>.{name}"` workflow
    ///
    /// The body receives the open [`TxnSession`] and must return a boxed
    /// future borrowing it, e.g. `|session, args| async move { .. }.boxed()`.
    pub fn transaction<F>(&mut self, name: impl Into<String>, isolation: IsolationLevel, f: F)
    where
        F: for<'a> Fn(
                &'a mut TxnSession,
                serde_json::Value,
            ) -> BoxFuture<'a, Result<serde_json::Value, TxnError>>
            + Send
            + Sync
            + 'static,
    {
        self.transaction_with_roles(name, isolation, vec![], f);
    }

    /// Register a transaction function that requires one of the given roles
    pub fn transaction_with_roles<F>(
        &mut self,
        name: impl Into<String>,
        isolation: IsolationLevel,
        required_roles: Vec<String>,
        f: F,
    ) where
        F: for<'a> Fn(
                &'a mut TxnSession,
                serde_json::Value,
            ) -> BoxFuture<'a, Result<serde_json::Value, TxnError>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        self.transactions.insert(
            name.clone(),
            Arc::new(RegisteredTransaction {
                name: name.clone(),
                isolation,
                required_roles,
                func: Arc::new(f),
            }),
        );
        debug!(transaction = %name, "registered transaction");
        self.insert_temp_workflow(name, TempWorkflowKind::Transaction);
    }

    /// Register a configured instance under `"{class_name}/{config_name}"`
    pub fn register_instance(
        &mut self,
        class_name: &str,
        config_name: &str,
        instance: InstanceHandle,
    ) {
        self.instances
            .insert(format!("{class_name}/{config_name}"), instance);
    }

    /// Register a class-level binding (shared receiver without a config)
    pub fn register_class(&mut self, class_name: &str, instance: InstanceHandle) {
        self.classes.insert(class_name.to_string(), instance);
    }

    /// Number of registered workflows (synthetic ones included)
    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    /// Whether a workflow name is registered
    pub fn contains_workflow(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    fn insert_workflow(&mut self, workflow: RegisteredWorkflow) {
        debug!(workflow = %workflow.name, "registered workflow");
        self.workflows
            .insert(workflow.name.clone(), Arc::new(workflow));
    }

    fn insert_temp_workflow(&mut self, wrapped: String, kind: TempWorkflowKind) {
        let temp_name = temp_workflow_name(&wrapped);
        self.insert_workflow(RegisteredWorkflow {
            name: temp_name,
            class_name: None,
            required_roles: vec![],
            temp_kind: Some(kind),
            func: Arc::new(move |ctx, _instance, args| {
                let wrapped = wrapped.clone();
                async move {
                    match kind {
                        TempWorkflowKind::Step => ctx.run_step(&wrapped, args).await,
                        TempWorkflowKind::Transaction => {
                            ctx.run_transaction(&wrapped, args).await
                        }
                        TempWorkflowKind::Send => unreachable!("send has its own temp workflow"),
                    }
                }
                .boxed()
            }),
        });
    }

    pub(crate) fn get_workflow(&self, name: &str) -> Option<Arc<RegisteredWorkflow>> {
        self.workflows.get(name).cloned()
    }

    pub(crate) fn get_step(&self, name: &str) -> Option<Arc<RegisteredStep>> {
        self.steps.get(name).cloned()
    }

    pub(crate) fn get_transaction(&self, name: &str) -> Option<Arc<RegisteredTransaction>> {
        self.transactions.get(name).cloned()
    }

    pub(crate) fn get_instance(&self, class_name: &str, config_name: &str) -> Option<InstanceHandle> {
        self.instances
            .get(&format!("{class_name}/{config_name}"))
            .cloned()
    }

    pub(crate) fn get_class(&self, class_name: &str) -> Option<InstanceHandle> {
        self.classes.get(class_name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("transactions", &self.transactions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Name of the synthetic workflow wrapping a bare step/transaction call
pub(crate) fn temp_workflow_name(name: &str) -> String {
    format!("<temp>.{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_workflow() {
        let mut registry = Registry::new();
        registry.workflow("noop", |_ctx, args| async move { Ok(args) });

        assert!(registry.contains_workflow("noop"));
        assert!(!registry.contains_workflow("unknown"));
        assert!(registry.get_workflow("noop").is_some());
    }

    #[test]
    fn test_step_registers_temp_workflow() {
        let mut registry = Registry::new();
        registry.step("fetch", StepRetryPolicy::default(), |_ctx, args| async move {
            Ok(args)
        });

        assert!(registry.get_step("fetch").is_some());
        assert!(registry.contains_workflow("<temp>.fetch"));
        assert_eq!(
            registry.get_workflow("<temp>.fetch").unwrap().temp_kind,
            Some(TempWorkflowKind::Step)
        );
    }

    #[test]
    fn test_transaction_registers_temp_workflow() {
        let mut registry = Registry::new();
        registry.transaction("reserve", IsolationLevel::Serializable, |_session, args| {
            async move { Ok(args) }.boxed()
        });

        assert!(registry.get_transaction("reserve").is_some());
        assert_eq!(
            registry.get_workflow("<temp>.reserve").unwrap().temp_kind,
            Some(TempWorkflowKind::Transaction)
        );
    }

    #[test]
    fn test_temp_send_workflow_is_builtin() {
        let registry = Registry::new();
        assert!(registry.contains_workflow(TEMP_SEND_WORKFLOW));
    }

    #[test]
    fn test_instance_bindings() {
        let mut registry = Registry::new();
        let instance: InstanceHandle = Arc::new(42_u32);

        registry.register_instance("Checkout", "eu", instance.clone());
        registry.register_class("Checkout", instance);

        assert!(registry.get_instance("Checkout", "eu").is_some());
        assert!(registry.get_instance("Checkout", "us").is_none());
        assert!(registry.get_class("Checkout").is_some());
    }
}
