//! Coordination primitives: send / recv / set_event / get_event
//!
//! Each primitive is semantically a step: it reserves a function id,
//! consults the database, and returns the recorded value on replay. The
//! timed waits (`recv`, `get_event`) reserve a second function id for the
//! durable timeout sleep so a replay reproduces the same wake pattern.

use std::time::Duration;

use tracing::Instrument;

use crate::engine::executor::WorkflowEngine;
use crate::error::DurableError;
use crate::persistence::store::GetEventCaller;
use crate::workflow::context::WorkflowContext;

fn ensure_not_in_step(ctx: &WorkflowContext, operation: &str) -> Result<(), DurableError> {
    if ctx.is_in_step() {
        return Err(DurableError::InvalidOperation(format!(
            "{operation}() must be called from workflow code, not from within a step"
        )));
    }
    Ok(())
}

pub(crate) async fn send(
    engine: &WorkflowEngine,
    ctx: &WorkflowContext,
    destination_id: &str,
    message: serde_json::Value,
    topic: Option<&str>,
) -> Result<(), DurableError> {
    ensure_not_in_step(ctx, "send")?;
    let function_id = ctx.next_function_id();
    let span = tracing::info_span!(
        "send",
        workflow_id = %ctx.workflow_id(),
        destination_id = %destination_id,
        function_id,
        operation_type = "step",
    );

    engine
        .system_db()
        .send(ctx.workflow_id(), function_id, destination_id, &message, topic)
        .instrument(span)
        .await?;
    Ok(())
}

pub(crate) async fn recv(
    engine: &WorkflowEngine,
    ctx: &WorkflowContext,
    topic: Option<&str>,
    timeout: Duration,
) -> Result<Option<serde_json::Value>, DurableError> {
    ensure_not_in_step(ctx, "recv")?;
    let function_id = ctx.next_function_id();
    // Reserved for the durable timeout sleep.
    let timeout_function_id = ctx.next_function_id();
    let span = tracing::info_span!(
        "recv",
        workflow_id = %ctx.workflow_id(),
        function_id,
        operation_type = "step",
    );

    Ok(engine
        .system_db()
        .recv(
            ctx.workflow_id(),
            function_id,
            timeout_function_id,
            topic,
            timeout,
        )
        .instrument(span)
        .await?)
}

pub(crate) async fn set_event(
    engine: &WorkflowEngine,
    ctx: &WorkflowContext,
    key: &str,
    value: serde_json::Value,
) -> Result<(), DurableError> {
    ensure_not_in_step(ctx, "set_event")?;
    let function_id = ctx.next_function_id();
    let span = tracing::info_span!(
        "set_event",
        workflow_id = %ctx.workflow_id(),
        key = %key,
        function_id,
        operation_type = "step",
    );

    engine
        .system_db()
        .set_event(ctx.workflow_id(), function_id, key, &value)
        .instrument(span)
        .await?;
    Ok(())
}

pub(crate) async fn get_event(
    engine: &WorkflowEngine,
    ctx: &WorkflowContext,
    target_workflow_id: &str,
    key: &str,
    timeout: Duration,
) -> Result<Option<serde_json::Value>, DurableError> {
    ensure_not_in_step(ctx, "get_event")?;
    let function_id = ctx.next_function_id();
    let timeout_function_id = ctx.next_function_id();
    let span = tracing::info_span!(
        "get_event",
        workflow_id = %ctx.workflow_id(),
        target_workflow_id = %target_workflow_id,
        key = %key,
        function_id,
        operation_type = "step",
    );

    let caller = GetEventCaller {
        workflow_id: ctx.workflow_id().to_string(),
        function_id,
        timeout_function_id,
    };
    Ok(engine
        .system_db()
        .get_event(target_workflow_id, key, timeout, Some(caller))
        .instrument(span)
        .await?)
}
