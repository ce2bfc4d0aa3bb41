//! Transaction engine
//!
//! Wraps a user database transaction with the OAOO check and a retry loop
//! for serialization failures. The transaction-result row is written
//! inside the same database transaction as the user's own writes, so
//! replay never double-applies them.

use std::time::Duration;

use tracing::{debug, info, warn, Instrument};

use crate::engine::executor::{check_required_roles, WorkflowEngine};
use crate::engine::registry::RegisteredTransaction;
use crate::error::{DurableError, SerializedError};
use crate::persistence::app::{TransactionRecord, TxnError, TxnSession};
use crate::workflow::context::WorkflowContext;

const INITIAL_RETRY_WAIT: Duration = Duration::from_millis(1);
const RETRY_BACKOFF_FACTOR: f64 = 1.5;
const MAX_RETRY_WAIT: Duration = Duration::from_secs(2);

enum AttemptOutcome {
    /// The user function ran and its result committed
    Completed(serde_json::Value),

    /// A record from a previous execution resolved the call
    Replayed(Result<serde_json::Value, DurableError>),
}

/// Run a registered transaction under the calling workflow
pub(crate) async fn invoke_transaction(
    engine: &WorkflowEngine,
    ctx: &WorkflowContext,
    name: &str,
    args: serde_json::Value,
) -> Result<serde_json::Value, DurableError> {
    let transaction =
        engine
            .registry()
            .get_transaction(name)
            .ok_or_else(|| DurableError::FunctionNotFound {
                workflow_id: ctx.workflow_id().to_string(),
                name: name.to_string(),
            })?;

    if ctx.is_in_step() {
        return Err(DurableError::InvalidOperation(
            "transactions cannot be called from within a step".to_string(),
        ));
    }

    check_required_roles(name, &transaction.required_roles, ctx.auth())?;

    let function_id = ctx.next_function_id();
    let workflow_id = ctx.workflow_id().to_string();
    let span = tracing::info_span!(
        "transaction",
        workflow_id = %workflow_id,
        name = %name,
        function_id,
        operation_type = "transaction",
    );

    async {
        let mut retry_wait = INITIAL_RETRY_WAIT;
        loop {
            let mut session =
                TxnSession::begin(engine.app_db().as_ref(), transaction.isolation).await?;

            let attempt = run_attempt(
                engine,
                &mut session,
                &transaction,
                &workflow_id,
                function_id,
                &args,
            )
            .await;

            match attempt {
                Ok(AttemptOutcome::Completed(output)) => return Ok(output),
                Ok(AttemptOutcome::Replayed(result)) => {
                    rollback_quietly(&mut session).await;
                    if result.is_ok() {
                        debug!("returning recorded transaction result");
                    }
                    return result;
                }
                Err(TxnError::Database(db_err)) => {
                    rollback_quietly(&mut session).await;
                    if db_err.is_serialization_failure() {
                        info!(
                            retry_wait_seconds = retry_wait.as_secs_f64(),
                            "Transaction Serialization Failure"
                        );
                        tokio::time::sleep(retry_wait).await;
                        retry_wait = Duration::from_secs_f64(
                            (retry_wait.as_secs_f64() * RETRY_BACKOFF_FACTOR)
                                .min(MAX_RETRY_WAIT.as_secs_f64()),
                        );
                        continue;
                    }
                    if db_err.is_unique_violation() {
                        // Another executor recorded this function id first.
                        return Err(DurableError::ConflictingWorkflowId(workflow_id.clone()));
                    }
                    // Other database-layer failures re-raise unrecorded.
                    return Err(DurableError::AppDb(db_err));
                }
                Err(TxnError::App(app_err)) => {
                    rollback_quietly(&mut session).await;
                    let serialized = SerializedError::from_anyhow(&app_err);
                    let mut record = TransactionRecord::new(&workflow_id, function_id);
                    record.error = Some(serialized.to_value());
                    record.executor_id = Some(engine.config().executor_id.clone());
                    // The failing transaction is gone; record in a fresh one.
                    if let Err(record_err) =
                        engine.app_db().record_transaction_error(&record).await
                    {
                        warn!(%record_err, "failed to record transaction error");
                    }
                    return Err(DurableError::Application(serialized));
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// One transaction attempt: OAOO check, user function, result insert,
/// commit — all inside a single database transaction.
async fn run_attempt(
    engine: &WorkflowEngine,
    session: &mut TxnSession,
    transaction: &RegisteredTransaction,
    workflow_id: &str,
    function_id: u64,
    args: &serde_json::Value,
) -> Result<AttemptOutcome, TxnError> {
    if let Some(outcome) = session
        .check_transaction_execution(workflow_id, function_id)
        .await?
    {
        return Ok(AttemptOutcome::Replayed(
            outcome.into_result(workflow_id, function_id),
        ));
    }

    let output = (transaction.func)(session, args.clone()).await?;

    let mut record = TransactionRecord::new(workflow_id, function_id);
    record.output = Some(output.clone());
    record.executor_id = Some(engine.config().executor_id.clone());
    session.record_output(&record).await?;
    session.commit().await?;

    Ok(AttemptOutcome::Completed(output))
}

async fn rollback_quietly(session: &mut TxnSession) {
    if let Err(err) = session.rollback().await {
        warn!(%err, "transaction rollback failed");
    }
}
