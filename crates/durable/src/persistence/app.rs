//! Application-database seam for transactions
//!
//! The engine only needs a session abstraction that supports isolation
//! levels, a transaction-result table written inside the user transaction,
//! and SQLSTATE inspection for serialization-failure retry. User code
//! reaches the concrete session through [`TxnSession::as_any`].

use std::any::Any;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::store::RecordedOutcome;

/// SQLSTATE for a serialization conflict under SERIALIZABLE/REPEATABLE READ
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE for a unique-constraint violation
pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

/// Error from the application database
#[derive(Debug, Clone)]
pub struct AppDbError {
    /// Human-readable message
    pub message: String,

    /// Five-character SQLSTATE, when the backend reported one
    pub sqlstate: Option<String>,
}

impl std::fmt::Display for AppDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sqlstate {
            Some(sqlstate) => write!(
                f,
                "application database error [{sqlstate}]: {}",
                self.message
            ),
            None => write!(f, "application database error: {}", self.message),
        }
    }
}

impl std::error::Error for AppDbError {}

impl AppDbError {
    /// A database error with an SQLSTATE code
    pub fn with_sqlstate(message: impl Into<String>, sqlstate: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: Some(sqlstate.into()),
        }
    }

    /// A database error without a code
    pub fn database(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
        }
    }

    /// A synthetic serialization conflict (used by tests and fakes)
    pub fn serialization_conflict() -> Self {
        Self::with_sqlstate(
            "could not serialize access due to concurrent update",
            SQLSTATE_SERIALIZATION_FAILURE,
        )
    }

    /// A synthetic unique-constraint violation
    pub fn unique_violation(detail: impl Into<String>) -> Self {
        Self::with_sqlstate(detail, SQLSTATE_UNIQUE_VIOLATION)
    }

    /// Whether this error is a retryable serialization conflict
    pub fn is_serialization_failure(&self) -> bool {
        self.sqlstate.as_deref() == Some(SQLSTATE_SERIALIZATION_FAILURE)
    }

    /// Whether this error is a unique-constraint violation
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some(SQLSTATE_UNIQUE_VIOLATION)
    }
}

/// Error surfaced by a user transaction body
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    /// An error from the database layer, retried when its SQLSTATE says so
    #[error(transparent)]
    Database(#[from] AppDbError),

    /// An error raised by the application logic itself
    #[error("{0}")]
    App(anyhow::Error),
}

/// Transaction isolation level set as the first in-transaction statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling of the level
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        Self::Serializable
    }
}

/// One row of the transaction-result table
///
/// Written inside the user transaction so the record and the user's own
/// writes commit atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub workflow_id: String,
    pub function_id: u64,
    pub output: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub txn_snapshot: String,
    pub txn_id: Option<String>,
    pub executor_id: Option<String>,
}

impl TransactionRecord {
    /// An empty record for the given OAOO key
    pub fn new(workflow_id: impl Into<String>, function_id: u64) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            function_id,
            output: None,
            error: None,
            txn_snapshot: String::new(),
            txn_id: None,
            executor_id: None,
        }
    }
}

/// A single open application-database transaction
#[async_trait]
pub trait AppTransaction: Send {
    /// Look up the transaction-result row for the OAOO key, within this
    /// transaction
    async fn check_transaction_execution(
        &mut self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<Option<RecordedOutcome>, AppDbError>;

    /// Insert the transaction-result row inside this transaction.
    /// A duplicate key surfaces as a unique-violation [`AppDbError`].
    async fn record_output(&mut self, record: &TransactionRecord) -> Result<(), AppDbError>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<(), AppDbError>;

    /// Roll the transaction back
    async fn rollback(self: Box<Self>) -> Result<(), AppDbError>;

    /// Access the concrete session type for user queries
    fn as_any(&mut self) -> &mut dyn Any;
}

/// Factory for application-database transactions
#[async_trait]
pub trait AppDatabase: Send + Sync + 'static {
    /// Open a transaction at the given isolation level. The isolation
    /// level must be applied before any other statement runs.
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn AppTransaction>, AppDbError>;

    /// Record an error outcome in its own transaction; the failed user
    /// transaction has already been rolled back. Recording the same key
    /// twice is a no-op.
    async fn record_transaction_error(
        &self,
        record: &TransactionRecord,
    ) -> Result<(), AppDbError>;
}

/// The session handle passed to user transaction bodies
///
/// Wraps the open [`AppTransaction`]; the engine drives OAOO bookkeeping
/// and commit/rollback, user code uses [`TxnSession::as_any`] (or
/// [`TxnSession::downcast_mut`]) to reach the backend session.
pub struct TxnSession {
    inner: Option<Box<dyn AppTransaction>>,
}

impl TxnSession {
    pub(crate) async fn begin(
        db: &dyn AppDatabase,
        isolation: IsolationLevel,
    ) -> Result<Self, AppDbError> {
        let inner = db.begin(isolation).await?;
        Ok(Self { inner: Some(inner) })
    }

    fn inner_mut(&mut self) -> &mut dyn AppTransaction {
        // The inner transaction is only taken by commit/rollback, after
        // which the session is never handed back to user code.
        self.inner
            .as_deref_mut()
            .expect("transaction session already finished")
    }

    pub(crate) async fn check_transaction_execution(
        &mut self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<Option<RecordedOutcome>, AppDbError> {
        self.inner_mut()
            .check_transaction_execution(workflow_id, function_id)
            .await
    }

    pub(crate) async fn record_output(
        &mut self,
        record: &TransactionRecord,
    ) -> Result<(), AppDbError> {
        self.inner_mut().record_output(record).await
    }

    pub(crate) async fn commit(&mut self) -> Result<(), AppDbError> {
        match self.inner.take() {
            Some(txn) => txn.commit().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn rollback(&mut self) -> Result<(), AppDbError> {
        match self.inner.take() {
            Some(txn) => txn.rollback().await,
            None => Ok(()),
        }
    }

    /// Access the concrete backend session
    pub fn as_any(&mut self) -> &mut dyn Any {
        self.inner_mut().as_any()
    }

    /// Downcast the backend session to a concrete type
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.as_any().downcast_mut::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        assert!(AppDbError::serialization_conflict().is_serialization_failure());
        assert!(AppDbError::unique_violation("dup").is_unique_violation());
        assert!(!AppDbError::database("boom").is_serialization_failure());
    }

    #[test]
    fn test_isolation_sql() {
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::default(), IsolationLevel::Serializable);
    }

    #[test]
    fn test_error_display_includes_sqlstate() {
        let err = AppDbError::serialization_conflict();
        assert!(err.to_string().contains("[40001]"));
    }
}
