//! # Durable Execution Core
//!
//! A PostgreSQL-backed workflow engine that lets application code express
//! long-running, fault-tolerant business logic as ordinary async function
//! calls. Every sub-operation a workflow performs is checkpointed to a
//! backing database; after a crash or restart, workflows resume from where
//! they left off with once-and-only-once effects on recorded operations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (init/execute workflows, conflict convergence, recovery)   │
//! └─────────────────────────────────────────────────────────────┘
//!                │                             │
//!                ▼                             ▼
//! ┌───────────────────────────┐  ┌───────────────────────────────┐
//! │       SystemDatabase       │  │          AppDatabase          │
//! │ (statuses, inputs, steps,  │  │ (user transactions + atomic   │
//! │  messages, events)         │  │  transaction-result records)  │
//! └───────────────────────────┘  └───────────────────────────────┘
//! ```
//!
//! ## Three kinds of durable operations
//!
//! - **Workflows** orchestrate; each sub-operation they invoke is keyed by
//!   a per-workflow function id assigned in body order, which makes
//!   replays deterministic.
//! - **Steps** wrap non-transactional side effects, with optional
//!   exponential-backoff retry.
//! - **Transactions** wrap a single application-database transaction; the
//!   result record commits atomically with the user's own writes, and
//!   serialization conflicts retry transparently.
//!
//! ## Example
//!
//! ```ignore
//! use oxbow_durable::prelude::*;
//!
//! let mut registry = Registry::new();
//! registry.step("charge", StepRetryPolicy::retrying(), |_ctx, args| async move {
//!     Ok(serde_json::json!({ "charged": args["amount"] }))
//! });
//! registry.workflow("checkout", |ctx, args| async move {
//!     let charged = ctx.run_step("charge", args).await?;
//!     Ok(charged)
//! });
//!
//! let engine = WorkflowEngine::launch(
//!     registry,
//!     Arc::new(MemorySystemDatabase::new()),
//!     Arc::new(MemoryAppDatabase::new()),
//!     EngineConfig::default(),
//! );
//!
//! let handle = engine
//!     .start_workflow("checkout", serde_json::json!({ "amount": 42 }), StartOptions::default())
//!     .await?;
//! let output = handle.result().await?;
//! ```

pub mod engine;
pub mod error;
pub mod persistence;
pub mod reliability;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        EngineConfig, InstanceHandle, Registry, StartOptions, StepContext, WorkflowEngine,
    };
    pub use crate::error::{DurableError, SerializedError};
    pub use crate::persistence::{
        AppDatabase, IsolationLevel, MemoryAppDatabase, MemorySystemDatabase,
        PostgresAppDatabase, PostgresSystemDatabase, SystemDatabase, TxnError, TxnSession,
        WorkflowStatus,
    };
    pub use crate::reliability::StepRetryPolicy;
    pub use crate::workflow::{AuthContext, WorkflowContext, WorkflowHandle};
}

// Re-export key types at crate root
pub use engine::{
    EngineConfig, InstanceHandle, Registry, StartOptions, StepContext, WorkflowEngine,
    TEMP_SEND_WORKFLOW,
};
pub use error::{DurableError, SerializedError};
pub use persistence::{
    AppDatabase, AppDbError, AppTransaction, GetEventCaller, IsolationLevel, MemoryAppDatabase,
    MemoryAppTransaction, MemorySystemDatabase, OperationResultRecord, PostgresAppDatabase,
    PostgresAppTransaction, PostgresSystemDatabase, RecordedOutcome, StoreError, SystemDatabase,
    TransactionRecord, TxnError, TxnSession, WorkflowStatus, WorkflowStatusRecord,
};
pub use reliability::StepRetryPolicy;
pub use workflow::{AuthContext, WorkflowContext, WorkflowHandle};
