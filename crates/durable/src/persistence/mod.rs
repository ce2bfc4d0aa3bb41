//! Persistence layer: system database, application database, backends

pub mod app;
pub mod memory;
pub mod postgres;
pub mod store;

pub use app::{
    AppDatabase, AppDbError, AppTransaction, IsolationLevel, TransactionRecord, TxnError,
    TxnSession,
};
pub use memory::{MemoryAppDatabase, MemoryAppTransaction, MemorySystemDatabase};
pub use postgres::{PostgresAppDatabase, PostgresAppTransaction, PostgresSystemDatabase};
pub use store::{
    GetEventCaller, OperationResultRecord, RecordedOutcome, StoreError, SystemDatabase,
    WorkflowStatus, WorkflowStatusRecord,
};
