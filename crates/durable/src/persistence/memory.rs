//! In-memory implementations of the system and application databases
//!
//! Primarily for testing. Data lives in process memory with the same
//! semantics as the PostgreSQL implementations: write-once terminal
//! statuses, unique operation keys, FIFO message queues per
//! `(destination, topic)`, and last-writer-wins events with wake-ups.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::app::{
    AppDatabase, AppDbError, AppTransaction, IsolationLevel, TransactionRecord,
};
use super::store::*;

/// How often waiters re-check state; wake-ups usually arrive sooner.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type QueueKey = (String, String);

/// In-memory implementation of [`SystemDatabase`]
///
/// # Example
///
/// ```
/// use oxbow_durable::MemorySystemDatabase;
///
/// let store = MemorySystemDatabase::new();
/// ```
pub struct MemorySystemDatabase {
    workflows: RwLock<HashMap<String, WorkflowStatusRecord>>,
    inputs: RwLock<HashMap<String, serde_json::Value>>,
    operations: RwLock<HashMap<(String, u64), OperationResultRecord>>,
    queues: Mutex<HashMap<QueueKey, VecDeque<serde_json::Value>>>,
    events: RwLock<HashMap<(String, String), serde_json::Value>>,
    message_notifies: Mutex<HashMap<QueueKey, Arc<Notify>>>,
    event_notifies: Mutex<HashMap<(String, String), Arc<Notify>>>,
    poll_interval: Duration,
}

impl MemorySystemDatabase {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            inputs: RwLock::new(HashMap::new()),
            operations: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            message_notifies: Mutex::new(HashMap::new()),
            event_notifies: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the waiter poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Number of workflow status rows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Recorded operation results for a workflow, ordered by function id
    pub fn operation_results(&self, workflow_id: &str) -> Vec<OperationResultRecord> {
        let operations = self.operations.read();
        let mut results: Vec<_> = operations
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.function_id);
        results
    }

    /// Number of queued (unconsumed) messages for a destination
    pub fn queued_message_count(&self, destination_id: &str) -> usize {
        self.queues
            .lock()
            .iter()
            .filter(|((dest, _), _)| dest == destination_id)
            .map(|(_, q)| q.len())
            .sum()
    }

    fn message_notify(&self, key: &QueueKey) -> Arc<Notify> {
        self.message_notifies
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn event_notify(&self, key: &(String, String)) -> Arc<Notify> {
        self.event_notifies
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn pop_message(&self, key: &QueueKey) -> Option<serde_json::Value> {
        let mut queues = self.queues.lock();
        queues.get_mut(key).and_then(|q| q.pop_front())
    }

    fn try_record(&self, result: OperationResultRecord) -> Result<(), StoreError> {
        let mut operations = self.operations.write();
        let key = (result.workflow_id.clone(), result.function_id);
        if operations.contains_key(&key) {
            return Err(StoreError::DuplicateOperation {
                workflow_id: result.workflow_id.clone(),
                function_id: result.function_id,
            });
        }
        operations.insert(key, result);
        Ok(())
    }

    fn recorded_outcome(&self, workflow_id: &str, function_id: u64) -> Option<RecordedOutcome> {
        let operations = self.operations.read();
        operations
            .get(&(workflow_id.to_string(), function_id))
            .map(|r| RecordedOutcome {
                output: r.output.clone(),
                error: r.error.clone(),
            })
    }
}

impl Default for MemorySystemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemDatabase for MemorySystemDatabase {
    async fn insert_workflow_status(
        &self,
        status: &WorkflowStatusRecord,
        in_recovery: bool,
    ) -> Result<Option<WorkflowStatusRecord>, StoreError> {
        let mut workflows = self.workflows.write();
        if let Some(existing) = workflows.get_mut(&status.workflow_id) {
            if in_recovery {
                existing.recovery_attempts += 1;
            }
            return Ok(Some(existing.clone()));
        }
        workflows.insert(status.workflow_id.clone(), status.clone());
        Ok(None)
    }

    async fn update_workflow_status(
        &self,
        status: &WorkflowStatusRecord,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        match workflows.get_mut(&status.workflow_id) {
            Some(existing) => {
                // Terminal rows are write-once; the rest of the row (most
                // importantly the recovery counter) is owned by insert.
                if existing.status.is_terminal() {
                    return Ok(());
                }
                existing.status = status.status;
                existing.output = status.output.clone();
                existing.error = status.error.clone();
            }
            None => {
                workflows.insert(status.workflow_id.clone(), status.clone());
            }
        }
        Ok(())
    }

    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRecord>, StoreError> {
        Ok(self.workflows.read().get(workflow_id).cloned())
    }

    async fn update_workflow_inputs(
        &self,
        workflow_id: &str,
        inputs: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inputs
            .write()
            .entry(workflow_id.to_string())
            .or_insert_with(|| inputs.clone());
        Ok(())
    }

    async fn get_workflow_inputs(
        &self,
        workflow_id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.inputs.read().get(workflow_id).cloned())
    }

    async fn await_workflow_result(
        &self,
        workflow_id: &str,
    ) -> Result<RecordedOutcome, StoreError> {
        loop {
            {
                let workflows = self.workflows.read();
                if let Some(outcome) = workflows.get(workflow_id).and_then(|w| w.outcome()) {
                    return Ok(outcome);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn record_operation_result(
        &self,
        result: &OperationResultRecord,
    ) -> Result<(), StoreError> {
        self.try_record(result.clone())
    }

    async fn check_operation_execution(
        &self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<Option<RecordedOutcome>, StoreError> {
        Ok(self.recorded_outcome(workflow_id, function_id))
    }

    async fn durable_sleep(
        &self,
        workflow_id: &str,
        function_id: u64,
        duration: Duration,
    ) -> Result<Duration, StoreError> {
        let parse_wake_at = |outcome: RecordedOutcome| -> Option<DateTime<Utc>> {
            outcome
                .output
                .as_ref()
                .and_then(|v| v.get("wake_at"))
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        if let Some(outcome) = self.recorded_outcome(workflow_id, function_id) {
            let remaining = parse_wake_at(outcome)
                .and_then(|wake_at| (wake_at - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO);
            return Ok(remaining);
        }

        let wake_at = Utc::now()
            + chrono::Duration::from_std(duration)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let record = OperationResultRecord {
            workflow_id: workflow_id.to_string(),
            function_id,
            output: Some(serde_json::json!({ "wake_at": wake_at.to_rfc3339() })),
            error: None,
        };
        match self.try_record(record) {
            Ok(()) => Ok(duration),
            // Another executor recorded the sleep first; honor its deadline.
            Err(StoreError::DuplicateOperation { .. }) => {
                let remaining = self
                    .recorded_outcome(workflow_id, function_id)
                    .and_then(parse_wake_at)
                    .and_then(|wake_at| (wake_at - Utc::now()).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                Ok(remaining)
            }
            Err(other) => Err(other),
        }
    }

    async fn send(
        &self,
        workflow_id: &str,
        function_id: u64,
        destination_id: &str,
        message: &serde_json::Value,
        topic: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.recorded_outcome(workflow_id, function_id).is_some() {
            // Already sent on a previous execution.
            return Ok(());
        }

        self.try_record(OperationResultRecord {
            workflow_id: workflow_id.to_string(),
            function_id,
            output: Some(serde_json::Value::Null),
            error: None,
        })?;

        let key = (destination_id.to_string(), topic_or_default(topic));
        self.queues
            .lock()
            .entry(key.clone())
            .or_default()
            .push_back(message.clone());
        self.message_notify(&key).notify_waiters();
        Ok(())
    }

    async fn recv(
        &self,
        workflow_id: &str,
        function_id: u64,
        timeout_function_id: u64,
        topic: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        if let Some(outcome) = self.recorded_outcome(workflow_id, function_id) {
            return Ok(outcome.output.filter(|v| !v.is_null()));
        }

        let remaining = self
            .durable_sleep(workflow_id, timeout_function_id, timeout)
            .await?;
        let deadline = Instant::now() + remaining;
        let key = (workflow_id.to_string(), topic_or_default(topic));

        let message = loop {
            if let Some(message) = self.pop_message(&key) {
                break Some(message);
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            let notify = self.message_notify(&key);
            let wait = (deadline - now).min(self.poll_interval);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        };

        let record = OperationResultRecord {
            workflow_id: workflow_id.to_string(),
            function_id,
            output: Some(message.clone().unwrap_or(serde_json::Value::Null)),
            error: None,
        };
        if let Err(err) = self.try_record(record) {
            // A concurrent executor recorded this recv first; give the
            // consumed message back before surfacing the conflict.
            if let Some(message) = message {
                self.queues.lock().entry(key).or_default().push_front(message);
            }
            return Err(err);
        }
        Ok(message)
    }

    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: u64,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        if self.recorded_outcome(workflow_id, function_id).is_some() {
            return Ok(());
        }

        self.try_record(OperationResultRecord {
            workflow_id: workflow_id.to_string(),
            function_id,
            output: Some(serde_json::Value::Null),
            error: None,
        })?;

        let event_key = (workflow_id.to_string(), key.to_string());
        self.events.write().insert(event_key.clone(), value.clone());
        self.event_notify(&event_key).notify_waiters();
        Ok(())
    }

    async fn get_event(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
        caller: Option<GetEventCaller>,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        if let Some(caller) = &caller {
            if let Some(outcome) =
                self.recorded_outcome(&caller.workflow_id, caller.function_id)
            {
                return Ok(outcome.output.filter(|v| !v.is_null()));
            }
        }

        let remaining = match &caller {
            Some(caller) => {
                self.durable_sleep(&caller.workflow_id, caller.timeout_function_id, timeout)
                    .await?
            }
            None => timeout,
        };
        let deadline = Instant::now() + remaining;
        let event_key = (target_workflow_id.to_string(), key.to_string());

        let value = loop {
            {
                let events = self.events.read();
                if let Some(value) = events.get(&event_key) {
                    break Some(value.clone());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            let notify = self.event_notify(&event_key);
            let wait = (deadline - now).min(self.poll_interval);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        };

        if let Some(caller) = &caller {
            self.try_record(OperationResultRecord {
                workflow_id: caller.workflow_id.clone(),
                function_id: caller.function_id,
                output: Some(value.clone().unwrap_or(serde_json::Value::Null)),
                error: None,
            })?;
        }
        Ok(value)
    }
}

// =============================================================================
// Application database
// =============================================================================

type KvMap = Arc<RwLock<HashMap<String, serde_json::Value>>>;
type TxnOutputs = Arc<RwLock<HashMap<(String, u64), TransactionRecord>>>;

/// In-memory implementation of [`AppDatabase`]
///
/// Models the user's own database as a key/value table. Transactions stage
/// writes and apply them on commit, atomically with the transaction-result
/// record, matching the OAOO contract of the PostgreSQL implementation.
pub struct MemoryAppDatabase {
    kv: KvMap,
    txn_outputs: TxnOutputs,
}

impl MemoryAppDatabase {
    /// Create a new in-memory application database
    pub fn new() -> Self {
        Self {
            kv: Arc::new(RwLock::new(HashMap::new())),
            txn_outputs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Read a committed value
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.kv.read().get(key).cloned()
    }

    /// Recorded transaction results for a workflow, ordered by function id
    pub fn transaction_results(&self, workflow_id: &str) -> Vec<TransactionRecord> {
        let outputs = self.txn_outputs.read();
        let mut results: Vec<_> = outputs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.function_id);
        results
    }
}

impl Default for MemoryAppDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AppDatabase for MemoryAppDatabase {
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn AppTransaction>, AppDbError> {
        Ok(Box::new(MemoryAppTransaction {
            kv: self.kv.clone(),
            txn_outputs: self.txn_outputs.clone(),
            staged_kv: HashMap::new(),
            staged_output: None,
            isolation,
        }))
    }

    async fn record_transaction_error(
        &self,
        record: &TransactionRecord,
    ) -> Result<(), AppDbError> {
        let mut outputs = self.txn_outputs.write();
        let key = (record.workflow_id.clone(), record.function_id);
        outputs.entry(key).or_insert_with(|| record.clone());
        Ok(())
    }
}

/// An open in-memory application transaction
///
/// Test code reaches it through [`TxnSession::downcast_mut`] and uses the
/// key/value helpers as its "user tables".
///
/// [`TxnSession::downcast_mut`]: super::app::TxnSession::downcast_mut
pub struct MemoryAppTransaction {
    kv: KvMap,
    txn_outputs: TxnOutputs,
    staged_kv: HashMap<String, serde_json::Value>,
    staged_output: Option<TransactionRecord>,
    #[allow(dead_code)] // The in-memory store cannot interleave, so the level is inert.
    isolation: IsolationLevel,
}

impl MemoryAppTransaction {
    /// Read a value as seen by this transaction (staged writes included)
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.staged_kv
            .get(key)
            .cloned()
            .or_else(|| self.kv.read().get(key).cloned())
    }

    /// Stage a write; visible to others only after commit
    pub fn put(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.staged_kv.insert(key.into(), value);
    }
}

#[async_trait]
impl AppTransaction for MemoryAppTransaction {
    async fn check_transaction_execution(
        &mut self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<Option<RecordedOutcome>, AppDbError> {
        let outputs = self.txn_outputs.read();
        Ok(outputs
            .get(&(workflow_id.to_string(), function_id))
            .map(|r| RecordedOutcome {
                output: r.output.clone(),
                error: r.error.clone(),
            }))
    }

    async fn record_output(&mut self, record: &TransactionRecord) -> Result<(), AppDbError> {
        let outputs = self.txn_outputs.read();
        let key = (record.workflow_id.clone(), record.function_id);
        if outputs.contains_key(&key) {
            return Err(AppDbError::unique_violation(format!(
                "transaction output already recorded for ({}, {})",
                record.workflow_id, record.function_id
            )));
        }
        drop(outputs);
        self.staged_output = Some(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppDbError> {
        // The result record and the staged writes land atomically, under
        // the same write locks.
        let mut outputs = self.txn_outputs.write();
        if let Some(record) = &self.staged_output {
            let key = (record.workflow_id.clone(), record.function_id);
            if outputs.contains_key(&key) {
                return Err(AppDbError::unique_violation(format!(
                    "transaction output already recorded for ({}, {})",
                    record.workflow_id, record.function_id
                )));
            }
            outputs.insert(key, record.clone());
        }
        let mut kv = self.kv.write();
        for (key, value) in self.staged_kv {
            kv.insert(key, value);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppDbError> {
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(workflow_id: &str) -> WorkflowStatusRecord {
        WorkflowStatusRecord {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Pending,
            name: "test_workflow".to_string(),
            class_name: None,
            config_name: None,
            output: None,
            error: None,
            app_id: None,
            app_version: None,
            executor_id: "executor-1".to_string(),
            request: None,
            recovery_attempts: 0,
            authenticated_user: None,
            authenticated_roles: vec![],
            assumed_role: None,
        }
    }

    #[tokio::test]
    async fn test_insert_is_insert_or_get() {
        let store = MemorySystemDatabase::new();
        let record = status("wf-1");

        assert!(store
            .insert_workflow_status(&record, false)
            .await
            .unwrap()
            .is_none());

        let existing = store
            .insert_workflow_status(&record, false)
            .await
            .unwrap()
            .expect("row should exist");
        assert_eq!(existing.workflow_id, "wf-1");
        assert_eq!(existing.recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_recovery_increments_attempts() {
        let store = MemorySystemDatabase::new();
        let record = status("wf-1");

        store.insert_workflow_status(&record, false).await.unwrap();
        let first = store
            .insert_workflow_status(&record, true)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .insert_workflow_status(&record, true)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.recovery_attempts, 1);
        assert_eq!(second.recovery_attempts, 2);
    }

    #[tokio::test]
    async fn test_terminal_status_is_write_once() {
        let store = MemorySystemDatabase::new();
        let mut record = status("wf-1");
        store.insert_workflow_status(&record, false).await.unwrap();

        record.status = WorkflowStatus::Success;
        record.output = Some(serde_json::json!(1));
        store.update_workflow_status(&record).await.unwrap();

        record.status = WorkflowStatus::Error;
        record.output = None;
        record.error = Some(serde_json::json!({"kind": "application", "message": "late"}));
        store.update_workflow_status(&record).await.unwrap();

        let row = store.get_workflow_status("wf-1").await.unwrap().unwrap();
        assert_eq!(row.status, WorkflowStatus::Success);
        assert_eq!(row.output, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_inputs_written_at_most_once() {
        let store = MemorySystemDatabase::new();
        store
            .update_workflow_inputs("wf-1", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        store
            .update_workflow_inputs("wf-1", &serde_json::json!({"x": 2}))
            .await
            .unwrap();

        let inputs = store.get_workflow_inputs("wf-1").await.unwrap().unwrap();
        assert_eq!(inputs, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_duplicate_operation_result() {
        let store = MemorySystemDatabase::new();
        let record = OperationResultRecord {
            workflow_id: "wf-1".to_string(),
            function_id: 1,
            output: Some(serde_json::json!(10)),
            error: None,
        };

        store.record_operation_result(&record).await.unwrap();
        let dup = store.record_operation_result(&record).await;
        assert!(matches!(dup, Err(StoreError::DuplicateOperation { .. })));
    }

    #[tokio::test]
    async fn test_send_recv_fifo() {
        let store = MemorySystemDatabase::new();

        store
            .send("sender", 1, "receiver", &serde_json::json!("a"), Some("t"))
            .await
            .unwrap();
        store
            .send("sender", 2, "receiver", &serde_json::json!("b"), Some("t"))
            .await
            .unwrap();

        let first = store
            .recv("receiver", 1, 2, Some("t"), Duration::from_secs(1))
            .await
            .unwrap();
        let second = store
            .recv("receiver", 3, 4, Some("t"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(first, Some(serde_json::json!("a")));
        assert_eq!(second, Some(serde_json::json!("b")));
    }

    #[tokio::test]
    async fn test_send_is_idempotent_per_function_id() {
        let store = MemorySystemDatabase::new();
        let msg = serde_json::json!("a");

        store.send("sender", 1, "receiver", &msg, None).await.unwrap();
        store.send("sender", 1, "receiver", &msg, None).await.unwrap();

        assert_eq!(store.queued_message_count("receiver"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout_is_recorded() {
        let store = MemorySystemDatabase::new();

        let got = store
            .recv("receiver", 1, 2, None, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(got, None);

        // Replay returns the recorded timeout without waiting.
        let start = Instant::now();
        let replayed = store
            .recv("receiver", 1, 2, None, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(replayed, None);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_set_and_get_event() {
        let store = MemorySystemDatabase::new();

        store
            .set_event("wf-1", 1, "status", &serde_json::json!("ready"))
            .await
            .unwrap();

        let value = store
            .get_event("wf-1", "status", Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(value, Some(serde_json::json!("ready")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_event_wakes_on_set() {
        let store = Arc::new(MemorySystemDatabase::new());

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .get_event("wf-1", "status", Duration::from_secs(30), None)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        store
            .set_event("wf-1", 1, "status", &serde_json::json!("done"))
            .await
            .unwrap();

        let value = reader.await.unwrap().unwrap();
        assert_eq!(value, Some(serde_json::json!("done")));
    }

    #[tokio::test]
    async fn test_app_transaction_commit_applies_writes() {
        let db = MemoryAppDatabase::new();

        let mut txn = db.begin(IsolationLevel::Serializable).await.unwrap();
        txn.as_any()
            .downcast_mut::<MemoryAppTransaction>()
            .unwrap()
            .put("balance", serde_json::json!(100));

        let mut record = TransactionRecord::new("wf-1", 1);
        record.output = Some(serde_json::json!(100));
        txn.record_output(&record).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(db.get("balance"), Some(serde_json::json!(100)));
        assert_eq!(db.transaction_results("wf-1").len(), 1);
    }

    #[tokio::test]
    async fn test_app_transaction_rollback_discards_writes() {
        let db = MemoryAppDatabase::new();

        let mut txn = db.begin(IsolationLevel::Serializable).await.unwrap();
        txn.as_any()
            .downcast_mut::<MemoryAppTransaction>()
            .unwrap()
            .put("balance", serde_json::json!(100));
        txn.rollback().await.unwrap();

        assert_eq!(db.get("balance"), None);
    }

    #[tokio::test]
    async fn test_duplicate_transaction_output() {
        let db = MemoryAppDatabase::new();
        let mut record = TransactionRecord::new("wf-1", 1);
        record.output = Some(serde_json::json!(1));

        let mut first = db.begin(IsolationLevel::Serializable).await.unwrap();
        first.record_output(&record).await.unwrap();
        first.commit().await.unwrap();

        let mut second = db.begin(IsolationLevel::Serializable).await.unwrap();
        let dup = second.record_output(&record).await;
        assert!(dup.unwrap_err().is_unique_violation());
    }
}
