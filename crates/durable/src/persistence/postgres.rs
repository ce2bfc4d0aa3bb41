//! PostgreSQL implementations of the system and application databases
//!
//! Production persistence using runtime-checked queries against a
//! connection pool. FIFO message consumption uses `FOR UPDATE SKIP LOCKED`
//! so concurrent receivers never double-deliver; OAOO keys rely on primary
//! keys and surface duplicate inserts as conflicts.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use super::app::{
    AppDatabase, AppDbError, AppTransaction, IsolationLevel, TransactionRecord,
};
use super::store::*;

const SYSTEM_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflow_status (
        workflow_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        name TEXT NOT NULL,
        class_name TEXT,
        config_name TEXT,
        output JSONB,
        error JSONB,
        app_id TEXT,
        app_version TEXT,
        executor_id TEXT NOT NULL,
        request JSONB,
        recovery_attempts BIGINT NOT NULL DEFAULT 0,
        authenticated_user TEXT,
        authenticated_roles JSONB NOT NULL DEFAULT '[]'::jsonb,
        assumed_role TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_inputs (
        workflow_id TEXT PRIMARY KEY,
        inputs JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS operation_outputs (
        workflow_id TEXT NOT NULL,
        function_id BIGINT NOT NULL,
        output JSONB,
        error JSONB,
        PRIMARY KEY (workflow_id, function_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        sequence BIGSERIAL PRIMARY KEY,
        destination_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        message JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_destination
        ON notifications (destination_id, topic, sequence)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_events (
        workflow_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value JSONB NOT NULL,
        PRIMARY KEY (workflow_id, key)
    )
    "#,
];

const APP_SCHEMA: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS transaction_outputs (
        workflow_id TEXT NOT NULL,
        function_id BIGINT NOT NULL,
        output JSONB,
        error JSONB,
        txn_snapshot TEXT NOT NULL DEFAULT '',
        txn_id TEXT,
        executor_id TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (workflow_id, function_id)
    )
    "#];

fn store_err(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.to_string()),
        _ => None,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(super::app::SQLSTATE_UNIQUE_VIOLATION)
}

fn app_err(err: sqlx::Error) -> AppDbError {
    AppDbError {
        message: err.to_string(),
        sqlstate: sqlstate(&err),
    }
}

/// PostgreSQL implementation of [`SystemDatabase`]
///
/// # Example
///
/// ```ignore
/// use oxbow_durable::PostgresSystemDatabase;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/oxbow").await?;
/// let store = PostgresSystemDatabase::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresSystemDatabase {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresSystemDatabase {
    /// Create a store over the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Override the interval at which waiters re-poll the database
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create the system tables if they do not exist
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SYSTEM_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_status(row: &PgRow) -> Result<WorkflowStatusRecord, StoreError> {
        let status: String = row.get("status");
        let roles: serde_json::Value = row.get("authenticated_roles");
        Ok(WorkflowStatusRecord {
            workflow_id: row.get("workflow_id"),
            status: status.parse()?,
            name: row.get("name"),
            class_name: row.get("class_name"),
            config_name: row.get("config_name"),
            output: row.get("output"),
            error: row.get("error"),
            app_id: row.get("app_id"),
            app_version: row.get("app_version"),
            executor_id: row.get("executor_id"),
            request: row.get("request"),
            recovery_attempts: row.get::<i64, _>("recovery_attempts") as u32,
            authenticated_user: row.get("authenticated_user"),
            authenticated_roles: serde_json::from_value(roles)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            assumed_role: row.get("assumed_role"),
        })
    }

    async fn fetch_outcome(
        &self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<Option<RecordedOutcome>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT output, error FROM operation_outputs
            WHERE workflow_id = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(function_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(|row| RecordedOutcome {
            output: row.get("output"),
            error: row.get("error"),
        }))
    }

    async fn insert_operation_row(
        &self,
        result: &OperationResultRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO operation_outputs (workflow_id, function_id, output, error)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&result.workflow_id)
        .bind(result.function_id as i64)
        .bind(&result.output)
        .bind(&result.error)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::DuplicateOperation {
                    workflow_id: result.workflow_id.clone(),
                    function_id: result.function_id,
                }
            } else {
                store_err(err)
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl SystemDatabase for PostgresSystemDatabase {
    #[instrument(skip(self, status))]
    async fn insert_workflow_status(
        &self,
        status: &WorkflowStatusRecord,
        in_recovery: bool,
    ) -> Result<Option<WorkflowStatusRecord>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let existing = sqlx::query(
            r#"
            SELECT * FROM workflow_status WHERE workflow_id = $1 FOR UPDATE
            "#,
        )
        .bind(&status.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        if let Some(row) = existing {
            let mut record = Self::row_to_status(&row)?;
            if in_recovery {
                sqlx::query(
                    r#"
                    UPDATE workflow_status
                    SET recovery_attempts = recovery_attempts + 1, updated_at = now()
                    WHERE workflow_id = $1
                    "#,
                )
                .bind(&status.workflow_id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
                record.recovery_attempts += 1;
            }
            tx.commit().await.map_err(store_err)?;
            return Ok(Some(record));
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_status (
                workflow_id, status, name, class_name, config_name,
                output, error, app_id, app_version, executor_id, request,
                recovery_attempts, authenticated_user, authenticated_roles, assumed_role
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&status.workflow_id)
        .bind(status.status.to_string())
        .bind(&status.name)
        .bind(&status.class_name)
        .bind(&status.config_name)
        .bind(&status.output)
        .bind(&status.error)
        .bind(&status.app_id)
        .bind(&status.app_version)
        .bind(&status.executor_id)
        .bind(&status.request)
        .bind(status.recovery_attempts as i64)
        .bind(&status.authenticated_user)
        .bind(serde_json::json!(status.authenticated_roles))
        .bind(&status.assumed_role)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        debug!(workflow_id = %status.workflow_id, "inserted workflow status");
        Ok(None)
    }

    #[instrument(skip(self, status))]
    async fn update_workflow_status(
        &self,
        status: &WorkflowStatusRecord,
    ) -> Result<(), StoreError> {
        // Terminal rows are write-once: the conflict update only applies
        // while the existing row is still PENDING.
        sqlx::query(
            r#"
            INSERT INTO workflow_status (
                workflow_id, status, name, class_name, config_name,
                output, error, app_id, app_version, executor_id, request,
                recovery_attempts, authenticated_user, authenticated_roles, assumed_role
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (workflow_id) DO UPDATE SET
                status = EXCLUDED.status,
                output = EXCLUDED.output,
                error = EXCLUDED.error,
                updated_at = now()
            WHERE workflow_status.status = 'PENDING'
            "#,
        )
        .bind(&status.workflow_id)
        .bind(status.status.to_string())
        .bind(&status.name)
        .bind(&status.class_name)
        .bind(&status.config_name)
        .bind(&status.output)
        .bind(&status.error)
        .bind(&status.app_id)
        .bind(&status.app_version)
        .bind(&status.executor_id)
        .bind(&status.request)
        .bind(status.recovery_attempts as i64)
        .bind(&status.authenticated_user)
        .bind(serde_json::json!(status.authenticated_roles))
        .bind(&status.assumed_role)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowStatusRecord>, StoreError> {
        let row = sqlx::query(r#"SELECT * FROM workflow_status WHERE workflow_id = $1"#)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|row| Self::row_to_status(&row)).transpose()
    }

    async fn update_workflow_inputs(
        &self,
        workflow_id: &str,
        inputs: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_inputs (workflow_id, inputs)
            VALUES ($1, $2)
            ON CONFLICT (workflow_id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(inputs)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_workflow_inputs(
        &self,
        workflow_id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query(r#"SELECT inputs FROM workflow_inputs WHERE workflow_id = $1"#)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|row| row.get("inputs")))
    }

    async fn await_workflow_result(
        &self,
        workflow_id: &str,
    ) -> Result<RecordedOutcome, StoreError> {
        loop {
            let row = sqlx::query(
                r#"SELECT status, output, error FROM workflow_status WHERE workflow_id = $1"#,
            )
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

            if let Some(row) = row {
                let status: WorkflowStatus = row.get::<String, _>("status").parse()?;
                if status.is_terminal() {
                    return Ok(RecordedOutcome {
                        output: row.get("output"),
                        error: row.get("error"),
                    });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn record_operation_result(
        &self,
        result: &OperationResultRecord,
    ) -> Result<(), StoreError> {
        self.insert_operation_row(result).await
    }

    async fn check_operation_execution(
        &self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<Option<RecordedOutcome>, StoreError> {
        self.fetch_outcome(workflow_id, function_id).await
    }

    async fn durable_sleep(
        &self,
        workflow_id: &str,
        function_id: u64,
        duration: Duration,
    ) -> Result<Duration, StoreError> {
        let remaining_from = |outcome: RecordedOutcome| {
            outcome
                .output
                .as_ref()
                .and_then(|v| v.get("wake_at"))
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .and_then(|wake_at| (wake_at - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO)
        };

        if let Some(outcome) = self.fetch_outcome(workflow_id, function_id).await? {
            return Ok(remaining_from(outcome));
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
        match self.insert_operation_row(&record).await {
            Ok(()) => Ok(duration),
            Err(StoreError::DuplicateOperation { .. }) => {
                let outcome = self
                    .fetch_outcome(workflow_id, function_id)
                    .await?
                    .map(remaining_from)
                    .unwrap_or(Duration::ZERO);
                Ok(outcome)
            }
            Err(other) => Err(other),
        }
    }

    #[instrument(skip(self, message))]
    async fn send(
        &self,
        workflow_id: &str,
        function_id: u64,
        destination_id: &str,
        message: &serde_json::Value,
        topic: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let recorded = sqlx::query(
            r#"
            SELECT 1 AS present FROM operation_outputs
            WHERE workflow_id = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(function_id as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        if recorded.is_some() {
            // Already sent on a previous execution.
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO notifications (destination_id, topic, message)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(destination_id)
        .bind(topic_or_default(topic))
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            INSERT INTO operation_outputs (workflow_id, function_id, output, error)
            VALUES ($1, $2, 'null'::jsonb, NULL)
            "#,
        )
        .bind(workflow_id)
        .bind(function_id as i64)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::DuplicateOperation {
                    workflow_id: workflow_id.to_string(),
                    function_id,
                }
            } else {
                store_err(err)
            }
        })?;

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn recv(
        &self,
        workflow_id: &str,
        function_id: u64,
        timeout_function_id: u64,
        topic: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        if let Some(outcome) = self.fetch_outcome(workflow_id, function_id).await? {
            return Ok(outcome.output.filter(|v| !v.is_null()));
        }

        let remaining = self
            .durable_sleep(workflow_id, timeout_function_id, timeout)
            .await?;
        let deadline = tokio::time::Instant::now() + remaining;
        let topic = topic_or_default(topic);

        loop {
            let mut tx = self.pool.begin().await.map_err(store_err)?;

            // Consume and record atomically so a crash cannot lose or
            // double-deliver a message.
            let row = sqlx::query(
                r#"
                DELETE FROM notifications
                WHERE sequence = (
                    SELECT sequence FROM notifications
                    WHERE destination_id = $1 AND topic = $2
                    ORDER BY sequence ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING message
                "#,
            )
            .bind(workflow_id)
            .bind(&topic)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;

            if let Some(row) = row {
                let message: serde_json::Value = row.get("message");
                sqlx::query(
                    r#"
                    INSERT INTO operation_outputs (workflow_id, function_id, output, error)
                    VALUES ($1, $2, $3, NULL)
                    "#,
                )
                .bind(workflow_id)
                .bind(function_id as i64)
                .bind(&message)
                .execute(&mut *tx)
                .await
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        StoreError::DuplicateOperation {
                            workflow_id: workflow_id.to_string(),
                            function_id,
                        }
                    } else {
                        store_err(err)
                    }
                })?;
                tx.commit().await.map_err(store_err)?;
                return Ok(Some(message));
            }

            tx.rollback().await.map_err(store_err)?;
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }

        self.insert_operation_row(&OperationResultRecord {
            workflow_id: workflow_id.to_string(),
            function_id,
            output: Some(serde_json::Value::Null),
            error: None,
        })
        .await?;
        Ok(None)
    }

    #[instrument(skip(self, value))]
    async fn set_event(
        &self,
        workflow_id: &str,
        function_id: u64,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let recorded = sqlx::query(
            r#"
            SELECT 1 AS present FROM operation_outputs
            WHERE workflow_id = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(function_id as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        if recorded.is_some() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_events (workflow_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(workflow_id)
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            INSERT INTO operation_outputs (workflow_id, function_id, output, error)
            VALUES ($1, $2, 'null'::jsonb, NULL)
            "#,
        )
        .bind(workflow_id)
        .bind(function_id as i64)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::DuplicateOperation {
                    workflow_id: workflow_id.to_string(),
                    function_id,
                }
            } else {
                store_err(err)
            }
        })?;

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_event(
        &self,
        target_workflow_id: &str,
        key: &str,
        timeout: Duration,
        caller: Option<GetEventCaller>,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        if let Some(caller) = &caller {
            if let Some(outcome) = self
                .fetch_outcome(&caller.workflow_id, caller.function_id)
                .await?
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
        let deadline = tokio::time::Instant::now() + remaining;

        let value = loop {
            let row = sqlx::query(
                r#"SELECT value FROM workflow_events WHERE workflow_id = $1 AND key = $2"#,
            )
            .bind(target_workflow_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

            if let Some(row) = row {
                break Some(row.get::<serde_json::Value, _>("value"));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break None;
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        };

        if let Some(caller) = &caller {
            self.insert_operation_row(&OperationResultRecord {
                workflow_id: caller.workflow_id.clone(),
                function_id: caller.function_id,
                output: Some(value.clone().unwrap_or(serde_json::Value::Null)),
                error: None,
            })
            .await?;
        }
        Ok(value)
    }
}

/// PostgreSQL implementation of [`AppDatabase`]
#[derive(Clone)]
pub struct PostgresAppDatabase {
    pool: PgPool,
}

impl PostgresAppDatabase {
    /// Create an application database over the given pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the transaction-outputs table if it does not exist
    pub async fn ensure_schema(&self) -> Result<(), AppDbError> {
        for statement in APP_SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(app_err)?;
        }
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AppDatabase for PostgresAppDatabase {
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn AppTransaction>, AppDbError> {
        let mut tx = self.pool.begin().await.map_err(app_err)?;
        // Must be the first statement inside the transaction.
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await
        .map_err(app_err)?;
        Ok(Box::new(PostgresAppTransaction { tx: Some(tx) }))
    }

    async fn record_transaction_error(
        &self,
        record: &TransactionRecord,
    ) -> Result<(), AppDbError> {
        sqlx::query(
            r#"
            INSERT INTO transaction_outputs
                (workflow_id, function_id, output, error, txn_snapshot, txn_id, executor_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (workflow_id, function_id) DO NOTHING
            "#,
        )
        .bind(&record.workflow_id)
        .bind(record.function_id as i64)
        .bind(&record.output)
        .bind(&record.error)
        .bind(&record.txn_snapshot)
        .bind(&record.txn_id)
        .bind(&record.executor_id)
        .execute(&self.pool)
        .await
        .map_err(app_err)?;
        Ok(())
    }
}

/// An open PostgreSQL application transaction
///
/// User transaction bodies reach it through
/// [`TxnSession::downcast_mut`](super::app::TxnSession::downcast_mut) and
/// issue their queries against [`connection`](Self::connection).
pub struct PostgresAppTransaction {
    tx: Option<sqlx::Transaction<'static, sqlx::Postgres>>,
}

impl PostgresAppTransaction {
    fn tx_mut(&mut self) -> &mut sqlx::Transaction<'static, sqlx::Postgres> {
        self.tx
            .as_mut()
            .expect("postgres transaction already finished")
    }

    /// The open connection, for user queries inside the transaction
    pub fn connection(&mut self) -> &mut sqlx::PgConnection {
        &mut **self.tx_mut()
    }
}

#[async_trait]
impl AppTransaction for PostgresAppTransaction {
    async fn check_transaction_execution(
        &mut self,
        workflow_id: &str,
        function_id: u64,
    ) -> Result<Option<RecordedOutcome>, AppDbError> {
        let row = sqlx::query(
            r#"
            SELECT output, error FROM transaction_outputs
            WHERE workflow_id = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(function_id as i64)
        .fetch_optional(&mut **self.tx_mut())
        .await
        .map_err(app_err)?;

        Ok(row.map(|row| RecordedOutcome {
            output: row.get("output"),
            error: row.get("error"),
        }))
    }

    async fn record_output(&mut self, record: &TransactionRecord) -> Result<(), AppDbError> {
        sqlx::query(
            r#"
            INSERT INTO transaction_outputs
                (workflow_id, function_id, output, error, txn_snapshot, txn_id, executor_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.workflow_id)
        .bind(record.function_id as i64)
        .bind(&record.output)
        .bind(&record.error)
        .bind(&record.txn_snapshot)
        .bind(&record.txn_id)
        .bind(&record.executor_id)
        .execute(&mut **self.tx_mut())
        .await
        .map_err(app_err)?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), AppDbError> {
        match self.tx.take() {
            Some(tx) => tx.commit().await.map_err(app_err),
            None => Ok(()),
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), AppDbError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(app_err),
            None => Ok(()),
        }
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}
