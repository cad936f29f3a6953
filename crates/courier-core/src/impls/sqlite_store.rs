//! SQLite task store.
//!
//! One `queue` table holds every task. Each state transition is a single
//! conditional `UPDATE ... WHERE id = ?`, which SQLite serializes, so two
//! writers can never both move the same row.
//!
//! Timestamps are written by the store (from its `Clock`) as fixed-width UTC
//! strings, so string comparison in SQL is time comparison.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::{debug, info};

use super::{cutoff, retention_window};
use crate::app::status::QueueCounts;
use crate::domain::{
    ABANDONED_ON_FINAL_ATTEMPT, Failure, StoreError, TaskId, TaskRecord, TaskStatus, TaskType,
};
use crate::ports::{Clock, SystemClock, TaskStore};

/// Persisted timestamp layout (UTC, millisecond precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const SELECT_COLUMNS: &str = "SELECT id, type, payload, status, attempts, max_attempts, \
     last_error, created_at, updated_at, processed_at FROM queue";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    type         TEXT    NOT NULL,
    payload      BLOB    NOT NULL,
    status       TEXT    NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    last_error   TEXT    NULL,
    created_at   TEXT    NOT NULL,
    updated_at   TEXT    NOT NULL,
    processed_at TEXT    NULL
)
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_queue_status_created ON queue (status, created_at)";

pub fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts both the store's own layout and plain `YYYY-MM-DD HH:MM:SS`.
pub fn decode_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// SQLite-backed task store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteTaskStore {
    /// Open (creating if missing) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened task store");
        Self::from_pool(pool).await
    }

    /// A private in-memory database.
    ///
    /// Each SQLite in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    fn now(&self) -> String {
        encode_timestamp(self.clock.now())
    }

    /// Explain why a conditional update on `id` touched no row.
    async fn transition_error(&self, id: TaskId, to: TaskStatus) -> StoreError {
        match self.get(id).await {
            Ok(Some(task)) => StoreError::InvalidTransition {
                id,
                from: task.status,
                to,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

fn decode_row(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let id: i64 = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::Corrupt { id, reason };

    let status: String = row.try_get("status")?;
    let status = TaskStatus::from_str(&status).map_err(|e| corrupt(e.to_string()))?;

    let count = |column: &str| -> Result<u32, StoreError> {
        let value: i64 = row.try_get(column)?;
        u32::try_from(value).map_err(|_| corrupt(format!("{column} out of range: {value}")))
    };
    let timestamp = |column: &str, value: &str| {
        decode_timestamp(value).ok_or_else(|| corrupt(format!("bad {column}: {value:?}")))
    };

    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let processed_at: Option<String> = row.try_get("processed_at")?;

    Ok(TaskRecord {
        id: TaskId::new(id),
        task_type: TaskType::new(row.try_get::<String, _>("type")?),
        payload: row.try_get("payload")?,
        status,
        attempts: count("attempts")?,
        max_attempts: count("max_attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: timestamp("created_at", &created_at)?,
        updated_at: timestamp("updated_at", &updated_at)?,
        processed_at: processed_at
            .as_deref()
            .map(|v| timestamp("processed_at", v))
            .transpose()?,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn enqueue(
        &self,
        task_type: &TaskType,
        payload: &[u8],
        max_attempts: u32,
    ) -> Result<TaskId, StoreError> {
        if max_attempts == 0 {
            return Err(StoreError::InvalidMaxAttempts);
        }
        let now = self.now();
        let result = sqlx::query(
            "INSERT INTO queue (type, payload, status, attempts, max_attempts, created_at, updated_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(task_type.as_str())
        .bind(payload)
        .bind(TaskStatus::Pending.as_str())
        .bind(i64::from(max_attempts))
        .bind(now.as_str())
        .bind(now.as_str())
        .execute(&self.pool)
        .await?;

        let id = TaskId::new(result.last_insert_rowid());
        debug!(task_id = %id, task_type = %task_type, "task enqueued");
        Ok(id)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = ? OR (status = ? AND attempts < max_attempts) \
             ORDER BY created_at ASC, id ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(TaskStatus::Pending.as_str())
            .bind(TaskStatus::Failed.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn mark_processing(&self, id: TaskId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE queue SET status = ?, attempts = attempts + 1, updated_at = ? \
             WHERE id = ? AND (status = ? OR (status = ? AND attempts < max_attempts))",
        )
        .bind(TaskStatus::Processing.as_str())
        .bind(self.now())
        .bind(id.get())
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn mark_completed(&self, id: TaskId) -> Result<(), StoreError> {
        let now = self.now();
        let result = sqlx::query(
            "UPDATE queue SET status = ?, processed_at = ?, updated_at = ?, last_error = NULL \
             WHERE id = ? AND status = ?",
        )
        .bind(TaskStatus::Completed.as_str())
        .bind(now.as_str())
        .bind(now.as_str())
        .bind(id.get())
        .bind(TaskStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Completed).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: TaskId, failure: Failure) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE queue SET status = ?, last_error = ?, updated_at = ?, \
             max_attempts = CASE WHEN ? THEN attempts ELSE max_attempts END \
             WHERE id = ? AND status = ?",
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(failure.reason.as_str())
        .bind(self.now())
        .bind(failure.terminal)
        .bind(id.get())
        .bind(TaskStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, TaskStatus::Failed).await);
        }
        Ok(())
    }

    async fn recover_stuck(&self, threshold: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let result = sqlx::query(
            "UPDATE queue SET \
             status = CASE WHEN attempts < max_attempts THEN ? ELSE ? END, \
             last_error = CASE WHEN attempts < max_attempts THEN last_error ELSE ? END, \
             updated_at = ? \
             WHERE status = ? AND updated_at < ?",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(ABANDONED_ON_FINAL_ATTEMPT)
        .bind(encode_timestamp(now))
        .bind(TaskStatus::Processing.as_str())
        .bind(encode_timestamp(cutoff(now, threshold)))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u64, StoreError> {
        let processed_before = cutoff(self.clock.now(), retention_window(retention_days));
        let result = sqlx::query("DELETE FROM queue WHERE status = ? AND processed_at <= ?")
            .bind(TaskStatus::Completed.as_str())
            .bind(encode_timestamp(processed_before))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status IN (?, ?, ?) ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(TaskStatus::Pending.as_str())
            .bind(TaskStatus::Processing.as_str())
            .bind(TaskStatus::Failed.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn counts_by_status(&self) -> Result<QueueCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT status, attempts < max_attempts AS has_budget, COUNT(*) AS n \
             FROM queue GROUP BY status, has_budget",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let has_budget: i64 = row.try_get("has_budget")?;
            let n = u64::try_from(row.try_get::<i64, _>("n")?).unwrap_or(0);
            match TaskStatus::from_str(&status) {
                Ok(TaskStatus::Pending) => counts.pending += n,
                Ok(TaskStatus::Processing) => counts.processing += n,
                Ok(TaskStatus::Completed) => counts.completed += n,
                Ok(TaskStatus::Failed) if has_budget != 0 => counts.retrying += n,
                Ok(TaskStatus::Failed) => counts.dead += n,
                Err(e) => {
                    return Err(StoreError::Corrupt {
                        id: -1,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(counts)
    }
}
