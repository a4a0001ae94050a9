//! The durable task queue.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::{
    Result, Store, StoreError,
    models::{Task, TaskStatus, TaskType},
};

const TASK_COLUMNS: &str =
    "id, merchant_id, task_type, payload, status, run_at, created_at";

#[derive(FromRow)]
struct TaskRow {
    id: i64,
    merchant_id: String,
    task_type: String,
    payload: serde_json::Value,
    status: String,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;
    fn try_from(row: TaskRow) -> Result<Task> {
        let task_type = TaskType::from_str(&row.task_type).map_err(|_| {
            StoreError::CorruptRow(format!(
                "task {} has unknown type '{}'",
                row.id, row.task_type
            ))
        })?;
        let status = TaskStatus::from_str(&row.status).map_err(|_| {
            StoreError::CorruptRow(format!(
                "task {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;
        Ok(Task {
            id: row.id,
            merchant_id: row.merchant_id,
            task_type,
            payload: row.payload,
            status,
            run_at: row.run_at,
            created_at: row.created_at,
        })
    }
}

impl Store {
    /// Insert a new pending task.
    pub async fn enqueue_task(
        &self,
        merchant_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
    ) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "INSERT INTO tasks (merchant_id, task_type, payload, run_at) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(merchant_id)
        .bind(task_type.as_str())
        .bind(payload)
        .bind(run_at)
        .fetch_one(self.pool())
        .await?;
        Task::try_from(row)
    }

    /// Claim the earliest ready task, if any.
    ///
    /// `FOR UPDATE SKIP LOCKED` gives at-most-one claimant per task across
    /// arbitrarily many concurrent callers, without blocking on contended
    /// rows. Equal `run_at` ties break on primary key.
    pub async fn claim_next_task(&self) -> Result<Option<Task>> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'pending' AND run_at <= now() \
             ORDER BY run_at ASC, id ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE tasks SET status = 'running' WHERE id = $1")
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let mut task = Task::try_from(row)?;
        task.status = TaskStatus::Running;
        Ok(Some(task))
    }

    /// Unconditional status transition; the caller enforces legality.
    pub async fn update_task_status(
        &self,
        task_id: i64,
        status: TaskStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = $2 WHERE id = $1")
            .bind(task_id)
            .bind(status.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn task(&self, task_id: i64) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(self.pool())
        .await?
        .map(Task::try_from)
        .transpose()
    }

    /// Ownership-scoped fetch: returns `None` for another merchant's task.
    pub async fn task_for_merchant(
        &self,
        task_id: i64,
        merchant_id: &str,
    ) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE id = $1 AND merchant_id = $2"
        ))
        .bind(task_id)
        .bind(merchant_id)
        .fetch_optional(self.pool())
        .await?
        .map(Task::try_from)
        .transpose()
    }

    pub async fn list_tasks(
        &self,
        merchant_id: &str,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE merchant_id = $1 AND status = $2 \
                     ORDER BY created_at DESC \
                     LIMIT $3"
                ))
                .bind(merchant_id)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE merchant_id = $1 \
                     ORDER BY created_at DESC \
                     LIMIT $2"
                ))
                .bind(merchant_id)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Pending tasks for a merchant; gates the queue-limit quota.
    pub async fn pending_task_count(&self, merchant_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks \
             WHERE merchant_id = $1 AND status = 'pending'",
        )
        .bind(merchant_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Per-status counts for the dashboard.
    pub async fn task_counts(
        &self,
        merchant_id: &str,
    ) -> Result<crate::models::TaskCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks \
             WHERE merchant_id = $1 GROUP BY status",
        )
        .bind(merchant_id)
        .fetch_all(self.pool())
        .await?;

        let mut counts = crate::models::TaskCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "running" => counts.running = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Reset a task back to pending, eligible to run immediately.
    /// Returns false if the task doesn't exist or isn't the merchant's.
    pub async fn retry_task(
        &self,
        task_id: i64,
        merchant_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', run_at = now() \
             WHERE id = $1 AND merchant_id = $2",
        )
        .bind(task_id)
        .bind(merchant_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_task(
        &self,
        task_id: i64,
        merchant_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE id = $1 AND merchant_id = $2",
        )
        .bind(task_id)
        .bind(merchant_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_completed_tasks(
        &self,
        merchant_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM tasks \
             WHERE merchant_id = $1 AND status = 'completed'",
        )
        .bind(merchant_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop a merchant's pending/running work, e.g. on PP disconnect.
    pub async fn delete_open_tasks(&self, merchant_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM tasks \
             WHERE merchant_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(merchant_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Janitor: reset tasks stuck in `running` since before `cutoff` back to
    /// `pending`, eligible immediately. Recovers from worker crashes.
    pub async fn rescue_zombie_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', run_at = now() \
             WHERE status = 'running' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Watchdog: whether a pending/running task of this type exists for the
    /// given owner.
    pub async fn has_open_task(
        &self,
        merchant_id: &str,
        task_type: TaskType,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(\
                 SELECT 1 FROM tasks \
                 WHERE merchant_id = $1 AND task_type = $2 \
                   AND status IN ('pending', 'running'))",
        )
        .bind(merchant_id)
        .bind(task_type.as_str())
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }
}
