use crate::error::{Result, StoreError};
use crate::models::{AsyncTask, NewTask, TaskStatus};
use crate::store::{Store, json_column, optional_json_column};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

const TASK_COLUMNS: &str = "id, binding_id, task_type, status, priority, input_data, output_data, \
     error_message, retry_count, started_at, completed_at, created_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<AsyncTask> {
    Ok(AsyncTask {
        id: row.get(0)?,
        binding_id: row.get(1)?,
        task_type: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        input_data: json_column(row, 5)?,
        output_data: optional_json_column(row, 6)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn load_task(conn: &Connection, id: i64) -> Result<AsyncTask> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM async_tasks WHERE id = ?1"),
        params![id],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("task", id))
}

impl Store {
    pub async fn enqueue_task(&self, task: NewTask, now: DateTime<Utc>) -> Result<AsyncTask> {
        let input = serde_json::to_string(&task.input_data)?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO async_tasks
                     (binding_id, task_type, status, priority, input_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task.binding_id,
                    task.task_type,
                    TaskStatus::Pending,
                    task.priority,
                    input,
                    now
                ],
            )?;
            load_task(conn, conn.last_insert_rowid())
        })
        .await
    }

    /// Atomically takes the next PENDING task (highest priority, then oldest) and marks it RUNNING.
    pub async fn claim_next_task(&self, now: DateTime<Utc>) -> Result<Option<AsyncTask>> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let next: Option<i64> = tx
                .query_row(
                    "SELECT id FROM async_tasks WHERE status = 'PENDING'
                     ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = next else {
                tx.commit()?;
                return Ok(None);
            };
            tx.execute(
                "UPDATE async_tasks SET status = 'RUNNING', started_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            let task = load_task(&tx, id)?;
            tx.commit()?;
            Ok(Some(task))
        })
        .await
    }

    pub async fn complete_task(
        &self,
        id: i64,
        output: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<AsyncTask> {
        let output = serde_json::to_string(output)?;
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE async_tasks SET status = 'COMPLETED', output_data = ?1, completed_at = ?2,
                     error_message = NULL
                 WHERE id = ?3",
                params![output, now, id],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("task", id));
            }
            load_task(conn, id)
        })
        .await
    }

    /// Terminal failure: records the error and bumps `retry_count`. Nothing re-queues the task.
    pub async fn fail_task(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<AsyncTask> {
        let error = error.to_string();
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE async_tasks SET status = 'FAILED', error_message = ?1, completed_at = ?2,
                     retry_count = retry_count + 1
                 WHERE id = ?3",
                params![error, now, id],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("task", id));
            }
            load_task(conn, id)
        })
        .await
    }

    pub async fn pending_task_count(&self) -> Result<u64> {
        self.call(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM async_tasks WHERE status = 'PENDING'",
                [],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    pub async fn get_task(&self, id: i64) -> Result<AsyncTask> {
        self.call(move |conn| load_task(conn, id)).await
    }

    /// Tasks currently marked RUNNING, e.g. left behind by a process that stopped mid-task.
    pub async fn list_running_tasks(&self) -> Result<Vec<AsyncTask>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM async_tasks WHERE status = 'RUNNING' ORDER BY id"
            ))?;
            let rows = stmt.query_map([], task_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
