use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::debug;

use batch_domain::entities::{BatchTask, NewFireTask, TaskStatus};
use batch_domain::repositories::TaskRepository;
use batch_errors::{BatchError, BatchResult};

const TASK_COLUMNS: &str = "id, schedule_id, ticket_no, type, payload, priority, status, attempts, \
     max_attempts, not_before, owner, heartbeat_at, created_at, updated_at, finish_at, message";

pub(crate) fn row_to_task(row: &sqlx::postgres::PgRow) -> BatchResult<BatchTask> {
    Ok(BatchTask {
        id: row.try_get("id")?,
        schedule_id: row.try_get("schedule_id")?,
        ticket_no: row.try_get("ticket_no")?,
        task_type: row.try_get("type")?,
        payload: row.try_get("payload")?,
        priority: row.try_get("priority")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        not_before: row.try_get("not_before")?,
        owner: row.try_get("owner")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finish_at: row.try_get("finish_at")?,
        message: row.try_get("message")?,
    })
}

pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn create(&self, task: &BatchTask) -> BatchResult<BatchTask> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO batch_task (schedule_id, ticket_no, type, payload, priority, status,
                                    attempts, max_attempts, not_before, owner, heartbeat_at,
                                    created_at, updated_at, finish_at, message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12, $13, $14)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task.schedule_id)
        .bind(&task.ticket_no)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.priority)
        .bind(task.status)
        .bind(task.attempts)
        .bind(task.max_attempts)
        .bind(task.not_before)
        .bind(&task.owner)
        .bind(task.heartbeat_at)
        .bind(now)
        .bind(task.finish_at)
        .bind(&task.message)
        .fetch_one(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        let created = row_to_task(&row)?;
        debug!("任务已入队: id={}, type={}", created.id, created.task_type);
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> BatchResult<Option<BatchTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM batch_task WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        match row {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> BatchResult<Vec<BatchTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM batch_task ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn insert_if_absent(&self, task: &NewFireTask) -> BatchResult<u64> {
        // ticket 唯一索引下的条件插入：重复触发收敛为 0 行，不抛错
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO batch_task (ticket_no, type, payload, priority, status, attempts,
                                    max_attempts, not_before, schedule_id, created_at, updated_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10
            WHERE NOT EXISTS (SELECT 1 FROM batch_task WHERE ticket_no = $1)
            "#,
        )
        .bind(&task.ticket_no)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.priority)
        .bind(TaskStatus::Pending)
        .bind(task.attempts)
        .bind(task.max_attempts)
        .bind(task.not_before)
        .bind(task.schedule_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(BatchError::Database)?;
        Ok(result.rows_affected())
    }

    async fn update_status_if(
        &self,
        id: i64,
        expect: TaskStatus,
        next: TaskStatus,
    ) -> BatchResult<u64> {
        let result = sqlx::query(
            "UPDATE batch_task SET status = $3, updated_at = $4 WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(expect)
        .bind(next)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(BatchError::Database)?;
        Ok(result.rows_affected())
    }

    async fn count_by_schedule_id(&self, schedule_id: i64) -> BatchResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM batch_task WHERE schedule_id = $1")
                .bind(schedule_id)
                .fetch_one(&self.pool)
                .await
                .map_err(BatchError::Database)?;
        Ok(count)
    }

    async fn delete(&self, id: i64) -> BatchResult<bool> {
        let result = sqlx::query("DELETE FROM batch_task WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(BatchError::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
