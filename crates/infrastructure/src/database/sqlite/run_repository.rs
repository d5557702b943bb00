use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use batch_domain::entities::BatchRun;
use batch_domain::repositories::RunRepository;
use batch_errors::{BatchError, BatchResult};

pub(crate) fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> BatchResult<BatchRun> {
    Ok(BatchRun {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        status: row.try_get("status")?,
        message: row.try_get("message")?,
    })
}

pub struct SqliteRunRepository {
    pool: SqlitePool,
}

impl SqliteRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn find_by_id(&self, id: i64) -> BatchResult<Option<BatchRun>> {
        let row = sqlx::query(
            "SELECT id, task_id, started_at, ended_at, status, message FROM batch_run WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        match row {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_task_id(&self, task_id: i64) -> BatchResult<Vec<BatchRun>> {
        let rows = sqlx::query(
            "SELECT id, task_id, started_at, ended_at, status, message FROM batch_run WHERE task_id = $1 ORDER BY id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        rows.iter().map(row_to_run).collect()
    }
}
