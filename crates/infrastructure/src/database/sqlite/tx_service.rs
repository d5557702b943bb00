use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use batch_domain::entities::{BatchRun, BatchTask, OperationLog, RunStatus, TaskStatus};
use batch_domain::services::TxService;
use batch_errors::{BatchError, BatchResult};

use super::task_picker::SqliteTaskPicker;
use super::task_repository::row_to_task;

fn clip_message(message: Option<&str>) -> Option<String> {
    message.map(|m| m.chars().take(2000).collect())
}

pub(crate) fn row_to_op(row: &sqlx::sqlite::SqliteRow) -> BatchResult<OperationLog> {
    Ok(OperationLog {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        seq_no: row.try_get("seq_no")?,
        action_type: row.try_get("action_type")?,
        action_payload: row.try_get("action_payload")?,
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// SQLite 短事务服务
pub struct SqliteTxService {
    pool: SqlitePool,
}

impl SqliteTxService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TxService for SqliteTxService {
    async fn claim_one(&self, owner: &str) -> BatchResult<Option<BatchTask>> {
        let mut tx = self.pool.begin().await.map_err(BatchError::Database)?;

        let Some(id) = SqliteTaskPicker::lock_one_pending_id(&mut tx).await? else {
            tx.rollback().await.map_err(BatchError::Database)?;
            return Ok(None);
        };

        let affected = SqliteTaskPicker::mark_running(&mut tx, id, owner).await?;
        if affected == 0 {
            // 被其它进程抢走，下个 tick 再试
            debug!("任务领取竞争失败: id={id}");
            tx.rollback().await.map_err(BatchError::Database)?;
            return Ok(None);
        }

        let row = sqlx::query(
            "SELECT id, schedule_id, ticket_no, type, payload, priority, status, attempts, \
                    max_attempts, not_before, owner, heartbeat_at, created_at, updated_at, \
                    finish_at, message \
             FROM batch_task WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(BatchError::Database)?;
        let task = row_to_task(&row)?;

        tx.commit().await.map_err(BatchError::Database)?;
        Ok(Some(task))
    }

    async fn create_run(
        &self,
        task_id: i64,
        started_at: DateTime<Utc>,
    ) -> BatchResult<BatchRun> {
        let row = sqlx::query(
            r#"
            INSERT INTO batch_run (task_id, started_at, status)
            VALUES ($1, $2, $3)
            RETURNING id, task_id, started_at, ended_at, status, message
            "#,
        )
        .bind(task_id)
        .bind(started_at)
        .bind(RunStatus::Running)
        .fetch_one(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        super::run_repository::row_to_run(&row)
    }

    async fn complete(
        &self,
        task_id: i64,
        run_id: i64,
        succeeded: bool,
        message: Option<&str>,
        finish_at: DateTime<Utc>,
        final_status: Option<TaskStatus>,
    ) -> BatchResult<()> {
        let mut tx = self.pool.begin().await.map_err(BatchError::Database)?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM batch_task WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(BatchError::Database)?;
        if exists.is_none() {
            warn!("完成回写时任务缺失: id={task_id}");
            tx.rollback().await.map_err(BatchError::Database)?;
            return Ok(());
        }

        let status_to_set = final_status.unwrap_or(if succeeded {
            TaskStatus::Succeed
        } else {
            TaskStatus::Failed
        });
        let message = clip_message(message);

        sqlx::query(
            "UPDATE batch_task SET status = $1, message = $2, finish_at = $3, updated_at = $3 \
             WHERE id = $4",
        )
        .bind(status_to_set)
        .bind(&message)
        .bind(finish_at)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(BatchError::Database)?;

        let run_status = if status_to_set == TaskStatus::Canceled {
            RunStatus::Canceled
        } else if succeeded {
            RunStatus::Succeed
        } else {
            RunStatus::Failed
        };
        let run_rows = sqlx::query(
            "UPDATE batch_run SET status = $1, ended_at = $2, message = $3 WHERE id = $4",
        )
        .bind(run_status)
        .bind(finish_at)
        .bind(&message)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(BatchError::Database)?;
        if run_rows.rows_affected() == 0 {
            warn!("完成回写时运行记录缺失: run_id={run_id}");
        }

        tx.commit().await.map_err(BatchError::Database)?;
        Ok(())
    }

    async fn is_cancel_requested(&self, task_id: i64) -> BatchResult<bool> {
        let status: Option<TaskStatus> =
            sqlx::query_scalar("SELECT status FROM batch_task WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(BatchError::Database)?;
        Ok(status == Some(TaskStatus::CancelRequested))
    }

    async fn log_compensation(
        &self,
        run_id: i64,
        action_type: &str,
        payload_json: &str,
    ) -> BatchResult<OperationLog> {
        let mut tx = self.pool.begin().await.map_err(BatchError::Database)?;

        let max_seq: Option<i32> =
            sqlx::query_scalar("SELECT MAX(seq_no) FROM batch_operation_log WHERE run_id = $1")
                .bind(run_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(BatchError::Database)?;
        let next = max_seq.unwrap_or(0) + 1;

        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO batch_operation_log (run_id, seq_no, action_type, action_payload,
                                             status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $6)
            RETURNING id, run_id, seq_no, action_type, action_payload, status, attempts,
                      last_error, created_at, updated_at
            "#,
        )
        .bind(run_id)
        .bind(next)
        .bind(action_type)
        .bind(payload_json)
        .bind(batch_domain::entities::OpStatus::Pending)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(BatchError::Database)?;
        let op = row_to_op(&row)?;

        tx.commit().await.map_err(BatchError::Database)?;
        Ok(op)
    }

    async fn fetch_compensations_desc(&self, run_id: i64) -> BatchResult<Vec<OperationLog>> {
        let rows = sqlx::query(
            "SELECT id, run_id, seq_no, action_type, action_payload, status, attempts, \
                    last_error, created_at, updated_at \
             FROM batch_operation_log WHERE run_id = $1 ORDER BY seq_no DESC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        rows.iter().map(row_to_op).collect()
    }

    async fn mark_compensation_done(&self, op_id: i64) -> BatchResult<()> {
        let result = sqlx::query(
            "UPDATE batch_operation_log SET status = 'DONE', updated_at = $1 WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(op_id)
        .execute(&self.pool)
        .await
        .map_err(BatchError::Database)?;
        if result.rows_affected() == 0 {
            return Err(BatchError::OperationLogNotFound { id: op_id });
        }
        Ok(())
    }

    async fn mark_compensation_failed(&self, op_id: i64, error: &str) -> BatchResult<()> {
        let result = sqlx::query(
            "UPDATE batch_operation_log \
             SET status = 'FAILED', attempts = attempts + 1, last_error = $1, updated_at = $2 \
             WHERE id = $3",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(op_id)
        .execute(&self.pool)
        .await
        .map_err(BatchError::Database)?;
        if result.rows_affected() == 0 {
            return Err(BatchError::OperationLogNotFound { id: op_id });
        }
        Ok(())
    }
}
