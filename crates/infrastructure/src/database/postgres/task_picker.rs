use sqlx::Postgres;
use sqlx::Transaction;

use batch_errors::{BatchError, BatchResult};

/// PostgreSQL 任务领取器
///
/// 在同一个短事务内：
/// - `lock_one_pending_id` 用 `FOR UPDATE SKIP LOCKED` 跳过他事务已锁行，
///   只挑 status='PENDING' 且 not_before 已到期的最高优先行；
/// - `mark_running` 仅在行仍为 PENDING 时置 RUNNING，返回受影响行数。
///
/// 两步合用保证跨进程并发下同一任务至多一个领取者观察到 1。
pub struct PostgresTaskPicker;

impl PostgresTaskPicker {
    pub async fn lock_one_pending_id(
        tx: &mut Transaction<'_, Postgres>,
    ) -> BatchResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM batch_task \
             WHERE status = 'PENDING' AND (not_before IS NULL OR not_before <= now()) \
             ORDER BY priority DESC, id ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut **tx)
        .await
        .map_err(BatchError::Database)?;
        Ok(id)
    }

    pub async fn mark_running(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        owner: &str,
    ) -> BatchResult<u64> {
        let result = sqlx::query(
            "UPDATE batch_task \
             SET status = 'RUNNING', owner = $2, attempts = attempts + 1, \
                 heartbeat_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .bind(owner)
        .execute(&mut **tx)
        .await
        .map_err(BatchError::Database)?;
        Ok(result.rows_affected())
    }
}
