use chrono::Utc;
use sqlx::{Sqlite, Transaction};

use batch_errors::{BatchError, BatchResult};

/// SQLite 任务领取器
///
/// SQLite 无行级锁语法，依赖其单写者语义：同一时刻只有一个写事务，
/// `mark_running` 的 `WHERE status = 'PENDING'` 条件更新仍然保证
/// 同一任务至多一个领取者观察到 1。当前时间走绑定参数而非 SQL 函数，
/// 保持与驱动的时间编码格式一致。
pub struct SqliteTaskPicker;

impl SqliteTaskPicker {
    pub async fn lock_one_pending_id(
        tx: &mut Transaction<'_, Sqlite>,
    ) -> BatchResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM batch_task \
             WHERE status = 'PENDING' AND (not_before IS NULL OR not_before <= $1) \
             ORDER BY priority DESC, id ASC \
             LIMIT 1",
        )
        .bind(Utc::now())
        .fetch_optional(&mut **tx)
        .await
        .map_err(BatchError::Database)?;
        Ok(id)
    }

    pub async fn mark_running(
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        owner: &str,
    ) -> BatchResult<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE batch_task \
             SET status = 'RUNNING', owner = $1, attempts = attempts + 1, \
                 heartbeat_at = $2, updated_at = $2 \
             WHERE id = $3 AND status = 'PENDING'",
        )
        .bind(owner)
        .bind(now)
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(BatchError::Database)?;
        Ok(result.rows_affected())
    }
}
