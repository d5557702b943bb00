use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use batch_domain::entities::BatchSchedule;
use batch_domain::repositories::ScheduleRepository;
use batch_errors::{BatchError, BatchResult};

pub struct PostgresScheduleRepository {
    pool: PgPool,
}

impl PostgresScheduleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &sqlx::postgres::PgRow) -> BatchResult<BatchSchedule> {
        Ok(BatchSchedule {
            id: row.try_get("id")?,
            task_type: row.try_get("type")?,
            cron: row.try_get("cron")?,
            payload: row.try_get("payload")?,
            enabled: row.try_get("enabled")?,
            last_fire_at: row.try_get("last_fire_at")?,
        })
    }
}

#[async_trait]
impl ScheduleRepository for PostgresScheduleRepository {
    async fn create(&self, schedule: &BatchSchedule) -> BatchResult<BatchSchedule> {
        let row = sqlx::query(
            r#"
            INSERT INTO batch_schedule (type, cron, payload, enabled, last_fire_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, type, cron, payload, enabled, last_fire_at
            "#,
        )
        .bind(&schedule.task_type)
        .bind(&schedule.cron)
        .bind(&schedule.payload)
        .bind(schedule.enabled)
        .bind(schedule.last_fire_at)
        .fetch_one(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        let created = Self::row_to_schedule(&row)?;
        debug!("调度已创建: id={}, type={}", created.id, created.task_type);
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> BatchResult<Option<BatchSchedule>> {
        let row = sqlx::query(
            "SELECT id, type, cron, payload, enabled, last_fire_at FROM batch_schedule WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_schedule(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_all(&self) -> BatchResult<Vec<BatchSchedule>> {
        let rows = sqlx::query(
            "SELECT id, type, cron, payload, enabled, last_fire_at FROM batch_schedule ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        rows.iter().map(Self::row_to_schedule).collect()
    }

    async fn find_enabled(&self) -> BatchResult<Vec<BatchSchedule>> {
        let rows = sqlx::query(
            "SELECT id, type, cron, payload, enabled, last_fire_at FROM batch_schedule WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(BatchError::Database)?;

        rows.iter().map(Self::row_to_schedule).collect()
    }

    async fn update_enabled(&self, id: i64, enabled: bool) -> BatchResult<bool> {
        let result = sqlx::query("UPDATE batch_schedule SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(if enabled { 1 } else { 0 })
            .execute(&self.pool)
            .await
            .map_err(BatchError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_last_fire_at(&self, id: i64, ts: DateTime<Utc>) -> BatchResult<bool> {
        let result = sqlx::query("UPDATE batch_schedule SET last_fire_at = $2 WHERE id = $1")
            .bind(id)
            .bind(ts)
            .execute(&self.pool)
            .await
            .map_err(BatchError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: i64) -> BatchResult<bool> {
        let result = sqlx::query("DELETE FROM batch_schedule WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(BatchError::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
