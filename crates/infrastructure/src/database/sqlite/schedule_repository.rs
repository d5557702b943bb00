use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use batch_domain::entities::BatchSchedule;
use batch_domain::repositories::ScheduleRepository;
use batch_errors::{BatchError, BatchResult};

pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &sqlx::sqlite::SqliteRow) -> BatchResult<BatchSchedule> {
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
impl ScheduleRepository for SqliteScheduleRepository {
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
        let result = sqlx::query("UPDATE batch_schedule SET enabled = $1 WHERE id = $2")
            .bind(if enabled { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(BatchError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_last_fire_at(&self, id: i64, ts: DateTime<Utc>) -> BatchResult<bool> {
        let result = sqlx::query("UPDATE batch_schedule SET last_fire_at = $1 WHERE id = $2")
            .bind(ts)
            .bind(id)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_toggle() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in crate::database::sqlite::SCHEMA {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        let repo = SqliteScheduleRepository::new(pool);

        let schedule = BatchSchedule::new(
            "demo".to_string(),
            "*/5 * * * * *".to_string(),
            Some("{}".to_string()),
        );
        let created = repo.create(&schedule).await.unwrap();
        assert!(created.id > 0);
        assert!(created.is_enabled());

        assert!(repo.update_enabled(created.id, false).await.unwrap());
        let reloaded = repo.find_by_id(created.id).await.unwrap().unwrap();
        assert!(!reloaded.is_enabled());
        assert!(repo.find_enabled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_fire_at_roundtrip() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in crate::database::sqlite::SCHEMA {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        let repo = SqliteScheduleRepository::new(pool);

        let created = repo
            .create(&BatchSchedule::new(
                "demo".to_string(),
                "0 0 * * * *".to_string(),
                None,
            ))
            .await
            .unwrap();
        assert!(created.last_fire_at.is_none());

        let ts = Utc::now();
        assert!(repo.update_last_fire_at(created.id, ts).await.unwrap());
        let reloaded = repo.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_fire_at.map(|t| t.timestamp()), Some(ts.timestamp()));
    }
}
