//! cron 扇出服务
//!
//! 周期扫描启用的调度，按表达式枚举扫描窗口内的触发时刻，
//! 以 ticket 去重的条件插入为每个触发时刻生成一条 PENDING 任务。
//! ticket 编码了调度与时刻，重叠窗口与重启重放都在唯一索引处收敛。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, Timelike, Utc};
use cron::Schedule;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use batch_domain::entities::NewFireTask;
use batch_domain::repositories::{ScheduleRepository, TaskRepository};
use batch_errors::{BatchError, BatchResult};

/// 校验 cron 表达式（管理界面入口用）
pub fn validate_cron(expr: &str) -> BatchResult<()> {
    Schedule::from_str(expr.trim()).map_err(|e| BatchError::InvalidCron {
        expr: expr.to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

/// 去重 ticket：`schedule#<id>#<YYYYMMDDHHMMSS>`（本地时刻，纯数字）
pub(crate) fn fire_ticket(schedule_id: i64, at: &DateTime<Local>) -> String {
    format!("schedule#{}#{}", schedule_id, at.format("%Y%m%d%H%M%S"))
}

pub struct ScheduleFireService {
    schedules: Arc<dyn ScheduleRepository>,
    tasks: Arc<dyn TaskRepository>,
    /// last_fire_at 为空时的回填窗口（秒）
    window_seconds: i64,
    /// 单调度单 tick 触发上限（超宽回填的安全阀）
    max_fire_per_tick: usize,
}

impl ScheduleFireService {
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
        tasks: Arc<dyn TaskRepository>,
        window_seconds: i64,
        max_fire_per_tick: usize,
    ) -> Self {
        Self {
            schedules,
            tasks,
            window_seconds,
            max_fire_per_tick,
        }
    }

    /// 单轮扇出，返回新插入的任务数
    pub async fn fire_due(&self) -> BatchResult<u64> {
        let now = Utc::now();
        let now = now.with_nanosecond(0).unwrap_or(now);
        let mut inserted_total = 0u64;

        for schedule in self.schedules.find_enabled().await? {
            let cron_expr = schedule.cron.trim();
            if cron_expr.is_empty() {
                continue;
            }
            let cron = match Schedule::from_str(cron_expr) {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(
                        "无效的CRON表达式，跳过: id={}, cron={}, err={e}",
                        schedule.id, schedule.cron
                    );
                    continue;
                }
            };

            let start = schedule
                .last_fire_at
                .unwrap_or_else(|| now - Duration::seconds(self.window_seconds));
            let after = (start - Duration::seconds(1)).with_timezone(&Local);

            let mut fired = 0usize;
            for at in cron.after(&after) {
                let at_utc = at.with_timezone(&Utc);
                if at_utc > now {
                    break;
                }
                if fired >= self.max_fire_per_tick {
                    debug!("到达单 tick 触发上限，余量顺延: id={}", schedule.id);
                    break;
                }
                fired += 1;

                let payload = match schedule.payload.as_deref().map(str::trim) {
                    Some(p) if !p.is_empty() => p.to_string(),
                    _ => "{}".to_string(),
                };
                let task = NewFireTask {
                    ticket_no: fire_ticket(schedule.id, &at),
                    task_type: schedule.task_type.clone(),
                    payload,
                    priority: 0,
                    attempts: 0,
                    max_attempts: 3,
                    not_before: Some(at_utc),
                    schedule_id: Some(schedule.id),
                };
                let inserted = self.tasks.insert_if_absent(&task).await?;
                if inserted > 0 {
                    info!(
                        "调度触发: id={}, cron={}, at={at_utc}",
                        schedule.id, schedule.cron
                    );
                    self.schedules
                        .update_last_fire_at(schedule.id, at_utc)
                        .await?;
                    inserted_total += inserted;
                }
            }
        }
        Ok(inserted_total)
    }

    /// 周期循环：初始延迟后按固定间隔扇出，直至收到停机信号
    pub async fn run_loop(
        self: Arc<Self>,
        scan_interval_ms: u64,
        initial_delay_ms: u64,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(StdDuration::from_millis(initial_delay_ms)) => {}
        }
        let mut ticker = tokio::time::interval(StdDuration::from_millis(scan_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("cron 扇出服务停止");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.fire_due().await {
                        error!("cron 扇出失败: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use batch_domain::entities::{BatchSchedule, TaskStatus};
    use batch_infrastructure::database::sqlite::{
        SqliteScheduleRepository, SqliteTaskRepository, SCHEMA,
    };
    use sqlx::SqlitePool;

    async fn setup() -> (
        SqlitePool,
        Arc<SqliteScheduleRepository>,
        Arc<SqliteTaskRepository>,
    ) {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        (
            pool.clone(),
            Arc::new(SqliteScheduleRepository::new(pool.clone())),
            Arc::new(SqliteTaskRepository::new(pool)),
        )
    }

    #[test]
    fn test_fire_ticket_digits_only() {
        let at = Local::now();
        let ticket = fire_ticket(42, &at);
        assert!(ticket.starts_with("schedule#42#"));
        let stamp = ticket.rsplit('#').next().unwrap();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_validate_cron() {
        assert!(validate_cron("*/5 * * * * *").is_ok());
        assert!(validate_cron("0 0 * * * *").is_ok());
        assert!(matches!(
            validate_cron("not a cron"),
            Err(BatchError::InvalidCron { .. })
        ));
    }

    #[tokio::test]
    async fn test_backfill_window_every_five_seconds() {
        let (_pool, schedules, tasks) = setup().await;
        let created = schedules
            .create(&BatchSchedule::new(
                "demo".to_string(),
                "*/5 * * * * *".to_string(),
                Some("{}".to_string()),
            ))
            .await
            .unwrap();

        let service =
            ScheduleFireService::new(schedules.clone(), tasks.clone(), 3600, 5000);
        let inserted = service.fire_due().await.unwrap();
        // 3600 秒窗口、5 秒周期：720 个触发点（窗口起点含边界时 721）
        assert!(
            (720..=721).contains(&inserted),
            "插入数异常: {inserted}"
        );

        let all = tasks.find_all().await.unwrap();
        assert_eq!(all.len() as u64, inserted);
        let tickets: HashSet<_> = all.iter().map(|t| t.ticket_no.clone().unwrap()).collect();
        assert_eq!(tickets.len() as u64, inserted);
        for task in &all {
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.schedule_id, Some(created.id));
            assert!(task.not_before.is_some());
        }

        // last_fire_at 推进到窗口内最新触发点
        let reloaded = schedules.find_by_id(created.id).await.unwrap().unwrap();
        let max_fire = all.iter().filter_map(|t| t.not_before).max().unwrap();
        assert_eq!(
            reloaded.last_fire_at.map(|t| t.timestamp()),
            Some(max_fire.timestamp())
        );
    }

    #[tokio::test]
    async fn test_fire_due_idempotent_with_hourly_cron() {
        let (_pool, schedules, tasks) = setup().await;
        schedules
            .create(&BatchSchedule::new(
                "demo".to_string(),
                "0 0 * * * *".to_string(),
                None,
            ))
            .await
            .unwrap();

        let service =
            ScheduleFireService::new(schedules.clone(), tasks.clone(), 3600, 5000);
        let first = service.fire_due().await.unwrap();
        assert!(first >= 1);

        // 紧接着的第二轮没有新的触发点，插入为 0
        let second = service.fire_due().await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(tasks.find_all().await.unwrap().len() as u64, first);
    }

    #[tokio::test]
    async fn test_max_fire_per_tick_defers_remainder() {
        let (_pool, schedules, tasks) = setup().await;
        let created = schedules
            .create(&BatchSchedule::new(
                "demo".to_string(),
                "* * * * * *".to_string(),
                None,
            ))
            .await
            .unwrap();
        // 把 last_fire_at 拨回 60 秒前，制造超过上限的回填量
        schedules
            .update_last_fire_at(created.id, Utc::now() - Duration::seconds(60))
            .await
            .unwrap();

        let service = ScheduleFireService::new(schedules.clone(), tasks.clone(), 3600, 10);
        let first = service.fire_due().await.unwrap();
        assert_eq!(first, 10);

        // 第 11 个触发点顺延到下一轮
        let second = service.fire_due().await.unwrap();
        assert_eq!(second, 10);
        assert_eq!(tasks.find_all().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_invalid_cron_skipped_not_removed() {
        let (_pool, schedules, tasks) = setup().await;
        let bad = schedules
            .create(&BatchSchedule::new(
                "demo".to_string(),
                "definitely not cron".to_string(),
                None,
            ))
            .await
            .unwrap();

        let service =
            ScheduleFireService::new(schedules.clone(), tasks.clone(), 3600, 5000);
        let inserted = service.fire_due().await.unwrap();
        assert_eq!(inserted, 0);
        // 无效行保留，供运营修复
        assert!(schedules.find_by_id(bad.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_disabled_schedule_not_fired() {
        let (_pool, schedules, tasks) = setup().await;
        let created = schedules
            .create(&BatchSchedule::new(
                "demo".to_string(),
                "*/5 * * * * *".to_string(),
                None,
            ))
            .await
            .unwrap();
        schedules.update_enabled(created.id, false).await.unwrap();

        let service =
            ScheduleFireService::new(schedules.clone(), tasks.clone(), 3600, 5000);
        assert_eq!(service.fire_due().await.unwrap(), 0);
    }
}
