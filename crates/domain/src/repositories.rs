//! 领域仓储抽象
//!
//! 数据访问的抽象接口，按数据库厂商在 infrastructure 中各有一套实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{BatchRun, BatchSchedule, BatchTask, NewFireTask, TaskStatus};
use batch_errors::BatchResult;

/// 调度仓储抽象
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create(&self, schedule: &BatchSchedule) -> BatchResult<BatchSchedule>;
    async fn find_by_id(&self, id: i64) -> BatchResult<Option<BatchSchedule>>;
    async fn find_all(&self) -> BatchResult<Vec<BatchSchedule>>;
    async fn find_enabled(&self) -> BatchResult<Vec<BatchSchedule>>;
    async fn update_enabled(&self, id: i64, enabled: bool) -> BatchResult<bool>;
    /// cron 扇出推进 last_fire_at（按调度单调不减）
    async fn update_last_fire_at(&self, id: i64, ts: DateTime<Utc>) -> BatchResult<bool>;
    async fn delete(&self, id: i64) -> BatchResult<bool>;
}

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &BatchTask) -> BatchResult<BatchTask>;
    async fn find_by_id(&self, id: i64) -> BatchResult<Option<BatchTask>>;
    async fn find_all(&self) -> BatchResult<Vec<BatchTask>>;
    /// ticket 去重的条件插入，返回受影响行数（0 表示 ticket 已存在）
    async fn insert_if_absent(&self, task: &NewFireTask) -> BatchResult<u64>;
    /// 仅当当前状态为 `expect` 时迁移到 `next`，返回受影响行数
    async fn update_status_if(
        &self,
        id: i64,
        expect: TaskStatus,
        next: TaskStatus,
    ) -> BatchResult<u64>;
    async fn count_by_schedule_id(&self, schedule_id: i64) -> BatchResult<i64>;
    async fn delete(&self, id: i64) -> BatchResult<bool>;
}

/// 运行记录仓储抽象
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> BatchResult<Option<BatchRun>>;
    async fn find_by_task_id(&self, task_id: i64) -> BatchResult<Vec<BatchRun>>;
}
