//! 领域模型
//!
//! 批处理调度系统的核心实体（调度、任务、运行记录、补偿日志）与
//! 数据访问抽象。不依赖具体数据库实现。

pub mod entities;
pub mod repositories;
pub mod services;

pub use entities::{
    BatchRun, BatchSchedule, BatchTask, NewFireTask, OpStatus, OperationLog, RunStatus, TaskStatus,
};
pub use repositories::{RunRepository, ScheduleRepository, TaskRepository};
pub use services::TxService;
