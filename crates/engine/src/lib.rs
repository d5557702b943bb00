//! 任务引擎
//!
//! 进程内派发流水线（领取 → 执行 → 完成回写）、补偿回放、
//! cron 扇出与 Runner / 补偿器注册表。

pub mod compensator;
pub mod cron_fire;
pub mod engine;
pub mod poll;
pub mod registrar;
pub mod runner;

pub use compensator::{Compensator, CompensatorRegistry};
pub use cron_fire::{validate_cron, ScheduleFireService};
pub use engine::TaskEngine;
pub use poll::PollScheduler;
pub use registrar::RunnerRegistrar;
pub use runner::{RunContext, TaskRunner};
