//! 引擎侧短事务服务抽象
//!
//! 领取、建 run、完成回写、取消检查与补偿日志操作。每次调用各自开启
//! 一个短事务，保证 Runner 级失败不回滚调度簿记。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{BatchRun, BatchTask, OperationLog, TaskStatus};
use batch_errors::BatchResult;

#[async_trait]
pub trait TxService: Send + Sync {
    /// 原子领取一条就绪任务：跳锁选行 + 条件置 RUNNING + 读回任务行。
    /// 任一步为空则返回 None。跨进程保证同一任务至多一个领取者成功。
    async fn claim_one(&self, owner: &str) -> BatchResult<Option<BatchTask>>;

    /// 新建 RUNNING 状态的运行记录
    async fn create_run(&self, task_id: i64, started_at: DateTime<Utc>)
        -> BatchResult<BatchRun>;

    /// 完成回写：任务置 final_status（缺省按 succeeded 推导 SUCCEED/FAILED），
    /// 写 finish_at / updated_at / message；运行记录状态联动
    /// （任务 CANCELED 则 run 为 CANCELED）。行缺失时告警返回，幂等。
    async fn complete(
        &self,
        task_id: i64,
        run_id: i64,
        succeeded: bool,
        message: Option<&str>,
        finish_at: DateTime<Utc>,
        final_status: Option<TaskStatus>,
    ) -> BatchResult<()>;

    /// 只读检查取消请求标记
    async fn is_cancel_requested(&self, task_id: i64) -> BatchResult<bool>;

    /// 追加一条补偿记录，seq_no = 该 run 当前最大值 + 1（从 1 起）
    async fn log_compensation(
        &self,
        run_id: i64,
        action_type: &str,
        payload_json: &str,
    ) -> BatchResult<OperationLog>;

    /// 按 seq_no 逆序取某 run 的补偿记录
    async fn fetch_compensations_desc(&self, run_id: i64) -> BatchResult<Vec<OperationLog>>;

    async fn mark_compensation_done(&self, op_id: i64) -> BatchResult<()>;

    /// 置 FAILED，attempts 加一并记录最后错误
    async fn mark_compensation_failed(&self, op_id: i64, error: &str) -> BatchResult<()>;
}
