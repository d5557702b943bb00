//! Runner 契约与运行上下文

use std::sync::Arc;

use async_trait::async_trait;

use batch_domain::services::TxService;
use batch_errors::{BatchError, BatchResult};

/// 任务执行单元
///
/// 由类型码解析得到，引擎在 Worker 中调用 `init_job`。正常返回视为成功；
/// 返回错误触发补偿回放。Runner 对副作用的幂等性自行负责，
/// 不可回滚的修改应通过 `ctx.log_compensation` 登记撤销动作。
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// 注册名（按名解析的兜底匹配键）
    fn name(&self) -> &str;

    async fn init_job(&self, ctx: &RunContext, payload: serde_json::Value) -> BatchResult<()>;
}

/// 运行上下文
///
/// 显式携带 run 标识与事务服务，Runner 追加补偿记录时无需自行
/// 拼装 run 归属。手动执行（管理界面同步触发）没有 run 记录，
/// 此时上下文为分离态，补偿登记直接报错。
pub struct RunContext {
    run_id: i64,
    tx: Arc<dyn TxService>,
}

impl RunContext {
    pub fn new(run_id: i64, tx: Arc<dyn TxService>) -> Self {
        Self { run_id, tx }
    }

    /// 手动执行用的分离上下文
    pub fn detached(tx: Arc<dyn TxService>) -> Self {
        Self { run_id: 0, tx }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn is_detached(&self) -> bool {
        self.run_id == 0
    }

    /// 追加一条补偿记录（seq_no 在本 run 内单调递增）
    pub async fn log_compensation(
        &self,
        action_type: &str,
        payload: &serde_json::Value,
    ) -> BatchResult<()> {
        if self.is_detached() {
            return Err(BatchError::Compensation(
                "手动执行不支持补偿登记".to_string(),
            ));
        }
        self.tx
            .log_compensation(self.run_id, action_type, &payload.to_string())
            .await?;
        Ok(())
    }
}
