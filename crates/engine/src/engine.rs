//! 进程内任务引擎
//!
//! 每个 tick 领取一条就绪任务，提交到有界执行池；Worker 解析 Runner、
//! 执行、失败时驱动补偿回放，最终统一完成回写。执行池满载时轮询方
//! 内联执行，形成天然背压。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::{watch, Semaphore, TryAcquireError};
use tracing::{debug, error, info, warn};

use batch_domain::entities::TaskStatus;
use batch_domain::services::TxService;
use batch_errors::{BatchError, BatchResult};

use crate::compensator::CompensatorRegistry;
use crate::runner::{RunContext, TaskRunner};

/// 错误文本归一化：空白折叠，超长截断
pub(crate) fn trim_err(message: &str) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(1900).collect()
}

/// Worker 的单次执行结果
enum JobOutcome {
    Succeeded,
    Canceled(String),
    Failed(String),
}

/// 一轮补偿回放的账目
#[derive(Debug, Default)]
pub struct CompensationSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub first_error: Option<String>,
}

struct EngineInner {
    tx: Arc<dyn TxService>,
    compensators: Arc<CompensatorRegistry>,
    // type -> Runner
    runners: RwLock<HashMap<String, Arc<dyn TaskRunner>>>,
    // 本进程运行中的任务
    running_ids: Mutex<HashSet<i64>>,
    // 协作取消句柄（对应已提交的 Worker）
    cancels: Mutex<HashMap<i64, watch::Sender<bool>>>,
    permits: Arc<Semaphore>,
    strict_registration: bool,
    owner: String,
}

#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    pub fn new(
        tx: Arc<dyn TxService>,
        compensators: Arc<CompensatorRegistry>,
        max_concurrent: usize,
        strict_registration: bool,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tx,
                compensators,
                runners: RwLock::new(HashMap::new()),
                running_ids: Mutex::new(HashSet::new()),
                cancels: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(max_concurrent)),
                strict_registration,
                owner: format!("local#{}", std::process::id()),
            }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// 显式注册。重复 key 宽容模式保留先到绑定并告警，严格模式直接失败。
    pub fn register(&self, key: &str, runner: Arc<dyn TaskRunner>) -> BatchResult<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(BatchError::validation_error("Runner key 不能为空"));
        }
        let mut runners = self
            .inner
            .runners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = runners.get(key) {
            if std::ptr::eq(
                Arc::as_ptr(prev) as *const (),
                Arc::as_ptr(&runner) as *const (),
            ) {
                debug!("重复注册同一实例: key={key}");
                return Ok(());
            }
            let msg = format!(
                "Runner key 冲突: '{key}' (existing={}, new={})",
                prev.name(),
                runner.name()
            );
            if self.inner.strict_registration {
                error!("{msg}");
                return Err(BatchError::DuplicateRunner(msg));
            }
            warn!("{msg} — 保留已注册绑定");
            return Ok(());
        }
        info!("Runner 已注册: {key} -> {}", runner.name());
        runners.insert(key.to_string(), runner);
        Ok(())
    }

    pub fn runner(&self, key: &str) -> Option<Arc<dyn TaskRunner>> {
        self.inner
            .runners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn runner_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .runners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn compensator_types(&self) -> Vec<String> {
        self.inner.compensators.available_types()
    }

    pub fn is_running(&self, task_id: i64) -> bool {
        self.inner
            .running_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&task_id)
    }

    /// 向运行中的 Worker 发协作中断信号；无对应 Worker 返回 false
    pub fn interrupt_if_running(&self, task_id: i64) -> bool {
        let cancels = self
            .inner
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match cancels.get(&task_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// 对外入口：领取 → 建 run → 提交执行池。返回是否派发了任务。
    pub async fn poll_and_run_once(&self) -> BatchResult<bool> {
        let Some(task) = self.inner.tx.claim_one(&self.inner.owner).await? else {
            return Ok(false);
        };

        let run = self.inner.tx.create_run(task.id, Utc::now()).await?;

        let task_id = task.id;
        let task_type = task.task_type.clone();
        let payload = task.safe_payload();
        let run_id = run.id;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, cancel_tx);

        info!("任务提交执行池: id={task_id}, type={task_type}, run_id={run_id}");

        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let engine = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    engine
                        .execute_and_complete(task_id, task_type, payload, run_id, cancel_rx)
                        .await;
                });
            }
            Err(TryAcquireError::NoPermits) => {
                // 池满：轮询方内联执行，形成背压
                debug!("执行池已满，内联执行: id={task_id}");
                self.execute_and_complete(task_id, task_type, payload, run_id, cancel_rx)
                    .await;
            }
            Err(TryAcquireError::Closed) => {
                return Err(BatchError::Internal("执行池已关闭".to_string()));
            }
        }
        Ok(true)
    }

    /// Worker 执行体。任何错误都不会越过完成回写。
    async fn execute_and_complete(
        &self,
        task_id: i64,
        task_type: String,
        payload: String,
        run_id: i64,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        self.inner
            .running_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id);

        info!("开始执行任务: id={task_id}, type={task_type}, run_id={run_id}");

        let mut succeeded = false;
        let mut err_msg: Option<String> = None;
        let final_status: Option<TaskStatus>;

        let outcome = self
            .run_job(task_id, &task_type, &payload, run_id, &mut cancel_rx)
            .await;

        match outcome {
            JobOutcome::Succeeded => {
                succeeded = true;
                final_status = Some(TaskStatus::Succeed);
            }
            JobOutcome::Canceled(message) => {
                // 取消路径不做补偿
                warn!("任务已取消: id={task_id}, reason={message}");
                final_status = Some(TaskStatus::Canceled);
                err_msg = Some(message);
            }
            JobOutcome::Failed(message) => {
                error!("任务失败: id={task_id}, err={message}");
                final_status = Some(TaskStatus::Failed);
                err_msg = Some(message);

                match self.compensate_run(run_id).await {
                    Ok(summary) if summary.failed > 0 => {
                        let detail = summary
                            .first_error
                            .unwrap_or_else(|| format!("{} 条补偿失败", summary.failed));
                        err_msg = Some(format!(
                            "{} | CompensationError: {}",
                            err_msg.unwrap_or_default(),
                            trim_err(&detail)
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let comp_err = trim_err(&e.to_string());
                        error!("补偿流程错误: run_id={run_id}, err={comp_err}");
                        err_msg = Some(format!(
                            "{} | CompensationError: {comp_err}",
                            err_msg.unwrap_or_default()
                        ));
                    }
                }
            }
        }

        // 回写与清理：保证执行
        if let Err(e) = self
            .inner
            .tx
            .complete(
                task_id,
                run_id,
                succeeded,
                err_msg.as_deref(),
                Utc::now(),
                final_status,
            )
            .await
        {
            error!("完成回写失败: id={task_id}, run_id={run_id}, err={e}");
        }
        self.inner
            .running_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
        self.inner
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    async fn run_job(
        &self,
        task_id: i64,
        task_type: &str,
        payload: &str,
        run_id: i64,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> JobOutcome {
        // 起跑前取消检查
        match self.inner.tx.is_cancel_requested(task_id).await {
            Ok(true) => return JobOutcome::Canceled("Canceled before start".to_string()),
            Ok(false) => {}
            Err(e) => return JobOutcome::Failed(trim_err(&e.to_string())),
        }

        let Some(runner) = self.runner(task_type) else {
            return JobOutcome::Failed(format!("No runner for type={task_type}"));
        };

        // Runner 解析后再查一次，缩短竞争窗口
        match self.inner.tx.is_cancel_requested(task_id).await {
            Ok(true) => return JobOutcome::Canceled("Canceled right before start".to_string()),
            Ok(false) => {}
            Err(e) => return JobOutcome::Failed(trim_err(&e.to_string())),
        }
        if *cancel_rx.borrow() {
            return JobOutcome::Canceled("Interrupted before start".to_string());
        }

        let parsed: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => return JobOutcome::Failed(trim_err(&format!("BadPayload: {e}"))),
        };

        let ctx = RunContext::new(run_id, Arc::clone(&self.inner.tx));
        tokio::select! {
            _ = cancel_rx.changed() => {
                JobOutcome::Canceled("Interrupted during execution".to_string())
            }
            result = runner.init_job(&ctx, parsed) => match result {
                Ok(()) => JobOutcome::Succeeded,
                Err(e) => JobOutcome::Failed(trim_err(&e.to_string())),
            }
        }
    }

    /// 补偿回放：按 seq_no 逆序处理 PENDING 项，逐条尽力而为。
    /// 单条失败不阻断后续；已是 DONE/FAILED 的条目跳过。
    pub async fn compensate_run(&self, run_id: i64) -> BatchResult<CompensationSummary> {
        info!("开始补偿回放: run_id={run_id}");
        let ops = self.inner.tx.fetch_compensations_desc(run_id).await?;
        if ops.is_empty() {
            info!("无补偿记录: run_id={run_id}");
            return Ok(CompensationSummary::default());
        }

        let mut summary = CompensationSummary {
            total: ops.len(),
            ..Default::default()
        };

        for op in ops {
            if op.status != batch_domain::entities::OpStatus::Pending {
                debug!("跳过补偿记录: op_id={}, status={:?}", op.id, op.status);
                continue;
            }

            let Some(action_type) = op.action_type.as_deref().filter(|t| !t.trim().is_empty())
            else {
                self.record_compensation_failure(&mut summary, op.id, "MISSING_ACTION_TYPE")
                    .await;
                continue;
            };

            let Some(compensator) = self.inner.compensators.get(action_type) else {
                let err = format!("No compensator registered for actionType={action_type}");
                warn!("{err}");
                self.record_compensation_failure(&mut summary, op.id, &err)
                    .await;
                continue;
            };

            let payload: serde_json::Value =
                match serde_json::from_str(op.action_payload.as_deref().unwrap_or("{}")) {
                    Ok(value) => value,
                    Err(e) => {
                        self.record_compensation_failure(
                            &mut summary,
                            op.id,
                            &trim_err(&e.to_string()),
                        )
                        .await;
                        continue;
                    }
                };

            match compensator.compensate(run_id, &payload).await {
                Ok(true) => {
                    if let Err(e) = self.inner.tx.mark_compensation_done(op.id).await {
                        error!("补偿状态回写失败: op_id={}, err={e}", op.id);
                        continue;
                    }
                    summary.done += 1;
                    info!("补偿完成: op_id={}, action={action_type}", op.id);
                }
                Ok(false) => {
                    warn!("补偿返回 false: op_id={}, action={action_type}", op.id);
                    self.record_compensation_failure(
                        &mut summary,
                        op.id,
                        "COMPENSATE_RETURNED_FALSE",
                    )
                    .await;
                }
                Err(e) => {
                    let err = trim_err(&e.to_string());
                    error!(
                        "补偿执行错误: op_id={}, action={action_type}, err={err}",
                        op.id
                    );
                    self.record_compensation_failure(&mut summary, op.id, &err)
                        .await;
                }
            }
        }

        info!(
            "补偿回放结束: run_id={run_id}, done={}, failed={}",
            summary.done, summary.failed
        );
        Ok(summary)
    }

    async fn record_compensation_failure(
        &self,
        summary: &mut CompensationSummary,
        op_id: i64,
        error_text: &str,
    ) {
        summary.failed += 1;
        if summary.first_error.is_none() {
            summary.first_error = Some(error_text.to_string());
        }
        if let Err(e) = self.inner.tx.mark_compensation_failed(op_id, error_text).await {
            // 状态回写失败也不阻断后续条目
            error!("补偿失败状态回写失败: op_id={op_id}, err={e}");
        }
    }
}
