//! 引擎端到端场景：领取竞争、取消、补偿回放

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use batch_domain::entities::{BatchTask, OpStatus, RunStatus, TaskStatus};
use batch_domain::repositories::TaskRepository;
use batch_domain::services::TxService;
use batch_engine::{Compensator, CompensatorRegistry, RunContext, TaskEngine, TaskRunner};
use batch_errors::{BatchError, BatchResult};
use batch_infrastructure::database::sqlite::{
    SqliteRunRepository, SqliteTaskRepository, SqliteTxService, SCHEMA,
};
use batch_domain::repositories::RunRepository;

async fn setup_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(&pool).await.unwrap();
    }
    pool
}

async fn enqueue(pool: &SqlitePool, task_type: &str) -> BatchTask {
    let repo = SqliteTaskRepository::new(pool.clone());
    repo.create(&BatchTask::new_ad_hoc(
        task_type.to_string(),
        "{}".to_string(),
        None,
    ))
    .await
    .unwrap()
}

async fn wait_for_status(pool: &SqlitePool, task_id: i64, expected: TaskStatus) {
    for _ in 0..250 {
        let status: TaskStatus = sqlx::query_scalar("SELECT status FROM batch_task WHERE id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .unwrap();
        if status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("任务未在时限内到达 {expected:?}");
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("条件未在时限内满足");
}

struct CountingRunner {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskRunner for CountingRunner {
    fn name(&self) -> &str {
        "CountingRunner"
    }

    async fn init_job(&self, _ctx: &RunContext, _payload: serde_json::Value) -> BatchResult<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 登记两条 file.restore 补偿后失败
struct CompensateThenFailRunner;

#[async_trait]
impl TaskRunner for CompensateThenFailRunner {
    fn name(&self) -> &str {
        "CompensateThenFailRunner"
    }

    async fn init_job(&self, ctx: &RunContext, _payload: serde_json::Value) -> BatchResult<()> {
        ctx.log_compensation("file.restore", &serde_json::json!({"file": "fileA"}))
            .await?;
        ctx.log_compensation("file.restore", &serde_json::json!({"file": "fileB"}))
            .await?;
        Err(BatchError::TaskExecution("写入 fileB 后磁盘异常".to_string()))
    }
}

/// 登记一条补偿后阻塞，等待协作取消
struct BlockingRunner {
    started: Arc<AtomicBool>,
}

#[async_trait]
impl TaskRunner for BlockingRunner {
    fn name(&self) -> &str {
        "BlockingRunner"
    }

    async fn init_job(&self, ctx: &RunContext, _payload: serde_json::Value) -> BatchResult<()> {
        ctx.log_compensation("file.restore", &serde_json::json!({"file": "partial"}))
            .await?;
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(())
    }
}

/// 记录补偿调用顺序；可配置在指定 file 上报错
struct RecordingCompensator {
    calls: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
}

#[async_trait]
impl Compensator for RecordingCompensator {
    fn action_type(&self) -> &str {
        "file.restore"
    }

    async fn compensate(&self, _run_id: i64, payload: &serde_json::Value) -> BatchResult<bool> {
        let file = payload
            .get("file")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        self.calls.lock().unwrap().push(file.clone());
        if self.fail_on.as_deref() == Some(file.as_str()) {
            return Err(BatchError::Compensation(format!("无法恢复 {file}")));
        }
        Ok(true)
    }
}

fn engine_with(
    pool: &SqlitePool,
    compensators: Arc<CompensatorRegistry>,
) -> TaskEngine {
    TaskEngine::new(
        Arc::new(SqliteTxService::new(pool.clone())),
        compensators,
        4,
        false,
    )
}

#[tokio::test]
async fn test_concurrent_claim_yields_single_winner() {
    let pool = setup_pool().await;
    enqueue(&pool, "demo").await;

    let tx_a = SqliteTxService::new(pool.clone());
    let tx_b = SqliteTxService::new(pool.clone());
    let (a, b) = tokio::join!(tx_a.claim_one("local#a"), tx_b.claim_one("local#b"));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.is_some() != b.is_some(), "恰好一个领取者成功");
}

#[tokio::test]
async fn test_cancel_before_claim_skips_handler_and_run() {
    let pool = setup_pool().await;
    let invocations = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(&pool, Arc::new(CompensatorRegistry::new()));
    engine
        .register(
            "demo",
            Arc::new(CountingRunner {
                invocations: invocations.clone(),
            }),
        )
        .unwrap();

    let task = enqueue(&pool, "demo").await;
    let repo = SqliteTaskRepository::new(pool.clone());
    let n = repo
        .update_status_if(task.id, TaskStatus::Pending, TaskStatus::Canceled)
        .await
        .unwrap();
    assert_eq!(n, 1);

    // 下一个 tick：已取消的任务不可领取
    assert!(!engine.poll_and_run_once().await.unwrap());
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    let runs = SqliteRunRepository::new(pool.clone())
        .find_by_task_id(task.id)
        .await
        .unwrap();
    assert!(runs.is_empty());
}

#[tokio::test]
async fn test_successful_execution_completes_task_and_run() {
    let pool = setup_pool().await;
    let invocations = Arc::new(AtomicUsize::new(0));
    let engine = engine_with(&pool, Arc::new(CompensatorRegistry::new()));
    engine
        .register(
            "demo",
            Arc::new(CountingRunner {
                invocations: invocations.clone(),
            }),
        )
        .unwrap();

    let task = enqueue(&pool, "demo").await;
    assert!(engine.poll_and_run_once().await.unwrap());
    wait_for_status(&pool, task.id, TaskStatus::Succeed).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let runs = SqliteRunRepository::new(pool.clone())
        .find_by_task_id(task.id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Succeed);
    assert!(runs[0].ended_at.is_some());
}

#[tokio::test]
async fn test_unknown_type_marks_failed() {
    let pool = setup_pool().await;
    let engine = engine_with(&pool, Arc::new(CompensatorRegistry::new()));

    let task = enqueue(&pool, "ghost.type").await;
    assert!(engine.poll_and_run_once().await.unwrap());
    wait_for_status(&pool, task.id, TaskStatus::Failed).await;

    let message: String = sqlx::query_scalar("SELECT message FROM batch_task WHERE id = $1")
        .bind(task.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(message.contains("No runner for type=ghost.type"));
}

#[tokio::test]
async fn test_compensation_replays_in_reverse_order() {
    let pool = setup_pool().await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let compensators = Arc::new(CompensatorRegistry::new());
    compensators.register(Arc::new(RecordingCompensator {
        calls: calls.clone(),
        fail_on: None,
    }));

    let engine = engine_with(&pool, compensators);
    engine
        .register("demo", Arc::new(CompensateThenFailRunner))
        .unwrap();

    let task = enqueue(&pool, "demo").await;
    assert!(engine.poll_and_run_once().await.unwrap());
    wait_for_status(&pool, task.id, TaskStatus::Failed).await;

    // 逆序回放：seq 2（fileB）先于 seq 1（fileA）
    assert_eq!(*calls.lock().unwrap(), vec!["fileB", "fileA"]);

    let tx = SqliteTxService::new(pool.clone());
    let run_id: i64 = sqlx::query_scalar("SELECT id FROM batch_run WHERE task_id = $1")
        .bind(task.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let ops = tx.fetch_compensations_desc(run_id).await.unwrap();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|op| op.status == OpStatus::Done));

    // 回放只动 PENDING 项：重放一遍不改变任何簿记
    let summary = engine.compensate_run(run_id).await.unwrap();
    assert_eq!(summary.done, 0);
    assert_eq!(summary.failed, 0);
    let ops_again = tx.fetch_compensations_desc(run_id).await.unwrap();
    assert!(ops_again.iter().all(|op| op.status == OpStatus::Done));
}

#[tokio::test]
async fn test_compensator_failure_recorded_and_replay_continues() {
    let pool = setup_pool().await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let compensators = Arc::new(CompensatorRegistry::new());
    compensators.register(Arc::new(RecordingCompensator {
        calls: calls.clone(),
        fail_on: Some("fileB".to_string()),
    }));

    let engine = engine_with(&pool, compensators);
    engine
        .register("demo", Arc::new(CompensateThenFailRunner))
        .unwrap();

    let task = enqueue(&pool, "demo").await;
    assert!(engine.poll_and_run_once().await.unwrap());
    wait_for_status(&pool, task.id, TaskStatus::Failed).await;

    // seq 2 失败后 seq 1 仍被尝试
    assert_eq!(*calls.lock().unwrap(), vec!["fileB", "fileA"]);

    let tx = SqliteTxService::new(pool.clone());
    let run_id: i64 = sqlx::query_scalar("SELECT id FROM batch_run WHERE task_id = $1")
        .bind(task.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let ops = tx.fetch_compensations_desc(run_id).await.unwrap();
    let file_b = ops.iter().find(|op| op.seq_no == 2).unwrap();
    let file_a = ops.iter().find(|op| op.seq_no == 1).unwrap();
    assert_eq!(file_b.status, OpStatus::Failed);
    assert!(file_b.last_error.as_deref().unwrap().contains("无法恢复 fileB"));
    assert_eq!(file_b.attempts, 1);
    assert_eq!(file_a.status, OpStatus::Done);

    let message: String = sqlx::query_scalar("SELECT message FROM batch_task WHERE id = $1")
        .bind(task.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(message.contains("磁盘异常"));
    assert!(message.contains("| CompensationError:"));
}

#[tokio::test]
async fn test_cooperative_cancel_mid_run_skips_compensation() {
    let pool = setup_pool().await;
    let started = Arc::new(AtomicBool::new(false));
    let compensators = Arc::new(CompensatorRegistry::new());
    // 故意注册补偿器：取消路径不应触碰它
    let calls = Arc::new(Mutex::new(Vec::new()));
    compensators.register(Arc::new(RecordingCompensator {
        calls: calls.clone(),
        fail_on: None,
    }));

    let engine = engine_with(&pool, compensators);
    engine
        .register(
            "demo",
            Arc::new(BlockingRunner {
                started: started.clone(),
            }),
        )
        .unwrap();

    let task = enqueue(&pool, "demo").await;
    assert!(engine.poll_and_run_once().await.unwrap());

    let started_probe = started.clone();
    wait_until(move || started_probe.load(Ordering::SeqCst)).await;
    assert!(engine.is_running(task.id));

    // 管理侧：RUNNING -> CANCEL_REQUESTED，然后发协作中断
    let repo = SqliteTaskRepository::new(pool.clone());
    let n = repo
        .update_status_if(task.id, TaskStatus::Running, TaskStatus::CancelRequested)
        .await
        .unwrap();
    assert_eq!(n, 1);
    assert!(engine.interrupt_if_running(task.id));

    wait_for_status(&pool, task.id, TaskStatus::Canceled).await;
    let engine_probe = engine.clone();
    wait_until(move || !engine_probe.is_running(task.id)).await;

    let message: String = sqlx::query_scalar("SELECT message FROM batch_task WHERE id = $1")
        .bind(task.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(message, "Interrupted during execution");

    // run 联动为 CANCELED，补偿保持 PENDING 未回放
    let run_id: i64 = sqlx::query_scalar("SELECT id FROM batch_run WHERE task_id = $1")
        .bind(task.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let run_status: RunStatus = sqlx::query_scalar("SELECT status FROM batch_run WHERE id = $1")
        .bind(run_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(run_status, RunStatus::Canceled);

    let tx = SqliteTxService::new(pool.clone());
    let ops = tx.fetch_compensations_desc(run_id).await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OpStatus::Pending);
    assert!(calls.lock().unwrap().is_empty());

    // 完成后取消句柄随 Worker 一并回收
    let engine_probe = engine.clone();
    wait_until(move || !engine_probe.interrupt_if_running(task.id)).await;
}

#[tokio::test]
async fn test_poll_returns_false_on_empty_queue() {
    let pool = setup_pool().await;
    let engine = engine_with(&pool, Arc::new(CompensatorRegistry::new()));
    assert!(!engine.poll_and_run_once().await.unwrap());
}

#[tokio::test]
async fn test_run_created_at_claim_time() {
    let pool = setup_pool().await;
    let engine = engine_with(&pool, Arc::new(CompensatorRegistry::new()));
    engine
        .register(
            "demo",
            Arc::new(CountingRunner {
                invocations: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .unwrap();

    let before = Utc::now();
    let task = enqueue(&pool, "demo").await;
    assert!(engine.poll_and_run_once().await.unwrap());
    wait_for_status(&pool, task.id, TaskStatus::Succeed).await;

    let runs = SqliteRunRepository::new(pool.clone())
        .find_by_task_id(task.id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].started_at >= before - chrono::Duration::seconds(1));
}
