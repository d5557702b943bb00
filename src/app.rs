use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use batch_api::{create_routes, AppState};
use batch_config::AppConfig;
use batch_engine::{
    CompensatorRegistry, PollScheduler, RunnerRegistrar, ScheduleFireService, TaskEngine,
};
use batch_infrastructure::DatabaseManager;
use batch_runners::{CodeIndexRunner, FileRestoreCompensator};

/// 主应用：装配数据层、引擎、cron 扇出与管理界面
pub struct Application {
    config: AppConfig,
    engine: TaskEngine,
    registrar: Arc<RunnerRegistrar>,
    fire_service: Arc<ScheduleFireService>,
    state: AppState,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用: database={}", config.database.url);

        let db = DatabaseManager::new(&config.database.url, config.database.max_connections)
            .await
            .context("创建数据库连接池失败")?;
        db.initialize_schema().await.context("初始化表结构失败")?;
        db.health_check().await.context("数据库健康检查失败")?;

        let schedules = db.schedule_repository();
        let tasks = db.task_repository();
        let tx = db.tx_service();

        // 补偿器：先到先得注册
        let compensators = Arc::new(CompensatorRegistry::new());
        compensators.register(Arc::new(FileRestoreCompensator::new(
            config.runner.default_root.clone(),
        )));

        let engine = TaskEngine::new(
            tx.clone(),
            compensators,
            config.executor.max_concurrent,
            config.runner.strict_registration,
        );

        // Runner 装配：实例 + 工厂 + 映射文件
        let mut registrar = RunnerRegistrar::new(
            engine.clone(),
            config.runner.allowed_factory_prefixes.clone(),
        );
        registrar.register_runner(Arc::new(CodeIndexRunner::new()));
        registrar.register_factory("batch_runners::codeindex::CodeIndexRunner", || {
            Arc::new(CodeIndexRunner::new())
        });
        if let Some(mapping_file) = &config.runner.mapping_file {
            registrar
                .load_mapping_file(Path::new(mapping_file))
                .context("加载 Runner 映射文件失败")?;
        }
        registrar.init().context("注册 Runner 失败")?;
        let registrar = Arc::new(registrar);

        let fire_service = Arc::new(ScheduleFireService::new(
            schedules.clone(),
            tasks.clone(),
            config.cron.backfill_window_seconds,
            config.cron.max_fire_per_tick,
        ));

        let state = AppState {
            schedules,
            tasks,
            tx,
            engine: engine.clone(),
            registrar: registrar.clone(),
        };

        Ok(Self {
            config,
            engine,
            registrar,
            fire_service,
            state,
        })
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            "启动调度进程: owner={}, runners={:?}",
            self.engine.owner(),
            self.registrar.available_types()
        );

        // 引擎轮询
        let poll = PollScheduler::new(
            self.engine.clone(),
            self.config.poll.delay_ms,
            self.config.poll.batch,
        );
        let poll_handle = tokio::spawn(poll.run_loop(shutdown_rx.resubscribe()));

        // cron 扇出
        let fire_handle = tokio::spawn(self.fire_service.clone().run_loop(
            self.config.cron.scan_interval_ms,
            self.config.cron.initial_delay_ms,
            shutdown_rx.resubscribe(),
        ));

        // 管理界面
        let router = create_routes(self.state.clone());
        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("监听失败: {}", self.config.api.bind_address))?;
        info!("管理界面已启动: http://{}", self.config.api.bind_address);

        let mut api_shutdown = shutdown_rx.resubscribe();
        let api_handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!("管理界面退出异常: {e}");
            }
        });

        let (poll_result, fire_result, api_result) =
            tokio::join!(poll_handle, fire_handle, api_handle);
        poll_result.context("轮询循环异常退出")?;
        fire_result.context("cron 扇出循环异常退出")?;
        api_result.context("管理界面异常退出")?;

        info!("所有组件已停止");
        Ok(())
    }
}
