//! 配置模型

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub poll: PollConfig,
    pub cron: CronConfig,
    pub runner: RunnerConfig,
    pub executor: ExecutorConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// postgres:// 或 sqlite: 连接串，启动时据此选择厂商实现
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 10,
        }
    }
}

/// 引擎轮询参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// 两次轮询 tick 之间的间隔（毫秒）
    pub delay_ms: u64,
    /// 每个 tick 最多派发的任务数
    pub batch: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            delay_ms: 2000,
            batch: 16,
        }
    }
}

/// cron 扇出参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub scan_interval_ms: u64,
    pub initial_delay_ms: u64,
    /// last_fire_at 为空时的回填窗口（秒）
    pub backfill_window_seconds: i64,
    /// 单调度单 tick 的触发上限（防止超宽回填）
    pub max_fire_per_tick: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 10_000,
            initial_delay_ms: 5_000,
            backfill_window_seconds: 3600,
            max_fire_per_tick: 5000,
        }
    }
}

/// Runner 注册与解析参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// true 时重复注册同一 type 直接失败；false 保留先到的并告警
    pub strict_registration: bool,
    /// 映射文件中工厂名必须命中的前缀白名单
    pub allowed_factory_prefixes: Vec<String>,
    /// type -> runner/工厂名 的映射文件路径（key=value 每行一条）
    pub mapping_file: Option<String>,
    /// 文件恢复补偿器的默认根目录
    pub default_root: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            strict_registration: false,
            allowed_factory_prefixes: vec!["batch_runners::".to_string()],
            mapping_file: None,
            default_root: "/".to_string(),
        }
    }
}

/// 执行器并发上限
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// 并发执行许可数；满载时轮询方内联执行形成背压
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_concurrent: std::cmp::max(32, cores * 16),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}
