//! Runner 解析与注册
//!
//! type -> Runner 的解析顺序：
//!  1. 缓存
//!  2. 启动装配时按名注册的实例
//!  3. 映射文件（value 为 Runner 名，或白名单前缀内的工厂名）
//!  4. 在已注册实例中按 Runner 名兜底匹配
//!
//! 映射文件指向工厂名时，只有命中前缀白名单的工厂才会被实例化；
//! 工厂表在启动装配时静态登记，运行期不做任何动态加载。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use batch_errors::{BatchError, BatchResult};

use crate::engine::TaskEngine;
use crate::runner::TaskRunner;

type RunnerFactory = Box<dyn Fn() -> Arc<dyn TaskRunner> + Send + Sync>;

pub struct RunnerRegistrar {
    engine: TaskEngine,
    // 装配时注册的实例：name -> Runner
    runners_by_name: HashMap<String, Arc<dyn TaskRunner>>,
    // 编译期工厂表：工厂名 -> 构造闭包
    factories: HashMap<String, RunnerFactory>,
    // 映射文件内容：type -> Runner 名或工厂名
    mapping: HashMap<String, String>,
    allowed_prefixes: Vec<String>,
    cache: RwLock<HashMap<String, Arc<dyn TaskRunner>>>,
}

impl RunnerRegistrar {
    pub fn new(engine: TaskEngine, allowed_prefixes: Vec<String>) -> Self {
        Self {
            engine,
            runners_by_name: HashMap::new(),
            factories: HashMap::new(),
            mapping: HashMap::new(),
            allowed_prefixes,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 装配期按名注册一个实例
    pub fn register_runner(&mut self, runner: Arc<dyn TaskRunner>) {
        let name = runner.name().to_string();
        if self.runners_by_name.contains_key(&name) {
            warn!("Runner 实例重名: {name}，保留先注册实例");
            return;
        }
        self.runners_by_name.insert(name, runner);
    }

    /// 装配期登记一个工厂（映射文件可按工厂名引用）
    pub fn register_factory<F>(&mut self, factory_name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn TaskRunner> + Send + Sync + 'static,
    {
        self.factories
            .insert(factory_name.to_string(), Box::new(factory));
    }

    /// 加载映射文件（key=value 每行一条，# 开头为注释）。
    /// 文件缺失是合法的空配置。
    pub fn load_mapping_file(&mut self, path: &Path) -> BatchResult<usize> {
        if !path.exists() {
            debug!("映射文件不存在: {}", path.display());
            return Ok(0);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| BatchError::config_error(format!("读取映射文件失败: {e}")))?;
        let mut loaded = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("映射行格式错误，跳过: {line}");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }
            self.mapping.insert(key.to_string(), value.to_string());
            loaded += 1;
        }
        info!("映射文件已加载: {} 条", loaded);
        Ok(loaded)
    }

    /// 启动收尾：把所有可解析的 type 注册进引擎（引擎处理重复策略）
    pub fn init(&self) -> BatchResult<()> {
        let mut keys: Vec<String> = self.runners_by_name.keys().cloned().collect();
        for key in self.mapping.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys.sort();

        for type_code in keys {
            let Some(runner) = self.get_runner(&type_code) else {
                debug!("type '{type_code}' 未解析到 Runner，跳过引擎注册");
                continue;
            };
            self.engine.register(&type_code, runner)?;
        }
        info!(
            "Runner 注册完成: instances={}, mappings={}",
            self.runners_by_name.len(),
            self.mapping.len()
        );
        Ok(())
    }

    pub fn get_runner(&self, type_code: &str) -> Option<Arc<dyn TaskRunner>> {
        if type_code.is_empty() {
            return None;
        }

        // 1. 缓存
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(type_code)
        {
            return Some(cached.clone());
        }

        // 2. 按名注册的实例
        if let Some(runner) = self.runners_by_name.get(type_code) {
            self.cache_put(type_code, runner.clone());
            return Some(runner.clone());
        }

        // 3. 映射文件
        if let Some(mapped) = self.mapping.get(type_code) {
            if let Some(runner) = self.runners_by_name.get(mapped) {
                self.cache_put(type_code, runner.clone());
                return Some(runner.clone());
            }
            if self.is_allowed_factory(mapped) {
                if let Some(factory) = self.factories.get(mapped) {
                    let created = factory();
                    self.cache_put(type_code, created.clone());
                    self.cache_put(created.name(), created.clone());
                    return Some(created);
                }
                warn!("映射指向未登记的工厂: {mapped}");
            } else {
                warn!("映射的工厂名不在白名单内: {mapped}");
            }
        }

        // 4. 按 Runner 名兜底匹配
        for runner in self.runners_by_name.values() {
            if runner.name() == type_code {
                self.cache_put(type_code, runner.clone());
                return Some(runner.clone());
            }
        }

        None
    }

    pub fn has_runner(&self, type_code: &str) -> bool {
        self.get_runner(type_code).is_some()
    }

    /// 可用类型（优先映射文件的 key，避免实例名干扰界面）
    pub fn available_types(&self) -> Vec<String> {
        let mut types: Vec<String> = if self.mapping.is_empty() {
            self.runners_by_name.keys().cloned().collect()
        } else {
            self.mapping.keys().cloned().collect()
        };
        types.sort();
        types
    }

    fn cache_put(&self, type_code: &str, runner: Arc<dyn TaskRunner>) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(type_code.to_string())
            .or_insert(runner);
    }

    fn is_allowed_factory(&self, factory_name: &str) -> bool {
        self.allowed_prefixes
            .iter()
            .any(|prefix| factory_name.starts_with(prefix))
    }
}
