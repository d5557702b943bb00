//! 代码索引 Runner
//!
//! type code `code.index`。payload：
//!   - `root`：必填，待索引的源码根目录
//!   - `output`：必填，CSV 输出文件路径
//!   - `includes` / `excludes`：可选，相对路径的子串过滤器
//!
//! 扫描 root 下的普通文件，每个文件产出一行
//! `path,extension,lines,bytes`。并发分片处理，单文件结果先在本地
//! 缓冲，落盘只在共享输出上做短临界区，压低并发生产者的锁持有时间。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

use batch_engine::{RunContext, TaskRunner};
use batch_errors::{BatchError, BatchResult};

/// 分片并发度
const INDEX_WORKERS: usize = 4;

/// 相对路径过滤器（子串匹配）
///
/// excludes 命中即拒绝；includes 非空时必须命中其一。
pub struct PathFilter {
    includes: Vec<String>,
    excludes: Vec<String>,
}

const DEFAULT_EXCLUDES: &[&str] = &["target/", "build/", ".git/", ".idea/", "generated/"];

impl PathFilter {
    pub fn new(includes: Vec<String>, excludes: Vec<String>) -> Self {
        let mut all_excludes: Vec<String> =
            DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        all_excludes.extend(excludes.into_iter().filter(|s| !s.trim().is_empty()));
        Self {
            includes: includes.into_iter().filter(|s| !s.trim().is_empty()).collect(),
            excludes: all_excludes,
        }
    }

    pub fn accepts(&self, relative: &str) -> bool {
        if self.excludes.iter().any(|pat| relative.contains(pat.as_str())) {
            return false;
        }
        if self.includes.is_empty() {
            return true;
        }
        self.includes.iter().any(|pat| relative.contains(pat.as_str()))
    }
}

fn required_str(payload: &serde_json::Value, key: &str) -> BatchResult<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| BatchError::validation_error(format!("payload.{key} required")))
}

fn read_string_array(payload: &serde_json::Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// 同步递归收集 root 下通过过滤器的普通文件（相对路径）
fn collect_files(root: &Path, filter: &PathFilter) -> std::io::Result<Vec<PathBuf>> {
    fn walk(
        root: &Path,
        dir: &Path,
        filter: &PathFilter,
        out: &mut Vec<PathBuf>,
    ) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            if file_type.is_dir() {
                // 目录本身不过滤 includes，只挡 excludes，否则子树会被整体误杀
                let dir_key = format!("{relative}/");
                if filter
                    .excludes
                    .iter()
                    .any(|pat| dir_key.contains(pat.as_str()))
                {
                    continue;
                }
                walk(root, &path, filter, out)?;
            } else if file_type.is_file() && filter.accepts(&relative) {
                out.push(PathBuf::from(relative));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, root, filter, &mut files)?;
    files.sort();
    Ok(files)
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub struct CodeIndexRunner;

impl CodeIndexRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CodeIndexRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRunner for CodeIndexRunner {
    fn name(&self) -> &str {
        "CodeIndexRunner"
    }

    async fn init_job(&self, _ctx: &RunContext, payload: serde_json::Value) -> BatchResult<()> {
        info!("CodeIndexRunner 启动: payload={payload}");

        let root = PathBuf::from(required_str(&payload, "root")?);
        let output = PathBuf::from(required_str(&payload, "output")?);
        let filter = Arc::new(PathFilter::new(
            read_string_array(&payload, "includes"),
            read_string_array(&payload, "excludes"),
        ));

        let walk_root = root.clone();
        let walk_filter = Arc::clone(&filter);
        let files = tokio::task::spawn_blocking(move || collect_files(&walk_root, &walk_filter))
            .await
            .map_err(|e| BatchError::Internal(e.to_string()))?
            .map_err(|e| {
                BatchError::TaskExecution(format!("扫描目录失败: {}: {e}", root.display()))
            })?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BatchError::TaskExecution(format!("创建输出目录失败: {e}")))?;
        }
        let mut out_file = tokio::fs::File::create(&output)
            .await
            .map_err(|e| BatchError::TaskExecution(format!("创建输出文件失败: {e}")))?;
        out_file
            .write_all(b"path,extension,lines,bytes\n")
            .await
            .map_err(|e| BatchError::TaskExecution(format!("写输出失败: {e}")))?;
        let out_file = Arc::new(Mutex::new(out_file));

        let total = files.len();
        let chunk_size = total.div_ceil(INDEX_WORKERS).max(1);
        let mut workers = Vec::new();
        for chunk in files.chunks(chunk_size) {
            let chunk: Vec<PathBuf> = chunk.to_vec();
            let root = root.clone();
            let out_file = Arc::clone(&out_file);
            workers.push(tokio::spawn(async move {
                // 本地缓冲本分片的所有行
                let mut buffer = String::new();
                for relative in &chunk {
                    let full = root.join(relative);
                    match tokio::fs::read(&full).await {
                        Ok(bytes) => {
                            let lines = bytes.iter().filter(|b| **b == b'\n').count();
                            let extension = relative
                                .extension()
                                .map(|e| e.to_string_lossy().to_string())
                                .unwrap_or_default();
                            buffer.push_str(&format!(
                                "{},{},{lines},{}\n",
                                csv_escape(&relative.to_string_lossy()),
                                csv_escape(&extension),
                                bytes.len()
                            ));
                        }
                        Err(e) => {
                            error!("读取文件失败，跳过: {}: {e}", full.display());
                        }
                    }
                }
                // 短临界区：一次性落盘整个分片
                let mut file = out_file.lock().await;
                file.write_all(buffer.as_bytes()).await
            }));
        }
        for worker in workers {
            worker
                .await
                .map_err(|e| BatchError::Internal(e.to_string()))?
                .map_err(|e| BatchError::TaskExecution(format!("写输出失败: {e}")))?;
        }
        out_file
            .lock()
            .await
            .flush()
            .await
            .map_err(|e| BatchError::TaskExecution(format!("落盘失败: {e}")))?;

        info!(
            "CodeIndexRunner 完成: root={}, files={total}, output={}",
            root.display(),
            output.display()
        );
        Ok(())
    }
}
