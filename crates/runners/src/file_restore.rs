//! 文件恢复补偿器
//!
//! action_type = `file.restore`。payload：
//!   - `root`：可选，缺省用配置的默认根目录
//!   - `file`：必填，root 下的相对路径
//!   - `origBase64`：可选。有值则解码后原子写回（旁路临时文件 + rename，
//!     rename 失败退化为复制）；无值表示原本不存在，delete-if-exists。
//!
//! 归一化后越出 root 的目标一律报错（路径穿越防护）。幂等：重复回放
//! 得到同一终态。

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use tracing::{debug, error, info, warn};

use batch_engine::Compensator;
use batch_errors::{BatchError, BatchResult};

const MAX_BASE64_LEN: usize = 200 * 1024;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// 词法归一化：消去 `.` 与 `..`，不访问文件系统
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn write_atomic(target: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = target.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let tmp = parent.join(format!(
        ".tmp-{}-{}.part",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    if let Err(e) = std::fs::write(&tmp, data) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    match std::fs::rename(&tmp, target) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // 文件系统拒绝原子替换时退化为复制
            debug!("原子替换失败，退化为复制: {target:?}, err={rename_err}");
            let copied = std::fs::copy(&tmp, target).map(|_| ());
            let _ = std::fs::remove_file(&tmp);
            copied
        }
    }
}

pub struct FileRestoreCompensator {
    default_root: PathBuf,
}

impl FileRestoreCompensator {
    pub fn new(default_root: impl Into<PathBuf>) -> Self {
        Self {
            default_root: default_root.into(),
        }
    }
}

#[async_trait]
impl Compensator for FileRestoreCompensator {
    fn action_type(&self) -> &str {
        "file.restore"
    }

    async fn compensate(&self, run_id: i64, payload: &serde_json::Value) -> BatchResult<bool> {
        if !payload.is_object() {
            warn!("file.restore: payload 为空: run_id={run_id}");
            return Ok(false);
        }

        let root = match payload.get("root").and_then(|v| v.as_str()) {
            Some(root) => PathBuf::from(root),
            None => self.default_root.clone(),
        };
        let root = normalize(&std::path::absolute(&root).map_err(|e| {
            BatchError::Compensation(format!("file.restore: root 无法解析: {e}"))
        })?);

        let Some(file_rel) = payload.get("file").and_then(|v| v.as_str()) else {
            warn!("file.restore: payload 缺少 file 字段: run_id={run_id}");
            return Ok(false);
        };

        let target = normalize(&root.join(file_rel));
        if !target.starts_with(&root) {
            let msg = format!(
                "file.restore: 目标越出 root: run_id={run_id}, target={}, root={}",
                target.display(),
                root.display()
            );
            error!("{msg}");
            return Err(BatchError::Compensation(msg));
        }

        match payload.get("origBase64").filter(|v| !v.is_null()) {
            Some(value) => {
                let Some(b64) = value.as_str() else {
                    return Err(BatchError::Compensation(
                        "file.restore: origBase64 不是字符串".to_string(),
                    ));
                };
                if b64.len() > MAX_BASE64_LEN {
                    let msg = format!(
                        "file.restore: origBase64 超限: run_id={run_id}, size={}",
                        b64.len()
                    );
                    error!("{msg}");
                    return Err(BatchError::Compensation(msg));
                }
                let data = base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| {
                        BatchError::Compensation(format!("file.restore: base64 解码失败: {e}"))
                    })?;

                let write_target = target.clone();
                tokio::task::spawn_blocking(move || write_atomic(&write_target, &data))
                    .await
                    .map_err(|e| BatchError::Internal(e.to_string()))?
                    .map_err(|e| {
                        BatchError::Compensation(format!(
                            "file.restore: 写回失败: target={}, err={e}",
                            target.display()
                        ))
                    })?;

                info!("file.restore: 已恢复文件: run_id={run_id} -> {}", target.display());
                Ok(true)
            }
            None => {
                // 原本不存在：删除目标（幂等）
                let deleted = match tokio::fs::remove_file(&target).await {
                    Ok(()) => true,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                    Err(e) => {
                        return Err(BatchError::Compensation(format!(
                            "file.restore: 删除失败: target={}, err={e}",
                            target.display()
                        )));
                    }
                };
                info!(
                    "file.restore: delete-if-exists: run_id={run_id}, target={}, deleted={deleted}",
                    target.display()
                );
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compensator(root: &Path) -> FileRestoreCompensator {
        FileRestoreCompensator::new(root)
    }

    fn encode(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    #[test]
    fn test_normalize_strips_dot_segments() {
        assert_eq!(
            normalize(Path::new("/data/root/../evil")),
            PathBuf::from("/data/evil")
        );
        assert_eq!(
            normalize(Path::new("/data/./a/b")),
            PathBuf::from("/data/a/b")
        );
    }

    #[tokio::test]
    async fn test_restore_writes_decoded_content() {
        let dir = tempfile::tempdir().unwrap();
        let comp = compensator(dir.path());

        let ok = comp
            .compensate(
                1,
                &json!({"file": "sub/data.txt", "origBase64": encode(b"hello")}),
            )
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(
            std::fs::read(dir.path().join("sub/data.txt")).unwrap(),
            b"hello"
        );

        // 覆盖已有内容（幂等重放到同一终态）
        let ok = comp
            .compensate(
                1,
                &json!({"file": "sub/data.txt", "origBase64": encode(b"world")}),
            )
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(
            std::fs::read(dir.path().join("sub/data.txt")).unwrap(),
            b"world"
        );
    }

    #[tokio::test]
    async fn test_no_base64_deletes_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let comp = compensator(dir.path());
        std::fs::write(dir.path().join("stale.txt"), b"x").unwrap();

        let ok = comp
            .compensate(2, &json!({"file": "stale.txt"}))
            .await
            .unwrap();
        assert!(ok);
        assert!(!dir.path().join("stale.txt").exists());

        // 再删一次仍然成功（幂等）
        let ok = comp
            .compensate(2, &json!({"file": "stale.txt"}))
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let comp = compensator(dir.path());

        let err = comp
            .compensate(3, &json!({"file": "../outside.txt", "origBase64": encode(b"x")}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("越出 root"));
    }

    #[tokio::test]
    async fn test_oversized_base64_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let comp = compensator(dir.path());

        let big = "A".repeat(MAX_BASE64_LEN + 1);
        let err = comp
            .compensate(4, &json!({"file": "big.bin", "origBase64": big}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("超限"));
    }

    #[tokio::test]
    async fn test_missing_file_field_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let comp = compensator(dir.path());

        assert!(!comp.compensate(5, &json!({"root": "/tmp"})).await.unwrap());
        assert!(!comp.compensate(5, &json!(null)).await.unwrap());
    }

    #[tokio::test]
    async fn test_payload_root_overrides_default() {
        let default_dir = tempfile::tempdir().unwrap();
        let other_dir = tempfile::tempdir().unwrap();
        let comp = compensator(default_dir.path());

        let ok = comp
            .compensate(
                6,
                &json!({
                    "root": other_dir.path().to_str().unwrap(),
                    "file": "a.txt",
                    "origBase64": encode(b"payload root"),
                }),
            )
            .await
            .unwrap();
        assert!(ok);
        assert!(other_dir.path().join("a.txt").exists());
        assert!(!default_dir.path().join("a.txt").exists());
    }
}
