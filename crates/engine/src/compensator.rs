//! 补偿器契约与注册表

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::warn;

use batch_errors::BatchResult;

/// 补偿执行单元
///
/// 回放引擎按 action_type 解析后调用 `compensate`。实现应幂等：
/// 返回 Ok(true) 记 DONE，Ok(false) 记 FAILED（等待重试或人工介入），
/// 返回错误记 FAILED 并保留错误文本。
#[async_trait]
pub trait Compensator: Send + Sync {
    /// 此补偿器对应的 action_type
    fn action_type(&self) -> &str;

    async fn compensate(&self, run_id: i64, payload: &serde_json::Value) -> BatchResult<bool>;
}

/// 补偿器注册表（先到先得，冲突告警）
#[derive(Default)]
pub struct CompensatorRegistry {
    map: RwLock<HashMap<String, Arc<dyn Compensator>>>,
}

impl CompensatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, compensator: Arc<dyn Compensator>) {
        let action_type = compensator.action_type().to_string();
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&action_type) {
            warn!("补偿器冲突: action_type={action_type}，保留已注册实例");
            return;
        }
        map.insert(action_type, compensator);
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn Compensator>> {
        self.map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(action_type)
            .cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(action_type)
    }

    pub fn available_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCompensator {
        action: String,
    }

    #[async_trait]
    impl Compensator for NoopCompensator {
        fn action_type(&self) -> &str {
            &self.action
        }

        async fn compensate(
            &self,
            _run_id: i64,
            _payload: &serde_json::Value,
        ) -> BatchResult<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = CompensatorRegistry::new();
        let first = Arc::new(NoopCompensator {
            action: "file.restore".to_string(),
        });
        let second = Arc::new(NoopCompensator {
            action: "file.restore".to_string(),
        });

        registry.register(first.clone());
        registry.register(second);

        let resolved = registry.get("file.restore").unwrap();
        assert!(std::ptr::eq(
            Arc::as_ptr(&resolved) as *const (),
            Arc::as_ptr(&first) as *const ()
        ));
        assert!(registry.contains("file.restore"));
        assert!(!registry.contains("other"));
        assert_eq!(registry.available_types(), vec!["file.restore".to_string()]);
    }
}
