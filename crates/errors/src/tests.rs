use super::*;

#[test]
fn test_error_display() {
    let err = BatchError::TaskNotFound { id: 42 };
    assert_eq!(err.to_string(), "任务未找到: 42");

    let err = BatchError::InvalidCron {
        expr: "bad".to_string(),
        message: "解析失败".to_string(),
    };
    assert!(err.to_string().contains("bad"));
}

#[test]
fn test_from_serde_json() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: BatchError = json_err.into();
    assert!(matches!(err, BatchError::Serialization(_)));
}

#[test]
fn test_retryable() {
    assert!(BatchError::DatabaseOperation("连接中断".to_string()).is_retryable());
    assert!(!BatchError::UnknownTaskType("x".to_string()).is_retryable());
}
