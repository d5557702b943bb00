use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("运行记录未找到: {id}")]
    RunNotFound { id: i64 },
    #[error("调度未找到: {id}")]
    ScheduleNotFound { id: i64 },
    #[error("补偿记录未找到: {id}")]
    OperationLogNotFound { id: i64 },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("未注册的任务类型: {0}")]
    UnknownTaskType(String),
    #[error("Runner重复注册: {0}")]
    DuplicateRunner(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("补偿执行错误: {0}")]
    Compensation(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type BatchResult<T> = Result<T, BatchError>;

impl BatchError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn run_not_found(id: i64) -> Self {
        Self::RunNotFound { id }
    }
    pub fn unknown_type<S: Into<String>>(type_code: S) -> Self {
        Self::UnknownTaskType(type_code.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    /// 是否值得上层重试（瞬时故障）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchError::Database(_) | BatchError::DatabaseOperation(_)
        )
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        BatchError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for BatchError {
    fn from(err: anyhow::Error) -> Self {
        BatchError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
