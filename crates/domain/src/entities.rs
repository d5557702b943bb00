//! 核心领域实体
//!
//! 调度（batch_schedule）、任务（batch_task）、运行记录（batch_run）与
//! 补偿日志（batch_operation_log）。所有时间戳为毫秒精度 UTC 时刻。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// 状态枚举
// ============================================================================

/// 任务状态
///
/// 生命周期：PENDING 创建后可被领取；领取后进入 RUNNING；
/// 终态为 SUCCEED / FAILED / CANCELED。CANCEL_REQUESTED 表示
/// 运行中收到取消请求，等待 Worker 协作停止。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEED")]
    Succeed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "CANCEL_REQUESTED")]
    CancelRequested,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeed => "SUCCEED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::CancelRequested => "CANCEL_REQUESTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "SUCCEED" => Some(TaskStatus::Succeed),
            "FAILED" => Some(TaskStatus::Failed),
            "CANCELED" => Some(TaskStatus::Canceled),
            "CANCEL_REQUESTED" => Some(TaskStatus::CancelRequested),
            _ => None,
        }
    }

    /// 终态不再迁移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// 允许的状态迁移边
    pub fn can_transition(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Canceled)
                | (Running, CancelRequested)
                | (Running, Succeed)
                | (Running, Failed)
                | (Running, Canceled)
                | (CancelRequested, Canceled)
        )
    }
}

// SQLx 数据库类型支持 - TaskStatus
impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        TaskStatus::parse(s).ok_or_else(|| format!("Invalid task status: {s}").into())
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        TaskStatus::parse(s).ok_or_else(|| format!("Invalid task status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 运行记录状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEED")]
    Succeed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELED")]
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeed => "SUCCEED",
            RunStatus::Failed => "FAILED",
            RunStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "SUCCEED" => Some(RunStatus::Succeed),
            "FAILED" => Some(RunStatus::Failed),
            "CANCELED" => Some(RunStatus::Canceled),
            _ => None,
        }
    }
}

// SQLx 数据库类型支持 - RunStatus
impl sqlx::Type<sqlx::Postgres> for RunStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for RunStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for RunStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        RunStatus::parse(s).ok_or_else(|| format!("Invalid run status: {s}").into())
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for RunStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        RunStatus::parse(s).ok_or_else(|| format!("Invalid run status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for RunStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for RunStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 补偿日志条目状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OpStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "PENDING",
            OpStatus::Done => "DONE",
            OpStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OpStatus::Pending),
            "DONE" => Some(OpStatus::Done),
            "FAILED" => Some(OpStatus::Failed),
            _ => None,
        }
    }
}

// SQLx 数据库类型支持 - OpStatus
impl sqlx::Type<sqlx::Postgres> for OpStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl sqlx::Type<sqlx::Sqlite> for OpStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for OpStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        OpStatus::parse(s).ok_or_else(|| format!("Invalid operation log status: {s}").into())
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for OpStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        OpStatus::parse(s).ok_or_else(|| format!("Invalid operation log status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for OpStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for OpStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

// ============================================================================
// 调度实体
// ============================================================================

/// 周期调度定义
///
/// `last_fire_at` 仅由 cron 扇出服务推进，其余字段由管理界面维护。
/// enabled 为 1 时 cron 必须可解析；无效行由扇出服务跳过并告警，不删除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSchedule {
    pub id: i64,
    pub task_type: String,
    pub cron: String,
    pub payload: Option<String>,
    pub enabled: i32,
    pub last_fire_at: Option<DateTime<Utc>>,
}

impl BatchSchedule {
    pub fn new(task_type: String, cron: String, payload: Option<String>) -> Self {
        Self {
            id: 0,
            task_type,
            cron,
            payload,
            enabled: 1,
            last_fire_at: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }
}

// ============================================================================
// 任务实体
// ============================================================================

/// 一次可领取执行的批处理任务
///
/// `ticket_no` 为全局唯一去重键（cron 扇出生成的任务携带，手工入队为 NULL）。
/// `owner` 标识领取该任务的工作进程，领取到回写之间该进程独占状态变更。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTask {
    pub id: i64,
    pub schedule_id: Option<i64>,
    pub ticket_no: Option<String>,
    pub task_type: String,
    pub payload: Option<String>,
    pub priority: i32,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finish_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl BatchTask {
    /// 手工入队的任务（不关联调度，无 ticket）
    pub fn new_ad_hoc(
        task_type: String,
        payload: String,
        not_before: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            schedule_id: None,
            ticket_no: None,
            task_type,
            payload: Some(payload),
            priority: 0,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            not_before,
            owner: None,
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
            finish_at: None,
            message: None,
        }
    }

    /// 空 payload 统一为 `{}`
    pub fn safe_payload(&self) -> String {
        match self.payload.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => "{}".to_string(),
        }
    }

    /// 运行中/取消待确认的任务不可删除
    pub fn can_delete(&self) -> bool {
        !matches!(
            self.status,
            TaskStatus::Running | TaskStatus::CancelRequested
        )
    }
}

/// cron 扇出生成的待插入任务行（带去重 ticket 的条件插入）
#[derive(Debug, Clone)]
pub struct NewFireTask {
    pub ticket_no: String,
    pub task_type: String,
    pub payload: String,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub schedule_id: Option<i64>,
}

// ============================================================================
// 运行记录
// ============================================================================

/// 任务的一次执行尝试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: i64,
    pub task_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub message: Option<String>,
}

impl BatchRun {
    pub fn is_finished(&self) -> bool {
        !matches!(self.status, RunStatus::Running)
    }
}

// ============================================================================
// 补偿日志
// ============================================================================

/// 补偿动作记录
///
/// Runner 执行期间追加（seq_no 在 run 内从 1 起单调递增），
/// 之后仅由补偿回放引擎变更状态。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLog {
    pub id: i64,
    pub run_id: i64,
    pub seq_no: i32,
    pub action_type: Option<String>,
    pub action_payload: Option<String>,
    pub status: OpStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeed,
            TaskStatus::Failed,
            TaskStatus::Canceled,
            TaskStatus::CancelRequested,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("NOPE"), None);
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeed,
            TaskStatus::Failed,
            TaskStatus::Canceled,
            TaskStatus::CancelRequested,
        ];
        for from in all {
            if from.is_terminal() {
                for to in all {
                    assert!(!from.can_transition(to), "{from:?} -> {to:?} 不应允许");
                }
            }
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(TaskStatus::Pending.can_transition(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition(TaskStatus::Canceled));
        assert!(TaskStatus::Running.can_transition(TaskStatus::CancelRequested));
        assert!(TaskStatus::CancelRequested.can_transition(TaskStatus::Canceled));
        assert!(!TaskStatus::Pending.can_transition(TaskStatus::Succeed));
        assert!(!TaskStatus::CancelRequested.can_transition(TaskStatus::Running));
    }

    #[test]
    fn test_safe_payload() {
        let mut task = BatchTask::new_ad_hoc("demo".to_string(), "{\"a\":1}".to_string(), None);
        assert_eq!(task.safe_payload(), "{\"a\":1}");
        task.payload = Some("   ".to_string());
        assert_eq!(task.safe_payload(), "{}");
        task.payload = None;
        assert_eq!(task.safe_payload(), "{}");
    }

    #[test]
    fn test_can_delete() {
        let mut task = BatchTask::new_ad_hoc("demo".to_string(), "{}".to_string(), None);
        assert!(task.can_delete());
        task.status = TaskStatus::Running;
        assert!(!task.can_delete());
        task.status = TaskStatus::CancelRequested;
        assert!(!task.can_delete());
        task.status = TaskStatus::Failed;
        assert!(task.can_delete());
    }
}
