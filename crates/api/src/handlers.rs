use std::collections::HashMap;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    response::Redirect,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use batch_domain::entities::{BatchSchedule, BatchTask, TaskStatus};
use batch_domain::repositories::{ScheduleRepository, TaskRepository};
use batch_engine::{validate_cron, RunContext};

use crate::routes::AppState;
use crate::time::parse_not_before;

/// 空 payload 统一为 `{}`
fn safe_json(payload: Option<&str>) -> String {
    match payload.map(str::trim) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => "{}".to_string(),
    }
}

/// 回显文本归一化：空白折叠，超长截断
fn safe_msg(msg: &str) -> String {
    let collapsed = msg.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > 500 {
        let clipped: String = collapsed.chars().take(500).collect();
        format!("{clipped}...")
    } else {
        collapsed
    }
}

fn redirect(pairs: &[(&str, &str)]) -> Redirect {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        query.append_pair(key, value);
    }
    Redirect::to(&format!("/?{}", query.finish()))
}

fn ok_info(info: &str) -> Redirect {
    redirect(&[("ok", "true"), ("info", info)])
}

fn fail(error: &str) -> Redirect {
    redirect(&[("ok", "false"), ("error", &safe_msg(error))])
}

// ============================================================================
// 总览
// ============================================================================

#[derive(Serialize)]
pub struct Overview {
    pub schedules: Vec<BatchSchedule>,
    pub tasks: Vec<BatchTask>,
    pub runners: Vec<String>,
    pub compensators: Vec<String>,
    /// 上一次操作的回显字段（ok / type / payload / cost / error / info）
    pub last: HashMap<String, String>,
}

pub async fn home(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Overview> {
    let schedules = state.schedules.find_all().await.unwrap_or_default();
    let tasks = state.tasks.find_all().await.unwrap_or_default();
    Json(Overview {
        schedules,
        tasks,
        runners: state.registrar.available_types(),
        compensators: state.engine.compensator_types(),
        last: params,
    })
}

// ============================================================================
// 手动执行
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ManualRunForm {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Option<String>,
}

/// 同步执行一个已注册的 Runner（不落任务，不建 run，不支持补偿登记）
pub async fn manual_run(
    State(state): State<AppState>,
    axum::Form(form): axum::Form<ManualRunForm>,
) -> Redirect {
    let json = safe_json(form.payload.as_deref());
    let start = Instant::now();
    let mut error: Option<String> = None;

    match state.registrar.get_runner(&form.task_type) {
        None => {
            error = Some(format!("Unknown type: {}，请先注册对应 Runner", form.task_type));
        }
        Some(runner) => match serde_json::from_str::<serde_json::Value>(&json) {
            Err(e) => error = Some(format!("BadPayload: {}", safe_msg(&e.to_string()))),
            Ok(parsed) => {
                let ctx = RunContext::detached(state.tx.clone());
                if let Err(e) = runner.init_job(&ctx, parsed).await {
                    warn!("手动执行失败: type={}, err={e}", form.task_type);
                    error = Some(safe_msg(&e.to_string()));
                }
            }
        },
    }

    let cost = start.elapsed().as_millis().to_string();
    let mut pairs: Vec<(&str, &str)> = vec![
        ("ok", if error.is_none() { "true" } else { "false" }),
        ("type", &form.task_type),
        ("payload", &json),
        ("cost", &cost),
    ];
    let error_text = error.unwrap_or_default();
    if !error_text.is_empty() {
        pairs.push(("error", &error_text));
    }
    redirect(&pairs)
}

// ============================================================================
// 调度
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateScheduleForm {
    #[serde(rename = "type")]
    pub task_type: String,
    pub cron: String,
    pub payload: Option<String>,
    pub enabled: Option<i32>,
}

pub async fn create_schedule(
    State(state): State<AppState>,
    axum::Form(form): axum::Form<CreateScheduleForm>,
) -> Redirect {
    if !state.registrar.has_runner(&form.task_type) {
        return fail(&format!(
            "Unknown type: {}，请先实现并注册对应 Runner",
            form.task_type
        ));
    }

    let json = safe_json(form.payload.as_deref());
    if let Err(e) = serde_json::from_str::<serde_json::Value>(&json) {
        return fail(&format!("BadPayload in schedule: {e}"));
    }
    if let Err(e) = validate_cron(&form.cron) {
        return fail(&e.to_string());
    }

    let mut schedule = BatchSchedule::new(form.task_type.clone(), form.cron.trim().to_string(), Some(json.clone()));
    schedule.enabled = form.enabled.unwrap_or(1);
    match state.schedules.create(&schedule).await {
        Ok(created) => redirect(&[
            ("ok", "true"),
            ("type", &created.task_type),
            ("payload", &json),
        ]),
        Err(e) => fail(&format!("创建调度失败: {e}")),
    }
}

#[derive(Debug, Deserialize)]
pub struct ToggleForm {
    pub enabled: bool,
}

pub async fn toggle_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    axum::Form(form): axum::Form<ToggleForm>,
) -> Redirect {
    match state.schedules.update_enabled(id, form.enabled).await {
        Ok(true) => ok_info(&format!("调度已更新: id={id}, enabled={}", form.enabled)),
        Ok(false) => fail(&format!("Schedule not found: id={id}")),
        Err(e) => fail(&format!("更新调度失败: {e}")),
    }
}

pub async fn delete_schedule(State(state): State<AppState>, Path(id): Path<i64>) -> Redirect {
    match state.schedules.find_by_id(id).await {
        Ok(None) => return fail(&format!("Schedule not found: id={id}")),
        Err(e) => return fail(&format!("查询调度失败: {e}")),
        Ok(Some(_)) => {}
    }
    match state.tasks.count_by_schedule_id(id).await {
        Ok(0) => {}
        Ok(total) => {
            return fail(&format!(
                "该调度还关联 {total} 条任务，请先删除任务再重试"
            ));
        }
        Err(e) => return fail(&format!("查询关联任务失败: {e}")),
    }
    match state.schedules.delete(id).await {
        Ok(_) => ok_info(&format!("调度已删除: id={id}")),
        Err(e) => fail(&format!("删除调度失败: {e}")),
    }
}

// ============================================================================
// 任务
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EnqueueForm {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Option<String>,
    #[serde(rename = "notBefore")]
    pub not_before: Option<String>,
}

pub async fn enqueue_task(
    State(state): State<AppState>,
    axum::Form(form): axum::Form<EnqueueForm>,
) -> Redirect {
    let json = safe_json(form.payload.as_deref());
    if !state.registrar.has_runner(&form.task_type) {
        return redirect(&[
            ("ok", "false"),
            ("type", &form.task_type),
            ("payload", &json),
            (
                "error",
                &format!("Unknown type: {}（没有对应的 Runner）", form.task_type),
            ),
        ]);
    }
    if let Err(e) = serde_json::from_str::<serde_json::Value>(&json) {
        return redirect(&[
            ("ok", "false"),
            ("type", &form.task_type),
            ("payload", &json),
            ("error", &format!("BadPayload: {}", safe_msg(&e.to_string()))),
        ]);
    }

    let not_before = match form.not_before.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => match parse_not_before(s) {
            Ok(ts) => Some(ts),
            Err(e) => {
                return redirect(&[
                    ("ok", "false"),
                    ("type", &form.task_type),
                    ("payload", &json),
                    ("error", &e),
                ]);
            }
        },
        _ => None,
    };

    let task = BatchTask::new_ad_hoc(form.task_type.clone(), json.clone(), not_before);
    match state.tasks.create(&task).await {
        Ok(_) => redirect(&[("ok", "true"), ("type", &form.task_type), ("payload", &json)]),
        Err(e) => fail(&format!("入队失败: {e}")),
    }
}

pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<i64>) -> Redirect {
    let task = match state.tasks.find_by_id(id).await {
        Ok(Some(task)) => task,
        Ok(None) => return fail(&format!("Task not found: id={id}")),
        Err(e) => return fail(&format!("查询任务失败: {e}")),
    };

    match task.status {
        TaskStatus::Pending => {
            match state
                .tasks
                .update_status_if(id, TaskStatus::Pending, TaskStatus::Canceled)
                .await
            {
                Ok(1) => ok_info(&format!("任务已取消: id={id}")),
                // 领取和取消赛跑输了：按运行中任务再走一遍请求路径
                Ok(_) => request_cancel_running(&state, id).await,
                Err(e) => fail(&format!("取消任务失败: {e}")),
            }
        }
        TaskStatus::Running => request_cancel_running(&state, id).await,
        status => ok_info(&format!("无需取消: id={id}, status={}", status.as_str())),
    }
}

async fn request_cancel_running(state: &AppState, id: i64) -> Redirect {
    match state
        .tasks
        .update_status_if(id, TaskStatus::Running, TaskStatus::CancelRequested)
        .await
    {
        Ok(1) => {
            // 运行在本进程时再发协作中断
            state.engine.interrupt_if_running(id);
            ok_info(&format!("已向运行中任务发出取消请求: id={id}"))
        }
        Ok(_) => ok_info(&format!("无需取消: id={id}")),
        Err(e) => fail(&format!("取消任务失败: {e}")),
    }
}

pub async fn delete_task(State(state): State<AppState>, Path(id): Path<i64>) -> Redirect {
    let task = match state.tasks.find_by_id(id).await {
        Ok(Some(task)) => task,
        Ok(None) => return fail(&format!("Task not found: id={id}")),
        Err(e) => return fail(&format!("查询任务失败: {e}")),
    };

    if !task.can_delete() {
        return fail(&format!("运行中/取消待确认的任务不可删除: id={id}"));
    }
    match state.tasks.delete(id).await {
        Ok(_) => ok_info(&format!("任务已删除: id={id}")),
        Err(e) => fail(&format!("删除任务失败: {e}")),
    }
}
