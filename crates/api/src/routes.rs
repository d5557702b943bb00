use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use batch_domain::repositories::{ScheduleRepository, TaskRepository};
use batch_domain::services::TxService;
use batch_engine::{RunnerRegistrar, TaskEngine};

use crate::handlers::{
    cancel_task, create_schedule, delete_schedule, delete_task, enqueue_task, home, manual_run,
    toggle_schedule,
};

#[derive(Clone)]
pub struct AppState {
    pub schedules: Arc<dyn ScheduleRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub tx: Arc<dyn TxService>,
    pub engine: TaskEngine,
    pub registrar: Arc<RunnerRegistrar>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/manual/run", post(manual_run))
        .route("/schedules", post(create_schedule))
        .route("/tasks/enqueue", post(enqueue_task))
        .route("/schedule/{id}/toggle", post(toggle_schedule))
        .route("/schedule/{id}/delete", post(delete_schedule))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/delete", post(delete_task))
        .with_state(state)
}
