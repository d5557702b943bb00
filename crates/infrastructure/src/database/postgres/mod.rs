pub mod run_repository;
pub mod schedule_repository;
pub mod task_picker;
pub mod task_repository;
pub mod tx_service;

pub use run_repository::PostgresRunRepository;
pub use schedule_repository::PostgresScheduleRepository;
pub use task_picker::PostgresTaskPicker;
pub use task_repository::PostgresTaskRepository;
pub use tx_service::PostgresTxService;

/// PostgreSQL 建表语句（毫秒精度时间戳）
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS batch_schedule (
        id BIGSERIAL PRIMARY KEY,
        type VARCHAR(64) NOT NULL,
        cron VARCHAR(64) NOT NULL,
        payload TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_fire_at TIMESTAMPTZ(3)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sched_enabled ON batch_schedule(enabled)",
    r#"
    CREATE TABLE IF NOT EXISTS batch_task (
        id BIGSERIAL PRIMARY KEY,
        schedule_id BIGINT,
        ticket_no VARCHAR(128),
        type VARCHAR(64) NOT NULL,
        payload TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        status VARCHAR(16) NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        not_before TIMESTAMPTZ(3),
        owner VARCHAR(64),
        heartbeat_at TIMESTAMPTZ(3),
        created_at TIMESTAMPTZ(3) NOT NULL,
        updated_at TIMESTAMPTZ(3) NOT NULL,
        finish_at TIMESTAMPTZ(3),
        message VARCHAR(2000)
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS uk_task_ticket ON batch_task(ticket_no)",
    "CREATE INDEX IF NOT EXISTS idx_task_status ON batch_task(status)",
    "CREATE INDEX IF NOT EXISTS idx_task_not_before ON batch_task(not_before)",
    "CREATE INDEX IF NOT EXISTS idx_task_pick ON batch_task(status, not_before, priority, id)",
    r#"
    CREATE TABLE IF NOT EXISTS batch_run (
        id BIGSERIAL PRIMARY KEY,
        task_id BIGINT NOT NULL,
        started_at TIMESTAMPTZ(3) NOT NULL,
        ended_at TIMESTAMPTZ(3),
        status VARCHAR(16) NOT NULL,
        message VARCHAR(2000)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_run_task ON batch_run(task_id)",
    r#"
    CREATE TABLE IF NOT EXISTS batch_operation_log (
        id BIGSERIAL PRIMARY KEY,
        run_id BIGINT NOT NULL,
        seq_no INTEGER NOT NULL,
        action_type VARCHAR(128),
        action_payload TEXT,
        status VARCHAR(16) NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TIMESTAMPTZ(3) NOT NULL,
        updated_at TIMESTAMPTZ(3) NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_op_run ON batch_operation_log(run_id)",
];
