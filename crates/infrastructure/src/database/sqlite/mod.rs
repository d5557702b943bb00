pub mod run_repository;
pub mod schedule_repository;
pub mod task_picker;
pub mod task_repository;
pub mod tx_service;

pub use run_repository::SqliteRunRepository;
pub use schedule_repository::SqliteScheduleRepository;
pub use task_picker::SqliteTaskPicker;
pub use task_repository::SqliteTaskRepository;
pub use tx_service::SqliteTxService;

/// SQLite 建表语句
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS batch_schedule (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        cron TEXT NOT NULL,
        payload TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_fire_at DATETIME
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sched_enabled ON batch_schedule(enabled)",
    r#"
    CREATE TABLE IF NOT EXISTS batch_task (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        schedule_id INTEGER,
        ticket_no TEXT,
        type TEXT NOT NULL,
        payload TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        not_before DATETIME,
        owner TEXT,
        heartbeat_at DATETIME,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL,
        finish_at DATETIME,
        message TEXT
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS uk_task_ticket ON batch_task(ticket_no)",
    "CREATE INDEX IF NOT EXISTS idx_task_status ON batch_task(status)",
    "CREATE INDEX IF NOT EXISTS idx_task_not_before ON batch_task(not_before)",
    "CREATE INDEX IF NOT EXISTS idx_task_pick ON batch_task(status, not_before, priority, id)",
    r#"
    CREATE TABLE IF NOT EXISTS batch_run (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        started_at DATETIME NOT NULL,
        ended_at DATETIME,
        status TEXT NOT NULL,
        message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_run_task ON batch_run(task_id)",
    r#"
    CREATE TABLE IF NOT EXISTS batch_operation_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL,
        seq_no INTEGER NOT NULL,
        action_type TEXT,
        action_payload TEXT,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_op_run ON batch_operation_log(run_id)",
];
