use crate::repository::DbPool;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

pub async fn establish_connection(database_url: &str) -> Result<DbPool> {
    // Ensure the database URL has the correct format
    let db_url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{}", database_url)
    };

    // WAL keeps concurrent readers unblocked while writes stay serialized;
    // foreign_keys must be on for cascade deletes to work at all.
    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            command TEXT NOT NULL,
            description TEXT,
            cron TEXT,
            is_enabled BOOLEAN NOT NULL DEFAULT 1,
            is_infinite BOOLEAN NOT NULL DEFAULT 0,
            create_date TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            command TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            process_id INTEGER,
            process_return_code INTEGER,
            scheduled_date TEXT,
            create_date TEXT NOT NULL,
            start_date TEXT,
            finish_date TEXT,
            stop_reason INTEGER,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE,
            UNIQUE (task_id, seq)
        );

        CREATE TABLE IF NOT EXISTS task_run_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_run_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            kind INTEGER NOT NULL,
            date TEXT NOT NULL,
            FOREIGN KEY (task_run_id) REFERENCES task_runs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_run_id INTEGER,
            name TEXT NOT NULL,
            text TEXT NOT NULL,
            kind INTEGER NOT NULL,
            append_date TEXT NOT NULL,
            sending_date TEXT,
            canceling_date TEXT,
            FOREIGN KEY (task_run_id) REFERENCES task_runs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_task_runs_task_id ON task_runs(task_id);
        CREATE INDEX IF NOT EXISTS idx_task_runs_status ON task_runs(status);
        CREATE INDEX IF NOT EXISTS idx_task_run_logs_task_run_id ON task_run_logs(task_run_id);
        CREATE INDEX IF NOT EXISTS idx_notifications_append_date ON notifications(append_date);
        CREATE INDEX IF NOT EXISTS idx_tasks_is_enabled ON tasks(is_enabled);
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}
