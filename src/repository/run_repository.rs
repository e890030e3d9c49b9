use crate::error::{AppError, Result};
use crate::models::{LogKind, RunStatus, StopReason, TaskRun, TaskRunLog};
use crate::repository::DbPool;
use chrono::{DateTime, Utc};

#[derive(Clone)]
pub struct RunRepository {
    pool: DbPool,
}

impl RunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Returns an existing Pending run of the same "has scheduled_date"
    /// class, or creates one with the next seq for the task. This is what
    /// keeps a task at no more than one unscheduled and one scheduled
    /// pending run at a time. The flag says whether a row was created.
    pub async fn add_or_get_run(
        &self,
        task_id: i64,
        scheduled_date: Option<DateTime<Utc>>,
    ) -> Result<(TaskRun, bool)> {
        let mut tx = self.pool.begin().await?;

        let command =
            sqlx::query_scalar::<_, String>("SELECT command FROM tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;

        let pending_filter = if scheduled_date.is_some() {
            "scheduled_date IS NOT NULL"
        } else {
            "scheduled_date IS NULL"
        };
        let existing = sqlx::query_as::<_, TaskRun>(&format!(
            "SELECT * FROM task_runs WHERE task_id = ? AND status = ? AND {pending_filter} \
             ORDER BY create_date LIMIT 1"
        ))
        .bind(task_id)
        .bind(RunStatus::Pending)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(run) = existing {
            tx.commit().await?;
            return Ok((run, false));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO task_runs (task_id, seq, command, status, scheduled_date, create_date)
            VALUES (
                ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_runs WHERE task_id = ?),
                ?, ?, ?, ?
            )
            "#,
        )
        .bind(task_id)
        .bind(task_id)
        .bind(&command)
        .bind(RunStatus::Pending)
        .bind(scheduled_date)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();
        let run = sqlx::query_as::<_, TaskRun>("SELECT * FROM task_runs WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok((run, true))
    }

    pub async fn get(&self, id: i64) -> Result<TaskRun> {
        let run = sqlx::query_as::<_, TaskRun>("SELECT * FROM task_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::RunNotFound(id))?;

        Ok(run)
    }

    /// Fresh read of the live status; other loops may have moved it.
    pub async fn actual_status(&self, id: i64) -> Result<RunStatus> {
        let status = sqlx::query_scalar::<_, RunStatus>("SELECT status FROM task_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::RunNotFound(id))?;

        Ok(status)
    }

    /// Applies a validated status transition. Same-value calls are silent
    /// no-ops with no timestamp side effects; illegal edges fail without
    /// mutating anything. Entering Running stamps start_date once, entering
    /// Finished stamps finish_date once.
    pub async fn set_status(&self, id: i64, status: RunStatus) -> Result<()> {
        let run = self.get(id).await?;
        if run.status == status {
            return Ok(());
        }

        run.status.check_transition(status)?;

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE task_runs
            SET status = ?,
                start_date = CASE WHEN ? THEN COALESCE(start_date, ?) ELSE start_date END,
                finish_date = CASE WHEN ? THEN COALESCE(finish_date, ?) ELSE finish_date END
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(status == RunStatus::Running)
        .bind(now)
        .bind(status == RunStatus::Finished)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Moves the run to Stopped, recording why. Already-stopped runs are
    /// left alone; an illegal edge (e.g. a finished run) is an error.
    pub async fn request_stop(&self, id: i64, reason: StopReason) -> Result<()> {
        let run = self.get(id).await?;
        if run.status == RunStatus::Stopped {
            return Ok(());
        }

        run.status.check_transition(RunStatus::Stopped)?;

        sqlx::query("UPDATE task_runs SET status = ?, stop_reason = ? WHERE id = ?")
            .bind(RunStatus::Stopped)
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_process_id(&self, id: i64, process_id: u32) -> Result<()> {
        sqlx::query("UPDATE task_runs SET process_id = ? WHERE id = ?")
            .bind(process_id as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_return_code(&self, id: i64, return_code: i64) -> Result<()> {
        sqlx::query("UPDATE task_runs SET process_return_code = ? WHERE id = ?")
            .bind(return_code)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn list_by_task(&self, task_id: i64) -> Result<Vec<TaskRun>> {
        let runs = sqlx::query_as::<_, TaskRun>(
            "SELECT * FROM task_runs WHERE task_id = ? ORDER BY seq",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    pub async fn pending_runs(&self, task_id: i64) -> Result<Vec<TaskRun>> {
        let runs = sqlx::query_as::<_, TaskRun>(
            "SELECT * FROM task_runs WHERE task_id = ? AND status = ? ORDER BY create_date",
        )
        .bind(task_id)
        .bind(RunStatus::Pending)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    pub async fn has_running(&self, task_id: i64) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM task_runs WHERE task_id = ? AND status = ?",
        )
        .bind(task_id)
        .bind(RunStatus::Running)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Runs persisted as Running whose start predates the threshold; their
    /// owning worker is gone (crash or restart).
    pub async fn hanging_runs(&self, threshold: DateTime<Utc>) -> Result<Vec<TaskRun>> {
        let runs = sqlx::query_as::<_, TaskRun>(
            "SELECT * FROM task_runs WHERE status = ? AND start_date IS NOT NULL AND start_date < ?",
        )
        .bind(RunStatus::Running)
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    /// Terminal runs whose finish (or, failing that, creation) predates the
    /// retention cutoff.
    pub async fn expired_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskRun>> {
        let runs = sqlx::query_as::<_, TaskRun>(
            r#"
            SELECT * FROM task_runs
            WHERE status IN (?, ?, ?, ?)
              AND COALESCE(finish_date, create_date) < ?
            "#,
        )
        .bind(RunStatus::Finished)
        .bind(RunStatus::Stopped)
        .bind(RunStatus::Unknown)
        .bind(RunStatus::Error)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    /// Deletes the run and, via cascade, its logs and notifications.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM task_runs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::RunNotFound(id));
        }

        Ok(())
    }

    pub async fn add_log(&self, task_run_id: i64, text: &str, kind: LogKind) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_run_logs (task_run_id, text, kind, date) VALUES (?, ?, ?, ?)",
        )
        .bind(task_run_id)
        .bind(text)
        .bind(kind)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn add_log_out(&self, task_run_id: i64, text: &str) -> Result<()> {
        self.add_log(task_run_id, text, LogKind::Out).await
    }

    pub async fn add_log_err(&self, task_run_id: i64, text: &str) -> Result<()> {
        self.add_log(task_run_id, text, LogKind::Err).await
    }

    pub async fn logs(&self, task_run_id: i64) -> Result<Vec<TaskRunLog>> {
        let logs = sqlx::query_as::<_, TaskRunLog>(
            "SELECT * FROM task_run_logs WHERE task_run_id = ? ORDER BY date, id",
        )
        .bind(task_run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }
}
