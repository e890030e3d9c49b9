use crate::config::Config;
use crate::error::Result;
use crate::models::{RunStatus, TaskRun};
use crate::process::{proc_tree, script_name_fragment};
use crate::repository::RunRepository;
use crate::services::executor::LiveRuns;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Recovers runs stranded by a crash and deletes runs past retention.
pub struct MaintenanceService {
    run_repo: RunRepository,
    config: Config,
    live_runs: LiveRuns,
    started_at: DateTime<Utc>,
    stop: Arc<AtomicBool>,
}

impl MaintenanceService {
    pub fn new(run_repo: RunRepository, config: Config, live_runs: LiveRuns) -> Self {
        Self {
            run_repo,
            config,
            live_runs,
            started_at: Utc::now(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.maintenance_interval_secs);
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.process_once().await {
                tracing::error!("Maintenance cycle failed: {e}");
            }
            sleep(interval).await;
        }
        tracing::info!("Maintenance exiting");
    }

    /// The two passes are independent; a recovery failure never costs the
    /// cycle its retention sweep.
    pub async fn process_once(&self) -> Result<()> {
        if let Err(e) = self.recover_hanging_runs().await {
            tracing::error!("Hanging-run recovery failed: {e}");
        }
        self.retention_sweep().await?;
        Ok(())
    }

    /// A Running row not owned by any live worker and older than the margin
    /// is a leftover of a previous process. Its subprocess tree, if still
    /// alive and recognizably ours, is killed, and the run is marked
    /// Unknown.
    async fn recover_hanging_runs(&self) -> Result<()> {
        let live = self.live_runs.snapshot();

        // Real workers may not have flipped their run to Running yet, so the
        // threshold trails the earliest live start (or our own start).
        let earliest_live = live
            .iter()
            .map(|run| run.start_date)
            .min()
            .unwrap_or(self.started_at);
        let threshold =
            earliest_live - ChronoDuration::seconds(self.config.hanging_margin_secs as i64);

        for run in self.run_repo.hanging_runs(threshold).await? {
            if self.live_runs.contains(run.id) {
                continue;
            }
            // One unrecoverable run (e.g. stopped by another loop since the
            // query) must not abort recovery of the rest.
            if let Err(e) = self.recover_run(&run).await {
                tracing::warn!("Failed to recover hanging run #{}: {e}", run.id);
            }
        }

        Ok(())
    }

    async fn recover_run(&self, run: &TaskRun) -> Result<()> {
        tracing::warn!(
            "[Task #{}] Run #{} is hanging (started {:?}), recovering",
            run.task_id,
            run.id,
            run.start_date
        );

        if let Some(pid) = run.process_id {
            self.kill_orphan(run.task_id, run.id, pid as u32).await;
        }

        self.run_repo.set_status(run.id, RunStatus::Unknown).await?;
        self.run_repo
            .add_log_err(run.id, "Run found hanging and marked Unknown")
            .await?;

        Ok(())
    }

    /// Best effort: the recorded pid may have been reused by an unrelated
    /// process, so the command line must carry the run's script name.
    async fn kill_orphan(&self, task_id: i64, run_id: i64, pid: u32) {
        if !proc_tree::process_exists(pid) {
            return;
        }
        let fragment = script_name_fragment(task_id, run_id);
        match proc_tree::cmdline(pid) {
            Some(cmdline) if cmdline.contains(&fragment) => {
                tracing::warn!("Killing orphaned process tree of run #{run_id} (pid {pid})");
                proc_tree::kill_tree(pid, KILL_TIMEOUT).await;
            }
            Some(_) => {
                tracing::info!("Pid {pid} of run #{run_id} was reused, leaving it alone");
            }
            None => {}
        }
    }

    /// Deletes terminal runs whose finish (or creation) date fell out of the
    /// retention window; logs and notifications go with them via cascade.
    async fn retention_sweep(&self) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.retention_days as i64);
        let expired = self.run_repo.expired_runs(cutoff).await?;
        if expired.is_empty() {
            return Ok(());
        }

        tracing::info!("Deleting {} runs past retention", expired.len());
        for run in expired {
            if let Err(e) = self.run_repo.delete(run.id).await {
                tracing::warn!("Failed to delete expired run #{}: {e}", run.id);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::connection::test_support::test_pool;
    use crate::repository::{DbPool, TaskRepository};
    use crate::services::executor::LiveRun;

    async fn setup() -> (
        MaintenanceService,
        TaskRepository,
        RunRepository,
        DbPool,
        tempfile::TempDir,
    ) {
        let (pool, dir) = test_pool().await;
        let task_repo = TaskRepository::new(pool.clone());
        let run_repo = RunRepository::new(pool.clone());
        let service = MaintenanceService::new(run_repo.clone(), Config::default(), LiveRuns::default());
        (service, task_repo, run_repo, pool, dir)
    }

    async fn backdate_start(pool: &DbPool, run_id: i64, ago: ChronoDuration) {
        sqlx::query("UPDATE task_runs SET start_date = ? WHERE id = ?")
            .bind(Utc::now() - ago)
            .bind(run_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hanging_run_is_marked_unknown() {
        let (service, tasks, runs, pool, _dir) = setup().await;
        let task = tasks.add("t", "sleep 600", None, None, false).await.unwrap();
        let (run, _) = runs.add_or_get_run(task.id, None).await.unwrap();
        runs.set_status(run.id, RunStatus::Running).await.unwrap();
        backdate_start(&pool, run.id, ChronoDuration::hours(1)).await;

        service.process_once().await.unwrap();

        let run = runs.get(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Unknown);
        assert!(!runs.logs(run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn runs_owned_by_a_live_worker_are_left_alone() {
        let (service, tasks, runs, pool, _dir) = setup().await;
        let task = tasks.add("t", "sleep 600", None, None, false).await.unwrap();
        let (run, _) = runs.add_or_get_run(task.id, None).await.unwrap();
        runs.set_status(run.id, RunStatus::Running).await.unwrap();
        backdate_start(&pool, run.id, ChronoDuration::hours(1)).await;

        service.live_runs.insert(LiveRun {
            run_id: run.id,
            task_id: task.id,
            start_date: Utc::now(),
        });

        service.process_once().await.unwrap();

        assert_eq!(runs.get(run.id).await.unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn recent_running_runs_are_not_hanging() {
        let (service, tasks, runs, _pool, _dir) = setup().await;
        let task = tasks.add("t", "sleep 5", None, None, false).await.unwrap();
        let (run, _) = runs.add_or_get_run(task.id, None).await.unwrap();
        runs.set_status(run.id, RunStatus::Running).await.unwrap();

        service.process_once().await.unwrap();

        assert_eq!(runs.get(run.id).await.unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn one_unrecoverable_run_does_not_abort_recovery_or_retention() {
        let (service, tasks, runs, pool, _dir) = setup().await;
        let task = tasks.add("t", "sleep 600", None, None, false).await.unwrap();

        let (poisoned, _) = runs.add_or_get_run(task.id, None).await.unwrap();
        runs.set_status(poisoned.id, RunStatus::Running).await.unwrap();
        backdate_start(&pool, poisoned.id, ChronoDuration::hours(1)).await;
        // Make the row's status update fail, standing in for a concurrent
        // transition mid-pass.
        sqlx::query(&format!(
            "CREATE TRIGGER block_poisoned BEFORE UPDATE ON task_runs \
             WHEN NEW.id = {} BEGIN SELECT RAISE(ABORT, 'locked'); END",
            poisoned.id
        ))
        .execute(&pool)
        .await
        .unwrap();

        let (hanging, _) = runs.add_or_get_run(task.id, None).await.unwrap();
        runs.set_status(hanging.id, RunStatus::Running).await.unwrap();
        backdate_start(&pool, hanging.id, ChronoDuration::hours(1)).await;

        let (expired, _) = runs.add_or_get_run(task.id, None).await.unwrap();
        runs.set_status(expired.id, RunStatus::Running).await.unwrap();
        runs.set_status(expired.id, RunStatus::Finished).await.unwrap();
        sqlx::query("UPDATE task_runs SET finish_date = ? WHERE id = ?")
            .bind(Utc::now() - ChronoDuration::days(40))
            .bind(expired.id)
            .execute(&pool)
            .await
            .unwrap();

        service.process_once().await.unwrap();

        assert_eq!(runs.get(poisoned.id).await.unwrap().status, RunStatus::Running);
        assert_eq!(runs.get(hanging.id).await.unwrap().status, RunStatus::Unknown);
        assert!(runs.get(expired.id).await.is_err());
    }

    #[tokio::test]
    async fn retention_deletes_old_terminal_runs_only() {
        let (service, tasks, runs, pool, _dir) = setup().await;
        let task = tasks.add("t", "true", None, None, false).await.unwrap();

        let (old, _) = runs.add_or_get_run(task.id, None).await.unwrap();
        runs.set_status(old.id, RunStatus::Running).await.unwrap();
        runs.set_status(old.id, RunStatus::Finished).await.unwrap();
        sqlx::query("UPDATE task_runs SET finish_date = ? WHERE id = ?")
            .bind(Utc::now() - ChronoDuration::days(40))
            .bind(old.id)
            .execute(&pool)
            .await
            .unwrap();

        let (fresh, _) = runs.add_or_get_run(task.id, None).await.unwrap();

        service.process_once().await.unwrap();

        assert!(runs.get(old.id).await.is_err());
        assert!(runs.get(fresh.id).await.is_ok());
    }
}
