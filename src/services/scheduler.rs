use crate::config::Config;
use crate::cron::CronExpr;
use crate::error::Result;
use crate::models::Task;
use crate::repository::{RunRepository, TaskRepository};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Turns cron expressions into pending runs. Infinite tasks get an
/// unscheduled run whenever none of theirs is pending or running; cron
/// tasks get a run stamped with the next occurrence.
pub struct SchedulerService {
    task_repo: TaskRepository,
    run_repo: RunRepository,
    config: Config,
    stop: Arc<AtomicBool>,
}

impl SchedulerService {
    pub fn new(task_repo: TaskRepository, run_repo: RunRepository, config: Config) -> Self {
        Self {
            task_repo,
            run_repo,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.scheduler_interval_secs);
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.process_once().await {
                tracing::error!("Scheduler cycle failed: {e}");
            }
            sleep(interval).await;
        }
        tracing::info!("Scheduler exiting");
    }

    /// One pass over the enabled tasks. A failure on one task never blocks
    /// the others.
    pub async fn process_once(&self) -> Result<()> {
        let tasks = self.task_repo.list_enabled().await?;
        let now = Utc::now();

        for task in tasks {
            if let Err(e) = self.schedule_task(&task, now).await {
                tracing::error!("Scheduling task #{} {:?} failed: {e}", task.id, task.name);
            }
        }

        Ok(())
    }

    async fn schedule_task(&self, task: &Task, now: DateTime<Utc>) -> Result<()> {
        let scheduled_date = if task.is_infinite {
            if self.run_repo.has_running(task.id).await? {
                return Ok(());
            }
            None
        } else {
            let Some(cron) = task.cron.as_deref() else {
                return Ok(());
            };
            let expr = CronExpr::parse(cron)?;
            let Some(next) = expr.next_occurrence(now) else {
                tracing::warn!(
                    "[Task #{}] Cron {cron:?} has no upcoming occurrence",
                    task.id
                );
                return Ok(());
            };
            Some(next)
        };

        let (run, created) = self.run_repo.add_or_get_run(task.id, scheduled_date).await?;
        if created {
            match run.scheduled_date {
                Some(date) => tracing::info!(
                    "[Task #{}] Created run #{} scheduled for {date}",
                    task.id,
                    run.id
                ),
                None => tracing::info!("[Task #{}] Created immediate run #{}", task.id, run.id),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use crate::repository::connection::test_support::test_pool;

    async fn setup() -> (SchedulerService, TaskRepository, RunRepository, tempfile::TempDir) {
        let (pool, dir) = test_pool().await;
        let task_repo = TaskRepository::new(pool.clone());
        let run_repo = RunRepository::new(pool);
        let scheduler = SchedulerService::new(task_repo.clone(), run_repo.clone(), Config::default());
        (scheduler, task_repo, run_repo, dir)
    }

    #[tokio::test]
    async fn cron_task_gets_one_scheduled_pending_run() {
        let (scheduler, tasks, runs, _dir) = setup().await;
        let task = tasks
            .add("nightly", "true", None, Some("0 3 * * *"), false)
            .await
            .unwrap();

        scheduler.process_once().await.unwrap();
        scheduler.process_once().await.unwrap();

        let pending = runs.pending_runs(task.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].scheduled_date.is_some());
    }

    #[tokio::test]
    async fn infinite_task_gets_an_immediate_run_unless_one_is_running() {
        let (scheduler, tasks, runs, _dir) = setup().await;
        let task = tasks.add("daemon", "true", None, None, true).await.unwrap();

        scheduler.process_once().await.unwrap();
        let pending = runs.pending_runs(task.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].scheduled_date.is_none());

        runs.set_status(pending[0].id, RunStatus::Running)
            .await
            .unwrap();
        scheduler.process_once().await.unwrap();
        assert!(runs.pending_runs(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_and_unscheduled_tasks_are_ignored() {
        let (scheduler, tasks, runs, _dir) = setup().await;
        let off = tasks
            .add("off", "true", None, Some("* * * * *"), false)
            .await
            .unwrap();
        tasks.set_enabled(off.id, false).await.unwrap();
        let manual = tasks.add("manual", "true", None, None, false).await.unwrap();

        scheduler.process_once().await.unwrap();

        assert!(runs.pending_runs(off.id).await.unwrap().is_empty());
        assert!(runs.pending_runs(manual.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_broken_cron_does_not_block_other_tasks() {
        let (scheduler, tasks, runs, _dir) = setup().await;
        tasks
            .add("broken", "true", None, Some("not a cron"), false)
            .await
            .unwrap();
        let good = tasks
            .add("good", "true", None, Some("*/5 * * * *"), false)
            .await
            .unwrap();

        scheduler.process_once().await.unwrap();

        assert_eq!(runs.pending_runs(good.id).await.unwrap().len(), 1);
    }
}
