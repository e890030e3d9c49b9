use crate::config::Config;
use crate::error::Result;
use crate::models::{NotificationKind, RunStatus, StopReason, Task, TaskRun};
use crate::process::{CommandScript, ProcessSupervisor};
use crate::repository::{NotificationRepository, RunRepository, TaskRepository};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const STOP_WATCH_INTERVAL: Duration = Duration::from_millis(500);
const LOG_CHANNEL_CAPACITY: usize = 256;

/// A run currently owned by a live worker.
#[derive(Debug, Clone)]
pub struct LiveRun {
    pub run_id: i64,
    pub task_id: i64,
    pub start_date: DateTime<Utc>,
}

/// Shared registry of runs the executor currently supervises; maintenance
/// reads it to tell hanging runs from healthy ones.
#[derive(Clone, Default)]
pub struct LiveRuns {
    inner: Arc<Mutex<HashMap<i64, LiveRun>>>,
}

impl LiveRuns {
    pub fn insert(&self, live: LiveRun) {
        self.inner.lock().unwrap().insert(live.run_id, live);
    }

    pub fn remove(&self, run_id: i64) {
        self.inner.lock().unwrap().remove(&run_id);
    }

    pub fn contains(&self, run_id: i64) -> bool {
        self.inner.lock().unwrap().contains_key(&run_id)
    }

    pub fn snapshot(&self) -> Vec<LiveRun> {
        self.inner.lock().unwrap().values().cloned().collect()
    }
}

struct WorkerHandle {
    join: JoinHandle<()>,
}

/// Maintains one worker loop per enabled task, reconciled every cycle
/// against the enabled-task set: missing workers are started, naturally
/// finished ones are removed.
pub struct ExecutorService {
    task_repo: TaskRepository,
    run_repo: RunRepository,
    notification_repo: NotificationRepository,
    config: Config,
    live_runs: LiveRuns,
    stop: Arc<AtomicBool>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl ExecutorService {
    pub fn new(
        task_repo: TaskRepository,
        run_repo: RunRepository,
        notification_repo: NotificationRepository,
        config: Config,
        live_runs: LiveRuns,
    ) -> Self {
        Self {
            task_repo,
            run_repo,
            notification_repo,
            config,
            live_runs,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.executor_interval_secs);
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.reconcile_once().await {
                tracing::error!("Executor reconcile failed: {e}");
            }
            sleep(interval).await;
        }
    }

    /// One reconciliation cycle of the worker map.
    pub async fn reconcile_once(self: &Arc<Self>) -> Result<()> {
        let tasks = self.task_repo.list_enabled().await?;

        let mut workers = self.workers.lock().unwrap();
        workers.retain(|name, handle| {
            if handle.join.is_finished() {
                tracing::info!("Removing finished worker for task {name:?}");
                false
            } else {
                true
            }
        });

        for task in tasks {
            if workers.contains_key(&task.name) {
                continue;
            }
            tracing::info!("Starting worker for task #{} {:?}", task.id, task.name);
            let worker = TaskWorker {
                name: task.name.clone(),
                executor: Arc::clone(self),
            };
            workers.insert(task.name, WorkerHandle {
                join: tokio::spawn(worker.run()),
            });
        }

        Ok(())
    }

    /// Signals every loop to stop, asks the store to stop all live runs and
    /// waits a bounded grace period for worker loops to end. Worker threads
    /// are never force-killed; only their child OS processes are, via the
    /// stop predicate.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);

        for live in self.live_runs.snapshot() {
            if let Err(e) = self
                .run_repo
                .request_stop(live.run_id, StopReason::ServerRequest)
                .await
            {
                tracing::warn!("Failed to request stop of run #{}: {e}", live.run_id);
            }
        }

        let grace = Duration::from_secs(self.config.stop_grace_secs);
        tracing::info!("Waiting up to {}s for workers to finish", grace.as_secs());
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let all_finished = self
                .workers
                .lock()
                .unwrap()
                .values()
                .all(|handle| handle.join.is_finished());
            if all_finished {
                tracing::info!("All workers finished");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::info!("Gave up waiting for workers");
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}

/// One worker loop bound to a task name. Exits naturally when the task is
/// deleted, disabled, or after processing a run of a non-infinite task; the
/// reconcile cycle re-creates it when needed.
struct TaskWorker {
    name: String,
    executor: Arc<ExecutorService>,
}

impl TaskWorker {
    async fn run(self) {
        let interval = Duration::from_secs(self.executor.config.executor_interval_secs);
        loop {
            if self.executor.stop.load(Ordering::Relaxed) {
                break;
            }
            match self.cycle().await {
                Ok(ControlFlow::Break(())) => break,
                Ok(ControlFlow::Continue(())) => {}
                Err(e) => tracing::error!("Worker {:?} cycle failed: {e}", self.name),
            }
            sleep(interval).await;
        }
        tracing::info!("Worker for task {:?} exiting", self.name);
    }

    async fn cycle(&self) -> Result<ControlFlow<()>> {
        let Some(task) = self.executor.task_repo.get_by_name(&self.name).await? else {
            tracing::warn!("Task {:?} not found, worker exits", self.name);
            return Ok(ControlFlow::Break(()));
        };

        if !task.is_enabled {
            tracing::info!("Task {:?} is disabled, worker exits", self.name);
            return Ok(ControlFlow::Break(()));
        }

        let Some(run) = self.select_run(&task).await? else {
            return Ok(ControlFlow::Continue(()));
        };

        tracing::info!(
            "[Task #{}] Starting run #{} (seq {})",
            task.id,
            run.id,
            run.seq
        );
        let run_id = run.id;
        if let Err(e) = self.process_run(&task, run).await {
            tracing::error!("[Task #{}] Run #{run_id} failed: {e}", task.id);
            if let Err(set_err) = self
                .executor
                .run_repo
                .set_status(run_id, RunStatus::Error)
                .await
            {
                tracing::error!("[Task #{}] Could not mark run #{run_id} as Error: {set_err}", task.id);
            }
            let _ = self
                .executor
                .run_repo
                .add_log_err(run_id, &format!("Run failed: {e}"))
                .await;
            return Ok(ControlFlow::Continue(()));
        }

        // Non-infinite tasks give the worker slot back after one run; the
        // reconcile cycle re-creates the worker while the task stays enabled.
        if task.is_infinite {
            Ok(ControlFlow::Continue(()))
        } else {
            Ok(ControlFlow::Break(()))
        }
    }

    /// An unscheduled pending run wins; otherwise the earliest-created
    /// scheduled run whose time has already arrived.
    async fn select_run(&self, task: &Task) -> Result<Option<TaskRun>> {
        let pending = self.executor.run_repo.pending_runs(task.id).await?;

        if let Some(run) = pending.iter().find(|run| run.scheduled_date.is_none()) {
            return Ok(Some(run.clone()));
        }

        let now = Utc::now();
        Ok(pending
            .into_iter()
            .filter(|run| run.scheduled_date.is_some_and(|date| date <= now))
            .min_by_key(|run| run.create_date))
    }

    async fn process_run(&self, task: &Task, run: TaskRun) -> Result<()> {
        let repo = &self.executor.run_repo;
        let log_prefix = format!("[Task #{}, run #{}]", task.id, run.id);

        repo.set_status(run.id, RunStatus::Running).await?;
        let reason = run.start_reason(task.is_infinite);
        tracing::info!("{log_prefix} Start reason: {reason}");
        repo.add_log_out(run.id, &format!("Start reason: {reason}"))
            .await?;

        // Script must outlive the child; dropped (and deleted) after wait
        let script = CommandScript::create(task.id, run.id, &run.command)?;

        let stop = Arc::new(AtomicBool::new(false));
        let (log_tx, mut log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let supervisor = ProcessSupervisor::new(script.shell_command(), stop.clone(), log_tx);
        let process = supervisor.spawn()?;

        let pid = process.pid();
        tracing::debug!("{log_prefix} process_id: {pid}");
        repo.set_process_id(run.id, pid).await?;

        self.executor.live_runs.insert(LiveRun {
            run_id: run.id,
            task_id: task.id,
            start_date: Utc::now(),
        });

        let drain = tokio::spawn({
            let repo = repo.clone();
            let run_id = run.id;
            async move {
                while let Some(line) = log_rx.recv().await {
                    if let Err(e) = repo.add_log(run_id, &line.text, line.kind).await {
                        tracing::error!("Failed to persist log line of run #{run_id}: {e}");
                    }
                }
            }
        });

        let watcher_done = Arc::new(AtomicBool::new(false));
        let watcher = self.spawn_stop_watcher(task.id, run.id, stop, watcher_done.clone());

        let wait_result = process.wait().await;

        watcher_done.store(true, Ordering::Relaxed);
        let _ = watcher.await;
        let _ = drain.await;
        self.executor.live_runs.remove(run.id);
        drop(script);

        let return_code = wait_result?;
        tracing::debug!("{log_prefix} process_return_code: {return_code:?}");
        if let Some(code) = return_code {
            repo.set_return_code(run.id, code).await?;
        }

        // Another loop may have moved the run while it executed; only a run
        // still seen as Running is finalized here.
        if repo.actual_status(run.id).await? == RunStatus::Running {
            repo.set_status(run.id, RunStatus::Finished).await?;
        }

        let run = repo.get(run.id).await?;
        let work_status = run.work_status();
        repo.add_log_out(
            run.id,
            &format!("Process return code: {}", match return_code {
                Some(code) => code.to_string(),
                None => "<none>".to_string(),
            }),
        )
        .await?;
        repo.add_log_out(run.id, &format!("Work status: {}", work_status.as_str()))
            .await?;
        if let Some(reason) = run.stop_reason {
            repo.add_log_out(run.id, &format!("Stop reason: {}", reason.as_str()))
                .await?;
        }
        tracing::info!("{log_prefix} Finished with status {:?}", run.status);

        if !run.is_success() && run.status != RunStatus::Stopped {
            self.create_failure_notifications(task, &run).await?;
        }

        Ok(())
    }

    /// Re-reads the owning task's enabled flag and the run's live status
    /// while the child executes: a disable flips the run to Stopped, and any
    /// externally applied Stopped/Unknown/Error requests a process stop.
    fn spawn_stop_watcher(
        &self,
        task_id: i64,
        run_id: i64,
        stop: Arc<AtomicBool>,
        done: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let task_repo = self.executor.task_repo.clone();
        let run_repo = self.executor.run_repo.clone();

        tokio::spawn(async move {
            while !done.load(Ordering::Relaxed) {
                match task_repo.is_enabled(task_id).await {
                    Ok(Some(true)) => {}
                    Ok(Some(false)) => {
                        if let Err(e) = run_repo
                            .request_stop(run_id, StopReason::TaskDisabled)
                            .await
                        {
                            tracing::debug!("Stop request for run #{run_id} failed: {e}");
                        }
                    }
                    Ok(None) => {
                        // The task row is gone and the run went with it via
                        // cascade; there is no row left to stamp a reason on.
                        tracing::info!("Task #{task_id} was deleted, stopping run #{run_id}");
                        stop.store(true, Ordering::Relaxed);
                    }
                    Err(e) => tracing::debug!("Enabled check for task #{task_id} failed: {e}"),
                }

                match run_repo.actual_status(run_id).await {
                    Ok(RunStatus::Stopped | RunStatus::Unknown | RunStatus::Error) => {
                        stop.store(true, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(_) => {
                        // Run row gone; nothing left to supervise
                        stop.store(true, Ordering::Relaxed);
                    }
                }

                sleep(STOP_WATCH_INTERVAL).await;
            }
        })
    }

    async fn create_failure_notifications(&self, task: &Task, run: &TaskRun) -> Result<()> {
        let name = format!(
            "Task {:?} run #{}: {}",
            task.name,
            run.seq,
            run.work_status().as_str()
        );
        let text = format!(
            "Task {:?} run #{} ended with status {:?}, return code {}",
            task.name,
            run.seq,
            run.status,
            match run.process_return_code {
                Some(code) => code.to_string(),
                None => "<none>".to_string(),
            },
        );

        let notification = &self.executor.config.notification;
        let mut created = false;
        if notification.email.is_some() {
            self.executor
                .notification_repo
                .add(Some(run.id), &name, &text, NotificationKind::Email)
                .await?;
            created = true;
        }
        if notification.chat.is_some() {
            self.executor
                .notification_repo
                .add(Some(run.id), &name, &text, NotificationKind::Chat)
                .await?;
            created = true;
        }
        if !created {
            tracing::debug!("No notification channels configured, skipping for run #{}", run.id);
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::LogKind;
    use crate::repository::connection::test_support::test_pool;
    use tokio::time::Instant;

    async fn setup() -> (
        Arc<ExecutorService>,
        TaskRepository,
        RunRepository,
        tempfile::TempDir,
    ) {
        let (pool, dir) = test_pool().await;
        let task_repo = TaskRepository::new(pool.clone());
        let run_repo = RunRepository::new(pool.clone());
        let notification_repo = NotificationRepository::new(pool);
        let executor = Arc::new(ExecutorService::new(
            task_repo.clone(),
            run_repo.clone(),
            notification_repo,
            Config::default(),
            LiveRuns::default(),
        ));
        (executor, task_repo, run_repo, dir)
    }

    async fn wait_for_status(
        runs: &RunRepository,
        run_id: i64,
        wanted: RunStatus,
        timeout: Duration,
    ) -> TaskRun {
        let deadline = Instant::now() + timeout;
        loop {
            let run = runs.get(run_id).await.unwrap();
            if run.status == wanted {
                return run;
            }
            assert!(
                Instant::now() < deadline,
                "run #{run_id} stuck in {:?}, wanted {wanted:?}",
                run.status
            );
            sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn worker_processes_a_pending_run_to_finished() {
        let (executor, tasks, runs, _dir) = setup().await;
        let task = tasks
            .add("hello", "echo hello out", None, None, false)
            .await
            .unwrap();
        let (run, _) = runs.add_or_get_run(task.id, None).await.unwrap();

        executor.reconcile_once().await.unwrap();

        let run = wait_for_status(&runs, run.id, RunStatus::Finished, Duration::from_secs(15)).await;
        assert_eq!(run.process_return_code, Some(0));
        assert!(run.process_id.is_some());
        assert!(run.start_date.is_some());
        assert!(run.finish_date.is_some());

        let logs = runs.logs(run.id).await.unwrap();
        assert!(logs.iter().any(|log| log.text == "Start reason: manual"));
        assert!(logs
            .iter()
            .any(|log| log.kind == LogKind::Out && log.text == "hello out"));
        assert!(executor.live_runs.snapshot().is_empty());
    }

    #[tokio::test]
    async fn a_stop_request_kills_the_process_and_keeps_stopped() {
        let (executor, tasks, runs, _dir) = setup().await;
        let task = tasks
            .add("sleeper", "sleep 600", None, None, false)
            .await
            .unwrap();
        let (run, _) = runs.add_or_get_run(task.id, None).await.unwrap();

        executor.reconcile_once().await.unwrap();
        wait_for_status(&runs, run.id, RunStatus::Running, Duration::from_secs(15)).await;

        runs.request_stop(run.id, StopReason::Manual).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        while !executor.live_runs.snapshot().is_empty() {
            assert!(Instant::now() < deadline, "run never released");
            sleep(Duration::from_millis(100)).await;
        }

        let run = runs.get(run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
        assert_eq!(run.stop_reason, Some(StopReason::Manual));
        assert_eq!(run.process_return_code, None);
    }

    #[tokio::test]
    async fn deleting_the_task_terminates_its_running_process() {
        let (executor, tasks, runs, _dir) = setup().await;
        let task = tasks
            .add("doomed", "sleep 600", None, None, false)
            .await
            .unwrap();
        let (run, _) = runs.add_or_get_run(task.id, None).await.unwrap();

        executor.reconcile_once().await.unwrap();
        wait_for_status(&runs, run.id, RunStatus::Running, Duration::from_secs(15)).await;

        let deadline = Instant::now() + Duration::from_secs(15);
        let pid = loop {
            if let Some(pid) = runs.get(run.id).await.unwrap().process_id {
                break pid as u32;
            }
            assert!(Instant::now() < deadline, "pid never recorded");
            sleep(Duration::from_millis(100)).await;
        };

        tasks.delete(task.id).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        while executor.live_runs.contains(run.id) {
            assert!(Instant::now() < deadline, "run never released");
            sleep(Duration::from_millis(100)).await;
        }

        // The run row went with the task via cascade, and so did the child.
        assert!(runs.get(run.id).await.is_err());
        let deadline = Instant::now() + Duration::from_secs(10);
        while crate::process::proc_tree::process_exists(pid) {
            assert!(Instant::now() < deadline, "child survived task deletion");
            sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn failed_run_queues_notifications_for_configured_channels() {
        let (pool, _dir) = test_pool().await;
        let task_repo = TaskRepository::new(pool.clone());
        let run_repo = RunRepository::new(pool.clone());
        let notification_repo = NotificationRepository::new(pool);

        let mut config = Config::default();
        config.notification.enabled = true;
        config.notification.chat = Some(crate::config::ChatConfig {
            add_notify_url: "http://localhost:9/add_notify".to_string(),
            template_name: "{{ task.name }}".to_string(),
            template_text: "{{ work_status }}".to_string(),
        });
        let executor = Arc::new(ExecutorService::new(
            task_repo.clone(),
            run_repo.clone(),
            notification_repo.clone(),
            config,
            LiveRuns::default(),
        ));

        let task = task_repo
            .add("ping", "ls /nonexistent-host-check", None, None, false)
            .await
            .unwrap();
        let (run, _) = run_repo.add_or_get_run(task.id, None).await.unwrap();

        executor.reconcile_once().await.unwrap();
        let run = wait_for_status(&run_repo, run.id, RunStatus::Finished, Duration::from_secs(15))
            .await;
        assert!(!run.is_success());

        let unsent = notification_repo.get_unsent().await.unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].kind, NotificationKind::Chat);
        assert_eq!(unsent[0].task_run_id, Some(run.id));
    }

    #[tokio::test]
    async fn failed_run_is_finished_with_its_return_code() {
        let (executor, tasks, runs, _dir) = setup().await;
        let task = tasks
            .add("failing", "exit 3", None, None, false)
            .await
            .unwrap();
        let (run, _) = runs.add_or_get_run(task.id, None).await.unwrap();

        executor.reconcile_once().await.unwrap();

        let run = wait_for_status(&runs, run.id, RunStatus::Finished, Duration::from_secs(15)).await;
        assert_eq!(run.process_return_code, Some(3));
        assert!(!run.is_success());
    }
}
