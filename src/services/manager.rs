use crate::config::Config;
use crate::error::Result;
use crate::repository::{DbPool, NotificationRepository, RunRepository, TaskRepository};
use crate::services::executor::{ExecutorService, LiveRuns};
use crate::services::maintenance::MaintenanceService;
use crate::services::notifier::NotifierService;
use crate::services::scheduler::SchedulerService;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Owns the four background loops. They share nothing but the database
/// pool and the live-run registry; all coordination goes through the store.
pub struct TaskManager {
    scheduler: Arc<SchedulerService>,
    executor: Arc<ExecutorService>,
    maintenance: Arc<MaintenanceService>,
    notifier: Arc<NotifierService>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(pool: DbPool, config: Config) -> Result<Self> {
        let task_repo = TaskRepository::new(pool.clone());
        let run_repo = RunRepository::new(pool.clone());
        let notification_repo = NotificationRepository::new(pool);
        let live_runs = LiveRuns::default();

        let scheduler = Arc::new(SchedulerService::new(
            task_repo.clone(),
            run_repo.clone(),
            config.clone(),
        ));
        let executor = Arc::new(ExecutorService::new(
            task_repo.clone(),
            run_repo.clone(),
            notification_repo.clone(),
            config.clone(),
            live_runs.clone(),
        ));
        let maintenance = Arc::new(MaintenanceService::new(
            run_repo.clone(),
            config.clone(),
            live_runs,
        ));
        let notifier = Arc::new(NotifierService::new(
            task_repo,
            run_repo,
            notification_repo,
            config,
        )?);

        Ok(Self {
            scheduler,
            executor,
            maintenance,
            notifier,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn start(&self) {
        tracing::info!("Starting background services");
        let mut handles = self.handles.lock().unwrap();
        handles.push(tokio::spawn(self.scheduler.clone().run()));
        handles.push(tokio::spawn(self.executor.clone().run()));
        handles.push(tokio::spawn(self.maintenance.clone().run()));
        handles.push(tokio::spawn(self.notifier.clone().run()));
    }

    /// Orderly shutdown: flags first, then a bounded wait for the executor
    /// to stop its live runs, then the loops themselves are torn down.
    pub async fn stop(&self) {
        tracing::info!("Stopping background services");
        self.scheduler.stop_flag().store(true, Ordering::Relaxed);
        self.maintenance.stop_flag().store(true, Ordering::Relaxed);
        self.notifier.stop_flag().store(true, Ordering::Relaxed);

        self.executor.stop().await;

        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        tracing::info!("Background services stopped");
    }
}
