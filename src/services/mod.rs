pub mod executor;
pub mod maintenance;
pub mod manager;
pub mod notifier;
pub mod scheduler;

pub use executor::{ExecutorService, LiveRun, LiveRuns};
pub use maintenance::MaintenanceService;
pub use manager::TaskManager;
pub use notifier::NotifierService;
pub use scheduler::SchedulerService;
