pub mod notification;
pub mod run;
pub mod task;

pub use notification::{Notification, NotificationKind};
pub use run::{LogKind, RunStatus, StopReason, TaskRun, TaskRunLog, WorkStatus};
pub use task::Task;
