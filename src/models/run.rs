use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    /// 1-based, unique per task, assigned as previous max + 1.
    pub seq: i64,
    /// Snapshot of the task's command at creation time; later task edits
    /// do not affect an already created run.
    pub command: String,
    pub status: RunStatus,
    pub process_id: Option<i64>,
    pub process_return_code: Option<i64>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub create_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
pub enum RunStatus {
    Pending = 0,
    Running = 1,
    Finished = 2,
    Stopped = 3,
    Unknown = 4,
    Error = 5,
}

impl RunStatus {
    /// Validates a status edge against the transition table. Same-value
    /// transitions are allowed (callers treat them as silent no-ops).
    ///
    /// ```text
    /// Pending  -> Running, Stopped, Error
    /// Running  -> Finished, Stopped, Unknown, Error
    /// Finished, Stopped, Unknown -> Error
    /// Error    -> (terminal)
    /// ```
    pub fn check_transition(self, to: RunStatus) -> Result<()> {
        if self == to {
            return Ok(());
        }

        let allowed = match self {
            RunStatus::Pending => {
                matches!(to, RunStatus::Running | RunStatus::Stopped | RunStatus::Error)
            }
            RunStatus::Running => matches!(
                to,
                RunStatus::Finished | RunStatus::Stopped | RunStatus::Unknown | RunStatus::Error
            ),
            RunStatus::Finished | RunStatus::Stopped | RunStatus::Unknown => {
                matches!(to, RunStatus::Error)
            }
            RunStatus::Error => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(AppError::InvalidTransition { from: self, to })
        }
    }

    /// Terminal for retention purposes: everything except Pending/Running.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
pub enum StopReason {
    ServerRequest = 0,
    TaskDisabled = 1,
    Manual = 2,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::ServerRequest => "server request",
            StopReason::TaskDisabled => "task disabled",
            StopReason::Manual => "manual",
        }
    }
}

/// Derived outcome classification for reporting; never stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    None,
    InProcessed,
    Successful,
    Failed,
    Stopped,
}

impl WorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::None => "none",
            WorkStatus::InProcessed => "in_processed",
            WorkStatus::Successful => "successful",
            WorkStatus::Failed => "failed",
            WorkStatus::Stopped => "stopped",
        }
    }
}

impl TaskRun {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Finished && self.process_return_code == Some(0)
    }

    pub fn work_status(&self) -> WorkStatus {
        match self.status {
            RunStatus::Pending => WorkStatus::None,
            RunStatus::Running => WorkStatus::InProcessed,
            RunStatus::Finished => {
                if self.process_return_code == Some(0) {
                    WorkStatus::Successful
                } else {
                    WorkStatus::Failed
                }
            }
            RunStatus::Stopped => WorkStatus::Stopped,
            RunStatus::Unknown | RunStatus::Error => WorkStatus::Failed,
        }
    }

    /// Human-readable reason the executor logs when it picks this run up.
    pub fn start_reason(&self, task_is_infinite: bool) -> &'static str {
        if task_is_infinite {
            "infinite"
        } else if self.scheduled_date.is_some() {
            "scheduled"
        } else {
            "manual"
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
pub enum LogKind {
    Out = 0,
    Err = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRunLog {
    pub id: i64,
    pub task_run_id: i64,
    pub text: String,
    pub kind: LogKind,
    pub date: DateTime<Utc>,
}
