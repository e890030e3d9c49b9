use crate::models::RunStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task run not found: {0}")]
    RunNotFound(i64),

    #[error("Notification not found: {0}")]
    NotificationNotFound(i64),

    #[error("Parameter {0:?} must be defined")]
    MissingParameter(&'static str),

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Invalid cron expression {expr:?}: {reason}")]
    Cron { expr: String, reason: String },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
