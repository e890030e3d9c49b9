use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    /// Absent for notifications created by hand, outside of any run.
    pub task_run_id: Option<i64>,
    pub name: String,
    pub text: String,
    pub kind: NotificationKind,
    pub append_date: DateTime<Utc>,
    pub sending_date: Option<DateTime<Utc>>,
    pub canceling_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[repr(i32)]
pub enum NotificationKind {
    Email = 0,
    Chat = 1,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Email => "email",
            NotificationKind::Chat => "chat",
        }
    }
}

impl Notification {
    /// Ready for delivery: neither sent nor canceled.
    pub fn is_ready(&self) -> bool {
        self.sending_date.is_none() && self.canceling_date.is_none()
    }
}
