use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub description: Option<String>,
    pub cron: Option<String>,
    pub is_enabled: bool,
    pub is_infinite: bool,
    pub create_date: DateTime<Utc>,
}
