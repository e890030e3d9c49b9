use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub scheduler_interval_secs: u64,
    pub executor_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub notifier_interval_secs: u64,
    /// Backoff applied after a delivery failure or when delivery is
    /// globally disabled.
    pub notifier_backoff_secs: u64,
    /// How long stop_all waits for worker loops to end before giving up.
    pub stop_grace_secs: u64,
    /// Safety margin subtracted from the live-run threshold when hunting
    /// hanging runs; tolerates clock and scheduling skew.
    pub hanging_margin_secs: u64,
    /// Terminal runs older than this are deleted by the retention sweep.
    pub retention_days: u32,
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    /// Pattern with `{task_id}` / `{run_seq}` placeholders for the run URL
    /// attached to chat notifications.
    pub run_url_pattern: Option<String>,
    pub email: Option<EmailConfig>,
    pub chat: Option<ChatConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub send_to: String,
    pub template_name: String,
    pub template_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub add_notify_url: String,
    pub template_name: String,
    pub template_text: String,
}

impl Default for Config {
    fn default() -> Self {
        let database_url = crate::paths::data_dir()
            .map(|dir| format!("sqlite:{}", dir.join("task_node.db").display()))
            .unwrap_or_else(|_| "sqlite:task_node.db".to_string());
        Self {
            database_url,
            scheduler_interval_secs: 5,
            executor_interval_secs: 1,
            maintenance_interval_secs: 60,
            notifier_interval_secs: 5,
            notifier_backoff_secs: 60,
            stop_grace_secs: 5,
            hanging_margin_secs: 60,
            retention_days: 30,
            notification: NotificationConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = Self::from_conf_file()? {
            config.apply_file(file_config);
        }

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(margin) = std::env::var("HANGING_MARGIN_SECS") {
            config.hanging_margin_secs = margin.parse().unwrap_or(config.hanging_margin_secs);
        }

        if let Ok(days) = std::env::var("RETENTION_DAYS") {
            config.retention_days = days.parse().unwrap_or(config.retention_days);
        }

        config.normalize_database_url()?;
        Ok(config)
    }

    fn from_conf_file() -> Result<Option<FileConfig>> {
        let path = crate::paths::conf_dir()?.join("config.json");
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file_config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(Some(file_config))
    }

    fn apply_file(&mut self, file_config: FileConfig) {
        if let Some(database_url) = file_config.database_url {
            self.database_url = database_url;
        }
        if let Some(secs) = file_config.scheduler_interval_secs {
            self.scheduler_interval_secs = secs;
        }
        if let Some(secs) = file_config.executor_interval_secs {
            self.executor_interval_secs = secs;
        }
        if let Some(secs) = file_config.maintenance_interval_secs {
            self.maintenance_interval_secs = secs;
        }
        if let Some(secs) = file_config.notifier_interval_secs {
            self.notifier_interval_secs = secs;
        }
        if let Some(secs) = file_config.notifier_backoff_secs {
            self.notifier_backoff_secs = secs;
        }
        if let Some(secs) = file_config.stop_grace_secs {
            self.stop_grace_secs = secs;
        }
        if let Some(secs) = file_config.hanging_margin_secs {
            self.hanging_margin_secs = secs;
        }
        if let Some(days) = file_config.retention_days {
            self.retention_days = days;
        }
        if let Some(notification) = file_config.notification {
            self.notification = notification;
        }
    }

    fn normalize_database_url(&mut self) -> Result<()> {
        let Some(path_str) = self.database_url.strip_prefix("sqlite:") else {
            return Ok(());
        };

        let path = Path::new(path_str);
        if path.is_absolute() {
            return Ok(());
        }

        if path
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            anyhow::bail!("SQLite database path cannot contain '..'");
        }

        let root = crate::paths::install_root()?;
        let absolute = root.join(path);
        self.database_url = format!("sqlite:{}", absolute.display());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    database_url: Option<String>,
    scheduler_interval_secs: Option<u64>,
    executor_interval_secs: Option<u64>,
    maintenance_interval_secs: Option<u64>,
    notifier_interval_secs: Option<u64>,
    notifier_backoff_secs: Option<u64>,
    stop_grace_secs: Option<u64>,
    hanging_margin_secs: Option<u64>,
    retention_days: Option<u32>,
    notification: Option<NotificationConfig>,
}
