mod config;
mod cron;
mod error;
mod models;
mod notify;
mod paths;
mod process;
mod repository;
mod services;

use crate::config::Config;
use crate::repository::establish_connection;
use crate::services::TaskManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "task_node=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting task_node with config: {:?}", config);

    if let Some(path) = config.database_url.strip_prefix("sqlite:") {
        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Establish database connection
    let db_pool = establish_connection(&config.database_url).await?;
    tracing::info!("Database connected: {}", config.database_url);

    let manager = TaskManager::new(db_pool, config)?;
    manager.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    manager.stop().await;

    Ok(())
}
