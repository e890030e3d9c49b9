pub mod connection;
pub mod notification_repository;
pub mod run_repository;
pub mod task_repository;

pub use connection::establish_connection;
pub use notification_repository::NotificationRepository;
pub use run_repository::RunRepository;
pub use task_repository::TaskRepository;

pub type DbPool = sqlx::SqlitePool;
