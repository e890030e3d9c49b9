use crate::error::{AppError, Result};
use crate::models::Task;
use crate::repository::DbPool;
use chrono::Utc;

#[derive(Clone)]
pub struct TaskRepository {
    pool: DbPool,
}

impl TaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create-or-update by name. A task name is immutable once created;
    /// re-adding by name returns the existing task, updating the mutable
    /// fields if they changed.
    pub async fn add(
        &self,
        name: &str,
        command: &str,
        description: Option<&str>,
        cron: Option<&str>,
        is_infinite: bool,
    ) -> Result<Task> {
        if name.is_empty() {
            return Err(AppError::MissingParameter("name"));
        }
        if command.is_empty() {
            return Err(AppError::MissingParameter("command"));
        }

        if let Some(existing) = self.get_by_name(name).await? {
            if existing.command != command
                || existing.description.as_deref() != description
                || existing.cron.as_deref() != cron
                || existing.is_infinite != is_infinite
            {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET command = ?, description = ?, cron = ?, is_infinite = ?
                    WHERE id = ?
                    "#,
                )
                .bind(command)
                .bind(description)
                .bind(cron)
                .bind(is_infinite)
                .bind(existing.id)
                .execute(&self.pool)
                .await?;
            }
            return self.get(existing.id).await;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (name, command, description, cron, is_infinite, create_date)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(command)
        .bind(description)
        .bind(cron)
        .bind(is_infinite)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get(result.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> Result<Task> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::TaskNotFound(id.to_string()))?;

        Ok(task)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Task>> {
        if name.is_empty() {
            return Err(AppError::MissingParameter("name"));
        }

        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(tasks)
    }

    pub async fn list_enabled(&self) -> Result<Vec<Task>> {
        let tasks =
            sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE is_enabled = 1 ORDER BY name")
                .fetch_all(&self.pool)
                .await?;

        Ok(tasks)
    }

    /// Fresh read of the enabled flag; `None` when the task was deleted.
    pub async fn is_enabled(&self, id: i64) -> Result<Option<bool>> {
        let enabled = sqlx::query_scalar::<_, bool>("SELECT is_enabled FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(enabled)
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE tasks SET is_enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_is_infinite(&self, id: i64, is_infinite: bool) -> Result<()> {
        sqlx::query("UPDATE tasks SET is_infinite = ? WHERE id = ?")
            .bind(is_infinite)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_command(&self, id: i64, command: &str) -> Result<()> {
        if command.is_empty() {
            return Err(AppError::MissingParameter("command"));
        }

        sqlx::query("UPDATE tasks SET command = ? WHERE id = ?")
            .bind(command)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_description(&self, id: i64, description: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE tasks SET description = ? WHERE id = ?")
            .bind(description)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Deletes the task and, via foreign-key cascade, all of its runs,
    /// their logs and notifications.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::TaskNotFound(id.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::connection::test_support::test_pool;

    #[tokio::test]
    async fn add_rejects_empty_name_and_command() {
        let (pool, _dir) = test_pool().await;
        let repo = TaskRepository::new(pool);

        assert!(matches!(
            repo.add("", "echo hi", None, None, false).await,
            Err(AppError::MissingParameter("name"))
        ));
        assert!(matches!(
            repo.add("echo", "", None, None, false).await,
            Err(AppError::MissingParameter("command"))
        ));
    }

    #[tokio::test]
    async fn add_is_create_or_update_by_name() {
        let (pool, _dir) = test_pool().await;
        let repo = TaskRepository::new(pool);

        let first = repo
            .add("backup", "tar -czf /tmp/b.tgz /data", None, Some("0 3 * * *"), false)
            .await
            .unwrap();
        let second = repo
            .add("backup", "tar -czf /tmp/b2.tgz /data", Some("nightly"), Some("0 4 * * *"), false)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.command, "tar -czf /tmp/b2.tgz /data");
        assert_eq!(second.description.as_deref(), Some("nightly"));
        assert_eq!(second.cron.as_deref(), Some("0 4 * * *"));
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_enabled_skips_disabled_tasks() {
        let (pool, _dir) = test_pool().await;
        let repo = TaskRepository::new(pool);

        let a = repo.add("a", "true", None, None, false).await.unwrap();
        let b = repo.add("b", "true", None, None, false).await.unwrap();
        repo.set_enabled(a.id, false).await.unwrap();

        let enabled = repo.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, b.id);
        assert_eq!(repo.is_enabled(a.id).await.unwrap(), Some(false));
        assert_eq!(repo.is_enabled(a.id + 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_missing_task_is_an_error() {
        let (pool, _dir) = test_pool().await;
        let repo = TaskRepository::new(pool);

        assert!(matches!(
            repo.delete(42).await,
            Err(AppError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn infinite_flag_and_description_are_mutable() {
        let (pool, _dir) = test_pool().await;
        let repo = TaskRepository::new(pool);

        let task = repo.add("d", "true", None, None, false).await.unwrap();
        repo.set_is_infinite(task.id, true).await.unwrap();
        repo.set_description(task.id, Some("long lived")).await.unwrap();

        let task = repo.get(task.id).await.unwrap();
        assert!(task.is_infinite);
        assert_eq!(task.description.as_deref(), Some("long lived"));

        repo.set_description(task.id, None).await.unwrap();
        assert!(repo.get(task.id).await.unwrap().description.is_none());
    }
}
