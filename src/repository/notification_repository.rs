use crate::error::{AppError, Result};
use crate::models::{Notification, NotificationKind};
use crate::repository::DbPool;
use chrono::Utc;

#[derive(Clone)]
pub struct NotificationRepository {
    pool: DbPool,
}

impl NotificationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn add(
        &self,
        task_run_id: Option<i64>,
        name: &str,
        text: &str,
        kind: NotificationKind,
    ) -> Result<Notification> {
        if name.is_empty() {
            return Err(AppError::MissingParameter("name"));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO notifications (task_run_id, name, text, kind, append_date)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(task_run_id)
        .bind(name)
        .bind(text)
        .bind(kind)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get(result.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> Result<Notification> {
        let notification =
            sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(AppError::NotificationNotFound(id))?;

        Ok(notification)
    }

    pub async fn list(&self) -> Result<Vec<Notification>> {
        let notifications =
            sqlx::query_as::<_, Notification>("SELECT * FROM notifications ORDER BY append_date")
                .fetch_all(&self.pool)
                .await?;

        Ok(notifications)
    }

    pub async fn get_unsent(&self) -> Result<Vec<Notification>> {
        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE sending_date IS NULL AND canceling_date IS NULL
            ORDER BY append_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }

    /// Marks the notification as sent. A no-op once either terminal date is
    /// set: cancellation wins over a late send.
    pub async fn set_as_send(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET sending_date = ?
            WHERE id = ? AND sending_date IS NULL AND canceling_date IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Cancels delivery. A no-op once sent or already canceled.
    pub async fn cancel(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET canceling_date = ?
            WHERE id = ? AND sending_date IS NULL AND canceling_date IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
