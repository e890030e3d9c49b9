use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Notification, NotificationKind};
use crate::notify::{ChatSender, EmailSender, NotificationRenderer, RenderContext};
use crate::repository::{NotificationRepository, RunRepository, TaskRepository};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Drains the notification queue in append order. A delivery failure keeps
/// the row unsent and backs the whole loop off, so a dead SMTP relay or
/// chat endpoint does not hammer anything.
pub struct NotifierService {
    task_repo: TaskRepository,
    run_repo: RunRepository,
    notification_repo: NotificationRepository,
    config: Config,
    renderer: NotificationRenderer,
    email: Option<EmailSender>,
    chat: Option<ChatSender>,
    stop: Arc<AtomicBool>,
}

impl NotifierService {
    pub fn new(
        task_repo: TaskRepository,
        run_repo: RunRepository,
        notification_repo: NotificationRepository,
        config: Config,
    ) -> Result<Self> {
        let email = config
            .notification
            .email
            .as_ref()
            .map(EmailSender::new)
            .transpose()?;
        let chat = config
            .notification
            .chat
            .as_ref()
            .map(ChatSender::new)
            .transpose()?;

        Ok(Self {
            task_repo,
            run_repo,
            notification_repo,
            config,
            renderer: NotificationRenderer::new(),
            email,
            chat,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.notifier_interval_secs);
        let backoff = Duration::from_secs(self.config.notifier_backoff_secs);

        while !self.stop.load(Ordering::Relaxed) {
            if !self.config.notification.enabled {
                sleep(backoff).await;
                continue;
            }
            match self.process_once().await {
                Ok(()) => sleep(interval).await,
                Err(e) => {
                    tracing::error!("Notifier cycle failed: {e}");
                    sleep(backoff).await;
                }
            }
        }
        tracing::info!("Notifier exiting");
    }

    /// Delivers every currently unsent notification in append order. A
    /// failed item is logged (and noted on its run), left unsent for the
    /// next cycle and never blocks the items behind it; any failure still
    /// makes the cycle report an error so the caller backs off.
    pub async fn process_once(&self) -> Result<()> {
        let mut failed = 0usize;
        for notification in self.notification_repo.get_unsent().await? {
            // A cancellation racing the drain wins; re-check before sending.
            let fresh = self.notification_repo.get(notification.id).await?;
            if !fresh.is_ready() {
                continue;
            }

            match self.deliver(&fresh).await {
                Ok(()) => {
                    self.notification_repo.set_as_send(fresh.id).await?;
                    tracing::info!("Notification #{} ({}) sent", fresh.id, fresh.kind.as_str());
                }
                Err(e) => {
                    tracing::error!("Notification #{} failed to deliver: {e}", fresh.id);
                    if let Some(run_id) = fresh.task_run_id {
                        let _ = self
                            .run_repo
                            .add_log_err(run_id, &format!("Notification delivery failed: {e}"))
                            .await;
                    }
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(AppError::Notification(format!(
                "{failed} notification(s) failed to deliver"
            )));
        }
        Ok(())
    }

    /// Run-attached notifications are re-rendered from the configured
    /// channel template at send time, so the message reflects the run's
    /// final state. Detached rows go out with their stored name and text.
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let (name, text, run_url) = match notification.task_run_id {
            Some(run_id) => self.render_for_run(notification, run_id).await?,
            None => (notification.name.clone(), notification.text.clone(), None),
        };

        match notification.kind {
            NotificationKind::Email => {
                let sender = self.email.as_ref().ok_or_else(|| {
                    AppError::Notification("Email notifications are not configured".to_string())
                })?;
                sender.send(&name, &text).await
            }
            NotificationKind::Chat => {
                let sender = self.chat.as_ref().ok_or_else(|| {
                    AppError::Notification("Chat notifications are not configured".to_string())
                })?;
                sender.send(&name, &text, run_url.as_deref()).await
            }
        }
    }

    async fn render_for_run(
        &self,
        notification: &Notification,
        run_id: i64,
    ) -> Result<(String, String, Option<String>)> {
        let run = self.run_repo.get(run_id).await?;
        let task = self.task_repo.get(run.task_id).await?;

        let run_url = self
            .config
            .notification
            .run_url_pattern
            .as_ref()
            .map(|pattern| {
                pattern
                    .replace("{task_id}", &task.id.to_string())
                    .replace("{run_seq}", &run.seq.to_string())
            })
            .or_else(|| self.config.notification.base_url.clone());

        let (name_template, text_template) = match notification.kind {
            NotificationKind::Email => self
                .config
                .notification
                .email
                .as_ref()
                .map(|email| (email.template_name.as_str(), email.template_text.as_str())),
            NotificationKind::Chat => self
                .config
                .notification
                .chat
                .as_ref()
                .map(|chat| (chat.template_name.as_str(), chat.template_text.as_str())),
        }
        .unwrap_or((notification.name.as_str(), notification.text.as_str()));

        let ctx = RenderContext {
            task: &task,
            run: &run,
            base_url: self.config.notification.base_url.as_deref(),
            run_url: run_url.as_deref(),
        };
        let name = self.renderer.render(name_template, &ctx)?;
        let text = self.renderer.render(text_template, &ctx)?;

        Ok((name, text, run_url))
    }
}
