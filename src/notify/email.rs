use crate::config::EmailConfig;
use crate::error::{AppError, Result};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// SMTP delivery channel for `NotificationKind::Email`.
pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    mailbox: Mailbox,
}

impl EmailSender {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| AppError::Notification(format!("Invalid SMTP relay: {e}")))?
            .port(config.port)
            .credentials(Credentials::new(
                config.login.clone(),
                config.password.clone(),
            ))
            .build();

        let mailbox: Mailbox = config
            .send_to
            .parse()
            .map_err(|e| AppError::Notification(format!("Invalid email address: {e}")))?;

        Ok(Self { transport, mailbox })
    }

    pub async fn send(&self, subject: &str, text: &str) -> Result<()> {
        let message = Message::builder()
            .from(self.mailbox.clone())
            .to(self.mailbox.clone())
            .subject(subject)
            .body(text.to_string())
            .map_err(|e| AppError::Notification(format!("Failed to build email: {e}")))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| AppError::Notification(format!("SMTP send failed: {e}")))?;

        Ok(())
    }
}
