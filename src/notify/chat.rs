use crate::config::ChatConfig;
use crate::error::{AppError, Result};
use serde_json::json;
use std::time::Duration;

/// Chat/bot delivery channel for `NotificationKind::Chat`: posts the
/// rendered notification to an HTTP endpoint with failure severity, a
/// source URL and a delete affordance for the recipient.
pub struct ChatSender {
    client: reqwest::Client,
    add_notify_url: String,
}

impl ChatSender {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Notification(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            add_notify_url: config.add_notify_url.clone(),
        })
    }

    pub async fn send(&self, name: &str, text: &str, url: Option<&str>) -> Result<()> {
        let payload = json!({
            "name": name,
            "text": text,
            "type": "ERROR",
            "url": url,
            "has_delete_button": true,
        });

        let response = self
            .client
            .post(&self.add_notify_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Notification(format!("Chat post failed: {e}")))?;

        response
            .error_for_status()
            .map_err(|e| AppError::Notification(format!("Chat endpoint rejected: {e}")))?;

        Ok(())
    }
}
