//! Fire-and-forget status notifications.

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;

/// Delivery failures are swallowed by the implementations.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) {
        info!("[NOTIFY] {}", message);
    }
}

/// Sends notifications to a Telegram chat through the bot API.
pub struct TelegramNotifier {
    client: Client,
    url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: format!("https://api.telegram.org/bot{token}/sendMessage"),
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) {
        let result = self
            .client
            .post(&self.url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", message)])
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            warn!("Telegram notification failed: {}", e.without_url());
        }
    }
}
