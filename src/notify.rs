use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::TelegramConfig;

/// Fire-and-forget notification sink. Delivery failure must never fail the
/// operation that triggered the message.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Telegram Bot API sink.
pub struct TelegramNotifier {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(cfg: &TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: cfg.bot_token.clone(),
            chat_id: cfg.chat_id.clone(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Notification delivered ({} chars)", text.len());
            }
            Ok(resp) => {
                error!("Telegram rejected notification: HTTP {}", resp.status());
            }
            Err(e) => {
                error!("Failed to deliver notification: {}", e);
            }
        }
    }
}

/// Sink used when notifications are disabled. Messages are logged only.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, text: &str) {
        info!("Notification (sink disabled): {}", text);
    }
}

pub fn build_notifier(cfg: &TelegramConfig) -> SharedNotifier {
    if cfg.enabled && !cfg.bot_token.is_empty() && !cfg.chat_id.is_empty() {
        Arc::new(TelegramNotifier::new(cfg))
    } else {
        Arc::new(NullNotifier)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Captures messages for assertions.
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, text: &str) {
            self.messages.lock().push(text.to_string());
        }
    }
}
