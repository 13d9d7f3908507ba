//! Telegram implementation of the core notification port.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use wamux_core::notify::{Notifier, NotifyError};

/// Send-only notification sink over the Telegram Bot API.
///
/// User ids are the numeric Telegram chat ids the fleet stores as session
/// owners. Messages are sent with HTML parsing; a parse failure falls back
/// to plain text so a notification is never silently lost.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    /// Wrap a bot handle.
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, user_id: &str, text: &str) -> Result<(), NotifyError> {
        let chat_id: i64 = user_id
            .parse()
            .map_err(|_| NotifyError::Send(format!("non-numeric chat id: {user_id}")))?;

        let html_result = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await;

        match html_result {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(user = %user_id, error = %e, "HTML notification failed, retrying plain");
                self.bot
                    .send_message(ChatId(chat_id), text)
                    .await
                    .map(|_| ())
                    .map_err(|e| NotifyError::Send(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_numeric_user_id_rejected() {
        let notifier = TelegramNotifier::new(Bot::new("0000000000:TEST"));
        let result = notifier.notify("not-a-number", "hello").await;
        assert!(matches!(result, Err(NotifyError::Send(_))));
    }
}
