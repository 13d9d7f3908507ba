//! Chat-bot notification port.
//!
//! Terminal disconnects and hard timeouts tell the owning user what
//! happened through this port. The Telegram implementation lives in the
//! binary crate; the core only sees the trait, and every send races an
//! 8 second timer so a slow bot API can never wedge disconnect routing.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Upper bound on one notification delivery.
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(8);

/// Error type for notification delivery.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The sink rejected the message.
    #[error("notification send failed: {0}")]
    Send(String),

    /// Delivery did not complete within [`NOTIFICATION_TIMEOUT`].
    #[error("notification timed out")]
    Timeout,
}

/// Send-only notification sink keyed by chat-bot user id.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `text` to the user. Implementations may parse lightweight
    /// HTML formatting.
    async fn notify(&self, user_id: &str, text: &str) -> Result<(), NotifyError>;
}

/// Deliver a notification, bounded by [`NOTIFICATION_TIMEOUT`].
pub async fn notify_with_timeout(
    notifier: &dyn Notifier,
    user_id: &str,
    text: &str,
) -> Result<(), NotifyError> {
    match tokio::time::timeout(NOTIFICATION_TIMEOUT, notifier.notify(user_id, text)).await {
        Ok(result) => result,
        Err(_) => Err(NotifyError::Timeout),
    }
}

/// Notifier that drops everything. For web-only deployments and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _user_id: &str, _text: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Notifier that records every delivery, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(user_id, text)` pair delivered so far.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: &str, text: &str) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap()
            .push((user_id.to_string(), text.to_string()));
        Ok(())
    }
}
