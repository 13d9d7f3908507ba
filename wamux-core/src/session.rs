//! Session identity and persisted metadata.
//!
//! A session pairs a persistent identity (`session_{userId}`, auth blobs)
//! with at most one live socket. The user-id range encodes where the
//! session originated: web-frontend ids live in a reserved numeric band,
//! everything else is chat-bot originated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical session-id prefix.
pub const SESSION_PREFIX: &str = "session_";

/// First user id of the web-origination band.
pub const WEB_ID_MIN: u64 = 1_000_000_000;
/// Last user id of the web-origination band.
pub const WEB_ID_MAX: u64 = 1_999_999_999;

/// Canonical session id for a user: `session_{userId}`.
pub fn session_id_for(user_id: &str) -> String {
    format!("{SESSION_PREFIX}{user_id}")
}

/// Inverse of [`session_id_for`].
pub fn user_id_from_session(session_id: &str) -> Option<&str> {
    session_id.strip_prefix(SESSION_PREFIX)
}

/// Where a session originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    /// Created through the chat bot (`/connect`).
    Telegram,
    /// Credentials written by the web frontend; adopted by the detector.
    Web,
}

impl SessionSource {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionSource::Telegram => "telegram",
            SessionSource::Web => "web",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(SessionSource::Telegram),
            "web" => Some(SessionSource::Web),
            _ => None,
        }
    }

    /// Infer the source from the user-id range.
    pub fn from_user_id(user_id: &str) -> Self {
        match user_id.parse::<u64>() {
            Ok(id) if (WEB_ID_MIN..=WEB_ID_MAX).contains(&id) => SessionSource::Web,
            _ => SessionSource::Telegram,
        }
    }
}

/// Controller-level connection status, as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    AuthMissing,
    Failed,
    Error,
}

impl ConnectionStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::AuthMissing => "auth_missing",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Error => "error",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(ConnectionStatus::Connecting),
            "connected" => Some(ConnectionStatus::Connected),
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "reconnecting" => Some(ConnectionStatus::Reconnecting),
            "auth_missing" => Some(ConnectionStatus::AuthMissing),
            "failed" => Some(ConnectionStatus::Failed),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

/// A persisted session row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Canonical id, `session_{userId}`.
    pub session_id: String,
    /// Owning user id.
    pub user_id: String,
    /// E.164 phone number, `None` before pairing completes.
    pub phone_number: Option<String>,
    /// Origination path.
    pub source: SessionSource,
    /// Last persisted status.
    pub status: ConnectionStatus,
    /// Derived connection flag, persisted for the web frontend to read.
    pub is_connected: bool,
    /// Reconnection attempt counter; reset on a successful connect.
    pub reconnect_attempts: u32,
    /// Whether this controller owns the session. Always true for
    /// chat-bot sessions; flips true for web sessions on takeover.
    pub detected: bool,
    /// Last takeover failure, for the web frontend to surface.
    pub detection_error: Option<String>,
    /// When the last takeover was attempted.
    pub last_detection_attempt: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create a fresh record for a user. `detected` starts true for
    /// chat-bot sessions and false for web sessions.
    pub fn new(user_id: impl Into<String>, source: SessionSource) -> Self {
        let user_id = user_id.into();
        let now = Utc::now();
        Self {
            session_id: session_id_for(&user_id),
            user_id,
            phone_number: None,
            source,
            status: ConnectionStatus::Connecting,
            is_connected: false,
            reconnect_attempts: 0,
            detected: source == SessionSource::Telegram,
            detection_error: None,
            last_detection_attempt: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the phone number.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(phone.into());
        self
    }

    /// Set the status and the derived `is_connected` flag.
    #[must_use]
    pub fn with_status(mut self, status: ConnectionStatus) -> Self {
        self.status = status;
        self.is_connected = status == ConnectionStatus::Connected;
        self
    }
}

/// Mutable fields of a session row, for partial updates.
///
/// `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub phone_number: Option<String>,
    pub status: Option<ConnectionStatus>,
    pub is_connected: Option<bool>,
    pub reconnect_attempts: Option<u32>,
    pub detected: Option<bool>,
    pub detection_error: Option<Option<String>>,
    pub last_detection_attempt: Option<DateTime<Utc>>,
}

impl SessionUpdate {
    /// Update that marks the session connected and resets the attempt
    /// counter — the only transition allowed to decrease it.
    pub fn connected() -> Self {
        Self {
            status: Some(ConnectionStatus::Connected),
            is_connected: Some(true),
            reconnect_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Update that marks the session disconnected.
    pub fn disconnected() -> Self {
        Self {
            status: Some(ConnectionStatus::Disconnected),
            is_connected: Some(false),
            ..Self::default()
        }
    }
}

/// Live view of one session, combining the registry and the record.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub phone_number: Option<String>,
    pub source: SessionSource,
    pub status: ConnectionStatus,
    /// Socket present in the live registry.
    pub in_registry: bool,
    /// Transport reports open.
    pub ws_open: bool,
    /// The socket has an authenticated identity.
    pub has_identity: bool,
    pub reconnect_attempts: u32,
}
