//! Client-library abstraction layer.
//!
//! The WhatsApp wire protocol itself is an external dependency. This module
//! defines the narrow contract the fleet controller requires from it: a
//! [`SocketFactory`] that produces connected sockets, the [`WaSocket`]
//! request surface, and the typed [`SocketEvent`] taxonomy every socket
//! emits on its event stream.

pub mod mock;

pub use mock::{MockFactory, MockSocket};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::{MessageKey, WaMessage};
use crate::policy::DisconnectReason;
use crate::storage::{AuthBlob, AuthStore};

/// Error type for client-library operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The socket factory could not produce a connection.
    #[error("socket factory failed: {0}")]
    Factory(String),

    /// No driver is registered under the configured name.
    #[error("unknown client driver: {0}")]
    UnknownDriver(String),

    /// The socket is not in a state that allows the request.
    #[error("socket not connected")]
    NotConnected,

    /// An outbound request was rejected by the server.
    #[error("request failed: {0}")]
    Request(String),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
}

/// WebSocket readiness, mirroring the wire library's `ws.readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    /// Handshake in progress.
    Connecting,
    /// Live and usable.
    Open,
    /// Close initiated but not finished.
    Closing,
    /// Fully closed.
    Closed,
}

/// The `connection` field of a `connection.update` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is being established.
    Connecting,
    /// Session is authenticated and live.
    Open,
    /// Session closed; `last_disconnect` says why.
    Close,
}

/// A `connection.update` event.
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    /// New connection state, when it changed.
    pub connection: Option<ConnectionState>,
    /// Disconnect details, present on `Close`.
    pub last_disconnect: Option<DisconnectReason>,
    /// Pairing QR payload, present while waiting for a scan.
    pub qr: Option<String>,
}

/// How a `messages.upsert` batch entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    /// Live delivery.
    Notify,
    /// History backfill.
    Append,
}

/// A partial edit/status change for an existing message.
#[derive(Debug, Clone)]
pub struct MessageUpdate {
    /// Key of the message being updated.
    pub key: MessageKey,
    /// The partial update payload (status, edited content, ...).
    pub update: serde_json::Value,
}

impl MessageUpdate {
    /// True when the update carries only a delivery-status change.
    pub fn is_status_only(&self) -> bool {
        self.update
            .as_object()
            .is_some_and(|map| map.len() == 1 && map.contains_key("status"))
    }

    /// True when the update is an edit whose new content is null.
    pub fn is_null_edit(&self) -> bool {
        self.update
            .as_object()
            .is_some_and(|map| map.contains_key("message") && map["message"].is_null())
    }
}

/// A reaction added to or removed from a message.
#[derive(Debug, Clone)]
pub struct ReactionEvent {
    /// Key of the message being reacted to.
    pub key: MessageKey,
    /// The reacting participant (may be a LID in groups).
    pub participant: Option<String>,
    /// The emoji, or `None` when a reaction was removed.
    pub emoji: Option<String>,
}

/// Group participant change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// One member of a group's participant list.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupParticipant {
    /// Phone-form JID.
    pub jid: String,
    /// Lightweight identifier for this participant, when assigned.
    pub lid: Option<String>,
    /// Group admin.
    pub is_admin: bool,
    /// Group creator / super admin.
    pub is_super_admin: bool,
}

/// Group metadata snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupMetadata {
    /// The group JID.
    pub jid: String,
    /// Group subject line.
    pub subject: String,
    /// Creator JID, when known.
    pub owner: Option<String>,
    /// Current participant list.
    pub participants: Vec<GroupParticipant>,
}

/// Newsletter (channel) metadata.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewsletterMetadata {
    /// The newsletter JID.
    pub jid: String,
    /// Channel display name.
    pub name: String,
    /// The viewer's role; presence means the session already follows it.
    pub viewer_role: Option<String>,
}

/// Content of an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundContent {
    /// Plain text body.
    Text(String),
    /// Raw content tree passed to the wire library unchanged.
    Raw(serde_json::Value),
}

impl OutboundContent {
    /// The text body, when this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutboundContent::Text(text) => Some(text),
            OutboundContent::Raw(_) => None,
        }
    }
}

/// Typed event taxonomy produced by a socket's event stream.
///
/// Every wire event the controller consumes is a variant here; the
/// dispatcher is a single match over this enum.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// `connection.update`
    ConnectionUpdate(ConnectionUpdate),
    /// `creds.update` — rotated credential blob to persist.
    CredsUpdate(AuthBlob),
    /// `messages.upsert` — the hot path.
    MessagesUpsert {
        messages: Vec<WaMessage>,
        kind: UpsertKind,
    },
    /// `messages.update`
    MessagesUpdate(Vec<MessageUpdate>),
    /// `messages.delete`
    MessagesDelete { keys: Vec<MessageKey> },
    /// `messages.reaction`
    MessagesReaction(Vec<ReactionEvent>),
    /// `groups.upsert`
    GroupsUpsert(Vec<GroupMetadata>),
    /// `groups.update` — partial metadata refresh.
    GroupsUpdate(Vec<GroupMetadata>),
    /// `group-participants.update`
    GroupParticipantsUpdate {
        jid: String,
        participants: Vec<String>,
        action: ParticipantAction,
    },
    /// `contacts.upsert` / `contacts.update` — payload handed off opaque.
    Contacts(serde_json::Value),
    /// `chats.upsert` / `chats.update` / `chats.delete` — handed off opaque.
    Chats(serde_json::Value),
    /// `presence.update`
    PresenceUpdate { jid: String },
    /// `call`
    Call(serde_json::Value),
    /// `blocklist.set`
    BlocklistSet { jids: Vec<String> },
    /// `blocklist.update`
    BlocklistUpdate { jids: Vec<String>, action: String },
}

/// A freshly created connection: the request surface plus the event stream.
///
/// The receiver is handed to the dispatcher exactly once; taking it out of
/// this struct is what makes double event-subscription unrepresentable.
pub struct NewConnection {
    /// The live socket handle.
    pub socket: Arc<dyn WaSocket>,
    /// The socket's event stream.
    pub events: mpsc::Receiver<SocketEvent>,
}

/// Options for socket creation.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    /// Allow the library to start a fresh pairing (QR / pairing code) when
    /// no valid credentials exist. Reconnect paths always pass `false`.
    pub allow_pairing: bool,
    /// Phone number for pairing-code flows.
    pub phone_number: Option<String>,
}

/// Factory producing connected sockets from stored auth material.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Create a socket for the session, loading credentials from `auth`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Factory`] when the connection cannot be
    /// established at all. Auth problems surface later as disconnect events,
    /// not here.
    async fn connect(
        &self,
        session_id: &str,
        auth: Arc<dyn AuthStore>,
        options: SocketOptions,
    ) -> Result<NewConnection, ClientError>;
}

/// Request surface of one live socket.
///
/// Implementations must be thread-safe; the fleet shares each socket across
/// the dispatcher, the health monitor, and batch workers.
#[async_trait]
pub trait WaSocket: Send + Sync {
    /// The session's own JID once authenticated, `None` before pairing
    /// completes. A connected socket without an identity is the
    /// partial-session anomaly the health monitor repairs.
    fn user_jid(&self) -> Option<String>;

    /// Transport readiness.
    fn ws_state(&self) -> WsState;

    /// Send a message to a chat, optionally quoting another message.
    async fn send_message(
        &self,
        jid: &str,
        content: OutboundContent,
        quoted: Option<&WaMessage>,
    ) -> Result<(), ClientError>;

    /// Broadcast our presence state (`available`, `composing`, ...).
    async fn send_presence_update(&self, presence: &str) -> Result<(), ClientError>;

    /// Ask the server for presence updates about a JID.
    async fn presence_subscribe(&self, jid: &str) -> Result<(), ClientError>;

    /// Fetch group metadata, including the participant list with LIDs.
    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, ClientError>;

    /// Add/remove/promote/demote group participants.
    async fn group_participants_update(
        &self,
        jid: &str,
        participants: &[String],
        action: ParticipantAction,
    ) -> Result<(), ClientError>;

    /// Change a group setting (`announcement`, `locked`, ...).
    async fn group_setting_update(&self, jid: &str, setting: &str) -> Result<(), ClientError>;

    /// Revoke the current invite link, returning the new code.
    async fn group_revoke_invite(&self, jid: &str) -> Result<String, ClientError>;

    /// Fetch the current invite code.
    async fn group_invite_code(&self, jid: &str) -> Result<String, ClientError>;

    /// Inspect an invite code without joining.
    async fn group_invite_info(&self, code: &str) -> Result<serde_json::Value, ClientError>;

    /// Follow a newsletter.
    async fn newsletter_follow(&self, jid: &str) -> Result<(), ClientError>;

    /// Subscribe to live updates for a followed newsletter.
    async fn subscribe_newsletter_updates(&self, jid: &str) -> Result<(), ClientError>;

    /// Unmute a followed newsletter.
    async fn newsletter_unmute(&self, jid: &str) -> Result<(), ClientError>;

    /// Fetch newsletter metadata. `viewer_role` presence means the session
    /// already follows the channel.
    async fn newsletter_metadata(&self, jid: &str) -> Result<NewsletterMetadata, ClientError>;

    /// Check whether a JID is registered on WhatsApp.
    async fn check_status(&self, jid: &str) -> Result<bool, ClientError>;

    /// Pin or unpin a chat.
    async fn chat_pin(&self, jid: &str, pinned: bool) -> Result<(), ClientError>;

    /// Block or unblock a JID.
    async fn update_block_status(&self, jid: &str, block: bool) -> Result<(), ClientError>;

    /// Ask the server to resend a message that arrived as a ciphertext stub.
    async fn request_placeholder_resend(&self, key: &MessageKey) -> Result<(), ClientError>;

    /// Request a pairing code for phone-number pairing.
    async fn request_pairing_code(&self, phone: &str) -> Result<String, ClientError>;

    /// Close the underlying transport. Does not detach library-internal
    /// listeners; use [`clear_listeners`](WaSocket::clear_listeners) for that.
    fn close_ws(&self);

    /// Detach all event listeners. Used only on full teardown.
    fn clear_listeners(&self);

    /// Flush any buffered events to the stream.
    fn flush_events(&self);

    /// True while the library is buffering events (history sync).
    fn is_buffering(&self) -> bool;
}

/// Channel capacity for socket event streams.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Create a socket factory from a configured driver name.
///
/// The `"mock"` driver is the in-tree in-memory implementation, used for
/// development and tests. Wire drivers live in their own crates and are
/// registered here by the binary that links them.
///
/// # Errors
///
/// Returns [`ClientError::UnknownDriver`] for unrecognized names.
pub fn create_factory(driver: &str) -> Result<Arc<dyn SocketFactory>, ClientError> {
    match driver {
        "mock" => Ok(Arc::new(MockFactory::new().with_auto_open())),
        unknown => Err(ClientError::UnknownDriver(unknown.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_update_status_only() {
        let update = MessageUpdate {
            key: MessageKey::new("123@s.whatsapp.net", "A1", false),
            update: serde_json::json!({"status": 3}),
        };
        assert!(update.is_status_only());
        assert!(!update.is_null_edit());
    }

    #[test]
    fn test_message_update_null_edit() {
        let update = MessageUpdate {
            key: MessageKey::new("123@s.whatsapp.net", "A1", false),
            update: serde_json::json!({"message": null}),
        };
        assert!(update.is_null_edit());
        assert!(!update.is_status_only());
    }

    #[test]
    fn test_message_update_real_edit_passes_filters() {
        let update = MessageUpdate {
            key: MessageKey::new("123@s.whatsapp.net", "A1", false),
            update: serde_json::json!({"message": {"conversation": "edited"}, "status": 2}),
        };
        assert!(!update.is_null_edit());
        assert!(!update.is_status_only());
    }

    #[test]
    fn test_create_factory_known_and_unknown() {
        assert!(create_factory("mock").is_ok());
        assert!(matches!(
            create_factory("baileys"),
            Err(ClientError::UnknownDriver(_))
        ));
    }

    #[test]
    fn test_outbound_content_text_accessor() {
        assert_eq!(
            OutboundContent::Text("hi".to_string()).as_text(),
            Some("hi")
        );
        assert_eq!(
            OutboundContent::Raw(serde_json::json!({"image": {}})).as_text(),
            None
        );
    }
}
