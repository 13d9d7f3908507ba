//! Mock client library for testing.
//!
//! Provides [`MockSocket`] and [`MockFactory`], configurable in-memory
//! implementations of the client-library contract. Tests inject events
//! through the factory's connection handles and assert on the requests
//! each socket recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    ClientError, ConnectionState, ConnectionUpdate, EVENT_CHANNEL_CAPACITY, GroupMetadata,
    NewConnection, NewsletterMetadata, OutboundContent, ParticipantAction, SocketEvent,
    SocketFactory, SocketOptions, WaSocket, WsState,
};
use crate::message::{MessageKey, WaMessage};
use crate::storage::AuthStore;

/// One outbound message recorded by a [`MockSocket`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Destination chat.
    pub jid: String,
    /// What was sent.
    pub content: OutboundContent,
    /// Whether a quoted message was attached.
    pub quoted: bool,
}

/// A configurable in-memory socket.
///
/// Records every request; tests read the records back through the
/// accessor methods.
#[derive(Default)]
pub struct MockSocket {
    user: RwLock<Option<String>>,
    state: RwLock<Option<WsState>>,
    groups: Mutex<HashMap<String, GroupMetadata>>,
    newsletters: Mutex<HashMap<String, NewsletterMetadata>>,
    sent: Mutex<Vec<SentMessage>>,
    pins: Mutex<Vec<(String, bool)>>,
    followed: Mutex<Vec<String>>,
    subscribed: Mutex<Vec<String>>,
    unmuted: Mutex<Vec<String>>,
    resend_requests: Mutex<Vec<MessageKey>>,
    pairing_code: RwLock<Option<String>>,
    fail_sends: AtomicBool,
    buffering: AtomicBool,
    flush_count: AtomicUsize,
    listeners_cleared: AtomicBool,
    closed: AtomicBool,
}

impl MockSocket {
    /// A socket that reports `Open` with the given own JID.
    pub fn connected(user_jid: &str) -> Self {
        let sock = Self::default();
        *sock.user.write().unwrap() = Some(user_jid.to_string());
        *sock.state.write().unwrap() = Some(WsState::Open);
        sock
    }

    /// A socket with a live wire but no authenticated identity — the
    /// partial-session shape the health monitor looks for.
    pub fn without_identity() -> Self {
        let sock = Self::default();
        *sock.state.write().unwrap() = Some(WsState::Open);
        sock
    }

    /// Override the transport state.
    pub fn set_ws_state(&self, state: WsState) {
        *self.state.write().unwrap() = Some(state);
    }

    /// Register group metadata returned by `group_metadata`.
    pub fn put_group(&self, metadata: GroupMetadata) {
        self.groups
            .lock()
            .unwrap()
            .insert(metadata.jid.clone(), metadata);
    }

    /// Register newsletter metadata returned by `newsletter_metadata`.
    pub fn put_newsletter(&self, metadata: NewsletterMetadata) {
        self.newsletters
            .lock()
            .unwrap()
            .insert(metadata.jid.clone(), metadata);
    }

    /// Configure the pairing code returned by `request_pairing_code`.
    pub fn set_pairing_code(&self, code: &str) {
        *self.pairing_code.write().unwrap() = Some(code.to_string());
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Snapshot of every message sent so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Newsletters followed so far, in order.
    pub fn followed(&self) -> Vec<String> {
        self.followed.lock().unwrap().clone()
    }

    /// Newsletters subscribed for updates so far.
    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    /// Newsletters unmuted so far.
    pub fn unmuted(&self) -> Vec<String> {
        self.unmuted.lock().unwrap().clone()
    }

    /// Chats pinned/unpinned so far.
    pub fn pins(&self) -> Vec<(String, bool)> {
        self.pins.lock().unwrap().clone()
    }

    /// Placeholder resend requests recorded so far.
    pub fn resend_requests(&self) -> Vec<MessageKey> {
        self.resend_requests.lock().unwrap().clone()
    }

    /// True once `close_ws` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True once `clear_listeners` was called.
    pub fn listeners_cleared(&self) -> bool {
        self.listeners_cleared.load(Ordering::SeqCst)
    }

    /// Number of `flush_events` calls.
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    fn guard_send(&self) -> Result<(), ClientError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Request("mock send failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WaSocket for MockSocket {
    fn user_jid(&self) -> Option<String> {
        self.user.read().unwrap().clone()
    }

    fn ws_state(&self) -> WsState {
        if self.closed.load(Ordering::SeqCst) {
            return WsState::Closed;
        }
        self.state.read().unwrap().unwrap_or(WsState::Closed)
    }

    async fn send_message(
        &self,
        jid: &str,
        content: OutboundContent,
        quoted: Option<&WaMessage>,
    ) -> Result<(), ClientError> {
        self.guard_send()?;
        self.sent.lock().unwrap().push(SentMessage {
            jid: jid.to_string(),
            content,
            quoted: quoted.is_some(),
        });
        Ok(())
    }

    async fn send_presence_update(&self, _presence: &str) -> Result<(), ClientError> {
        self.guard_send()
    }

    async fn presence_subscribe(&self, _jid: &str) -> Result<(), ClientError> {
        self.guard_send()
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, ClientError> {
        self.groups
            .lock()
            .unwrap()
            .get(jid)
            .cloned()
            .ok_or_else(|| ClientError::Request(format!("unknown group: {jid}")))
    }

    async fn group_participants_update(
        &self,
        _jid: &str,
        _participants: &[String],
        _action: ParticipantAction,
    ) -> Result<(), ClientError> {
        self.guard_send()
    }

    async fn group_setting_update(&self, _jid: &str, _setting: &str) -> Result<(), ClientError> {
        self.guard_send()
    }

    async fn group_revoke_invite(&self, _jid: &str) -> Result<String, ClientError> {
        self.guard_send()?;
        Ok("REVOKED".to_string())
    }

    async fn group_invite_code(&self, _jid: &str) -> Result<String, ClientError> {
        self.guard_send()?;
        Ok("INVITE".to_string())
    }

    async fn group_invite_info(&self, _code: &str) -> Result<serde_json::Value, ClientError> {
        self.guard_send()?;
        Ok(serde_json::json!({}))
    }

    async fn newsletter_follow(&self, jid: &str) -> Result<(), ClientError> {
        self.guard_send()?;
        self.followed.lock().unwrap().push(jid.to_string());
        Ok(())
    }

    async fn subscribe_newsletter_updates(&self, jid: &str) -> Result<(), ClientError> {
        self.guard_send()?;
        self.subscribed.lock().unwrap().push(jid.to_string());
        Ok(())
    }

    async fn newsletter_unmute(&self, jid: &str) -> Result<(), ClientError> {
        self.guard_send()?;
        self.unmuted.lock().unwrap().push(jid.to_string());
        Ok(())
    }

    async fn newsletter_metadata(&self, jid: &str) -> Result<NewsletterMetadata, ClientError> {
        self.newsletters
            .lock()
            .unwrap()
            .get(jid)
            .cloned()
            .ok_or_else(|| ClientError::Request(format!("unknown newsletter: {jid}")))
    }

    async fn check_status(&self, _jid: &str) -> Result<bool, ClientError> {
        Ok(true)
    }

    async fn chat_pin(&self, jid: &str, pinned: bool) -> Result<(), ClientError> {
        self.guard_send()?;
        self.pins.lock().unwrap().push((jid.to_string(), pinned));
        Ok(())
    }

    async fn update_block_status(&self, _jid: &str, _block: bool) -> Result<(), ClientError> {
        self.guard_send()
    }

    async fn request_placeholder_resend(&self, key: &MessageKey) -> Result<(), ClientError> {
        self.resend_requests.lock().unwrap().push(key.clone());
        Ok(())
    }

    async fn request_pairing_code(&self, _phone: &str) -> Result<String, ClientError> {
        self.pairing_code
            .read()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    fn close_ws(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn clear_listeners(&self) {
        self.listeners_cleared.store(true, Ordering::SeqCst);
    }

    fn flush_events(&self) {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
    }

    fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::SeqCst)
    }
}

/// Handle to one connection a [`MockFactory`] produced.
///
/// Tests keep the sender side of the event stream and drive the socket's
/// lifecycle by pushing [`SocketEvent`]s.
#[derive(Clone)]
pub struct MockConnectionHandle {
    /// Session the connection was created for.
    pub session_id: String,
    /// The socket, for configuring and asserting.
    pub socket: Arc<MockSocket>,
    /// Sender half of the socket's event stream.
    pub events_tx: mpsc::Sender<SocketEvent>,
    /// The options the factory was called with.
    pub options: SocketOptions,
}

impl MockConnectionHandle {
    /// Push a `connection.update` with state `Open`.
    pub async fn emit_open(&self) {
        let _ = self
            .events_tx
            .send(SocketEvent::ConnectionUpdate(ConnectionUpdate {
                connection: Some(ConnectionState::Open),
                ..ConnectionUpdate::default()
            }))
            .await;
    }

    /// Push a `connection.update` close with the given disconnect reason.
    pub async fn emit_close(&self, reason: crate::policy::DisconnectReason) {
        let _ = self
            .events_tx
            .send(SocketEvent::ConnectionUpdate(ConnectionUpdate {
                connection: Some(ConnectionState::Close),
                last_disconnect: Some(reason),
                qr: None,
            }))
            .await;
    }
}

/// Mock socket factory.
///
/// Produces a [`MockSocket`] per `connect` call and records a
/// [`MockConnectionHandle`] for each. Failures can be injected for the
/// next N calls.
#[derive(Default)]
pub struct MockFactory {
    connections: Mutex<Vec<MockConnectionHandle>>,
    fail_next: AtomicUsize,
    auto_open: AtomicBool,
    connect_count: AtomicUsize,
}

impl MockFactory {
    /// A factory whose connections start silent; tests emit events through
    /// the recorded handles.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a `connection.update` `Open` event immediately on every connect.
    #[must_use]
    pub fn with_auto_open(self) -> Self {
        self.auto_open.store(true, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` connect calls with [`ClientError::Factory`].
    pub fn fail_times(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total connect calls observed (including failed ones).
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Handles for every successful connection, in creation order.
    pub fn handles(&self) -> Vec<MockConnectionHandle> {
        self.connections.lock().unwrap().clone()
    }

    /// Handle for the most recent successful connection.
    pub fn last_handle(&self) -> Option<MockConnectionHandle> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SocketFactory for MockFactory {
    async fn connect(
        &self,
        session_id: &str,
        _auth: Arc<dyn AuthStore>,
        options: SocketOptions,
    ) -> Result<NewConnection, ClientError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::Factory("mock connect failure".to_string()));
        }

        let own_jid = options
            .phone_number
            .clone()
            .map(|p| format!("{}@s.whatsapp.net", p.trim_start_matches('+')))
            .unwrap_or_else(|| "15550001111@s.whatsapp.net".to_string());

        let socket = Arc::new(MockSocket::connected(&own_jid));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        if self.auto_open.load(Ordering::SeqCst) {
            let _ = events_tx
                .send(SocketEvent::ConnectionUpdate(ConnectionUpdate {
                    connection: Some(ConnectionState::Open),
                    ..ConnectionUpdate::default()
                }))
                .await;
        }

        let handle = MockConnectionHandle {
            session_id: session_id.to_string(),
            socket: Arc::clone(&socket),
            events_tx,
            options,
        };
        self.connections.lock().unwrap().push(handle);

        Ok(NewConnection {
            socket,
            events: events_rx,
        })
    }
}
