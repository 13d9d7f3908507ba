//! Event dispatch and message ingress.
//!
//! One consumer task per socket drains the typed event stream: connection
//! updates feed the disconnect router, credential rotations feed the auth
//! store, and `messages.upsert` runs the ingress pipeline — broadcast
//! filtering, ciphertext retry, cross-session deduplication, identity
//! normalization, enrichment, and plugin dispatch. Taking the stream
//! receiver out of the connection makes double installation
//! unrepresentable; different sockets' consumers run concurrently while
//! messages within one batch stay ordered.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use crate::fleet::SessionOps;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::batch::ChannelFollowQueue;
use crate::client::{
    ConnectionState, GroupMetadata, SocketEvent, WaSocket,
};
use crate::config::IngressConfig;
use crate::dedup::MessageDedup;
use crate::fleet::SessionManager;
use crate::health::HealthMonitor;
use crate::jid::{self, STATUS_BROADCAST};
use crate::message::{InboundMessage, WaMessage, parse_command};
use crate::plugin::{CommandRegistry, MessageHook};
use crate::reconnect::ConnectionRouter;
use crate::session::user_id_from_session;
use crate::storage::PrefixCache;

/// How long cached group metadata stays fresh.
const GROUP_META_TTL: Duration = Duration::from_secs(300);
/// Recent messages kept per session for the anti-plugin hooks.
const RECENT_MESSAGES_CAP: usize = 100;
/// Delay before requesting a resend for a ciphertext stub.
const PLACEHOLDER_RESEND_DELAY: Duration = Duration::from_secs(2);

struct CachedGroup {
    metadata: GroupMetadata,
    fetched: Instant,
}

/// The per-fleet event dispatcher.
pub struct EventDispatcher {
    manager: Arc<SessionManager>,
    router: Arc<ConnectionRouter>,
    health: Arc<HealthMonitor>,
    dedup: Arc<MessageDedup>,
    registry: Arc<CommandRegistry>,
    prefixes: Arc<PrefixCache>,
    config: IngressConfig,
    group_meta: DashMap<(String, String), CachedGroup>,
    recent: DashMap<String, VecDeque<InboundMessage>>,
    game_locks: MessageDedup,
    follow_queue: OnceLock<Arc<ChannelFollowQueue>>,
    status_handler: OnceLock<Arc<dyn MessageHook>>,
}

impl EventDispatcher {
    /// Build a dispatcher. Wire the channel-follow queue afterwards with
    /// [`set_follow_queue`](Self::set_follow_queue).
    pub fn new(
        manager: Arc<SessionManager>,
        router: Arc<ConnectionRouter>,
        health: Arc<HealthMonitor>,
        dedup: Arc<MessageDedup>,
        registry: Arc<CommandRegistry>,
        prefixes: Arc<PrefixCache>,
        config: IngressConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            router,
            health,
            dedup,
            registry,
            prefixes,
            config,
            group_meta: DashMap::new(),
            recent: DashMap::new(),
            game_locks: MessageDedup::default(),
            follow_queue: OnceLock::new(),
            status_handler: OnceLock::new(),
        })
    }

    /// Install the channel auto-follow queue. Called once at fleet startup.
    pub fn set_follow_queue(&self, queue: Arc<ChannelFollowQueue>) {
        let _ = self.follow_queue.set(queue);
    }

    /// Install the optional status auto-view handler.
    pub fn set_status_handler(&self, handler: Arc<dyn MessageHook>) {
        let _ = self.status_handler.set(handler);
    }

    /// Attach the consumer task for one socket's event stream.
    ///
    /// The receiver is consumed here; a second subscription for the same
    /// socket cannot exist.
    pub fn attach(
        self: &Arc<Self>,
        session_id: &str,
        socket: Arc<dyn WaSocket>,
        mut events: mpsc::Receiver<SocketEvent>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatcher.health.record_activity(&session_id);
                dispatcher
                    .dispatch_event(&session_id, &socket, event)
                    .await;
            }
            tracing::debug!(session = %session_id, "event stream ended");
        })
    }

    /// Drop every per-session cache. Part of the full cleanup path.
    pub fn forget_session(&self, session_id: &str) {
        self.recent.remove(session_id);
        self.group_meta
            .retain(|(sid, _), _| sid != session_id);
    }

    /// Recent inbound messages for a session, newest last.
    pub fn recent_messages(&self, session_id: &str) -> Vec<InboundMessage> {
        self.recent
            .get(session_id)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn dispatch_event(&self, session_id: &str, socket: &Arc<dyn WaSocket>, event: SocketEvent) {
        match event {
            SocketEvent::ConnectionUpdate(update) => {
                if let Some(qr) = &update.qr {
                    self.manager.on_session_qr(session_id, qr);
                }
                match update.connection {
                    Some(ConnectionState::Open) => {
                        tracing::info!(session = %session_id, "connection open");
                        self.manager.on_session_open(session_id).await;
                        if let Some(queue) = self.follow_queue.get() {
                            queue.enqueue(session_id, Arc::clone(socket)).await;
                        }
                    }
                    Some(ConnectionState::Close) => {
                        let reason = update.last_disconnect.unwrap_or_default();
                        // Routed from a separate task: cleanup may abort
                        // this very consumer, and must not die with it.
                        let router = Arc::clone(&self.router);
                        let session = session_id.to_string();
                        tokio::spawn(async move {
                            router.handle_close(&session, reason).await;
                        });
                    }
                    Some(ConnectionState::Connecting) | None => {
                        tracing::debug!(session = %session_id, "connection progressing");
                    }
                }
            }
            SocketEvent::CredsUpdate(blob) => {
                if let Err(e) = self.manager.auth_store().put(&blob).await {
                    tracing::warn!(session = %session_id, file = %blob.filename, error = %e, "credential persist failed");
                }
            }
            SocketEvent::MessagesUpsert { messages, kind } => {
                tracing::debug!(session = %session_id, count = messages.len(), ?kind, "messages upsert");
                // In-order within the batch; concurrency lives across sockets.
                for message in messages {
                    self.process_message(session_id, socket, message).await;
                }
            }
            SocketEvent::MessagesUpdate(updates) => {
                let relevant: Vec<_> = updates
                    .into_iter()
                    .filter(|u| !u.is_status_only() && !u.is_null_edit())
                    .collect();
                if !relevant.is_empty() {
                    tracing::debug!(session = %session_id, count = relevant.len(), "message edits");
                }
            }
            SocketEvent::MessagesDelete { keys } => {
                for key in &keys {
                    let participant = key.participant.as_deref().map(jid::normalize_jid);
                    tracing::debug!(session = %session_id, chat = %key.remote_jid, ?participant, "message deleted");
                }
            }
            SocketEvent::MessagesReaction(reactions) => {
                for reaction in &reactions {
                    let participant = reaction.participant.as_deref().map(jid::normalize_jid);
                    tracing::debug!(session = %session_id, chat = %reaction.key.remote_jid, ?participant, "reaction");
                }
            }
            SocketEvent::GroupsUpsert(groups) | SocketEvent::GroupsUpdate(groups) => {
                for metadata in groups {
                    self.group_meta.insert(
                        (session_id.to_string(), metadata.jid.clone()),
                        CachedGroup {
                            metadata,
                            fetched: Instant::now(),
                        },
                    );
                }
            }
            SocketEvent::GroupParticipantsUpdate { jid, .. } => {
                self.group_meta
                    .remove(&(session_id.to_string(), jid.clone()));
                tracing::debug!(session = %session_id, group = %jid, "participants changed, cache dropped");
            }
            SocketEvent::PresenceUpdate { jid } => {
                tracing::trace!(session = %session_id, jid = %jid, "presence");
            }
            SocketEvent::Contacts(_) | SocketEvent::Chats(_) => {}
            SocketEvent::Call(call) => {
                tracing::debug!(session = %session_id, ?call, "call event");
            }
            SocketEvent::BlocklistSet { jids } | SocketEvent::BlocklistUpdate { jids, .. } => {
                tracing::debug!(session = %session_id, count = jids.len(), "blocklist event");
            }
        }
    }

    /// The message ingress pipeline.
    async fn process_message(
        &self,
        session_id: &str,
        socket: &Arc<dyn WaSocket>,
        mut message: WaMessage,
    ) {
        let chat = jid::normalize_jid(&message.key.remote_jid);

        // Status broadcasts go to the optional auto-view handler only.
        if chat == STATUS_BROADCAST {
            if let Some(handler) = self.status_handler.get() {
                let inbound = self.enrich_minimal(&message, &chat);
                let handler = Arc::clone(handler);
                let sock = Arc::clone(socket);
                let session = session_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = handler.inspect(sock, &session, &inbound).await {
                        tracing::warn!(session = %session, error = %e, "status handler failed");
                    }
                });
            }
            return;
        }
        // Non-status broadcast lists are dropped.
        if jid::is_broadcast(&chat) {
            return;
        }

        // Ciphertext stubs: schedule a placeholder resend, not a failure.
        if message.is_ciphertext_stub() {
            let sock = Arc::clone(socket);
            let key = message.key.clone();
            let session = session_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(PLACEHOLDER_RESEND_DELAY).await;
                if let Err(e) = sock.request_placeholder_resend(&key).await {
                    tracing::debug!(session = %session, error = %e, "placeholder resend failed");
                }
            });
            return;
        }

        // Cross-session dedup: first lock wins, everyone else drops.
        let message_id = message.key.id.clone();
        if self.dedup.is_duplicate(&chat, &message_id, session_id) {
            return;
        }
        if !self.dedup.try_lock(&chat, &message_id, session_id) {
            tracing::trace!(session = %session_id, chat = %chat, id = %message_id, "message owned elsewhere");
            return;
        }

        // Identity normalization, including LID resolution in groups.
        jid::normalize_message(&mut message);
        let is_group = jid::is_group(&chat);
        if is_group {
            if let Some(participant) = message.key.participant.clone()
                && jid::is_lid(&participant)
            {
                let resolved = jid::resolve_lid_to_jid(socket.as_ref(), &chat, &participant).await;
                message.key.participant = Some(resolved);
            }
            self.resolve_context_lids(socket, &chat, &mut message).await;
        }

        let inbound = self.enrich(session_id, socket, message, &chat, is_group).await;

        // Persist in the per-session ring and emit the structured log.
        {
            let mut buffer = self
                .recent
                .entry(session_id.to_string())
                .or_insert_with(VecDeque::new);
            if buffer.len() >= RECENT_MESSAGES_CAP {
                buffer.pop_front();
            }
            buffer.push_back(inbound.clone());
        }
        tracing::info!(
            session = %session_id,
            chat = %inbound.chat,
            sender = %inbound.sender,
            group = inbound.is_group,
            command = inbound.command.as_ref().map(|c| c.name.as_str()),
            "message accepted"
        );

        // Anti-plugins may consume the message.
        for hook in self.registry.hooks() {
            match hook
                .inspect(Arc::clone(socket), session_id, &inbound)
                .await
            {
                Ok(true) => {
                    tracing::debug!(session = %session_id, hook = hook.name(), "message consumed");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session = %session_id, hook = hook.name(), error = %e, "hook failed")
                }
            }
        }

        // Command dispatch, then game text as the fallback.
        if let Some(command) = inbound.command.clone()
            && let Some(handler) = self.registry.get(&command.name)
        {
            if handler.game_scoped()
                && !self
                    .game_locks
                    .try_lock(&chat, &format!("game:{}", command.name), session_id)
            {
                tracing::debug!(session = %session_id, chat = %chat, command = %command.name, "game state locked elsewhere");
                return;
            }

            let sock = Arc::clone(socket);
            let session = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = handler
                    .execute(sock, &session, &command.args, &inbound)
                    .await
                {
                    tracing::warn!(session = %session, command = %command.name, error = %e, "command failed");
                }
            });
            return;
        }

        if let Some(game) = self.registry.game_handler() {
            let sock = Arc::clone(socket);
            let session = session_id.to_string();
            tokio::spawn(async move {
                match game.handle_text(sock, &session, &inbound).await {
                    Ok(consumed) => {
                        if consumed {
                            tracing::debug!(session = %session, "game consumed text");
                        }
                    }
                    Err(e) => tracing::warn!(session = %session, error = %e, "game handler failed"),
                }
            });
        }
    }

    /// Full enrichment: timestamps, sender, command, admin flags.
    async fn enrich(
        &self,
        session_id: &str,
        socket: &Arc<dyn WaSocket>,
        message: WaMessage,
        chat: &str,
        is_group: bool,
    ) -> InboundMessage {
        let timestamp = self.corrected_timestamp(&message);
        let own_jid = socket.user_jid().map(|j| jid::normalize_jid(&j));

        // Sender: groups use the participant; private self-sent messages
        // fall back to our own identity; private inbound is the chat.
        let mut sender = if is_group {
            message
                .key
                .participant
                .clone()
                .unwrap_or_else(|| chat.to_string())
        } else if message.key.from_me {
            own_jid.clone().unwrap_or_else(|| chat.to_string())
        } else {
            chat.to_string()
        };
        if jid::is_lid(&sender) {
            let resolved = jid::resolve_lid_to_jid(socket.as_ref(), chat, &sender).await;
            sender = resolved;
        }

        let body = message.body().unwrap_or_default();

        // Interactive envelopes carry a synthetic command; otherwise the
        // user's prefix decides.
        let command = match message.interactive_response() {
            Some(synthetic) => parse_command(&synthetic, ""),
            None => {
                let user_id = user_id_from_session(session_id).unwrap_or(session_id);
                let prefix = self.prefixes.prefix_for(user_id).await;
                parse_command(&body, &prefix)
            }
        };

        let (is_admin, is_creator) = if is_group {
            match self.group_metadata_cached(session_id, socket, chat).await {
                Some(metadata) => {
                    let participant = metadata
                        .participants
                        .iter()
                        .find(|p| jid::is_same_jid(&p.jid, &sender));
                    let is_admin = participant
                        .map(|p| p.is_admin || p.is_super_admin)
                        .unwrap_or(false);
                    let is_creator = participant.map(|p| p.is_super_admin).unwrap_or(false)
                        || metadata
                            .owner
                            .as_deref()
                            .is_some_and(|owner| jid::is_same_jid(owner, &sender));
                    (is_admin, is_creator)
                }
                None => (false, false),
            }
        } else {
            // Private chats: both sides are admins; the owner flag holds
            // when the sender is this session's own phone.
            let is_creator = own_jid
                .as_deref()
                .is_some_and(|own| jid::is_same_jid(own, &sender));
            (true, is_creator)
        };

        let quoted = message.quoted();
        let push_name = message.push_name.clone();

        InboundMessage {
            raw: message,
            chat: chat.to_string(),
            sender,
            is_group,
            is_admin,
            is_creator,
            body,
            command,
            quoted,
            timestamp,
            push_name,
        }
    }

    /// Minimal enrichment for status broadcasts.
    fn enrich_minimal(&self, message: &WaMessage, chat: &str) -> InboundMessage {
        let sender = message
            .key
            .participant
            .clone()
            .map(|p| jid::normalize_jid(&p))
            .unwrap_or_else(|| chat.to_string());
        InboundMessage {
            raw: message.clone(),
            chat: chat.to_string(),
            sender,
            is_group: false,
            is_admin: false,
            is_creator: false,
            body: message.body().unwrap_or_default(),
            command: None,
            quoted: None,
            timestamp: self.corrected_timestamp(message),
            push_name: message.push_name.clone(),
        }
    }

    fn corrected_timestamp(&self, message: &WaMessage) -> DateTime<Utc> {
        match message.timestamp {
            Some(ts) => Utc
                .timestamp_opt(ts + self.config.timestamp_offset_secs, 0)
                .single()
                .unwrap_or_else(Utc::now),
            None => Utc::now(),
        }
    }

    /// Resolve any LID left in `contextInfo.participant` fields after
    /// normalization, so quoted-message identities match the sender's.
    async fn resolve_context_lids(
        &self,
        socket: &Arc<dyn WaSocket>,
        chat: &str,
        message: &mut WaMessage,
    ) {
        let Some(content) = message.content.as_mut() else {
            return;
        };
        let mut lids = Vec::new();
        collect_lid_participants(content, &mut lids);
        for lid in lids {
            let resolved = jid::resolve_lid_to_jid(socket.as_ref(), chat, &lid).await;
            if resolved != lid {
                replace_participant(content, &lid, &resolved);
            }
        }
    }

    async fn group_metadata_cached(
        &self,
        session_id: &str,
        socket: &Arc<dyn WaSocket>,
        chat: &str,
    ) -> Option<GroupMetadata> {
        let key = (session_id.to_string(), chat.to_string());
        if let Some(cached) = self.group_meta.get(&key)
            && cached.fetched.elapsed() < GROUP_META_TTL
        {
            return Some(cached.metadata.clone());
        }

        match socket.group_metadata(chat).await {
            Ok(metadata) => {
                self.group_meta.insert(
                    key,
                    CachedGroup {
                        metadata: metadata.clone(),
                        fetched: Instant::now(),
                    },
                );
                Some(metadata)
            }
            Err(e) => {
                tracing::debug!(session = %session_id, group = %chat, error = %e, "group metadata fetch failed");
                None
            }
        }
    }
}

fn collect_lid_participants(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(participant)) = map.get("participant")
                && jid::is_lid(participant)
            {
                out.push(participant.clone());
            }
            for (_, child) in map {
                collect_lid_participants(child, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_lid_participants(item, out);
            }
        }
        _ => {}
    }
}

fn replace_participant(value: &mut serde_json::Value, from: &str, to: &str) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(participant)) = map.get_mut("participant")
                && participant == from
            {
                *participant = to.to_string();
            }
            for (_, child) in map.iter_mut() {
                replace_participant(child, from, to);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                replace_participant(item, from, to);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::client::mock::{MockConnectionHandle, MockFactory};
    use crate::client::{
        GroupParticipant, SocketFactory, UpsertKind,
    };
    use crate::config::{FleetConfig, HealthConfig};
    use crate::fleet::{CreateRequest, SessionCallbacks, SessionOps};
    use crate::message::MessageKey;
    use crate::notify::{Notifier, RecordingNotifier};
    use crate::plugin::{CommandHandler, PluginError};
    use crate::reconnect::ReconnectGuard;
    use crate::session::{ConnectionStatus, SessionRecord, SessionSource};
    use crate::DisconnectReason;
    use crate::storage::mem::{MemoryAuthStore, MemorySessionStore};
    use crate::storage::{AuthBlob, AuthStore, SessionStore};

    struct CountingCommand {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for CountingCommand {
        fn name(&self) -> &str {
            "ping"
        }

        async fn execute(
            &self,
            _sock: Arc<dyn WaSocket>,
            _session_id: &str,
            _args: &str,
            _msg: &InboundMessage,
        ) -> Result<(), PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RecordingHook {
        seen: Mutex<Vec<InboundMessage>>,
        consume: bool,
    }

    #[async_trait]
    impl MessageHook for RecordingHook {
        fn name(&self) -> &str {
            "recording"
        }

        async fn inspect(
            &self,
            _sock: Arc<dyn WaSocket>,
            _session_id: &str,
            msg: &InboundMessage,
        ) -> Result<bool, PluginError> {
            self.seen.lock().unwrap().push(msg.clone());
            Ok(self.consume)
        }
    }

    struct Fixture {
        manager: Arc<SessionManager>,
        dispatcher: Arc<EventDispatcher>,
        factory: Arc<MockFactory>,
        auth: Arc<MemoryAuthStore>,
        store: Arc<MemorySessionStore>,
        dedup: Arc<MessageDedup>,
        prefixes: Arc<PrefixCache>,
        command: Arc<CountingCommand>,
        hook: Arc<RecordingHook>,
    }

    fn fixture() -> Fixture {
        fixture_with_hook(false)
    }

    fn fixture_with_hook(consume: bool) -> Fixture {
        let factory = Arc::new(MockFactory::new());
        let auth = Arc::new(MemoryAuthStore::new());
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(
            FleetConfig::default(),
            Arc::clone(&factory) as Arc<dyn SocketFactory>,
            Arc::clone(&auth) as Arc<dyn AuthStore>,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Arc::new(RecordingNotifier::new()) as Arc<dyn Notifier>,
        );
        let router = ConnectionRouter::new(Arc::clone(&manager) as Arc<dyn SessionOps>);
        manager.set_router(Arc::clone(&router));

        let prefixes = Arc::new(PrefixCache::new(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            ".",
        ));
        let health = HealthMonitor::new(
            Arc::clone(&manager) as Arc<dyn SessionOps>,
            Arc::clone(&router) as Arc<dyn ReconnectGuard>,
            Arc::clone(&prefixes),
            HealthConfig::default(),
        );

        let command = Arc::new(CountingCommand {
            calls: AtomicUsize::new(0),
        });
        let hook = Arc::new(RecordingHook {
            seen: Mutex::new(Vec::new()),
            consume,
        });
        let mut registry = CommandRegistry::new();
        registry.register(Arc::clone(&command) as Arc<dyn CommandHandler>);
        registry.register_hook(Arc::clone(&hook) as Arc<dyn MessageHook>);

        let dedup = Arc::new(MessageDedup::default());
        let dispatcher = EventDispatcher::new(
            Arc::clone(&manager),
            router,
            health,
            Arc::clone(&dedup),
            Arc::new(registry),
            Arc::clone(&prefixes),
            IngressConfig::default(),
        );
        manager.set_dispatcher(Arc::clone(&dispatcher));

        Fixture {
            manager,
            dispatcher,
            factory,
            auth,
            store,
            dedup,
            prefixes,
            command,
            hook,
        }
    }

    async fn connect(fx: &Fixture, user_id: &str) -> MockConnectionHandle {
        fx.manager
            .create(CreateRequest {
                user_id: user_id.to_string(),
                phone_number: Some("+15550001111".to_string()),
                source: SessionSource::Telegram,
                is_reconnect: false,
                allow_pairing: true,
                callbacks: SessionCallbacks::default(),
            })
            .await
            .unwrap();
        fx.factory.last_handle().unwrap()
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn group_message(id: &str, participant: &str, body: &str) -> WaMessage {
        WaMessage::text(
            MessageKey::new("group1@g.us", id, false).with_participant(participant),
            body,
        )
    }

    #[tokio::test]
    async fn test_creds_update_persisted() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        handle
            .events_tx
            .send(SocketEvent::CredsUpdate(AuthBlob::new(
                "session_100",
                "creds.json",
                b"{}".to_vec(),
            )))
            .await
            .unwrap();
        settle().await;

        assert!(fx.auth.has_creds("session_100").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_event_marks_connected() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        fx.store
            .update_session(
                "session_100",
                &crate::session::SessionUpdate {
                    reconnect_attempts: Some(3),
                    status: Some(ConnectionStatus::Connecting),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        handle.emit_open().await;
        settle().await;

        let row = fx.store.row("session_100").unwrap();
        assert_eq!(row.status, ConnectionStatus::Connected);
        assert_eq!(row.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_close_event_routes_to_policy() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;
        fx.auth.seed_creds("session_100");

        handle
            .emit_close(DisconnectReason::from_code(403))
            .await;
        settle().await;

        // Banned: full teardown through the router.
        assert!(fx.store.row("session_100").is_none());
        assert_eq!(fx.auth.blob_count("session_100"), 0);
        assert!(!fx.manager.is_session_connected("session_100"));
    }

    #[tokio::test]
    async fn test_command_dispatched_with_prefix() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![WaMessage::text(
                    MessageKey::new("222@s.whatsapp.net", "M1", false),
                    ".ping now",
                )],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(fx.command.calls.load(Ordering::SeqCst), 1);
        // The hook observed it before dispatch.
        assert_eq!(fx.hook.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_command_not_dispatched() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![WaMessage::text(
                    MessageKey::new("222@s.whatsapp.net", "M1", false),
                    "hello there",
                )],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(fx.command.calls.load(Ordering::SeqCst), 0);
        // Still observed and buffered.
        assert_eq!(fx.dispatcher.recent_messages("session_100").len(), 1);
    }

    #[tokio::test]
    async fn test_consuming_hook_blocks_command() {
        let fx = fixture_with_hook(true);
        let handle = connect(&fx, "100").await;

        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![WaMessage::text(
                    MessageKey::new("222@s.whatsapp.net", "M1", false),
                    ".ping",
                )],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(fx.hook.seen.lock().unwrap().len(), 1);
        assert_eq!(fx.command.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cross_session_dedup_single_processor() {
        let fx = fixture();
        let handle_a = connect(&fx, "100").await;
        let handle_b = connect(&fx, "200").await;

        // The same group message arrives on both sessions' streams.
        for handle in [&handle_a, &handle_b] {
            handle
                .events_tx
                .send(SocketEvent::MessagesUpsert {
                    messages: vec![group_message("M1", "333@s.whatsapp.net", ".ping")],
                    kind: UpsertKind::Notify,
                })
                .await
                .unwrap();
        }
        settle().await;

        // Exactly one session fully processed it.
        assert_eq!(fx.command.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.hook.seen.lock().unwrap().len(), 1);
        assert!(fx.dedup.owner("group1@g.us", "M1").is_some());
    }

    #[tokio::test]
    async fn test_lid_resolution_end_to_end() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;
        handle.socket.put_group(GroupMetadata {
            jid: "group1@g.us".to_string(),
            subject: "test".to_string(),
            owner: Some("19876543210@s.whatsapp.net".to_string()),
            participants: vec![GroupParticipant {
                jid: "19876543210@s.whatsapp.net".to_string(),
                lid: Some("445566@lid".to_string()),
                is_admin: true,
                is_super_admin: false,
            }],
        });

        let mut message = group_message("M1", "445566:3@lid", "hello group");
        message.content = Some(serde_json::json!({
            "extendedTextMessage": {
                "text": "hello group",
                "contextInfo": {
                    "participant": "445566:3@lid",
                    "stanzaId": "Q1",
                    "quotedMessage": {"conversation": "earlier"}
                }
            }
        }));

        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![message],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        let seen = fx.hook.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let inbound = &seen[0];
        // Every downstream field reflects the resolved JID.
        assert_eq!(inbound.sender, "19876543210@s.whatsapp.net");
        assert_eq!(
            inbound.raw.key.participant.as_deref(),
            Some("19876543210@s.whatsapp.net")
        );
        assert_eq!(
            inbound.quoted.as_ref().unwrap().participant.as_deref(),
            Some("19876543210@s.whatsapp.net")
        );
        // The admin check used the resolved identity.
        assert!(inbound.is_admin);
        assert!(inbound.is_creator);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ciphertext_stub_schedules_resend() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        let stub = WaMessage {
            key: MessageKey::new("222@s.whatsapp.net", "M1", false),
            content: None,
            message_stub_type: Some(crate::message::STUB_CIPHERTEXT),
            timestamp: None,
            push_name: None,
        };
        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![stub],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        // Nothing yet: the resend is delayed.
        assert!(handle.socket.resend_requests().is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        let requests = handle.socket.resend_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "M1");
        // Stubs never enter the dedup map or the pipeline.
        assert!(fx.dedup.owner("222@s.whatsapp.net", "M1").is_none());
        assert_eq!(fx.hook.seen.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_status_broadcast_not_processed() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![WaMessage::text(
                    MessageKey::new(STATUS_BROADCAST, "S1", false),
                    "a status",
                )],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(fx.hook.seen.lock().unwrap().len(), 0);
        assert!(fx.dedup.owner(STATUS_BROADCAST, "S1").is_none());
    }

    #[tokio::test]
    async fn test_interactive_reply_becomes_command() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        let message = WaMessage {
            key: MessageKey::new("222@s.whatsapp.net", "M1", false),
            content: Some(serde_json::json!({
                "buttonsResponseMessage": {"selectedButtonId": "ping"}
            })),
            message_stub_type: None,
            timestamp: None,
            push_name: None,
        };
        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![message],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(fx.command.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_prefix_user_every_message_is_command() {
        let fx = fixture();
        fx.store.set_prefix("100", "none").await.unwrap();
        fx.prefixes.load().await.unwrap();
        let handle = connect(&fx, "100").await;

        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![WaMessage::text(
                    MessageKey::new("222@s.whatsapp.net", "M1", false),
                    "ping",
                )],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(fx.command.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timestamp_offset_applied() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        let mut message = WaMessage::text(
            MessageKey::new("222@s.whatsapp.net", "M1", false),
            "hello",
        );
        message.timestamp = Some(1_700_000_000);
        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![message],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        let seen = fx.hook.seen.lock().unwrap();
        // Default offset is zero: the wire timestamp passes through.
        assert_eq!(seen[0].timestamp.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_forget_session_drops_caches() {
        let fx = fixture();
        let handle = connect(&fx, "100").await;

        handle
            .events_tx
            .send(SocketEvent::MessagesUpsert {
                messages: vec![WaMessage::text(
                    MessageKey::new("222@s.whatsapp.net", "M1", false),
                    "hello",
                )],
                kind: UpsertKind::Notify,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(fx.dispatcher.recent_messages("session_100").len(), 1);

        // Full cleanup clears the per-session buffers.
        fx.manager.complete_cleanup("session_100").await;
        settle().await;
        assert!(fx.dispatcher.recent_messages("session_100").is_empty());
        assert!(!fx.manager.is_session_connected("session_100"));
    }
}
