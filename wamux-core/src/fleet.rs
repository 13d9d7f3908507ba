//! Session fleet manager.
//!
//! Authoritative owner of the live session registry. Creates and destroys
//! sockets through the client-library factory, persists session rows, and
//! coordinates the disconnect router, health monitor, detector, and batch
//! workers. Only this module mutates `sockets`; everyone else goes through
//! the [`SessionOps`] port.

pub mod state;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::client::{ClientError, SocketFactory, SocketOptions, WaSocket, WsState};
use crate::config::FleetConfig;
use crate::dispatch::EventDispatcher;
use crate::notify::Notifier;
use crate::reconnect::{ConnectionRouter, ReconnectGuard};
use crate::session::{
    ConnectionStatus, SessionInfo, SessionRecord, SessionSource, SessionUpdate, session_id_for,
    user_id_from_session,
};
use crate::storage::{AuthStore, SessionStore, StorageError};
use self::state::{FleetState, SessionFlag};

/// Cadence of the stale-flag sweep.
const FLAG_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the failed-session retry pass.
const FAILED_RETRY_INTERVAL: Duration = Duration::from_secs(300);
/// Sessions retried per failed-retry tick.
const FAILED_RETRY_PER_TICK: usize = 3;
/// Spacing between retries within one tick.
const FAILED_RETRY_SPACING: Duration = Duration::from_secs(2);
/// Attempt ceiling for the background retry pass.
const FAILED_RETRY_MAX_ATTEMPTS: u32 = 10;

/// Error type for fleet operations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// The fleet is at capacity.
    #[error("max sessions reached ({0})")]
    MaxSessionsReached(usize),

    /// The client-library factory failed to produce a socket.
    #[error("factory failed: {0}")]
    FactoryFailed(#[from] ClientError),

    /// A required storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The session is mid-initialization with no socket to return.
    #[error("session initializing: {0}")]
    Initializing(String),

    /// No such session.
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Lifecycle callbacks attached at session creation. Held only in memory;
/// never persisted.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    /// Fired when the session reaches `Open`.
    pub on_connected: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Fired with each pairing QR payload.
    pub on_qr: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
    /// Fired on terminal errors.
    pub on_error: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_qr", &self.on_qr.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Parameters for session creation.
#[derive(Clone, Debug)]
pub struct CreateRequest {
    /// Owning user id.
    pub user_id: String,
    /// E.164 phone, when known.
    pub phone_number: Option<String>,
    /// Origination path.
    pub source: SessionSource,
    /// Reconnect path: never touches persisted auth.
    pub is_reconnect: bool,
    /// Allow the library to start a fresh pairing.
    pub allow_pairing: bool,
    /// Lifecycle callbacks.
    pub callbacks: SessionCallbacks,
}

/// One live registry entry.
struct SessionHandle {
    socket: Arc<dyn WaSocket>,
    consumer: Option<JoinHandle<()>>,
}

/// Outcome of [`SessionManager::initialize_existing_sessions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitReport {
    /// Sessions successfully brought up.
    pub initialized: usize,
    /// Sessions considered.
    pub total: usize,
    /// Sessions that failed both the batch pass and the retry.
    pub failed: usize,
}

/// Per-step outcome of a full cleanup. Every step is best-effort and
/// reported individually.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Socket closed and registry entry dropped.
    pub socket_closed: bool,
    /// Dispatcher caches for the session dropped.
    pub caches_cleared: bool,
    /// Auth blobs erased.
    pub auth_erased: bool,
    /// Metadata removed (chat-bot) or archived disconnected (web).
    pub metadata_handled: bool,
}

/// Narrow view of the session manager, as consumed by the disconnect
/// router, health monitor, and web detector.
#[async_trait]
pub trait SessionOps: Send + Sync {
    /// Create (or return) a session socket.
    async fn create_session(&self, req: CreateRequest) -> Result<Arc<dyn WaSocket>, FleetError>;

    /// The metadata store.
    fn session_store(&self) -> Arc<dyn SessionStore>;

    /// The auth blob store.
    fn auth_store(&self) -> Arc<dyn AuthStore>;

    /// The notification sink.
    fn notifier(&self) -> Arc<dyn Notifier>;

    /// The live socket for a session, if registered.
    fn socket(&self, session_id: &str) -> Option<Arc<dyn WaSocket>>;

    /// Ids of every registered session.
    fn active_session_ids(&self) -> Vec<String>;

    /// Whether the session was voluntarily disconnected.
    fn is_voluntary(&self, session_id: &str) -> bool;

    /// Flag operations on the shared fleet state.
    fn flags(&self) -> &FleetState;

    /// Whether the complex 515 restart path is enabled.
    fn enable_515_flow(&self) -> bool;

    /// In-memory-only socket teardown; persisted auth untouched.
    async fn cleanup_socket_in_memory(&self, session_id: &str);

    /// Full teardown: socket, caches, auth, metadata.
    async fn complete_cleanup(&self, session_id: &str) -> CleanupReport;

    /// Surface a terminal error to the session's `on_error` callback.
    fn notify_error(&self, session_id: &str, error: &str);
}

/// The session fleet manager.
pub struct SessionManager {
    config: FleetConfig,
    factory: Arc<dyn SocketFactory>,
    auth: Arc<dyn AuthStore>,
    store: Arc<dyn SessionStore>,
    notifier: Arc<dyn Notifier>,
    state: FleetState,
    sockets: DashMap<String, SessionHandle>,
    callbacks: DashMap<String, SessionCallbacks>,
    dispatcher: OnceLock<Arc<EventDispatcher>>,
    router: OnceLock<Arc<ConnectionRouter>>,
}

impl SessionManager {
    /// Build a manager. Wire the dispatcher and router afterwards with
    /// [`set_dispatcher`](Self::set_dispatcher) and
    /// [`set_router`](Self::set_router).
    pub fn new(
        config: FleetConfig,
        factory: Arc<dyn SocketFactory>,
        auth: Arc<dyn AuthStore>,
        store: Arc<dyn SessionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            auth,
            store,
            notifier,
            state: FleetState::new(),
            sockets: DashMap::new(),
            callbacks: DashMap::new(),
            dispatcher: OnceLock::new(),
            router: OnceLock::new(),
        })
    }

    /// Install the event dispatcher. Called once at fleet startup.
    pub fn set_dispatcher(&self, dispatcher: Arc<EventDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    /// Install the disconnect router. Called once at fleet startup.
    pub fn set_router(&self, router: Arc<ConnectionRouter>) {
        let _ = self.router.set(router);
    }

    /// Verify that required storage is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] wrapped in
    /// [`FleetError::Storage`] when the metadata store cannot be queried.
    pub async fn initialize(&self) -> Result<(), FleetError> {
        self.store.get_all_prefixes().await?;
        Ok(())
    }

    /// Rehydrate persisted sessions at startup.
    ///
    /// Candidates are all persisted rows plus any auth-store session with a
    /// valid root credential that has no row. Undetected web rows are left
    /// to the takeover detector, voluntary disconnects are respected, and
    /// the total is capped at `max_sessions`. Startup is paced: batches of
    /// `init_concurrency` with an intra-batch stagger and an inter-batch
    /// delay, then one-at-a-time retry of the failures.
    pub async fn initialize_existing_sessions(self: &Arc<Self>) -> InitReport {
        let mut candidates: Vec<(String, SessionRecord)> = Vec::new();

        let rows = match self.store.get_all_sessions().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "cannot list sessions for rehydration");
                return InitReport::default();
            }
        };
        let known_rows: std::collections::HashSet<String> =
            rows.iter().map(|r| r.session_id.clone()).collect();

        for row in rows {
            if row.source == SessionSource::Web && !row.detected {
                continue; // The takeover detector owns these.
            }
            if self.state.contains(SessionFlag::VoluntarilyDisconnected, &row.session_id) {
                continue;
            }
            match self.auth.has_creds(&row.session_id).await {
                Ok(true) => candidates.push((row.session_id.clone(), row)),
                Ok(false) => {
                    let update = SessionUpdate {
                        status: Some(ConnectionStatus::AuthMissing),
                        is_connected: Some(false),
                        ..SessionUpdate::default()
                    };
                    if let Err(e) = self.store.update_session(&row.session_id, &update).await {
                        tracing::warn!(session = %row.session_id, error = %e, "auth-missing status update failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %row.session_id, error = %e, "creds probe failed");
                }
            }
        }

        // File-mode leftovers: credential directories without a row.
        if let Ok(ids) = self.auth.list_session_ids().await {
            for session_id in ids {
                if known_rows.contains(&session_id) {
                    continue;
                }
                let has_creds = self.auth.has_creds(&session_id).await.unwrap_or(false);
                let Some(user_id) = user_id_from_session(&session_id) else {
                    continue;
                };
                if has_creds {
                    let record =
                        SessionRecord::new(user_id, SessionSource::from_user_id(user_id));
                    candidates.push((session_id, record));
                }
            }
        }

        candidates.truncate(self.config.max_sessions);
        let total = candidates.len();
        tracing::info!(total, "rehydrating sessions");

        let mut initialized = 0usize;
        let mut failures: Vec<(String, SessionRecord)> = Vec::new();

        for batch in candidates.chunks(self.config.init_concurrency.max(1)) {
            let attempts = batch.iter().enumerate().map(|(i, (session_id, record))| {
                let manager = Arc::clone(self);
                let session_id = session_id.clone();
                let record = record.clone();
                let stagger = Duration::from_millis(self.config.init_stagger_ms * i as u64);
                async move {
                    tokio::time::sleep(stagger).await;
                    let result = manager.rehydrate_one(&record).await;
                    (session_id, record, result)
                }
            });

            for (session_id, record, result) in futures::future::join_all(attempts).await {
                match result {
                    Ok(()) => initialized += 1,
                    Err(e) => {
                        tracing::warn!(session = %session_id, error = %e, "rehydration failed");
                        failures.push((session_id, record));
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(self.config.init_batch_delay_ms)).await;
        }

        // One-at-a-time retry of the failures.
        let mut failed = 0usize;
        for (session_id, record) in failures {
            match self.rehydrate_one(&record).await {
                Ok(()) => initialized += 1,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "rehydration retry failed");
                    failed += 1;
                }
            }
        }

        tracing::info!(initialized, total, failed, "rehydration complete");
        InitReport {
            initialized,
            total,
            failed,
        }
    }

    async fn rehydrate_one(&self, record: &SessionRecord) -> Result<(), FleetError> {
        self.create(CreateRequest {
            user_id: record.user_id.clone(),
            phone_number: record.phone_number.clone(),
            source: record.source,
            is_reconnect: true,
            allow_pairing: false,
            callbacks: SessionCallbacks::default(),
        })
        .await
        .map(|_| ())
    }

    /// The canonical session-creation entry point.
    ///
    /// Guards: refuses past `max_sessions`; a session mid-initialization is
    /// never double-created; a live existing socket is returned as-is; a
    /// dead one is torn down in memory first. The reconnect path never
    /// touches persisted auth; the fresh-pairing path wipes stale auth
    /// before connecting.
    ///
    /// # Errors
    ///
    /// [`FleetError::MaxSessionsReached`], [`FleetError::FactoryFailed`],
    /// or [`FleetError::Storage`] when persisting the new row fails (the
    /// socket is torn down in memory on that path).
    pub async fn create(&self, req: CreateRequest) -> Result<Arc<dyn WaSocket>, FleetError> {
        let session_id = session_id_for(&req.user_id);

        if self.state.contains(SessionFlag::Initializing, &session_id) {
            if let Some(handle) = self.sockets.get(&session_id) {
                return Ok(Arc::clone(&handle.socket));
            }
            return Err(FleetError::Initializing(session_id));
        }

        if let Some(handle) = self.sockets.get(&session_id) {
            let socket = Arc::clone(&handle.socket);
            drop(handle);
            match socket.ws_state() {
                WsState::Open | WsState::Connecting => return Ok(socket),
                WsState::Closing | WsState::Closed => {
                    // Dead socket in the registry: in-memory teardown only.
                    self.cleanup_in_memory(&session_id).await;
                }
            }
        }

        if self.sockets.len() >= self.config.max_sessions {
            return Err(FleetError::MaxSessionsReached(self.config.max_sessions));
        }

        if !req.is_reconnect {
            // A fresh user-initiated create overrides an earlier voluntary
            // disconnect.
            self.state
                .clear(SessionFlag::VoluntarilyDisconnected, &session_id);

            if req.allow_pairing {
                // Stale auth with no live socket: wipe before pairing anew.
                let has_creds = self.auth.has_creds(&session_id).await.unwrap_or(false);
                if has_creds {
                    tracing::info!(session = %session_id, "clearing stale auth before fresh pairing");
                    if let Err(e) = self.auth.delete_by_session(&session_id).await {
                        tracing::warn!(session = %session_id, error = %e, "stale auth wipe failed");
                    }
                }
            }
        }

        // The reconnect path is already serialized by the reconnection
        // lock; only direct creates take the initializing flag.
        let holds_init_flag = !req.is_reconnect;
        if holds_init_flag && !self.state.mark(SessionFlag::Initializing, &session_id) {
            return Err(FleetError::Initializing(session_id));
        }

        let result = self.create_inner(&session_id, &req).await;

        if result.is_err() && holds_init_flag {
            self.state.clear(SessionFlag::Initializing, &session_id);
        }
        result
    }

    async fn create_inner(
        &self,
        session_id: &str,
        req: &CreateRequest,
    ) -> Result<Arc<dyn WaSocket>, FleetError> {
        let options = SocketOptions {
            allow_pairing: req.allow_pairing,
            phone_number: req.phone_number.clone(),
        };

        let connection = self
            .factory
            .connect(session_id, Arc::clone(&self.auth), options)
            .await?;

        let socket = Arc::clone(&connection.socket);
        self.callbacks
            .insert(session_id.to_string(), req.callbacks.clone());

        let consumer = self.dispatcher.get().map(|dispatcher| {
            dispatcher.attach(session_id, Arc::clone(&socket), connection.events)
        });

        self.sockets.insert(
            session_id.to_string(),
            SessionHandle {
                socket: Arc::clone(&socket),
                consumer,
            },
        );

        // Preserve takeover state and row age across reconnects.
        let existing = self.store.get_session(session_id).await.ok().flatten();
        let mut record = SessionRecord {
            phone_number: req.phone_number.clone(),
            ..SessionRecord::new(req.user_id.clone(), req.source)
        }
        .with_status(ConnectionStatus::Connected);
        if let Some(existing) = existing {
            record.detected = existing.detected || record.detected;
            record.created_at = existing.created_at;
            if record.phone_number.is_none() {
                record.phone_number = existing.phone_number;
            }
        }

        if let Err(e) = self.store.save_session(&record).await {
            tracing::error!(session = %session_id, error = %e, "session persist failed, rolling back socket");
            self.cleanup_in_memory(session_id).await;
            return Err(FleetError::Storage(e));
        }

        tracing::info!(session = %session_id, source = %req.source.as_str(), reconnect = req.is_reconnect, "session created");
        Ok(socket)
    }

    /// Fired by the dispatcher on `connection.update: open`.
    ///
    /// Clears the initializing flag (first definitive outcome), resets the
    /// persisted attempt counter, and invokes the user's callback.
    pub async fn on_session_open(&self, session_id: &str) {
        self.state.clear(SessionFlag::Initializing, session_id);
        if let Some(router) = self.router.get() {
            router.on_session_open(session_id);
        }

        if let Err(e) = self
            .store
            .update_session(session_id, &SessionUpdate::connected())
            .await
        {
            tracing::warn!(session = %session_id, error = %e, "connected status update failed");
        }

        if let Some(callbacks) = self.callbacks.get(session_id)
            && let Some(on_connected) = callbacks.on_connected.clone()
        {
            on_connected(session_id);
        }
    }

    /// Fired by the dispatcher when a pairing QR arrives.
    pub fn on_session_qr(&self, session_id: &str, qr: &str) {
        if let Some(callbacks) = self.callbacks.get(session_id)
            && let Some(on_qr) = callbacks.on_qr.clone()
        {
            on_qr(session_id, qr);
        }
    }

    /// Fired by the router on terminal failures.
    pub fn on_session_error(&self, session_id: &str, error: &str) {
        // A permanent failure is a definitive outcome for initialization.
        self.state.clear(SessionFlag::Initializing, session_id);
        if let Some(callbacks) = self.callbacks.get(session_id)
            && let Some(on_error) = callbacks.on_error.clone()
        {
            on_error(session_id, error);
        }
    }

    /// Voluntary disconnect.
    ///
    /// Cancels any in-flight reconnection, marks the session so nothing
    /// auto-reconnects it, then either runs the full cleanup
    /// (`force_cleanup`) or drops the socket while keeping auth: web rows
    /// are archived as disconnected, chat-bot rows are deleted.
    pub async fn disconnect(&self, session_id: &str, force_cleanup: bool) -> Result<(), FleetError> {
        if let Some(router) = self.router.get() {
            router.cancel_reconnection(session_id);
        }
        self.state
            .mark(SessionFlag::VoluntarilyDisconnected, session_id);

        if force_cleanup {
            self.complete_cleanup_impl(session_id).await;
            return Ok(());
        }

        let record = self.store.get_session(session_id).await?;
        self.cleanup_in_memory(session_id).await;

        match record {
            Some(record) if record.source == SessionSource::Web => {
                self.store.delete_session_keep_user(session_id).await?;
            }
            Some(_) => {
                self.store.delete_session(session_id).await?;
            }
            None => {}
        }

        tracing::info!(session = %session_id, force = force_cleanup, "session disconnected");
        Ok(())
    }

    /// In-memory-only teardown: abort the event consumer, detach
    /// listeners, close the wire, drop the registry entry. Persisted auth
    /// is never touched here.
    async fn cleanup_in_memory(&self, session_id: &str) {
        if let Some((_, handle)) = self.sockets.remove(session_id) {
            if let Some(consumer) = handle.consumer {
                consumer.abort();
            }
            handle.socket.clear_listeners();
            handle.socket.close_ws();
        }
        self.callbacks.remove(session_id);
    }

    async fn complete_cleanup_impl(&self, session_id: &str) -> CleanupReport {
        let mut report = CleanupReport::default();

        // (a) close the socket in memory.
        let had_socket = self.sockets.contains_key(session_id);
        self.cleanup_in_memory(session_id).await;
        report.socket_closed = had_socket;

        // (b) drop per-session dispatcher caches (message store).
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.forget_session(session_id);
            report.caches_cleared = true;
        }

        // (c) erase auth blobs.
        match self.auth.delete_by_session(session_id).await {
            Ok(removed) => {
                tracing::debug!(session = %session_id, removed, "auth blobs erased");
                report.auth_erased = true;
            }
            Err(e) => tracing::warn!(session = %session_id, error = %e, "auth erase failed"),
        }

        // (d) metadata: web users keep their account identity, chat-bot
        // users are erased. This bifurcation is a hard contract.
        let source = match self.store.get_session(session_id).await {
            Ok(Some(record)) => Some(record.source),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "metadata lookup failed during cleanup");
                None
            }
        };
        match source {
            Some(SessionSource::Web) => {
                match self.store.delete_session_keep_user(session_id).await {
                    Ok(()) => report.metadata_handled = true,
                    Err(e) => {
                        tracing::warn!(session = %session_id, error = %e, "web metadata archive failed")
                    }
                }
            }
            Some(SessionSource::Telegram) => {
                match self.store.completely_delete_session(session_id).await {
                    Ok(()) => report.metadata_handled = true,
                    Err(e) => {
                        tracing::warn!(session = %session_id, error = %e, "metadata delete failed")
                    }
                }
            }
            None => report.metadata_handled = true,
        }

        // No flag set may retain the session after full cleanup.
        self.state.clear_session(session_id);
        if let Some(router) = self.router.get() {
            router.cancel_reconnection(session_id);
        }

        tracing::info!(session = %session_id, ?report, "complete cleanup finished");
        report
    }

    /// The live socket for a session.
    pub fn get_session(&self, session_id: &str) -> Option<Arc<dyn WaSocket>> {
        self.sockets
            .get(session_id)
            .map(|handle| Arc::clone(&handle.socket))
    }

    /// Ids of all registered sessions.
    pub fn get_all_sessions(&self) -> Vec<String> {
        self.sockets.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered sessions.
    pub fn active_count(&self) -> usize {
        self.sockets.len()
    }

    /// Transport-level truth: the wire is open and the socket has an
    /// authenticated identity.
    pub fn is_really_connected(&self, session_id: &str) -> bool {
        self.get_session(session_id)
            .map(|socket| socket.ws_state() == WsState::Open && socket.user_jid().is_some())
            .unwrap_or(false)
    }

    /// Registry-level liveness: a socket is held for the session.
    pub fn is_session_connected(&self, session_id: &str) -> bool {
        self.sockets.contains_key(session_id)
    }

    /// Combined live/persisted view of one session.
    pub async fn get_session_info(&self, session_id: &str) -> Result<SessionInfo, FleetError> {
        let record = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(session_id.to_string()))?;

        let socket = self.get_session(session_id);
        Ok(SessionInfo {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            phone_number: record.phone_number.clone(),
            source: record.source,
            status: record.status,
            in_registry: socket.is_some(),
            ws_open: socket
                .as_ref()
                .map(|s| s.ws_state() == WsState::Open)
                .unwrap_or(false),
            has_identity: socket
                .as_ref()
                .map(|s| s.user_jid().is_some())
                .unwrap_or(false),
            reconnect_attempts: record.reconnect_attempts,
        })
    }

    /// One pass of the stale-flag sweep: drop flag entries whose session
    /// left the registry.
    pub fn sweep_stale_flags_once(&self) -> usize {
        self.state
            .sweep_stale(|session_id| self.sockets.contains_key(session_id))
    }

    /// One pass of the failed-session retry: re-attempt sessions that are
    /// persisted as live-ish but have no socket, bounded per tick.
    pub async fn retry_failed_sessions_once(&self) -> usize {
        let rows = match self.store.get_all_sessions().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "failed-retry pass cannot list sessions");
                return 0;
            }
        };

        let mut retried = 0usize;
        for row in rows {
            if retried >= FAILED_RETRY_PER_TICK {
                break;
            }
            if row.status == ConnectionStatus::Disconnected
                || self
                    .state
                    .contains(SessionFlag::VoluntarilyDisconnected, &row.session_id)
                || self.sockets.contains_key(&row.session_id)
                || row.reconnect_attempts >= FAILED_RETRY_MAX_ATTEMPTS
            {
                continue;
            }

            if retried > 0 {
                tokio::time::sleep(FAILED_RETRY_SPACING).await;
            }
            match self.rehydrate_one(&row).await {
                Ok(()) => tracing::info!(session = %row.session_id, "failed-session retry succeeded"),
                Err(e) => {
                    tracing::warn!(session = %row.session_id, error = %e, "failed-session retry failed")
                }
            }
            retried += 1;
        }
        retried
    }

    /// Spawn the background maintenance loops: stale-flag sweep and
    /// failed-session retry.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLAG_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = manager.sweep_stale_flags_once();
                if removed > 0 {
                    tracing::debug!(removed, "stale flag entries swept");
                }
            }
        }));

        let manager = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FAILED_RETRY_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.retry_failed_sessions_once().await;
            }
        }));

        handles
    }
}

#[async_trait]
impl SessionOps for SessionManager {
    async fn create_session(&self, req: CreateRequest) -> Result<Arc<dyn WaSocket>, FleetError> {
        self.create(req).await
    }

    fn session_store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.store)
    }

    fn auth_store(&self) -> Arc<dyn AuthStore> {
        Arc::clone(&self.auth)
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::clone(&self.notifier)
    }

    fn socket(&self, session_id: &str) -> Option<Arc<dyn WaSocket>> {
        self.get_session(session_id)
    }

    fn active_session_ids(&self) -> Vec<String> {
        self.get_all_sessions()
    }

    fn is_voluntary(&self, session_id: &str) -> bool {
        self.state
            .contains(SessionFlag::VoluntarilyDisconnected, session_id)
    }

    fn flags(&self) -> &FleetState {
        &self.state
    }

    fn enable_515_flow(&self) -> bool {
        self.config.enable_515_flow
    }

    async fn cleanup_socket_in_memory(&self, session_id: &str) {
        self.cleanup_in_memory(session_id).await;
    }

    async fn complete_cleanup(&self, session_id: &str) -> CleanupReport {
        self.complete_cleanup_impl(session_id).await
    }

    fn notify_error(&self, session_id: &str, error: &str) {
        self.on_session_error(session_id, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockFactory;
    use crate::notify::RecordingNotifier;
    use crate::storage::mem::{MemoryAuthStore, MemorySessionStore};

    struct Fixture {
        manager: Arc<SessionManager>,
        factory: Arc<MockFactory>,
        auth: Arc<MemoryAuthStore>,
        store: Arc<MemorySessionStore>,
    }

    fn fixture_with(config: FleetConfig) -> Fixture {
        let factory = Arc::new(MockFactory::new());
        let auth = Arc::new(MemoryAuthStore::new());
        let store = Arc::new(MemorySessionStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let manager = SessionManager::new(
            config,
            Arc::clone(&factory) as Arc<dyn SocketFactory>,
            Arc::clone(&auth) as Arc<dyn AuthStore>,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            notifier,
        );
        Fixture {
            manager,
            factory,
            auth,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FleetConfig::default())
    }

    fn request(user_id: &str) -> CreateRequest {
        CreateRequest {
            user_id: user_id.to_string(),
            phone_number: Some("+15551234".to_string()),
            source: SessionSource::Telegram,
            is_reconnect: false,
            allow_pairing: true,
            callbacks: SessionCallbacks::default(),
        }
    }

    #[tokio::test]
    async fn test_create_registers_and_persists() {
        let fx = fixture();
        let socket = fx.manager.create(request("100")).await.unwrap();

        assert!(fx.manager.is_session_connected("session_100"));
        assert!(socket.user_jid().is_some());

        let row = fx.store.row("session_100").unwrap();
        assert_eq!(row.status, ConnectionStatus::Connected);
        assert!(row.is_connected);
        assert_eq!(row.reconnect_attempts, 0);
        assert!(row.detected);
    }

    #[tokio::test]
    async fn test_create_at_capacity_refused() {
        let fx = fixture_with(FleetConfig {
            max_sessions: 1,
            ..FleetConfig::default()
        });

        fx.manager.create(request("100")).await.unwrap();
        let result = fx.manager.create(request("200")).await;
        assert!(matches!(result, Err(FleetError::MaxSessionsReached(1))));
    }

    #[tokio::test]
    async fn test_create_returns_live_socket_without_reconnecting() {
        let fx = fixture();
        let first = fx.manager.create(request("100")).await.unwrap();
        let second = fx.manager.create(request("100")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.factory.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_create_replaces_dead_socket_in_memory_only() {
        let fx = fixture();
        fx.auth.seed_creds("session_100");
        let first = fx.manager.create(request("100")).await.unwrap();
        first.close_ws();

        // Reconnect path: new socket, persisted auth untouched.
        let second = fx
            .manager
            .create(CreateRequest {
                is_reconnect: true,
                allow_pairing: false,
                ..request("100")
            })
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(fx.factory.connect_count(), 2);
        assert_eq!(fx.auth.blob_count("session_100"), 1);
    }

    #[tokio::test]
    async fn test_fresh_pairing_wipes_stale_auth() {
        let fx = fixture();
        fx.auth.seed_creds("session_100");

        fx.manager.create(request("100")).await.unwrap();

        // Stale creds were cleared before pairing.
        assert_eq!(fx.auth.blob_count("session_100"), 0);
    }

    #[tokio::test]
    async fn test_factory_failure_bubbles_and_clears_flag() {
        let fx = fixture();
        fx.factory.fail_times(1);

        let result = fx.manager.create(request("100")).await;
        assert!(matches!(result, Err(FleetError::FactoryFailed(_))));
        assert!(!fx
            .manager
            .flags()
            .contains(SessionFlag::Initializing, "session_100"));

        // The next attempt succeeds.
        fx.manager.create(request("100")).await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back_socket() {
        let fx = fixture();
        fx.store.fail_next_saves(1);

        let result = fx.manager.create(request("100")).await;

        assert!(matches!(result, Err(FleetError::Storage(_))));
        assert_eq!(fx.manager.active_count(), 0);
        let handles = fx.factory.handles();
        assert!(handles[0].socket.is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_telegram_deletes_row_keeps_auth() {
        let fx = fixture();
        fx.manager.create(request("100")).await.unwrap();
        fx.auth.seed_creds("session_100");

        fx.manager.disconnect("session_100", false).await.unwrap();

        assert!(!fx.manager.is_session_connected("session_100"));
        assert!(fx.manager.is_voluntary("session_100"));
        // Chat-bot row deleted, auth retained (non-forced disconnect).
        assert!(fx.store.row("session_100").is_none());
        assert_eq!(fx.auth.blob_count("session_100"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_web_keeps_row() {
        let fx = fixture();
        fx.manager
            .create(CreateRequest {
                source: SessionSource::Web,
                ..request("1500000000")
            })
            .await
            .unwrap();

        fx.manager
            .disconnect("session_1500000000", false)
            .await
            .unwrap();

        let row = fx.store.row("session_1500000000").unwrap();
        assert_eq!(row.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_complete_cleanup_telegram_erases_everything() {
        let fx = fixture();
        let socket = fx.manager.create(request("100")).await.unwrap();
        fx.auth.seed_creds("session_100");
        fx.manager
            .flags()
            .mark(SessionFlag::RestartPending, "session_100");

        let report = fx.manager.complete_cleanup("session_100").await;

        assert!(report.socket_closed);
        assert!(report.auth_erased);
        assert!(report.metadata_handled);
        assert_eq!(fx.auth.blob_count("session_100"), 0);
        assert!(fx.store.row("session_100").is_none());
        assert!(!fx.manager.is_session_connected("session_100"));
        // Every flag set released the session.
        assert!(!fx
            .manager
            .flags()
            .contains(SessionFlag::RestartPending, "session_100"));
        let handles = fx.factory.handles();
        assert!(handles[0].socket.is_closed());
        let _ = socket;
    }

    #[tokio::test]
    async fn test_complete_cleanup_web_preserves_metadata() {
        let fx = fixture();
        fx.manager
            .create(CreateRequest {
                source: SessionSource::Web,
                ..request("1500000000")
            })
            .await
            .unwrap();
        fx.auth.seed_creds("session_1500000000");

        let report = fx.manager.complete_cleanup("session_1500000000").await;

        assert!(report.auth_erased);
        assert_eq!(fx.auth.blob_count("session_1500000000"), 0);
        // Web metadata survives, archived as disconnected.
        let row = fx.store.row("session_1500000000").unwrap();
        assert_eq!(row.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_on_session_open_resets_attempts_and_fires_callback() {
        let fx = fixture();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        fx.manager
            .create(CreateRequest {
                callbacks: SessionCallbacks {
                    on_connected: Some(Arc::new(move |_| {
                        fired_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                    })),
                    ..SessionCallbacks::default()
                },
                ..request("100")
            })
            .await
            .unwrap();

        fx.store
            .update_session(
                "session_100",
                &SessionUpdate {
                    reconnect_attempts: Some(4),
                    ..SessionUpdate::default()
                },
            )
            .await
            .unwrap();

        fx.manager.on_session_open("session_100").await;

        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        let row = fx.store.row("session_100").unwrap();
        assert_eq!(row.reconnect_attempts, 0);
        assert_eq!(row.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_rehydration_skips_undetected_web_and_authless() {
        let fx = fixture();
        // Telegram row with creds: rehydrated.
        fx.store
            .seed(SessionRecord::new("100", SessionSource::Telegram));
        fx.auth.seed_creds("session_100");
        // Undetected web row: left to the detector.
        fx.store.seed(SessionRecord::new("1500000000", SessionSource::Web));
        fx.auth.seed_creds("session_1500000000");
        // Row without creds: marked auth_missing.
        fx.store
            .seed(SessionRecord::new("200", SessionSource::Telegram));

        let report = fx.manager.initialize_existing_sessions().await;

        assert_eq!(report.total, 1);
        assert_eq!(report.initialized, 1);
        assert_eq!(report.failed, 0);
        assert!(fx.manager.is_session_connected("session_100"));
        assert!(!fx.manager.is_session_connected("session_1500000000"));
        assert_eq!(
            fx.store.row("session_200").unwrap().status,
            ConnectionStatus::AuthMissing
        );
    }

    #[tokio::test]
    async fn test_rehydration_retries_failures_once() {
        let fx = fixture();
        fx.store
            .seed(SessionRecord::new("100", SessionSource::Telegram));
        fx.auth.seed_creds("session_100");
        // First connect fails, the one-at-a-time retry succeeds.
        fx.factory.fail_times(1);

        let report = fx.manager.initialize_existing_sessions().await;

        assert_eq!(report.initialized, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(fx.factory.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_failed_sessions_respects_guards() {
        let fx = fixture();
        // Eligible: connecting status, no socket, few attempts.
        fx.store.seed(
            SessionRecord::new("100", SessionSource::Telegram)
                .with_status(ConnectionStatus::Connecting),
        );
        // Ineligible: voluntarily disconnected.
        fx.store.seed(
            SessionRecord::new("200", SessionSource::Telegram)
                .with_status(ConnectionStatus::Connecting),
        );
        fx.manager
            .flags()
            .mark(SessionFlag::VoluntarilyDisconnected, "session_200");
        // Ineligible: persisted as disconnected.
        fx.store.seed(
            SessionRecord::new("300", SessionSource::Telegram)
                .with_status(ConnectionStatus::Disconnected),
        );
        // Ineligible: attempts exhausted.
        let mut exhausted = SessionRecord::new("400", SessionSource::Telegram)
            .with_status(ConnectionStatus::Connecting);
        exhausted.reconnect_attempts = 10;
        fx.store.seed(exhausted);

        let retried = fx.manager.retry_failed_sessions_once().await;

        assert_eq!(retried, 1);
        assert!(fx.manager.is_session_connected("session_100"));
        assert!(!fx.manager.is_session_connected("session_200"));
        assert!(!fx.manager.is_session_connected("session_300"));
        assert!(!fx.manager.is_session_connected("session_400"));
    }

    #[tokio::test]
    async fn test_stale_flag_sweep() {
        let fx = fixture();
        fx.manager.create(request("100")).await.unwrap();
        fx.manager
            .flags()
            .mark(SessionFlag::RestartPending, "session_100");
        fx.manager
            .flags()
            .mark(SessionFlag::RestartPending, "session_gone");

        let removed = fx.manager.sweep_stale_flags_once();

        assert_eq!(removed, 1);
        assert!(fx
            .manager
            .flags()
            .contains(SessionFlag::RestartPending, "session_100"));
    }

    #[tokio::test]
    async fn test_session_info_combines_views() {
        let fx = fixture();
        fx.manager.create(request("100")).await.unwrap();

        let info = fx.manager.get_session_info("session_100").await.unwrap();
        assert!(info.in_registry);
        assert!(info.ws_open);
        assert!(info.has_identity);
        assert_eq!(info.source, SessionSource::Telegram);

        assert!(matches!(
            fx.manager.get_session_info("session_absent").await,
            Err(FleetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_is_really_connected_tracks_wire() {
        let fx = fixture();
        let socket = fx.manager.create(request("100")).await.unwrap();
        assert!(fx.manager.is_really_connected("session_100"));

        socket.close_ws();
        assert!(!fx.manager.is_really_connected("session_100"));
        // Registry still holds the handle until someone cleans up.
        assert!(fx.manager.is_session_connected("session_100"));
    }
}
