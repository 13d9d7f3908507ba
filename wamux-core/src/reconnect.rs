//! Disconnect routing and reconnection scheduling.
//!
//! The per-session state machine on `connection.update: close`. The router
//! is the sole authority allowed to schedule reconnections: each one runs
//! as a cancellable task guarded by a per-session lock that doubles as the
//! task handle. Locks go stale after two minutes and are force-released,
//! so a wedged attempt can never freeze a session forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::fleet::state::SessionFlag;
use crate::fleet::{CreateRequest, SessionCallbacks, SessionOps};
use crate::notify::notify_with_timeout;
use crate::policy::{self, DisconnectKind, DisconnectReason};
use crate::session::{ConnectionStatus, SessionSource, SessionUpdate};

/// Age after which a reconnection lock is declared stale and force-released.
pub const RECONNECT_LOCK_STALE: Duration = Duration::from_secs(120);

/// Narrow view of the router, as consumed by the health monitor.
#[async_trait]
pub trait ReconnectGuard: Send + Sync {
    /// False while a live reconnection holds the session.
    fn can_reinitialize(&self, session_id: &str) -> bool;

    /// Cancel any in-flight reconnection for the session.
    fn cancel_reconnection(&self, session_id: &str);

    /// Route a (possibly simulated) close through the unified state machine.
    async fn route_close(&self, session_id: &str, reason: DisconnectReason);
}

/// One in-flight reconnection.
struct ReconnectJob {
    job_id: u64,
    started: Instant,
    attempt: u32,
    kind: DisconnectKind,
    cancel: CancellationToken,
}

/// Snapshot of an in-flight reconnection, for observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectStatus {
    /// Attempts made so far.
    pub attempt: u32,
    /// What kind of disconnect started this.
    pub kind: DisconnectKind,
}

/// The disconnect router.
pub struct ConnectionRouter {
    ops: Arc<dyn SessionOps>,
    active: DashMap<String, ReconnectJob>,
    next_job_id: AtomicU64,
    self_ref: Weak<ConnectionRouter>,
}

impl ConnectionRouter {
    /// Build a router over the manager's narrow port.
    pub fn new(ops: Arc<dyn SessionOps>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ops,
            active: DashMap::new(),
            next_job_id: AtomicU64::new(1),
            self_ref: weak.clone(),
        })
    }

    /// Route a close event for a session.
    ///
    /// Idempotent under a held reconnection lock, a no-op for 405, and a
    /// no-op for voluntarily disconnected sessions. Everything else flows
    /// through the policy table.
    pub async fn handle_close(&self, session_id: &str, reason: DisconnectReason) {
        let kind = reason.kind();

        // 405 is skipped entirely: no state change, no reconnect, no cleanup.
        if kind.is_ignored() {
            tracing::debug!(session = %session_id, "ignored disconnect code");
            return;
        }

        // Idempotency: a held, fresh lock swallows the event.
        if let Some(job) = self.active.get(session_id) {
            if job.started.elapsed() < RECONNECT_LOCK_STALE {
                tracing::debug!(session = %session_id, "close dropped, reconnection already in flight");
                return;
            }
            let stale_id = job.job_id;
            drop(job);
            self.force_release(session_id, stale_id);
        }

        let flags = self.ops.flags();
        let policy = reason.policy();
        tracing::info!(
            session = %session_id,
            code = ?reason.status_code,
            kind = ?kind,
            detail = policy.message,
            "session closed"
        );

        if policy.clears_voluntary_flag {
            flags.clear(SessionFlag::VoluntarilyDisconnected, session_id);
        }
        if self.ops.is_voluntary(session_id) {
            tracing::debug!(session = %session_id, "voluntary disconnect, no routing");
            return;
        }

        // The row reflects the disconnect before any routing decision.
        if let Err(e) = self
            .ops
            .session_store()
            .update_session(session_id, &SessionUpdate::disconnected())
            .await
        {
            tracing::warn!(session = %session_id, error = %e, "disconnect status update failed");
        }

        // Post-pairing restart codes (515/516).
        if policy.supports_515_flow {
            flags.mark(SessionFlag::RestartPending, session_id);
            if self.ops.enable_515_flow() {
                flags.mark(SessionFlag::ComplexRestart, session_id);
            }
            self.ops.cleanup_socket_in_memory(session_id).await;
            self.schedule_reconnection(session_id, reason, 0);
            return;
        }

        if policy.is_permanent {
            self.handle_permanent(session_id, &reason).await;
            return;
        }

        if !policy.should_reconnect {
            return;
        }

        // Recoverable path. Some codes require wiping key material first;
        // the root credential always survives.
        if policy.requires_auth_clear {
            match self
                .ops
                .auth_store()
                .delete_by_session_except_creds(session_id)
                .await
            {
                Ok(removed) => {
                    tracing::debug!(session = %session_id, removed, "key material wiped before reconnect")
                }
                Err(e) => tracing::warn!(session = %session_id, error = %e, "auth clear failed"),
            }
        }

        let attempts = match self.ops.session_store().get_session(session_id).await {
            Ok(Some(record)) => record.reconnect_attempts,
            Ok(None) => {
                tracing::warn!(session = %session_id, "no session row on close, running full cleanup");
                self.ops.complete_cleanup(session_id).await;
                return;
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "attempt lookup failed, assuming zero");
                0
            }
        };

        if attempts >= policy.max_attempts {
            tracing::warn!(session = %session_id, attempts, "reconnect attempts exhausted");
            self.ops.cleanup_socket_in_memory(session_id).await;
            return;
        }

        self.ops.cleanup_socket_in_memory(session_id).await;
        self.schedule_reconnection(session_id, reason, attempts);
    }

    /// Permanent-code routing: the source decides how much identity
    /// survives.
    async fn handle_permanent(&self, session_id: &str, reason: &DisconnectReason) {
        let policy = reason.policy();
        let kind = reason.kind();

        let record = match self.ops.session_store().get_session(session_id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "row lookup failed on permanent close");
                None
            }
        };
        let source = record.as_ref().map(|r| r.source);
        let user_id = record.as_ref().map(|r| r.user_id.clone());

        self.ops.notify_error(session_id, policy.message);

        if kind == DisconnectKind::LoggedOut && source == Some(SessionSource::Web) {
            // Web users keep their account identity: auth gone, row stays.
            self.ops.cleanup_socket_in_memory(session_id).await;
            if let Err(e) = self.ops.auth_store().delete_by_session(session_id).await {
                tracing::warn!(session = %session_id, error = %e, "web auth erase failed");
            }
            if let Err(e) = self
                .ops
                .session_store()
                .delete_session_keep_user(session_id)
                .await
            {
                tracing::warn!(session = %session_id, error = %e, "web metadata archive failed");
            }
            self.ops.flags().clear_session(session_id);
            return;
        }

        if policy.requires_cleanup {
            self.ops.complete_cleanup(session_id).await;
        }

        if policy.requires_notification
            && source == Some(SessionSource::Telegram)
            && let Some(user_id) = user_id
        {
            let action = policy.user_action.unwrap_or("Reconnect with /connect");
            let text = format!("Session ended: {}. {}", policy.message, action);
            let notifier = self.ops.notifier();
            if let Err(e) = notify_with_timeout(notifier.as_ref(), &user_id, &text).await {
                tracing::warn!(user = %user_id, error = %e, "disconnect notification failed");
            }
        }
    }

    /// Schedule a reconnection task for the session. A fresh lock already
    /// in place wins; the new request is dropped.
    pub fn schedule_reconnection(
        &self,
        session_id: &str,
        reason: DisconnectReason,
        starting_attempt: u32,
    ) {
        let Some(router) = self.self_ref.upgrade() else {
            return;
        };
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        match self.active.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().started.elapsed() < RECONNECT_LOCK_STALE {
                    tracing::debug!(session = %session_id, "reconnection already scheduled");
                    return;
                }
                occupied.get().cancel.cancel();
                occupied.insert(ReconnectJob {
                    job_id,
                    started: Instant::now(),
                    attempt: starting_attempt,
                    kind: reason.kind(),
                    cancel: cancel.clone(),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ReconnectJob {
                    job_id,
                    started: Instant::now(),
                    attempt: starting_attempt,
                    kind: reason.kind(),
                    cancel: cancel.clone(),
                });
            }
        }

        let session_id = session_id.to_string();
        tokio::spawn(async move {
            router
                .run_reconnection(&session_id, reason, starting_attempt, job_id, cancel)
                .await;
            router
                .active
                .remove_if(&session_id, |_, job| job.job_id == job_id);
        });
    }

    /// The reconnection attempt loop for one session.
    async fn run_reconnection(
        &self,
        session_id: &str,
        reason: DisconnectReason,
        starting_attempt: u32,
        job_id: u64,
        cancel: CancellationToken,
    ) {
        let max_attempts = policy::max_attempts(&reason);
        let mut attempt = starting_attempt;
        // After a failed attempt, later waits follow the unknown-code curve.
        let mut delay_reason = reason.clone();

        loop {
            let delay = policy::reconnect_delay(&delay_reason, attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(session = %session_id, "reconnection cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.ops.is_voluntary(session_id) {
                tracing::debug!(session = %session_id, "voluntary disconnect, reconnection abandoned");
                return;
            }

            let record = match self.ops.session_store().get_session(session_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::warn!(session = %session_id, "session row vanished, running full cleanup");
                    self.ops.complete_cleanup(session_id).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "row load failed, abandoning reconnection");
                    return;
                }
            };

            attempt += 1;
            if let Some(mut job) = self.active.get_mut(session_id)
                && job.job_id == job_id
            {
                job.attempt = attempt;
            }

            let update = SessionUpdate {
                reconnect_attempts: Some(attempt),
                status: Some(ConnectionStatus::Connecting),
                is_connected: Some(false),
                ..SessionUpdate::default()
            };
            if let Err(e) = self
                .ops
                .session_store()
                .update_session(session_id, &update)
                .await
            {
                tracing::warn!(session = %session_id, error = %e, "attempt counter update failed");
            }

            tracing::info!(session = %session_id, attempt, max_attempts, "reconnecting");

            let result = self
                .ops
                .create_session(CreateRequest {
                    user_id: record.user_id.clone(),
                    phone_number: record.phone_number.clone(),
                    source: record.source,
                    is_reconnect: true,
                    allow_pairing: false,
                    callbacks: SessionCallbacks::default(),
                })
                .await;

            match result {
                Ok(_) => {
                    tracing::info!(session = %session_id, attempt, "reconnected");
                    return;
                }
                Err(e) => {
                    tracing::warn!(session = %session_id, attempt, error = %e, "reconnect attempt failed");
                    if attempt >= max_attempts {
                        tracing::warn!(session = %session_id, max_attempts, "reconnection exhausted");
                        if let Err(e) = self
                            .ops
                            .session_store()
                            .update_session(session_id, &SessionUpdate::disconnected())
                            .await
                        {
                            tracing::warn!(session = %session_id, error = %e, "final status update failed");
                        }
                        return;
                    }
                    delay_reason = DisconnectReason::default();
                }
            }

            if cancel.is_cancelled() {
                return;
            }
        }
    }

    /// Called by the manager on `connection.update: open`: the session is
    /// live, release its lock.
    pub fn on_session_open(&self, session_id: &str) {
        if let Some((_, job)) = self.active.remove(session_id) {
            job.cancel.cancel();
        }
    }

    /// Snapshot of the in-flight reconnection for a session, if any.
    pub fn reconnection_status(&self, session_id: &str) -> Option<ReconnectStatus> {
        self.active.get(session_id).map(|job| ReconnectStatus {
            attempt: job.attempt,
            kind: job.kind,
        })
    }

    fn force_release(&self, session_id: &str, job_id: u64) {
        if let Some((_, job)) = self
            .active
            .remove_if(session_id, |_, job| job.job_id == job_id)
        {
            tracing::warn!(session = %session_id, "stale reconnection lock force-released");
            job.cancel.cancel();
        }
    }
}

#[async_trait]
impl ReconnectGuard for ConnectionRouter {
    fn can_reinitialize(&self, session_id: &str) -> bool {
        if let Some(job) = self.active.get(session_id) {
            if job.started.elapsed() < RECONNECT_LOCK_STALE {
                return false;
            }
            let stale_id = job.job_id;
            drop(job);
            self.force_release(session_id, stale_id);
        }
        true
    }

    fn cancel_reconnection(&self, session_id: &str) {
        if let Some((_, job)) = self.active.remove(session_id) {
            tracing::debug!(session = %session_id, "reconnection cancelled");
            job.cancel.cancel();
        }
    }

    async fn route_close(&self, session_id: &str, reason: DisconnectReason) {
        self.handle_close(session_id, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockFactory;
    use crate::client::SocketFactory;
    use crate::config::FleetConfig;
    use crate::fleet::SessionManager;
    use crate::notify::{Notifier, RecordingNotifier};
    use crate::session::{SessionRecord, SessionSource};
    use crate::storage::mem::{MemoryAuthStore, MemorySessionStore};
    use crate::storage::{AuthStore, SessionStore};

    struct Fixture {
        manager: Arc<SessionManager>,
        router: Arc<ConnectionRouter>,
        factory: Arc<MockFactory>,
        auth: Arc<MemoryAuthStore>,
        store: Arc<MemorySessionStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        fixture_with(FleetConfig::default())
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
            Arc::clone(&notifier) as Arc<dyn Notifier>,
        );
        let router = ConnectionRouter::new(Arc::clone(&manager) as Arc<dyn SessionOps>);
        manager.set_router(Arc::clone(&router));
        Fixture {
            manager,
            router,
            factory,
            auth,
            store,
            notifier,
        }
    }

    fn seed_connected(fx: &Fixture, user_id: &str, source: SessionSource) -> String {
        let record = SessionRecord::new(user_id, source)
            .with_phone("+15551234")
            .with_status(ConnectionStatus::Connected);
        let session_id = record.session_id.clone();
        fx.store.seed(record);
        session_id
    }

    /// Let spawned reconnection tasks make progress under paused time.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_405_is_skipped_entirely() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        let before = fx.store.row(&id).unwrap();

        fx.router
            .handle_close(&id, DisconnectReason::from_code(405))
            .await;

        // No state transition of any kind.
        let after = fx.store.row(&id).unwrap();
        assert_eq!(before.status, after.status);
        assert_eq!(before.is_connected, after.is_connected);
        assert!(fx.router.reconnection_status(&id).is_none());
        assert!(fx.notifier.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_515_tags_and_reconnects_fast() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        // First attempt fails so the incremented counter is observable.
        fx.factory.fail_times(1);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(515))
            .await;

        // Tagged and locked before the delay elapses.
        assert!(fx
            .manager
            .flags()
            .contains(SessionFlag::RestartPending, &id));
        let status = fx.router.reconnection_status(&id).unwrap();
        assert_eq!(status.kind, DisconnectKind::RestartRequired);

        // The retry fires within ~3 s and increments the attempt counter.
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(fx.factory.connect_count(), 1);
        let row = fx.store.row(&id).unwrap();
        assert_eq!(row.reconnect_attempts, 1);
        assert_eq!(row.status, ConnectionStatus::Connecting);

        // The follow-up attempt lands and the session is fully functional.
        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(fx.factory.connect_count(), 2);
        assert!(fx.manager.is_session_connected(&id));
        assert_eq!(fx.store.row(&id).unwrap().status, ConnectionStatus::Connected);
        // Tag retained for observation after the reconnect.
        assert!(fx
            .manager
            .flags()
            .contains(SessionFlag::RestartPending, &id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_515_complex_flow_flag() {
        let fx = fixture_with(FleetConfig {
            enable_515_flow: true,
            ..FleetConfig::default()
        });
        let id = seed_connected(&fx, "100", SessionSource::Telegram);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(516))
            .await;

        assert!(fx.manager.flags().contains(SessionFlag::ComplexRestart, &id));
    }

    #[tokio::test]
    async fn test_banned_account_cleanup_and_notification() {
        let fx = fixture();
        let id = seed_connected(&fx, "2010000000", SessionSource::Telegram);
        fx.auth.seed_creds(&id);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(403))
            .await;

        // Full teardown: auth erased, row deleted, no reconnection.
        assert_eq!(fx.auth.blob_count(&id), 0);
        assert!(fx.store.row(&id).is_none());
        assert!(fx.router.reconnection_status(&id).is_none());

        let messages = fx.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "2010000000");
        assert!(messages[0].1.contains("banned"));
    }

    #[tokio::test]
    async fn test_logged_out_web_keeps_metadata() {
        let fx = fixture();
        let id = seed_connected(&fx, "1500000000", SessionSource::Web);
        fx.auth.seed_creds(&id);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(401))
            .await;

        // Auth erased, metadata row survives, nobody is notified.
        assert_eq!(fx.auth.blob_count(&id), 0);
        let row = fx.store.row(&id).unwrap();
        assert_eq!(row.status, ConnectionStatus::Disconnected);
        assert!(fx.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn test_logged_out_telegram_erased_and_notified() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        fx.auth.seed_creds(&id);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(401))
            .await;

        assert!(fx.store.row(&id).is_none());
        assert_eq!(fx.auth.blob_count(&id), 0);
        let messages = fx.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("/connect"));
    }

    #[tokio::test]
    async fn test_timed_out_is_terminal() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(408))
            .await;

        assert!(fx.store.row(&id).is_none());
        assert!(fx.router.reconnection_status(&id).is_none());
        assert_eq!(fx.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_voluntary_close_not_routed() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        fx.manager
            .flags()
            .mark(SessionFlag::VoluntarilyDisconnected, &id);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(428))
            .await;

        assert!(fx.router.reconnection_status(&id).is_none());
        // Row untouched (still connected): routing stopped early.
        assert_eq!(fx.store.row(&id).unwrap().status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_515_clears_voluntary_flag() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        fx.manager
            .flags()
            .mark(SessionFlag::VoluntarilyDisconnected, &id);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(515))
            .await;

        // Post-pairing restart overrides a stale voluntary flag.
        assert!(!fx.manager.is_voluntary(&id));
        assert!(fx.router.reconnection_status(&id).is_some());
    }

    #[tokio::test]
    async fn test_bad_session_wipes_keys_keeps_creds() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        fx.auth.seed_creds(&id);
        fx.auth
            .put(&crate::storage::AuthBlob::new(&id, "pre-key-1.json", b"{}".to_vec()))
            .await
            .unwrap();

        fx.router
            .handle_close(&id, DisconnectReason::with_message(500, "Bad MAC"))
            .await;

        // Key material gone, creds.json survives, reconnection scheduled.
        assert_eq!(fx.auth.blob_count(&id), 1);
        assert!(fx.auth.has_creds(&id).await.unwrap());
        assert!(fx.router.reconnection_status(&id).is_some());
    }

    #[tokio::test]
    async fn test_attempt_exhaustion_stops_routing() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        let mut row = fx.store.row(&id).unwrap();
        row.reconnect_attempts = 5; // 409 allows 5.
        fx.store.seed(row);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(409))
            .await;

        assert!(fx.router.reconnection_status(&id).is_none());
        assert_eq!(
            fx.store.row(&id).unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_close_during_active_reconnection_dropped() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);

        fx.router
            .schedule_reconnection(&id, DisconnectReason::from_code(409), 0);
        let first = fx.router.reconnection_status(&id).unwrap();

        // A second close while the lock is held must not re-route.
        fx.router
            .handle_close(&id, DisconnectReason::from_code(428))
            .await;

        let second = fx.router.reconnection_status(&id).unwrap();
        assert_eq!(first.kind, second.kind);
        assert_eq!(second.kind, DisconnectKind::Conflict);
    }

    #[tokio::test]
    async fn test_cancel_reconnection_releases_lock() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);

        fx.router
            .schedule_reconnection(&id, DisconnectReason::from_code(409), 0);
        assert!(!fx.router.can_reinitialize(&id));

        fx.router.cancel_reconnection(&id);
        assert!(fx.router.can_reinitialize(&id));
        assert!(fx.router.reconnection_status(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_attempt_increments_and_connects() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(409))
            .await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;

        assert_eq!(fx.factory.connect_count(), 1);
        let handle = fx.factory.last_handle().unwrap();
        assert!(!handle.options.allow_pairing);
        assert!(fx.manager.is_session_connected(&id));
        // Success resets the persisted counter and releases the lock.
        assert_eq!(fx.store.row(&id).unwrap().reconnect_attempts, 0);
        assert!(fx.router.reconnection_status(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_retries_then_succeeds() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        fx.factory.fail_times(1);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(409))
            .await;

        // First attempt at 5 s fails and leaves the incremented counter.
        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(fx.factory.connect_count(), 1);
        assert_eq!(fx.store.row(&id).unwrap().reconnect_attempts, 1);

        // The retry waits the unknown-code delay (10 s) and succeeds.
        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        assert_eq!(fx.factory.connect_count(), 2);
        assert!(fx.manager.is_session_connected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_row_triggers_full_cleanup() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);
        fx.auth.seed_creds(&id);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(409))
            .await;
        // Row disappears while the task waits out the delay.
        fx.store.delete_session(&id).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;

        assert_eq!(fx.factory.connect_count(), 0);
        assert_eq!(fx.auth.blob_count(&id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voluntary_flag_aborts_pending_attempt() {
        let fx = fixture();
        let id = seed_connected(&fx, "100", SessionSource::Telegram);

        fx.router
            .handle_close(&id, DisconnectReason::from_code(409))
            .await;
        fx.manager
            .flags()
            .mark(SessionFlag::VoluntarilyDisconnected, &id);

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;

        assert_eq!(fx.factory.connect_count(), 0);
    }
}
