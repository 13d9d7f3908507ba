//! Connection health monitoring.
//!
//! Detects silent failures the wire never reports: sessions with a live
//! socket but no traffic, sockets that died without a close event, and
//! partial sessions that never got an identity after pairing. Repairs go
//! through the disconnect router so the source-aware cleanup rules apply,
//! and reinitialization always defers to an in-flight reconnection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tokio::task::JoinHandle;

use crate::client::{OutboundContent, WsState};
use crate::config::HealthConfig;
use crate::fleet::{CreateRequest, SessionCallbacks, SessionOps};
use crate::policy::DisconnectReason;
use crate::reconnect::ReconnectGuard;
use crate::session::user_id_from_session;
use crate::storage::PrefixCache;

/// Minimum spacing between reinitialization attempts for one session.
const REINIT_COOLDOWN: Duration = Duration::from_secs(60);
/// Tombstone preventing rapid re-entry right after a reinitialization.
const REINIT_TOMBSTONE: Duration = Duration::from_secs(5);
/// Settle time between closing the wire and recreating the socket.
const REINIT_SETTLE: Duration = Duration::from_secs(2);

/// Warning text sent ahead of the self-ping command.
const PING_WARNING: &str = "No recent activity on this session; running a connection check.";

struct ActivityEntry {
    last_activity: Instant,
    failed_pings: u32,
    monitor_started: Instant,
    stopped: bool,
}

/// Observable activity state for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySnapshot {
    /// Failed self-pings since the last activity.
    pub failed_pings: u32,
    /// Local monitoring gave up; the sweep or a close event takes over.
    pub stopped: bool,
}

/// Outcome of one full-registry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions with an open wire and an identity.
    pub healthy: usize,
    /// Sessions with a wire but no identity, routed as logged-out.
    pub partial: usize,
    /// Sessions whose wire is known dead; left for the library's own
    /// close event.
    pub closed: usize,
}

/// The connection health monitor.
pub struct HealthMonitor {
    ops: Arc<dyn SessionOps>,
    guard: Arc<dyn ReconnectGuard>,
    prefixes: Arc<PrefixCache>,
    config: HealthConfig,
    activity: DashMap<String, ActivityEntry>,
    reinitializing: DashSet<String>,
    last_reinit: DashMap<String, Instant>,
    tombstones: DashMap<String, Instant>,
}

impl HealthMonitor {
    /// Build a monitor over the manager and router ports.
    pub fn new(
        ops: Arc<dyn SessionOps>,
        guard: Arc<dyn ReconnectGuard>,
        prefixes: Arc<PrefixCache>,
        config: HealthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ops,
            guard,
            prefixes,
            config,
            activity: DashMap::new(),
            reinitializing: DashSet::new(),
            last_reinit: DashMap::new(),
            tombstones: DashMap::new(),
        })
    }

    /// Record life: resets the inactivity clock and the failed-ping count.
    /// Called by the dispatcher for every received event.
    pub fn record_activity(&self, session_id: &str) {
        let now = Instant::now();
        self.activity
            .entry(session_id.to_string())
            .and_modify(|entry| {
                entry.last_activity = now;
                entry.failed_pings = 0;
                entry.stopped = false;
            })
            .or_insert_with(|| ActivityEntry {
                last_activity: now,
                failed_pings: 0,
                monitor_started: now,
                stopped: false,
            });
    }

    /// Activity state for a session, if monitored.
    pub fn snapshot(&self, session_id: &str) -> Option<ActivitySnapshot> {
        self.activity.get(session_id).map(|entry| ActivitySnapshot {
            failed_pings: entry.failed_pings,
            stopped: entry.stopped,
        })
    }

    /// One inactivity probe pass over the registry.
    pub async fn probe_once(&self) {
        let threshold = Duration::from_secs(self.config.inactivity_threshold_secs);
        for session_id in self.ops.active_session_ids() {
            let now = Instant::now();
            let quiet = {
                let entry = self
                    .activity
                    .entry(session_id.clone())
                    .or_insert_with(|| ActivityEntry {
                        last_activity: now,
                        failed_pings: 0,
                        monitor_started: now,
                        stopped: false,
                    });
                !entry.stopped && entry.last_activity.elapsed() > threshold
            };
            if quiet {
                self.self_ping(&session_id).await;
            }
        }
    }

    /// Probe a quiet session by messaging its own JID and watching for any
    /// inbound activity within the ping timeout.
    ///
    /// Returns true when the session showed life.
    pub async fn self_ping(&self, session_id: &str) -> bool {
        let Some(socket) = self.ops.socket(session_id) else {
            return false;
        };
        let Some(own_jid) = socket.user_jid() else {
            // Partial session; the sweep routes these.
            return false;
        };

        let user_id = user_id_from_session(session_id).unwrap_or(session_id);
        let prefix = self.prefixes.prefix_for(user_id).await;

        tracing::info!(session = %session_id, "self-ping");
        if let Err(e) = socket
            .send_message(&own_jid, OutboundContent::Text(PING_WARNING.to_string()), None)
            .await
        {
            tracing::debug!(session = %session_id, error = %e, "self-ping warning send failed");
        }
        let ping_sent = Instant::now();
        if let Err(e) = socket
            .send_message(&own_jid, OutboundContent::Text(format!("{prefix}ping")), None)
            .await
        {
            tracing::debug!(session = %session_id, error = %e, "self-ping send failed");
        }

        tokio::time::sleep(Duration::from_secs(self.config.ping_timeout_secs)).await;

        let alive = self
            .activity
            .get(session_id)
            .map(|entry| entry.last_activity >= ping_sent)
            .unwrap_or(false);
        if alive {
            return true;
        }

        let mut give_up = false;
        if let Some(mut entry) = self.activity.get_mut(session_id) {
            entry.failed_pings += 1;
            if entry.failed_pings >= self.config.max_failed_pings {
                entry.stopped = true;
                give_up = true;
            }
            tracing::warn!(
                session = %session_id,
                failed = entry.failed_pings,
                monitored_for = ?entry.monitor_started.elapsed(),
                "self-ping went unanswered"
            );
        }

        if give_up {
            tracing::warn!(session = %session_id, "local monitoring stopped; sweep takes over");
        } else if socket.ws_state() != WsState::Open {
            self.reinitialize(session_id).await;
        }
        false
    }

    /// One full-registry sweep: classify every session and repair the
    /// partial ones through the unified disconnect routing.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let active: Vec<String> = self.ops.active_session_ids();

        for session_id in &active {
            let Some(socket) = self.ops.socket(session_id) else {
                continue;
            };
            match (socket.ws_state(), socket.user_jid()) {
                (WsState::Open | WsState::Connecting, None) => {
                    report.partial += 1;
                    tracing::warn!(session = %session_id, "partial session, routing as logged-out");
                    self.activity.remove(session_id);
                    // Simulated 401 so the source-aware cleanup applies.
                    self.guard
                        .route_close(session_id, DisconnectReason::from_code(401))
                        .await;
                }
                (WsState::Closed | WsState::Closing, _) => {
                    // The library's own close event will surface; nothing
                    // to do here.
                    report.closed += 1;
                }
                _ => report.healthy += 1,
            }
        }

        // Activity entries for sessions that left the registry.
        self.activity
            .retain(|session_id, _| active.iter().any(|id| id == session_id));

        report
    }

    /// Reinitialize a session suspected dead: close the wire (listeners
    /// stay attached), wait for the transport to settle, then recreate
    /// through the manager.
    ///
    /// Gated by a per-session cooldown, a re-entry tombstone, a
    /// one-at-a-time set, and the router's reconnection lock. Returns true
    /// when an attempt was actually made.
    pub async fn reinitialize(&self, session_id: &str) -> bool {
        if let Some(tombstone) = self.tombstones.get(session_id)
            && tombstone.elapsed() < REINIT_TOMBSTONE
        {
            return false;
        }
        if let Some(last) = self.last_reinit.get(session_id)
            && last.elapsed() < REINIT_COOLDOWN
        {
            return false;
        }
        if !self.reinitializing.insert(session_id.to_string()) {
            return false;
        }
        if !self.guard.can_reinitialize(session_id) {
            self.reinitializing.remove(session_id);
            tracing::debug!(session = %session_id, "reinit deferred to active reconnection");
            return false;
        }

        tracing::info!(session = %session_id, "reinitializing session");
        self.last_reinit
            .insert(session_id.to_string(), Instant::now());

        if let Some(socket) = self.ops.socket(session_id) {
            socket.flush_events();
            socket.close_ws();
        }
        tokio::time::sleep(REINIT_SETTLE).await;

        let record = match self.ops.session_store().get_session(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.reinitializing.remove(session_id);
                return false;
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "reinit row load failed");
                self.reinitializing.remove(session_id);
                return false;
            }
        };

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
            Ok(_) => tracing::info!(session = %session_id, "reinitialization succeeded"),
            Err(e) => tracing::warn!(session = %session_id, error = %e, "reinitialization failed"),
        }

        self.tombstones
            .insert(session_id.to_string(), Instant::now());
        self.reinitializing.remove(session_id);
        true
    }

    /// Spawn the probe and sweep loops.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let monitor = Arc::clone(self);
        let probe_interval = Duration::from_secs(self.config.probe_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.probe_once().await;
            }
        }));

        let monitor = Arc::clone(self);
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = monitor.sweep_once().await;
                tracing::debug!(?report, "health sweep finished");
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::client::mock::MockSocket;
    use crate::client::WaSocket;
    use crate::fleet::state::FleetState;
    use crate::fleet::{CleanupReport, FleetError};
    use crate::notify::{Notifier, NullNotifier};
    use crate::storage::mem::{MemoryAuthStore, MemorySessionStore};
    use crate::session::{SessionRecord, SessionSource};
    use crate::storage::{AuthStore, SessionStore};

    /// SessionOps stub with direct control over the registry.
    struct StubOps {
        sockets: DashMap<String, Arc<MockSocket>>,
        store: Arc<MemorySessionStore>,
        auth: Arc<MemoryAuthStore>,
        flags: FleetState,
        creates: Mutex<Vec<CreateRequest>>,
    }

    impl StubOps {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sockets: DashMap::new(),
                store: Arc::new(MemorySessionStore::new()),
                auth: Arc::new(MemoryAuthStore::new()),
                flags: FleetState::new(),
                creates: Mutex::new(Vec::new()),
            })
        }

        fn insert_socket(&self, session_id: &str, socket: MockSocket) -> Arc<MockSocket> {
            let socket = Arc::new(socket);
            self.sockets
                .insert(session_id.to_string(), Arc::clone(&socket));
            socket
        }

        fn creates(&self) -> Vec<CreateRequest> {
            self.creates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionOps for StubOps {
        async fn create_session(
            &self,
            req: CreateRequest,
        ) -> Result<Arc<dyn WaSocket>, FleetError> {
            self.creates.lock().unwrap().push(req.clone());
            let socket = Arc::new(MockSocket::connected("15550001111@s.whatsapp.net"));
            self.sockets.insert(
                crate::session::session_id_for(&req.user_id),
                Arc::clone(&socket),
            );
            Ok(socket)
        }

        fn session_store(&self) -> Arc<dyn SessionStore> {
            Arc::clone(&self.store) as Arc<dyn SessionStore>
        }

        fn auth_store(&self) -> Arc<dyn AuthStore> {
            Arc::clone(&self.auth) as Arc<dyn AuthStore>
        }

        fn notifier(&self) -> Arc<dyn Notifier> {
            Arc::new(NullNotifier)
        }

        fn socket(&self, session_id: &str) -> Option<Arc<dyn WaSocket>> {
            self.sockets
                .get(session_id)
                .map(|s| Arc::clone(s.value()) as Arc<dyn WaSocket>)
        }

        fn active_session_ids(&self) -> Vec<String> {
            self.sockets.iter().map(|e| e.key().clone()).collect()
        }

        fn is_voluntary(&self, session_id: &str) -> bool {
            self.flags.contains(
                crate::fleet::state::SessionFlag::VoluntarilyDisconnected,
                session_id,
            )
        }

        fn flags(&self) -> &FleetState {
            &self.flags
        }

        fn enable_515_flow(&self) -> bool {
            false
        }

        async fn cleanup_socket_in_memory(&self, session_id: &str) {
            self.sockets.remove(session_id);
        }

        async fn complete_cleanup(&self, session_id: &str) -> CleanupReport {
            self.sockets.remove(session_id);
            CleanupReport::default()
        }

        fn notify_error(&self, _session_id: &str, _error: &str) {}
    }

    /// ReconnectGuard stub recording routed closes.
    struct StubGuard {
        allow: std::sync::atomic::AtomicBool,
        routed: Mutex<Vec<(String, Option<u16>)>>,
    }

    impl StubGuard {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                allow: std::sync::atomic::AtomicBool::new(true),
                routed: Mutex::new(Vec::new()),
            })
        }

        fn deny(&self) {
            self.allow.store(false, std::sync::atomic::Ordering::SeqCst);
        }

        fn routed(&self) -> Vec<(String, Option<u16>)> {
            self.routed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReconnectGuard for StubGuard {
        fn can_reinitialize(&self, _session_id: &str) -> bool {
            self.allow.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn cancel_reconnection(&self, _session_id: &str) {}

        async fn route_close(&self, session_id: &str, reason: DisconnectReason) {
            self.routed
                .lock()
                .unwrap()
                .push((session_id.to_string(), reason.status_code));
        }
    }

    struct Fixture {
        ops: Arc<StubOps>,
        guard: Arc<StubGuard>,
        monitor: Arc<HealthMonitor>,
    }

    fn fixture() -> Fixture {
        let ops = StubOps::new();
        let guard = StubGuard::new();
        let prefixes = Arc::new(PrefixCache::new(
            Arc::clone(&ops.store) as Arc<dyn SessionStore>,
            ".",
        ));
        let monitor = HealthMonitor::new(
            Arc::clone(&ops) as Arc<dyn SessionOps>,
            Arc::clone(&guard) as Arc<dyn ReconnectGuard>,
            prefixes,
            HealthConfig::default(),
        );
        Fixture { ops, guard, monitor }
    }

    #[tokio::test]
    async fn test_record_activity_resets_failures() {
        let fx = fixture();
        fx.monitor.record_activity("session_1");

        // Simulate accumulated failures then fresh activity.
        if let Some(mut entry) = fx.monitor.activity.get_mut("session_1") {
            entry.failed_pings = 2;
            entry.stopped = true;
        }
        fx.monitor.record_activity("session_1");

        let snapshot = fx.monitor.snapshot("session_1").unwrap();
        assert_eq!(snapshot.failed_pings, 0);
        assert!(!snapshot.stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_self_ping_increments_failures() {
        let fx = fixture();
        let socket = fx
            .ops
            .insert_socket("session_1", MockSocket::connected("1555@s.whatsapp.net"));
        fx.monitor.record_activity("session_1");

        let healthy = fx.monitor.self_ping("session_1").await;

        assert!(!healthy);
        let snapshot = fx.monitor.snapshot("session_1").unwrap();
        assert_eq!(snapshot.failed_pings, 1);

        // Warning text then the prefixed ping command, both to our own JID.
        let sent = socket.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].jid, "1555@s.whatsapp.net");
        assert_eq!(sent[1].content.as_text(), Some(".ping"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_self_ping_is_healthy() {
        let fx = fixture();
        fx.ops
            .insert_socket("session_1", MockSocket::connected("1555@s.whatsapp.net"));
        fx.monitor.record_activity("session_1");

        // The ping reply arrives while the probe waits.
        let monitor = Arc::clone(&fx.monitor);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            monitor.record_activity("session_1");
        });

        let healthy = fx.monitor.self_ping("session_1").await;

        assert!(healthy);
        assert_eq!(fx.monitor.snapshot("session_1").unwrap().failed_pings, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_stops_after_max_failed_pings() {
        let fx = fixture();
        fx.ops
            .insert_socket("session_1", MockSocket::connected("1555@s.whatsapp.net"));
        fx.monitor.record_activity("session_1");

        for _ in 0..3 {
            fx.monitor.self_ping("session_1").await;
        }

        let snapshot = fx.monitor.snapshot("session_1").unwrap();
        assert_eq!(snapshot.failed_pings, 3);
        assert!(snapshot.stopped);

        // A stopped session is skipped by the probe.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        fx.monitor.probe_once().await;
        assert_eq!(fx.monitor.snapshot("session_1").unwrap().failed_pings, 3);
    }

    #[tokio::test]
    async fn test_sweep_routes_partial_as_logged_out() {
        let fx = fixture();
        fx.ops
            .insert_socket("session_partial", MockSocket::without_identity());
        fx.ops
            .insert_socket("session_ok", MockSocket::connected("1555@s.whatsapp.net"));
        let closed = fx
            .ops
            .insert_socket("session_dead", MockSocket::connected("1666@s.whatsapp.net"));
        closed.close_ws();

        let report = fx.monitor.sweep_once().await;

        assert_eq!(report.partial, 1);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.closed, 1);

        let routed = fx.guard.routed();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, "session_partial");
        assert_eq!(routed[0].1, Some(401));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinitialize_defers_to_active_reconnection() {
        let fx = fixture();
        fx.ops.store.seed(SessionRecord::new("1", SessionSource::Telegram));
        fx.ops
            .insert_socket("session_1", MockSocket::connected("1555@s.whatsapp.net"));
        fx.guard.deny();

        let attempted = fx.monitor.reinitialize("session_1").await;

        assert!(!attempted);
        assert!(fx.ops.creates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinitialize_closes_wire_and_recreates() {
        let fx = fixture();
        fx.ops.store.seed(SessionRecord::new("1", SessionSource::Telegram));
        let socket = fx
            .ops
            .insert_socket("session_1", MockSocket::connected("1555@s.whatsapp.net"));

        let attempted = fx.monitor.reinitialize("session_1").await;

        assert!(attempted);
        assert_eq!(socket.flush_count(), 1);
        assert!(socket.is_closed());
        // Listeners stay attached during reinit.
        assert!(!socket.listeners_cleared());

        let creates = fx.ops.creates();
        assert_eq!(creates.len(), 1);
        assert!(creates[0].is_reconnect);
        assert!(!creates[0].allow_pairing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinitialize_cooldown_blocks_second_attempt() {
        let fx = fixture();
        fx.ops.store.seed(SessionRecord::new("1", SessionSource::Telegram));
        fx.ops
            .insert_socket("session_1", MockSocket::connected("1555@s.whatsapp.net"));

        assert!(fx.monitor.reinitialize("session_1").await);
        // Tombstone plus cooldown both block immediate re-entry.
        assert!(!fx.monitor.reinitialize("session_1").await);

        // Past the cooldown it runs again.
        tokio::time::sleep(REINIT_COOLDOWN + Duration::from_secs(1)).await;
        assert!(fx.monitor.reinitialize("session_1").await);
        assert_eq!(fx.ops.creates().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_drops_activity_for_departed_sessions() {
        let fx = fixture();
        fx.monitor.record_activity("session_gone");
        fx.ops
            .insert_socket("session_live", MockSocket::connected("1555@s.whatsapp.net"));
        fx.monitor.record_activity("session_live");

        fx.monitor.sweep_once().await;

        assert!(fx.monitor.snapshot("session_gone").is_none());
        assert!(fx.monitor.snapshot("session_live").is_some());
    }
}
