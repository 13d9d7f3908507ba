//! Web-session takeover detection.
//!
//! A separate web frontend writes credentials and a session row, then
//! leaves the session unmanaged. This poller finds `{source: web,
//! detected: false}` rows and assumes ownership: adopt the credentials,
//! bring the socket up, and flip `detected` once the session opens.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tokio::task::JoinHandle;

use crate::fleet::state::SessionFlag;
use crate::fleet::{CreateRequest, SessionCallbacks, SessionOps};
use crate::client::WsState;
use crate::session::{SessionRecord, SessionUpdate};

/// Cadence of the takeover poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Outcome of one poll pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectReport {
    /// Sessions adopted by creating a socket.
    pub adopted: usize,
    /// Sessions that already had a live socket and were just marked.
    pub marked: usize,
    /// Takeover attempts that failed; the next poll retries them.
    pub failed: usize,
}

/// The web-session takeover detector.
pub struct WebSessionDetector {
    ops: Arc<dyn SessionOps>,
    processing: DashSet<String>,
}

impl WebSessionDetector {
    /// Build a detector over the manager port.
    pub fn new(ops: Arc<dyn SessionOps>) -> Arc<Self> {
        Arc::new(Self {
            ops,
            processing: DashSet::new(),
        })
    }

    /// One poll pass over the undetected web rows.
    pub async fn poll_once(&self) -> DetectReport {
        let mut report = DetectReport::default();

        let rows = match self.ops.session_store().get_undetected_web_sessions().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "undetected-web query failed");
                return report;
            }
        };

        for row in rows {
            let session_id = row.session_id.clone();
            // At most one in-flight takeover per session.
            if !self.processing.insert(session_id.clone()) {
                continue;
            }
            let outcome = self.take_over(&row).await;
            self.processing.remove(&session_id);

            match outcome {
                Ok(TakeoverOutcome::Marked) => report.marked += 1,
                Ok(TakeoverOutcome::Adopted) => report.adopted += 1,
                Err(_) => report.failed += 1,
            }
        }

        if report != DetectReport::default() {
            tracing::info!(?report, "web takeover pass finished");
        }
        report
    }

    async fn take_over(
        &self,
        row: &SessionRecord,
    ) -> Result<TakeoverOutcome, crate::fleet::FleetError> {
        let session_id = &row.session_id;

        // Already live: just record the ownership.
        if let Some(socket) = self.ops.socket(session_id)
            && socket.ws_state() == WsState::Open
        {
            self.mark_detected(session_id).await;
            return Ok(TakeoverOutcome::Marked);
        }

        tracing::info!(session = %session_id, "adopting web session");
        let result = self
            .ops
            .create_session(CreateRequest {
                user_id: row.user_id.clone(),
                phone_number: row.phone_number.clone(),
                source: row.source,
                is_reconnect: true,
                allow_pairing: false,
                callbacks: self.adoption_callbacks(),
            })
            .await;

        match result {
            Ok(_) => Ok(TakeoverOutcome::Adopted),
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "web takeover failed");
                let update = SessionUpdate {
                    detection_error: Some(Some(e.to_string())),
                    last_detection_attempt: Some(Utc::now()),
                    ..SessionUpdate::default()
                };
                if let Err(persist_err) = self
                    .ops
                    .session_store()
                    .update_session(session_id, &update)
                    .await
                {
                    tracing::warn!(session = %session_id, error = %persist_err, "detection error persist failed");
                }
                Err(e)
            }
        }
    }

    /// Callbacks flipping `detected` the moment the adopted session opens.
    fn adoption_callbacks(&self) -> SessionCallbacks {
        let ops = Arc::clone(&self.ops);
        SessionCallbacks {
            on_connected: Some(Arc::new(move |session_id: &str| {
                let ops = Arc::clone(&ops);
                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    ops.flags().mark(SessionFlag::DetectedWeb, &session_id);
                    if let Err(e) = ops
                        .session_store()
                        .mark_session_as_detected(&session_id)
                        .await
                    {
                        tracing::warn!(session = %session_id, error = %e, "mark-detected failed");
                    } else {
                        tracing::info!(session = %session_id, "web session detected");
                    }
                });
            })),
            ..SessionCallbacks::default()
        }
    }

    async fn mark_detected(&self, session_id: &str) {
        self.ops
            .flags()
            .mark(SessionFlag::DetectedWeb, session_id);
        if let Err(e) = self
            .ops
            .session_store()
            .mark_session_as_detected(session_id)
            .await
        {
            tracing::warn!(session = %session_id, error = %e, "mark-detected failed");
        }
    }

    /// Forced takeover: bypasses the already-detected check, drops any
    /// in-memory socket, and adopts the session from storage.
    ///
    /// # Errors
    ///
    /// Returns the creation error when adoption fails; the failure is also
    /// recorded on the row for the web frontend.
    pub async fn force_takeover(&self, session_id: &str) -> Result<(), crate::fleet::FleetError> {
        let row = self
            .ops
            .session_store()
            .get_session(session_id)
            .await?
            .ok_or_else(|| crate::fleet::FleetError::NotFound(session_id.to_string()))?;

        if !self.processing.insert(session_id.to_string()) {
            tracing::debug!(session = %session_id, "takeover already in flight");
            return Ok(());
        }

        self.ops.cleanup_socket_in_memory(session_id).await;
        let outcome = self.take_over(&row).await;
        if outcome.is_ok() {
            self.mark_detected(session_id).await;
        }
        self.processing.remove(session_id);

        outcome.map(|_| ())
    }

    /// Spawn the poll loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                detector.poll_once().await;
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TakeoverOutcome {
    Marked,
    Adopted,
}
