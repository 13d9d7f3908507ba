//! Batched fleet operations.
//!
//! Two jobs share the pacing primitives: the channel auto-follow queue,
//! fed by every `connection: open`, and the broadcast scheduler, fed by an
//! on-disk announcement file. Both drain in small batches with explicit
//! sleeps so 200 sessions never stampede the servers at once.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::client::{ClientError, OutboundContent, WaSocket, WsState};
use crate::fleet::SessionOps;

/// Follows processed per queue batch.
const FOLLOW_BATCH_SIZE: usize = 10;
/// Pause between follow batches.
const FOLLOW_BATCH_DELAY: Duration = Duration::from_secs(7);
/// Pause between individual follows in a batch.
const FOLLOW_ITEM_DELAY: Duration = Duration::from_secs(3);
/// Pause between the follow → subscribe → unmute sub-steps.
const FOLLOW_STEP_DELAY: Duration = Duration::from_secs(1);

/// Sessions per broadcast batch.
const BROADCAST_BATCH_SIZE: usize = 10;
/// Pause between broadcast batches.
const BROADCAST_BATCH_DELAY: Duration = Duration::from_secs(5);
/// Pause between messages within a batch.
const BROADCAST_MESSAGE_DELAY: Duration = Duration::from_secs(2);
/// Pause between a delivered broadcast and the optional pin.
const BROADCAST_PIN_DELAY: Duration = Duration::from_secs(1);

/// Outcome of one follow-queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowReport {
    /// Sessions that newly followed the channel.
    pub followed: usize,
    /// Sessions that were already subscribed.
    pub already_subscribed: usize,
    /// Follow attempts that failed; they may be re-queued on a later open.
    pub failed: usize,
}

/// Queue driving the channel auto-follow.
pub struct ChannelFollowQueue {
    channel_jid: Option<String>,
    queue: Mutex<VecDeque<(String, Arc<dyn WaSocket>)>>,
    queued: DashSet<String>,
    followed: DashSet<String>,
    notify: Notify,
}

impl ChannelFollowQueue {
    /// Build a queue. `None` disables the feature; enqueues become no-ops.
    pub fn new(channel_jid: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            channel_jid,
            queue: Mutex::new(VecDeque::new()),
            queued: DashSet::new(),
            followed: DashSet::new(),
            notify: Notify::new(),
        })
    }

    /// Enqueue a freshly opened session. Sessions already queued or
    /// already followed produce no entry.
    pub async fn enqueue(&self, session_id: &str, socket: Arc<dyn WaSocket>) {
        if self.channel_jid.is_none() {
            return;
        }
        if self.followed.contains(session_id) {
            return;
        }
        if !self.queued.insert(session_id.to_string()) {
            return;
        }
        self.queue
            .lock()
            .await
            .push_back((session_id.to_string(), socket));
        self.notify.notify_one();
    }

    /// Entries waiting to be drained.
    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drain one batch of the queue.
    pub async fn drain_once(&self) -> FollowReport {
        let mut report = FollowReport::default();
        let batch: Vec<(String, Arc<dyn WaSocket>)> = {
            let mut queue = self.queue.lock().await;
            let take = queue.len().min(FOLLOW_BATCH_SIZE);
            queue.drain(..take).collect()
        };

        for (i, (session_id, socket)) in batch.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(FOLLOW_ITEM_DELAY).await;
            }
            self.queued.remove(&session_id);
            match self.follow_one(&session_id, socket.as_ref()).await {
                Ok(true) => report.followed += 1,
                Ok(false) => report.already_subscribed += 1,
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "channel follow failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Follow the channel from one session: follow, subscribe to updates,
    /// unmute, with a short pause between sub-steps. A `viewer_role` in
    /// the newsletter metadata means the session already subscribes.
    async fn follow_one(
        &self,
        session_id: &str,
        socket: &dyn WaSocket,
    ) -> Result<bool, ClientError> {
        let Some(channel) = self.channel_jid.as_deref() else {
            return Ok(false);
        };

        match socket.newsletter_metadata(channel).await {
            Ok(metadata) if metadata.viewer_role.is_some() => {
                self.followed.insert(session_id.to_string());
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => {
                // Metadata is only the idempotency probe; attempt anyway.
                tracing::debug!(session = %session_id, error = %e, "newsletter metadata probe failed");
            }
        }

        socket.newsletter_follow(channel).await?;
        tokio::time::sleep(FOLLOW_STEP_DELAY).await;
        socket.subscribe_newsletter_updates(channel).await?;
        tokio::time::sleep(FOLLOW_STEP_DELAY).await;
        socket.newsletter_unmute(channel).await?;

        self.followed.insert(session_id.to_string());
        tracing::info!(session = %session_id, channel = %channel, "channel followed");
        Ok(true)
    }

    /// Spawn the single drain worker.
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if queue.pending().await == 0 {
                    queue.notify.notified().await;
                }
                let report = queue.drain_once().await;
                if report != FollowReport::default() {
                    tracing::info!(?report, "channel follow batch finished");
                }
                tokio::time::sleep(FOLLOW_BATCH_DELAY).await;
            }
        })
    }
}

/// Outcome of one broadcast sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions that received the announcement.
    pub sent: usize,
    /// Delivery failures (counted, never aborting the sweep).
    pub failed: usize,
    /// No announcement was pending.
    pub skipped: bool,
}

/// Scheduler delivering `announcement.txt` to every connected session.
pub struct BroadcastScheduler {
    ops: Arc<dyn SessionOps>,
    path: PathBuf,
    interval: Duration,
    pin_after_send: bool,
}

impl BroadcastScheduler {
    /// Build a scheduler over the manager port.
    pub fn new(
        ops: Arc<dyn SessionOps>,
        path: impl Into<PathBuf>,
        interval: Duration,
        pin_after_send: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            ops,
            path: path.into(),
            interval,
            pin_after_send,
        })
    }

    /// One broadcast sweep: read the announcement file, deliver it to
    /// every connected session's own JID in paced batches, then truncate
    /// the file once the sweep completes.
    pub async fn run_once(&self) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.skipped = true;
                return report;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "announcement read failed");
                report.skipped = true;
                return report;
            }
        };
        let message = text.trim();
        if message.is_empty() {
            report.skipped = true;
            return report;
        }

        let session_ids = self.ops.active_session_ids();
        tracing::info!(sessions = session_ids.len(), "broadcasting announcement");

        for (batch_index, batch) in session_ids.chunks(BROADCAST_BATCH_SIZE).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(BROADCAST_BATCH_DELAY).await;
            }
            for (i, session_id) in batch.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(BROADCAST_MESSAGE_DELAY).await;
                }
                match self.deliver(session_id, message).await {
                    Ok(true) => report.sent += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(session = %session_id, error = %e, "broadcast delivery failed");
                        report.failed += 1;
                    }
                }
            }
        }

        if let Err(e) = tokio::fs::write(&self.path, b"").await {
            tracing::warn!(path = %self.path.display(), error = %e, "announcement truncate failed");
        }

        tracing::info!(sent = report.sent, failed = report.failed, "broadcast sweep finished");
        report
    }

    async fn deliver(&self, session_id: &str, message: &str) -> Result<bool, ClientError> {
        let Some(socket) = self.ops.socket(session_id) else {
            return Ok(false);
        };
        if socket.ws_state() != WsState::Open {
            return Ok(false);
        }
        let Some(own_jid) = socket.user_jid() else {
            return Ok(false);
        };

        socket
            .send_message(&own_jid, OutboundContent::Text(message.to_string()), None)
            .await?;

        if self.pin_after_send {
            tokio::time::sleep(BROADCAST_PIN_DELAY).await;
            if let Err(e) = socket.chat_pin(&own_jid, true).await {
                tracing::debug!(session = %session_id, error = %e, "post-broadcast pin failed");
            }
        }
        Ok(true)
    }

    /// Spawn the periodic sweep.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scheduler.run_once().await;
            }
        })
    }
}
