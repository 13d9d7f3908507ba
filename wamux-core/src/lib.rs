//! Wamux core library.
//!
//! A multi-tenant WhatsApp session fleet controller: the session lifecycle
//! state machine, disconnect-code routing, reconnection scheduling, health
//! monitoring, web-session takeover, batched channel/broadcast operations,
//! and the message ingress pipeline. The wire protocol itself is an
//! external dependency behind the [`client`] port.

pub mod batch;
pub mod client;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod fleet;
pub mod health;
pub mod jid;
pub mod message;
pub mod notify;
pub mod plugin;
pub mod policy;
pub mod reconnect;
pub mod session;
pub mod storage;
pub mod webdetect;

pub use batch::{BroadcastScheduler, ChannelFollowQueue};
pub use client::{SocketEvent, SocketFactory, WaSocket, create_factory};
pub use config::{Config, ConfigError, StorageMode};
pub use dedup::MessageDedup;
pub use dispatch::EventDispatcher;
pub use fleet::{CreateRequest, FleetError, SessionCallbacks, SessionManager, SessionOps};
pub use health::HealthMonitor;
pub use message::InboundMessage;
pub use notify::{Notifier, NotifyError};
pub use plugin::{CommandHandler, CommandRegistry};
pub use policy::{DisconnectKind, DisconnectReason};
pub use reconnect::{ConnectionRouter, ReconnectGuard};
pub use session::{ConnectionStatus, SessionRecord, SessionSource};
pub use storage::{
    AuthStore, FileAuthStore, PrefixCache, SessionStore, SledAuthStore, SqliteSessionStore,
    StorageError,
};
pub use webdetect::WebSessionDetector;
