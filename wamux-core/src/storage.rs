//! Storage abstraction for the session fleet.
//!
//! Two ports: [`SessionStore`] for relational session metadata and user
//! records, and [`AuthStore`] for the opaque credential blobs the client
//! library reads and rotates. Backends: sqlite (metadata), sled or plain
//! files (auth blobs), plus in-memory doubles for tests.

pub mod cache;
pub mod fs;
pub mod mem;
pub mod sled_store;
pub mod sqlite;

pub use cache::PrefixCache;
pub use fs::FileAuthStore;
pub use mem::{MemoryAuthStore, MemorySessionStore};
pub use sled_store::SledAuthStore;
pub use sqlite::SqliteSessionStore;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{SessionRecord, SessionUpdate};

/// The root credential document. Survives every cleanup except the full
/// teardown path.
pub const CREDS_FILE: &str = "creds.json";

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// The requested row was not found.
    #[error("session not found: {0}")]
    NotFound(String),

    /// A filesystem operation failed.
    #[error("io error at '{path}': {source}")]
    Io {
        /// The path involved.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A migration operation failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// Invalid data was encountered.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The backend is not reachable. Fatal only during initialization.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Opaque binary credentials produced by the client library.
///
/// `creds.json` is the root credential; every other filename is rotating
/// signal-key material.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthBlob {
    /// Owning session.
    pub session_id: String,
    /// Document name within the session.
    pub filename: String,
    /// Raw document bytes.
    pub data: Vec<u8>,
}

impl AuthBlob {
    /// Build a blob.
    pub fn new(
        session_id: impl Into<String>,
        filename: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            filename: filename.into(),
            data: data.into(),
        }
    }

    /// True for the root credential document.
    pub fn is_creds(&self) -> bool {
        self.filename == CREDS_FILE
    }
}

/// Port for the credential blob store.
///
/// `put` is hot — key material rotates constantly while a session is live —
/// so implementations must sustain tens of thousands of small documents per
/// session without degrading `get` latency.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Fetch one document.
    async fn get(&self, session_id: &str, filename: &str)
    -> Result<Option<AuthBlob>, StorageError>;

    /// Insert or overwrite one document.
    async fn put(&self, blob: &AuthBlob) -> Result<(), StorageError>;

    /// Delete one document. Missing documents are not an error.
    async fn delete(&self, session_id: &str, filename: &str) -> Result<(), StorageError>;

    /// Delete every document of a session. Returns how many were removed.
    async fn delete_by_session(&self, session_id: &str) -> Result<u64, StorageError>;

    /// Delete every document of a session except `creds.json`. Returns how
    /// many were removed. This is the auth-clear path for recoverable
    /// disconnects.
    async fn delete_by_session_except_creds(&self, session_id: &str) -> Result<u64, StorageError>;

    /// All session ids that have at least one document.
    async fn list_session_ids(&self) -> Result<Vec<String>, StorageError>;

    /// Whether the session has a root credential — the eligibility test
    /// for rehydration at startup.
    async fn has_creds(&self, session_id: &str) -> Result<bool, StorageError> {
        Ok(self.get(session_id, CREDS_FILE).await?.is_some())
    }
}

/// Port for the relational session-metadata store.
///
/// Also owns the per-user command-prefix records; the in-memory
/// [`PrefixCache`] sits in front of those.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session row.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError>;

    /// Insert or replace a session row.
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError>;

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the row does not exist.
    async fn update_session(
        &self,
        session_id: &str,
        update: &SessionUpdate,
    ) -> Result<(), StorageError>;

    /// Delete a session row. Returns whether a row was removed.
    async fn delete_session(&self, session_id: &str) -> Result<bool, StorageError>;

    /// Keep the row (the user's account identity) but mark it disconnected.
    /// The teardown path for web-sourced sessions.
    async fn delete_session_keep_user(&self, session_id: &str) -> Result<(), StorageError>;

    /// Remove the session row and the owning user's prefix record.
    /// Best-effort across both tables.
    async fn completely_delete_session(&self, session_id: &str) -> Result<(), StorageError>;

    /// All session rows.
    async fn get_all_sessions(&self) -> Result<Vec<SessionRecord>, StorageError>;

    /// Web-sourced rows not yet owned by any controller.
    async fn get_undetected_web_sessions(&self) -> Result<Vec<SessionRecord>, StorageError>;

    /// Flip the `detected` flag, clearing any recorded detection error.
    async fn mark_session_as_detected(&self, session_id: &str) -> Result<(), StorageError>;

    /// All persisted user prefixes, keyed by user id. The literal `"none"`
    /// is preserved here; the cache maps it to the empty prefix.
    async fn get_all_prefixes(&self) -> Result<HashMap<String, String>, StorageError>;

    /// One user's persisted prefix.
    async fn get_prefix(&self, user_id: &str) -> Result<Option<String>, StorageError>;

    /// Write one user's prefix.
    async fn set_prefix(&self, user_id: &str, prefix: &str) -> Result<(), StorageError>;
}
