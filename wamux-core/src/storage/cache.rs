//! In-memory user-prefix cache.
//!
//! Loads every persisted command prefix once at boot and refreshes the
//! whole map on an interval, so the hot message path never touches the
//! relational store. Single-row updates write through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::storage::{SessionStore, StorageError};

/// Interval between full cache refreshes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(600);

/// The persisted marker meaning "no prefix" (every message is a command).
const NONE_MARKER: &str = "none";

/// Cache of `userId → effective prefix`.
///
/// The store persists the literal `"none"` for an empty prefix; the cache
/// resolves that to `""` so callers can use the value directly.
pub struct PrefixCache {
    store: Arc<dyn SessionStore>,
    map: RwLock<HashMap<String, String>>,
    default_prefix: String,
}

impl PrefixCache {
    /// Create an empty cache. Call [`load`](PrefixCache::load) before use.
    pub fn new(store: Arc<dyn SessionStore>, default_prefix: impl Into<String>) -> Self {
        Self {
            store,
            map: RwLock::new(HashMap::new()),
            default_prefix: default_prefix.into(),
        }
    }

    fn resolve(raw: &str) -> String {
        if raw == NONE_MARKER {
            String::new()
        } else {
            raw.to_string()
        }
    }

    /// Bulk-load every persisted prefix. Returns how many users were loaded.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`StorageError`]; the existing cache content
    /// is left untouched on failure.
    pub async fn load(&self) -> Result<usize, StorageError> {
        let raw = self.store.get_all_prefixes().await?;
        let resolved: HashMap<String, String> = raw
            .into_iter()
            .map(|(user, prefix)| (user, Self::resolve(&prefix)))
            .collect();
        let count = resolved.len();
        *self.map.write().await = resolved;
        Ok(count)
    }

    /// The effective prefix for a user: cached value, or the configured
    /// default for users with no record.
    pub async fn prefix_for(&self, user_id: &str) -> String {
        self.map
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_prefix.clone())
    }

    /// Write one user's prefix through to the store and the cache.
    /// An empty prefix is persisted as the `"none"` marker.
    pub async fn set_prefix(&self, user_id: &str, prefix: &str) -> Result<(), StorageError> {
        let stored = if prefix.is_empty() { NONE_MARKER } else { prefix };
        self.store.set_prefix(user_id, stored).await?;
        self.map
            .write()
            .await
            .insert(user_id.to_string(), prefix.to_string());
        Ok(())
    }

    /// Number of cached users.
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    /// True when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    /// Spawn the periodic refresh task. Refresh failures are logged and the
    /// stale cache keeps serving.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; boot already loaded.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.load().await {
                    Ok(count) => tracing::debug!(users = count, "prefix cache refreshed"),
                    Err(e) => tracing::warn!(error = %e, "prefix cache refresh failed"),
                }
            }
        })
    }
}
