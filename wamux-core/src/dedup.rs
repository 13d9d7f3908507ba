//! Cross-session message deduplication.
//!
//! Many sessions can be members of the same group, so one wire message
//! arrives on several event streams within milliseconds. A sharded TTL map
//! keyed by `(chat, id)` gives exactly one session ownership: the first
//! `try_lock` wins, everyone else observes the entry and drops.
//!
//! Sharding keeps lock contention negligible at fleet scale; entries are
//! evicted lazily on access plus an occasional full purge.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Number of independent shards. Power of two, sized so 200 busy sessions
/// rarely collide on a shard lock.
const SHARD_COUNT: usize = 64;

/// Default time-to-live for dedup entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct DedupEntry {
    owner: String,
    inserted: Instant,
}

/// Sharded TTL map guarding `(chat, id)` processing ownership.
pub struct MessageDedup {
    shards: Vec<Mutex<HashMap<(String, String), DedupEntry>>>,
    ttl: Duration,
}

impl MessageDedup {
    /// Create a map with the given entry TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            ttl,
        }
    }

    fn shard(&self, chat: &str, id: &str) -> &Mutex<HashMap<(String, String), DedupEntry>> {
        let mut hasher = DefaultHasher::new();
        chat.hash(&mut hasher);
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    fn is_expired(&self, entry: &DedupEntry) -> bool {
        entry.inserted.elapsed() > self.ttl
    }

    /// True when this session has already accepted this message.
    pub fn is_duplicate(&self, chat: &str, id: &str, session_id: &str) -> bool {
        let mut shard = self.shard(chat, id).lock().unwrap();
        let key = (chat.to_string(), id.to_string());
        match shard.get(&key) {
            Some(entry) if self.is_expired(entry) => {
                shard.remove(&key);
                false
            }
            Some(entry) => entry.owner == session_id,
            None => false,
        }
    }

    /// Atomically claim processing ownership of a message.
    ///
    /// Returns true only on fresh acquisition. Any live entry — whether
    /// owned by this session or another — makes the claim fail.
    pub fn try_lock(&self, chat: &str, id: &str, session_id: &str) -> bool {
        let mut shard = self.shard(chat, id).lock().unwrap();
        let key = (chat.to_string(), id.to_string());

        if let Some(entry) = shard.get(&key) {
            if !self.is_expired(entry) {
                return false;
            }
            shard.remove(&key);
        }

        shard.insert(
            key,
            DedupEntry {
                owner: session_id.to_string(),
                inserted: Instant::now(),
            },
        );
        true
    }

    /// The current owner of a message, if any live entry exists.
    pub fn owner(&self, chat: &str, id: &str) -> Option<String> {
        let shard = self.shard(chat, id).lock().unwrap();
        shard
            .get(&(chat.to_string(), id.to_string()))
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| entry.owner.clone())
    }

    /// Drop every expired entry. Cheap enough to run from a periodic sweep.
    pub fn purge_expired(&self) -> usize {
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let before = shard.len();
            shard.retain(|_, entry| entry.inserted.elapsed() <= self.ttl);
            purged += before - shard.len();
        }
        purged
    }

    /// Total live entries across shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageDedup {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
