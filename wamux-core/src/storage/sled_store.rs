//! Sled-backed auth blob store.
//!
//! Document mode for credential storage: one sled tree per session, one
//! document per filename. Sled buffers writes in memory and flushes in the
//! background, which absorbs the constant key-rotation churn without
//! penalizing reads.

use async_trait::async_trait;

use crate::storage::{AuthBlob, AuthStore, CREDS_FILE, StorageError};

/// Sled-backed [`AuthStore`].
pub struct SledAuthStore {
    db: sled::Db,
}

impl SledAuthStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] when the database cannot be
    /// opened — typically a lock held by another process.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref())
            .map_err(|e| StorageError::Unavailable(format!("sled open: {e}")))?;
        Ok(Self { db })
    }

    fn tree(&self, session_id: &str) -> Result<sled::Tree, StorageError> {
        self.db
            .open_tree(session_id.as_bytes())
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}

#[async_trait]
impl AuthStore for SledAuthStore {
    async fn get(
        &self,
        session_id: &str,
        filename: &str,
    ) -> Result<Option<AuthBlob>, StorageError> {
        let tree = self.tree(session_id)?;
        let value = tree
            .get(filename.as_bytes())
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(value.map(|data| AuthBlob::new(session_id, filename, data.to_vec())))
    }

    async fn put(&self, blob: &AuthBlob) -> Result<(), StorageError> {
        let tree = self.tree(&blob.session_id)?;
        tree.insert(blob.filename.as_bytes(), blob.data.clone())
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, session_id: &str, filename: &str) -> Result<(), StorageError> {
        let tree = self.tree(session_id)?;
        tree.remove(filename.as_bytes())
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<u64, StorageError> {
        let tree = self.tree(session_id)?;
        let count = tree.len() as u64;
        self.db
            .drop_tree(session_id.as_bytes())
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(count)
    }

    async fn delete_by_session_except_creds(&self, session_id: &str) -> Result<u64, StorageError> {
        let tree = self.tree(session_id)?;
        let mut removed = 0u64;

        let keys: Vec<sled::IVec> = tree
            .iter()
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        for key in keys {
            if key.as_ref() == CREDS_FILE.as_bytes() {
                continue;
            }
            tree.remove(&key)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            removed += 1;
        }

        Ok(removed)
    }

    async fn list_session_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for name in self.db.tree_names() {
            // Sled's internal default tree is not a session.
            if name.as_ref() == b"__sled__default" {
                continue;
            }
            match std::str::from_utf8(&name) {
                Ok(id) => ids.push(id.to_string()),
                Err(_) => {
                    return Err(StorageError::InvalidData(
                        "non-utf8 session tree name".to_string(),
                    ));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
