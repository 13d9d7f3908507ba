//! File-mode auth blob store.
//!
//! Lays credentials out as `<base>/session_{id}/<filename>`, matching what
//! the web frontend writes directly to disk. A session directory with a
//! valid `creds.json` is eligible for rehydration at startup.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::storage::{AuthBlob, AuthStore, CREDS_FILE, StorageError};

/// Filesystem-backed [`AuthStore`].
pub struct FileAuthStore {
    base: PathBuf,
}

impl FileAuthStore {
    /// Create a store rooted at `base` (conventionally `./sessions`),
    /// creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the base directory cannot be
    /// created.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base = base.into();
        std::fs::create_dir_all(&base).map_err(|source| StorageError::Io {
            path: base.display().to_string(),
            source,
        })?;
        Ok(Self { base })
    }

    /// The directory holding one session's blobs.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base.join(session_id)
    }

    fn blob_path(&self, session_id: &str, filename: &str) -> Result<PathBuf, StorageError> {
        // Filenames come from the client library; refuse anything that
        // could escape the session directory.
        if filename.contains('/') || filename.contains('\\') || filename == ".." {
            return Err(StorageError::InvalidData(format!(
                "unsafe blob filename: {filename}"
            )));
        }
        Ok(self.session_dir(session_id).join(filename))
    }

    fn io_err(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn get(
        &self,
        session_id: &str,
        filename: &str,
    ) -> Result<Option<AuthBlob>, StorageError> {
        let path = self.blob_path(session_id, filename)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(AuthBlob::new(session_id, filename, data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(&path, e)),
        }
    }

    async fn put(&self, blob: &AuthBlob) -> Result<(), StorageError> {
        let path = self.blob_path(&blob.session_id, &blob.filename)?;
        let dir = self.session_dir(&blob.session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::io_err(&dir, e))?;
        tokio::fs::write(&path, &blob.data)
            .await
            .map_err(|e| Self::io_err(&path, e))
    }

    async fn delete(&self, session_id: &str, filename: &str) -> Result<(), StorageError> {
        let path = self.blob_path(session_id, filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&path, e)),
        }
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<u64, StorageError> {
        let dir = self.session_dir(session_id);
        let mut removed = 0u64;

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Self::io_err(&dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_err(&dir, e))?
        {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                removed += 1;
            }
        }

        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| Self::io_err(&dir, e))?;
        Ok(removed)
    }

    async fn delete_by_session_except_creds(&self, session_id: &str) -> Result<u64, StorageError> {
        let dir = self.session_dir(session_id);
        let mut removed = 0u64;

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Self::io_err(&dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_err(&dir, e))?
        {
            let name = entry.file_name();
            if name.to_str() == Some(CREDS_FILE) {
                continue;
            }
            let path = entry.path();
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn list_session_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base)
            .await
            .map_err(|e| Self::io_err(&self.base, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_err(&self.base, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env::temp_dir;
    use uuid::Uuid;

    fn create_test_store() -> FileAuthStore {
        let base = temp_dir().join(format!("wamux_fs_{}", Uuid::new_v4()));
        FileAuthStore::new(base).expect("failed to create file store")
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = create_test_store();
        let blob = AuthBlob::new("session_1", CREDS_FILE, br#"{"me":{}}"#.to_vec());

        store.put(&blob).await.expect("put failed");

        let loaded = store
            .get("session_1", CREDS_FILE)
            .await
            .unwrap()
            .expect("missing blob");
        assert_eq!(loaded.data, blob.data);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = create_test_store();
        assert!(store.get("session_1", CREDS_FILE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsafe_filename_rejected() {
        let store = create_test_store();
        let blob = AuthBlob::new("session_1", "../escape.json", b"{}".to_vec());
        assert!(matches!(
            store.put(&blob).await,
            Err(StorageError::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = create_test_store();
        store.delete("session_1", "absent.json").await.unwrap();
    }

    #[tokio::test]
    async fn test_except_creds_keeps_creds() {
        let store = create_test_store();
        store
            .put(&AuthBlob::new("session_1", CREDS_FILE, b"{}".to_vec()))
            .await
            .unwrap();
        store
            .put(&AuthBlob::new("session_1", "pre-key-1.json", b"{}".to_vec()))
            .await
            .unwrap();
        store
            .put(&AuthBlob::new("session_1", "session-abc.json", b"{}".to_vec()))
            .await
            .unwrap();

        let removed = store
            .delete_by_session_except_creds("session_1")
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.has_creds("session_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_by_session_removes_dir() {
        let store = create_test_store();
        store
            .put(&AuthBlob::new("session_1", CREDS_FILE, b"{}".to_vec()))
            .await
            .unwrap();

        let removed = store.delete_by_session("session_1").await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.session_dir("session_1").exists());
        // A second delete is a no-op.
        assert_eq!(store.delete_by_session("session_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_session_ids_scans_directories() {
        let store = create_test_store();
        store
            .put(&AuthBlob::new("session_2", CREDS_FILE, b"{}".to_vec()))
            .await
            .unwrap();
        store
            .put(&AuthBlob::new("session_1", CREDS_FILE, b"{}".to_vec()))
            .await
            .unwrap();

        let ids = store.list_session_ids().await.unwrap();
        assert_eq!(ids, vec!["session_1", "session_2"]);
    }
}
