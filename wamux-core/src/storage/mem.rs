//! In-memory storage backends for testing.
//!
//! [`MemoryAuthStore`] and [`MemorySessionStore`] implement the storage
//! ports over plain hash maps, with light failure injection for exercising
//! degraded paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::session::{ConnectionStatus, SessionRecord, SessionSource, SessionUpdate};
use crate::storage::{AuthBlob, AuthStore, CREDS_FILE, SessionStore, StorageError};

/// In-memory [`AuthStore`].
#[derive(Default)]
pub struct MemoryAuthStore {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryAuthStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a root credential for a session.
    pub fn seed_creds(&self, session_id: &str) {
        self.blobs.lock().unwrap().insert(
            (session_id.to_string(), CREDS_FILE.to_string()),
            b"{}".to_vec(),
        );
    }

    /// Number of stored blobs for a session.
    pub fn blob_count(&self, session_id: &str) -> usize {
        self.blobs
            .lock()
            .unwrap()
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .count()
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn get(
        &self,
        session_id: &str,
        filename: &str,
    ) -> Result<Option<AuthBlob>, StorageError> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .get(&(session_id.to_string(), filename.to_string()))
            .map(|data| AuthBlob::new(session_id, filename, data.clone())))
    }

    async fn put(&self, blob: &AuthBlob) -> Result<(), StorageError> {
        self.blobs.lock().unwrap().insert(
            (blob.session_id.clone(), blob.filename.clone()),
            blob.data.clone(),
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str, filename: &str) -> Result<(), StorageError> {
        self.blobs
            .lock()
            .unwrap()
            .remove(&(session_id.to_string(), filename.to_string()));
        Ok(())
    }

    async fn delete_by_session(&self, session_id: &str) -> Result<u64, StorageError> {
        let mut blobs = self.blobs.lock().unwrap();
        let before = blobs.len();
        blobs.retain(|(sid, _), _| sid != session_id);
        Ok((before - blobs.len()) as u64)
    }

    async fn delete_by_session_except_creds(&self, session_id: &str) -> Result<u64, StorageError> {
        let mut blobs = self.blobs.lock().unwrap();
        let before = blobs.len();
        blobs.retain(|(sid, filename), _| sid != session_id || filename == CREDS_FILE);
        Ok((before - blobs.len()) as u64)
    }

    async fn list_session_ids(&self) -> Result<Vec<String>, StorageError> {
        let blobs = self.blobs.lock().unwrap();
        let mut ids: Vec<String> = blobs.keys().map(|(sid, _)| sid.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    prefixes: Mutex<HashMap<String, String>>,
    fail_next_updates: AtomicUsize,
    fail_next_saves: AtomicUsize,
}

impl MemorySessionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a session row.
    pub fn seed(&self, record: SessionRecord) {
        self.sessions
            .lock()
            .unwrap()
            .insert(record.session_id.clone(), record);
    }

    /// Make the next `n` `update_session` calls fail, to exercise the
    /// warn-and-continue paths.
    pub fn fail_next_updates(&self, n: usize) {
        self.fail_next_updates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `save_session` calls fail.
    pub fn fail_next_saves(&self, n: usize) {
        self.fail_next_saves.store(n, Ordering::SeqCst);
    }

    /// Snapshot of one row.
    pub fn row(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// True when no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self.sessions.lock().unwrap().get(session_id).cloned())
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let remaining = self.fail_next_saves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_saves.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Database("injected save failure".to_string()));
        }

        let mut record = record.clone();
        record.updated_at = Utc::now();
        self.sessions
            .lock()
            .unwrap()
            .insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn update_session(
        &self,
        session_id: &str,
        update: &SessionUpdate,
    ) -> Result<(), StorageError> {
        let remaining = self.fail_next_updates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_updates.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Database("injected update failure".to_string()));
        }

        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;

        if let Some(phone) = &update.phone_number {
            record.phone_number = Some(phone.clone());
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(is_connected) = update.is_connected {
            record.is_connected = is_connected;
        }
        if let Some(attempts) = update.reconnect_attempts {
            record.reconnect_attempts = attempts;
        }
        if let Some(detected) = update.detected {
            record.detected = detected;
        }
        if let Some(error) = &update.detection_error {
            record.detection_error = error.clone();
        }
        if let Some(at) = update.last_detection_attempt {
            record.last_detection_attempt = Some(at);
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StorageError> {
        Ok(self.sessions.lock().unwrap().remove(session_id).is_some())
    }

    async fn delete_session_keep_user(&self, session_id: &str) -> Result<(), StorageError> {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;
        record.status = ConnectionStatus::Disconnected;
        record.is_connected = false;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn completely_delete_session(&self, session_id: &str) -> Result<(), StorageError> {
        self.sessions.lock().unwrap().remove(session_id);
        if let Some(user_id) = crate::session::user_id_from_session(session_id) {
            self.prefixes.lock().unwrap().remove(user_id);
        }
        Ok(())
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let mut rows: Vec<SessionRecord> = self.sessions.lock().unwrap().values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn get_undetected_web_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let mut rows: Vec<SessionRecord> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.source == SessionSource::Web && !r.detected)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn mark_session_as_detected(&self, session_id: &str) -> Result<(), StorageError> {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;
        record.detected = true;
        record.detection_error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_all_prefixes(&self) -> Result<HashMap<String, String>, StorageError> {
        Ok(self.prefixes.lock().unwrap().clone())
    }

    async fn get_prefix(&self, user_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self.prefixes.lock().unwrap().get(user_id).cloned())
    }

    async fn set_prefix(&self, user_id: &str, prefix: &str) -> Result<(), StorageError> {
        self.prefixes
            .lock()
            .unwrap()
            .insert(user_id.to_string(), prefix.to_string());
        Ok(())
    }
}
