//! SQLite session-metadata store.
//!
//! The relational backend for session rows and user prefix records. Uses
//! connection pooling and WAL mode; migrations run automatically on startup.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::session::{ConnectionStatus, SessionRecord, SessionSource, SessionUpdate};
use crate::storage::{SessionStore, StorageError};

/// SQLite-backed [`SessionStore`].
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Create a store from a database URL (`sqlite:path/to/db`).
    ///
    /// Creates the parent directory, enables WAL mode, and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] if the pool cannot connect.
    /// Returns [`StorageError::Migration`] if migrations fail.
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        let path = PathBuf::from(url);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Database(format!("failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(url)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))
    }

    fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::InvalidData(format!("invalid datetime: {}", e)))
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRecord, StorageError> {
        let source_str: String = row.get("source");
        let source = SessionSource::parse(&source_str)
            .ok_or_else(|| StorageError::InvalidData(format!("unknown source: {}", source_str)))?;

        let status_str: String = row.get("status");
        let status = ConnectionStatus::parse(&status_str)
            .ok_or_else(|| StorageError::InvalidData(format!("unknown status: {}", status_str)))?;

        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        let last_detection_attempt: Option<String> = row.get("last_detection_attempt");
        let last_detection_attempt = match last_detection_attempt {
            Some(s) => Some(Self::parse_datetime(&s)?),
            None => None,
        };

        let is_connected: i64 = row.get("is_connected");
        let reconnect_attempts: i64 = row.get("reconnect_attempts");
        let detected: i64 = row.get("detected");

        Ok(SessionRecord {
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            phone_number: row.get("phone_number"),
            source,
            status,
            is_connected: is_connected != 0,
            reconnect_attempts: reconnect_attempts as u32,
            detected: detected != 0,
            detection_error: row.get("detection_error"),
            last_detection_attempt,
            created_at: Self::parse_datetime(&created_at_str)?,
            updated_at: Self::parse_datetime(&updated_at_str)?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT session_id, user_id, phone_number, source, status, is_connected,
                   reconnect_attempts, detected, detection_error, last_detection_attempt,
                   created_at, updated_at
            FROM sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, phone_number, source, status,
                                  is_connected, reconnect_attempts, detected,
                                  detection_error, last_detection_attempt,
                                  created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                user_id = excluded.user_id,
                phone_number = excluded.phone_number,
                source = excluded.source,
                status = excluded.status,
                is_connected = excluded.is_connected,
                reconnect_attempts = excluded.reconnect_attempts,
                detected = excluded.detected,
                detection_error = excluded.detection_error,
                last_detection_attempt = excluded.last_detection_attempt,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&record.phone_number)
        .bind(record.source.as_str())
        .bind(record.status.as_str())
        .bind(record.is_connected as i64)
        .bind(record.reconnect_attempts as i64)
        .bind(record.detected as i64)
        .bind(&record.detection_error)
        .bind(record.last_detection_attempt.map(|t| t.to_rfc3339()))
        .bind(record.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn update_session(
        &self,
        session_id: &str,
        update: &SessionUpdate,
    ) -> Result<(), StorageError> {
        let mut record = self
            .get_session(session_id)
            .await?
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

        self.save_session(&record).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(r#"DELETE FROM sessions WHERE session_id = ?"#)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_session_keep_user(&self, session_id: &str) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'disconnected', is_connected = 0, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn completely_delete_session(&self, session_id: &str) -> Result<(), StorageError> {
        // Best-effort across both tables; failures are logged, not surfaced.
        let user_id = crate::session::user_id_from_session(session_id).map(str::to_string);

        if let Err(e) = sqlx::query(r#"DELETE FROM sessions WHERE session_id = ?"#)
            .bind(session_id)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(session = %session_id, error = %e, "session row delete failed");
        }

        if let Some(user_id) = user_id
            && let Err(e) = sqlx::query(r#"DELETE FROM user_prefs WHERE user_id = ?"#)
                .bind(&user_id)
                .execute(&self.pool)
                .await
        {
            tracing::warn!(user = %user_id, error = %e, "user prefs delete failed");
        }

        Ok(())
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, user_id, phone_number, source, status, is_connected,
                   reconnect_attempts, detected, detection_error, last_detection_attempt,
                   created_at, updated_at
            FROM sessions
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn get_undetected_web_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, user_id, phone_number, source, status, is_connected,
                   reconnect_attempts, detected, detection_error, last_detection_attempt,
                   created_at, updated_at
            FROM sessions
            WHERE source = 'web' AND detected = 0
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn mark_session_as_detected(&self, session_id: &str) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET detected = 1, detection_error = NULL, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn get_all_prefixes(&self) -> Result<HashMap<String, String>, StorageError> {
        let rows = sqlx::query(r#"SELECT user_id, prefix FROM user_prefs"#)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("user_id"), row.get("prefix")))
            .collect())
    }

    async fn get_prefix(&self, user_id: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(r#"SELECT prefix FROM user_prefs WHERE user_id = ?"#)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(row.map(|r| r.get("prefix")))
    }

    async fn set_prefix(&self, user_id: &str, prefix: &str) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO user_prefs (user_id, prefix, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                prefix = excluded.prefix,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(prefix)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}
