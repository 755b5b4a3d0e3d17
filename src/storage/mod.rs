//! SQLite persistence
//!
//! The database is the only shared mutable store in the system. Every write
//! goes through the typed stores in this module under short transactions
//! and through [`with_retry`], which retries transient lock contention once
//! after a short backoff; statements are plain `sqlx::query` with explicit
//! binds, mapped into [`StoreError`] so callers can distinguish a missing
//! speaker id from a busy database from a full disk.

pub mod db;
pub mod failures;
pub mod meetings;
pub mod notes;
pub mod settings;
pub mod speakers;
pub mod transcripts;

pub use db::{migrate, open_memory, open_pool};
pub use failures::{FailureEvent, FailureKind, FailureStore};
pub use meetings::{Meeting, MeetingStatus, MeetingStore, Recording};
pub use notes::{NoteStore, StoredNote, StoredTask};
pub use settings::SettingsStore;
pub use speakers::{Speaker, SpeakerStore};
pub use transcripts::{NewRow, TranscriptRow, TranscriptStore};

use std::time::Duration;

/// Backoff before the single persistence retry
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Errors from the persistence layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A transcript row arrived without a speaker id; refusing it enforces
    /// speaker provenance at the storage boundary
    #[error("Transcript row has no speaker id")]
    MissingSpeakerId,

    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Transient lock contention; retried once before surfacing
    #[error("Database busy: {0}")]
    Busy(String),

    /// Out of disk; fatal to the session
    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        let text = e.to_string();
        if let sqlx::Error::Database(db) = &e {
            let message = db.message().to_string();
            // SQLite primary result code lives in the low byte of the
            // extended code (e.g. 2067 SQLITE_CONSTRAINT_UNIQUE -> 19)
            let primary = db
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| c & 0xff);
            match primary {
                Some(5) | Some(6) => return StoreError::Busy(message),
                Some(13) => return StoreError::DiskFull(message),
                Some(19) => return StoreError::Constraint(message),
                _ => {
                    if message.contains("database is locked") {
                        return StoreError::Busy(message);
                    }
                    if message.contains("disk is full") || message.contains("database or disk is full") {
                        return StoreError::DiskFull(message);
                    }
                    if message.contains("constraint") {
                        return StoreError::Constraint(message);
                    }
                }
            }
        }
        StoreError::Database(text)
    }
}

impl StoreError {
    /// Transient errors get one retry; everything else surfaces directly.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

/// Run a write once, retrying a single time after a short backoff when the
/// failure was transient lock contention.
pub(crate) async fn with_retry<T, F, Fut>(op: F) -> Result<T, StoreError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            log::warn!("Transient persistence error, retrying once: {}", e);
            tokio::time::sleep(RETRY_BACKOFF).await;
            op().await
        }
        other => other,
    }
}
