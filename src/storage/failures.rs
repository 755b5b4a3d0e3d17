//! Append-only failure event log
//!
//! Every classified failure is recorded with its raw worker output for
//! later diagnosis. Events are never deleted; acknowledgement only flips a
//! flag so notifications stop repeating.

use crate::storage::{with_retry, StoreError};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Failure taxonomy, storage-side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ModelsMissing,
    TokenMissing,
    WorkerInitFailed,
    WorkerCrashed,
    WorkerTimedOut,
    MissingSpeakerId,
    InvalidWavHeader,
    InsufficientCoverage,
    ProviderUnreachable,
    ProviderInvalidRequest,
    PersistenceFailed,
    DiskFull,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ModelsMissing => "models_missing",
            FailureKind::TokenMissing => "token_missing",
            FailureKind::WorkerInitFailed => "worker_init_failed",
            FailureKind::WorkerCrashed => "worker_crashed",
            FailureKind::WorkerTimedOut => "worker_timed_out",
            FailureKind::MissingSpeakerId => "missing_speaker_id",
            FailureKind::InvalidWavHeader => "invalid_wav_header",
            FailureKind::InsufficientCoverage => "insufficient_coverage",
            FailureKind::ProviderUnreachable => "provider_unreachable",
            FailureKind::ProviderInvalidRequest => "provider_invalid_request",
            FailureKind::PersistenceFailed => "persistence_failed",
            FailureKind::DiskFull => "disk_full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "models_missing" => FailureKind::ModelsMissing,
            "token_missing" => FailureKind::TokenMissing,
            "worker_init_failed" => FailureKind::WorkerInitFailed,
            "worker_crashed" => FailureKind::WorkerCrashed,
            "worker_timed_out" => FailureKind::WorkerTimedOut,
            "missing_speaker_id" => FailureKind::MissingSpeakerId,
            "invalid_wav_header" => FailureKind::InvalidWavHeader,
            "insufficient_coverage" => FailureKind::InsufficientCoverage,
            "provider_unreachable" => FailureKind::ProviderUnreachable,
            "provider_invalid_request" => FailureKind::ProviderInvalidRequest,
            "persistence_failed" => FailureKind::PersistenceFailed,
            "disk_full" => FailureKind::DiskFull,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub id: String,
    pub kind: FailureKind,
    pub meeting_id: Option<String>,
    pub message: String,
    pub raw_output: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

#[derive(Clone)]
pub struct FailureStore {
    db: SqlitePool,
}

impl FailureStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        kind: FailureKind,
        meeting_id: Option<&str>,
        message: &str,
        raw_output: Option<&str>,
    ) -> Result<FailureEvent, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        with_retry(|| async {
            sqlx::query(
                "INSERT INTO failure_events (id, kind, meeting_id, message, raw_output, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(kind.as_str())
            .bind(meeting_id)
            .bind(message)
            .bind(raw_output)
            .bind(now)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;

        Ok(FailureEvent {
            id,
            kind,
            meeting_id: meeting_id.map(String::from),
            message: message.to_string(),
            raw_output: raw_output.map(String::from),
            timestamp: now,
            acknowledged: false,
        })
    }

    pub async fn list_for_meeting(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<FailureEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, meeting_id, message, raw_output, timestamp, acknowledged
             FROM failure_events WHERE meeting_id = ? ORDER BY timestamp ASC",
        )
        .bind(meeting_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().filter_map(event_from_sql).collect())
    }

    pub async fn list_unacknowledged(&self) -> Result<Vec<FailureEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, kind, meeting_id, message, raw_output, timestamp, acknowledged
             FROM failure_events WHERE acknowledged = FALSE ORDER BY timestamp ASC",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().filter_map(event_from_sql).collect())
    }

    pub async fn acknowledge(&self, event_id: &str) -> Result<(), StoreError> {
        let result = with_retry(|| async {
            sqlx::query("UPDATE failure_events SET acknowledged = TRUE WHERE id = ?")
                .bind(event_id)
                .execute(&self.db)
                .await
                .map_err(StoreError::from)
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("failure event {}", event_id)));
        }
        Ok(())
    }
}

fn event_from_sql(r: sqlx::sqlite::SqliteRow) -> Option<FailureEvent> {
    Some(FailureEvent {
        id: r.get("id"),
        kind: FailureKind::parse(&r.get::<String, _>("kind"))?,
        meeting_id: r.get("meeting_id"),
        message: r.get("message"),
        raw_output: r.get("raw_output"),
        timestamp: r.get("timestamp"),
        acknowledged: r.get("acknowledged"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory;

    #[tokio::test]
    async fn events_append_and_acknowledge() {
        let store = FailureStore::new(open_memory().await);

        let event = store
            .append(
                FailureKind::TokenMissing,
                None,
                "diarizer needs HF_TOKEN",
                Some("[ERROR] token missing"),
            )
            .await
            .unwrap();

        let pending = store.list_unacknowledged().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, FailureKind::TokenMissing);

        store.acknowledge(&event.id).await.unwrap();
        assert!(store.list_unacknowledged().await.unwrap().is_empty());
    }
}
