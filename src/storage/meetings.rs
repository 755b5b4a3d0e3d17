//! Meetings and their recordings

use crate::storage::{with_retry, StoreError};
use chrono::{DateTime, Utc};
use log::info;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Meeting lifecycle. Advances monotonically; the one exception is
/// `Stopped -> Failed` when post-stop persistence fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeetingStatus {
    Scheduled,
    Recording,
    Stopped,
    Failed,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Scheduled => "scheduled",
            MeetingStatus::Recording => "recording",
            MeetingStatus::Stopped => "stopped",
            MeetingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "scheduled" => Ok(MeetingStatus::Scheduled),
            "recording" => Ok(MeetingStatus::Recording),
            "stopped" => Ok(MeetingStatus::Stopped),
            "failed" => Ok(MeetingStatus::Failed),
            other => Err(StoreError::Database(format!(
                "unknown meeting status: {}",
                other
            ))),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            MeetingStatus::Scheduled => 0,
            MeetingStatus::Recording => 1,
            MeetingStatus::Stopped => 2,
            MeetingStatus::Failed => 3,
        }
    }

    pub fn can_advance_to(&self, to: MeetingStatus) -> bool {
        to.rank() > self.rank()
    }
}

#[derive(Debug, Clone)]
pub struct Meeting {
    pub id: String,
    pub title: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: MeetingStatus,
    pub audio_file_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Recording {
    pub id: String,
    pub meeting_id: String,
    pub file_path: String,
    pub duration_ms: u64,
    pub file_size_bytes: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct MeetingStore {
    db: SqlitePool,
}

impl MeetingStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn create(&self, title: String) -> Result<Meeting, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        with_retry(|| async {
            sqlx::query(
                "INSERT INTO meetings (id, title, start_time, status) VALUES (?, ?, ?, 'scheduled')",
            )
            .bind(&id)
            .bind(&title)
            .bind(now)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;

        info!("Created meeting {} ({})", title, id);
        Ok(Meeting {
            id,
            title,
            start_time: Some(now),
            end_time: None,
            status: MeetingStatus::Scheduled,
            audio_file_path: None,
        })
    }

    pub async fn get(&self, meeting_id: &str) -> Result<Option<Meeting>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, start_time, end_time, status, audio_file_path
             FROM meetings WHERE id = ?",
        )
        .bind(meeting_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(|r| {
            Ok(Meeting {
                id: r.get("id"),
                title: r.get("title"),
                start_time: r.get("start_time"),
                end_time: r.get("end_time"),
                status: MeetingStatus::parse(&r.get::<String, _>("status"))?,
                audio_file_path: r.get("audio_file_path"),
            })
        })
        .transpose()
    }

    /// Advance the meeting status; regressions are rejected.
    pub async fn set_status(
        &self,
        meeting_id: &str,
        to: MeetingStatus,
    ) -> Result<(), StoreError> {
        let current = self
            .get(meeting_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("meeting {}", meeting_id)))?
            .status;

        if !current.can_advance_to(to) {
            return Err(StoreError::InvalidTransition(format!(
                "meeting {}: {} -> {}",
                meeting_id,
                current.as_str(),
                to.as_str()
            )));
        }

        let end_time = matches!(to, MeetingStatus::Stopped | MeetingStatus::Failed)
            .then(Utc::now);

        with_retry(|| async {
            sqlx::query(
                "UPDATE meetings SET status = ?, end_time = COALESCE(?, end_time) WHERE id = ?",
            )
            .bind(to.as_str())
            .bind(end_time)
            .bind(meeting_id)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;
        Ok(())
    }

    pub async fn set_audio_file_path(
        &self,
        meeting_id: &str,
        path: &str,
    ) -> Result<(), StoreError> {
        with_retry(|| async {
            sqlx::query("UPDATE meetings SET audio_file_path = ? WHERE id = ?")
                .bind(path)
                .bind(meeting_id)
                .execute(&self.db)
                .await
                .map_err(StoreError::from)
        })
        .await?;
        Ok(())
    }

    /// Register the finalized audio capture for a meeting.
    pub async fn add_recording(
        &self,
        meeting_id: &str,
        file_path: &str,
        duration_ms: u64,
        file_size_bytes: u64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Recording, StoreError> {
        let id = Uuid::new_v4().to_string();
        with_retry(|| async {
            sqlx::query(
                "INSERT INTO recordings
                 (id, meeting_id, file_path, duration_ms, file_size_bytes, start_time, end_time)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(meeting_id)
            .bind(file_path)
            .bind(duration_ms as i64)
            .bind(file_size_bytes as i64)
            .bind(start_time)
            .bind(end_time)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;

        Ok(Recording {
            id,
            meeting_id: meeting_id.to_string(),
            file_path: file_path.to_string(),
            duration_ms,
            file_size_bytes,
            start_time: Some(start_time),
            end_time: Some(end_time),
        })
    }

    pub async fn recordings_for(&self, meeting_id: &str) -> Result<Vec<Recording>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, meeting_id, file_path, duration_ms, file_size_bytes, start_time, end_time
             FROM recordings WHERE meeting_id = ? ORDER BY start_time ASC",
        )
        .bind(meeting_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Recording {
                id: r.get("id"),
                meeting_id: r.get("meeting_id"),
                file_path: r.get("file_path"),
                duration_ms: r.get::<i64, _>("duration_ms") as u64,
                file_size_bytes: r.get::<i64, _>("file_size_bytes") as u64,
                start_time: r.get("start_time"),
                end_time: r.get("end_time"),
            })
            .collect())
    }

    /// Delete a meeting; owned rows cascade.
    pub async fn delete(&self, meeting_id: &str) -> Result<(), StoreError> {
        with_retry(|| async {
            sqlx::query("DELETE FROM meetings WHERE id = ?")
                .bind(meeting_id)
                .execute(&self.db)
                .await
                .map_err(StoreError::from)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory;

    #[tokio::test]
    async fn status_advances_monotonically() {
        let pool = open_memory().await;
        let store = MeetingStore::new(pool);
        let meeting = store.create("Standup".to_string()).await.unwrap();

        store
            .set_status(&meeting.id, MeetingStatus::Recording)
            .await
            .unwrap();
        store
            .set_status(&meeting.id, MeetingStatus::Stopped)
            .await
            .unwrap();

        // Regression is rejected
        match store.set_status(&meeting.id, MeetingStatus::Recording).await {
            Err(StoreError::InvalidTransition(_)) => {}
            other => panic!("expected InvalidTransition, got {:?}", other),
        }

        // The one allowed post-stop move: persistence failure
        store
            .set_status(&meeting.id, MeetingStatus::Failed)
            .await
            .unwrap();
        let loaded = store.get(&meeting.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MeetingStatus::Failed);
        assert!(loaded.end_time.is_some());
    }

    #[tokio::test]
    async fn recordings_attach_to_meeting() {
        let pool = open_memory().await;
        let store = MeetingStore::new(pool);
        let meeting = store.create("Design review".to_string()).await.unwrap();

        let now = Utc::now();
        let recording = store
            .add_recording(&meeting.id, "/tmp/rec.wav", 60_000, 1_920_044, now, now)
            .await
            .unwrap();
        assert_eq!(recording.duration_ms, 60_000);

        let listed = store.recordings_for(&meeting.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_path, "/tmp/rec.wav");
    }
}
