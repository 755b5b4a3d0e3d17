//! Speakers shared across meetings, plus the per-meeting label map
//!
//! Diarizer labels ("SPEAKER_0") are session-local; `Speaker` rows are
//! database-local identities created lazily the first time a label shows up
//! in a meeting. The label-to-speaker map for a meeting is persisted so a
//! rename sticks, while the in-session copy lives in the orchestrator.

use crate::storage::{with_retry, StoreError};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, PartialEq)]
pub struct Speaker {
    pub id: i64,
    pub display_name: String,
    pub is_user: bool,
}

#[derive(Clone)]
pub struct SpeakerStore {
    db: SqlitePool,
}

impl SpeakerStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create a speaker row.
    pub async fn create(&self, display_name: &str, is_user: bool) -> Result<Speaker, StoreError> {
        let result = with_retry(|| async {
            sqlx::query("INSERT INTO speakers (display_name, is_user) VALUES (?, ?)")
                .bind(display_name)
                .bind(is_user)
                .execute(&self.db)
                .await
                .map_err(StoreError::from)
        })
        .await?;

        Ok(Speaker {
            id: result.last_insert_rowid(),
            display_name: display_name.to_string(),
            is_user,
        })
    }

    /// Map a session-local diarizer label to a speaker for one meeting,
    /// creating the speaker lazily on first sight.
    pub async fn ensure_for_label(
        &self,
        meeting_id: &str,
        diarizer_label: &str,
    ) -> Result<Speaker, StoreError> {
        if let Some(existing) = self.get_for_label(meeting_id, diarizer_label).await? {
            return Ok(existing);
        }

        let speaker = self.create(diarizer_label, false).await?;
        with_retry(|| async {
            sqlx::query(
                "INSERT INTO meeting_speaker_names (meeting_id, diarizer_label, speaker_id, display_name)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(meeting_id)
            .bind(diarizer_label)
            .bind(speaker.id)
            .bind(diarizer_label)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;
        Ok(speaker)
    }

    pub async fn get_for_label(
        &self,
        meeting_id: &str,
        diarizer_label: &str,
    ) -> Result<Option<Speaker>, StoreError> {
        let row = sqlx::query(
            "SELECT s.id, n.display_name, s.is_user
             FROM meeting_speaker_names n
             JOIN speakers s ON s.id = n.speaker_id
             WHERE n.meeting_id = ? AND n.diarizer_label = ?",
        )
        .bind(meeting_id)
        .bind(diarizer_label)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|r| Speaker {
            id: r.get("id"),
            display_name: r.get("display_name"),
            is_user: r.get("is_user"),
        }))
    }

    /// Rename a speaker within one meeting (e.g. "SPEAKER_0" -> "Alice").
    pub async fn rename_in_meeting(
        &self,
        meeting_id: &str,
        diarizer_label: &str,
        display_name: &str,
    ) -> Result<(), StoreError> {
        let result = with_retry(|| async {
            sqlx::query(
                "UPDATE meeting_speaker_names SET display_name = ?
                 WHERE meeting_id = ? AND diarizer_label = ?",
            )
            .bind(display_name)
            .bind(meeting_id)
            .bind(diarizer_label)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "no speaker {} in meeting {}",
                diarizer_label, meeting_id
            )));
        }
        Ok(())
    }

    /// All labels seen in a meeting, in label order.
    pub async fn labels_for_meeting(
        &self,
        meeting_id: &str,
    ) -> Result<Vec<(String, Speaker)>, StoreError> {
        let rows = sqlx::query(
            "SELECT n.diarizer_label, s.id, n.display_name, s.is_user
             FROM meeting_speaker_names n
             JOIN speakers s ON s.id = n.speaker_id
             WHERE n.meeting_id = ?
             ORDER BY n.diarizer_label ASC",
        )
        .bind(meeting_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get("diarizer_label"),
                    Speaker {
                        id: r.get("id"),
                        display_name: r.get("display_name"),
                        is_user: r.get("is_user"),
                    },
                )
            })
            .collect())
    }
}
