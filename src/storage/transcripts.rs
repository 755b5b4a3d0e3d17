//! Transcript store — speaker-attributed rows with full-text search
//!
//! Append-only within a meeting: the only permitted updates are promoting a
//! non-final row to final and correction-driven speaker re-labels. `create`
//! refuses rows without a speaker id, which is what keeps "no speaker
//! invented from text" enforceable at the last line of defense.

use crate::alignment::AlignedRow;
use crate::storage::{with_retry, StoreError};
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A persisted transcript row
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptRow {
    pub id: String,
    pub meeting_id: String,
    pub speaker_id: String,
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// A row waiting to be persisted
#[derive(Debug, Clone)]
pub struct NewRow {
    pub meeting_id: String,
    pub speaker_id: String,
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
    pub is_final: bool,
}

impl NewRow {
    pub fn from_aligned(meeting_id: &str, row: AlignedRow) -> Self {
        Self {
            meeting_id: meeting_id.to_string(),
            speaker_id: row.speaker_id,
            text: row.text,
            start_ms: row.start_ms,
            end_ms: row.end_ms,
            confidence: row.confidence,
            is_final: row.is_final,
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.speaker_id.trim().is_empty() {
            return Err(StoreError::MissingSpeakerId);
        }
        if self.end_ms < self.start_ms {
            return Err(StoreError::Constraint(format!(
                "end_ms {} before start_ms {}",
                self.end_ms, self.start_ms
            )));
        }
        Ok(())
    }
}

/// Search hit with its meeting context
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub row: TranscriptRow,
    pub meeting_title: String,
}

#[derive(Clone)]
pub struct TranscriptStore {
    db: SqlitePool,
}

impl TranscriptStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Persist one row. Durable when this returns.
    pub async fn create(&self, row: NewRow) -> Result<TranscriptRow, StoreError> {
        row.validate()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        with_retry(|| async {
            sqlx::query(
                "INSERT INTO transcripts
                 (id, meeting_id, speaker_id, text, start_ms, end_ms, confidence, is_final, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&row.meeting_id)
            .bind(&row.speaker_id)
            .bind(&row.text)
            .bind(row.start_ms as i64)
            .bind(row.end_ms as i64)
            .bind(row.confidence)
            .bind(row.is_final)
            .bind(now)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;

        debug!(
            "Persisted transcript row {} [{}ms..{}ms] speaker {}",
            id, row.start_ms, row.end_ms, row.speaker_id
        );

        Ok(TranscriptRow {
            id,
            meeting_id: row.meeting_id,
            speaker_id: row.speaker_id,
            text: row.text,
            start_ms: row.start_ms,
            end_ms: row.end_ms,
            confidence: row.confidence,
            is_final: row.is_final,
            created_at: now,
        })
    }

    /// Persist a batch atomically: either every row lands or none do.
    pub async fn create_batch(&self, rows: Vec<NewRow>) -> Result<Vec<TranscriptRow>, StoreError> {
        for row in &rows {
            row.validate()?;
        }

        let now = Utc::now();
        with_retry(|| async {
            let mut tx = self.db.begin().await?;
            let mut created = Vec::with_capacity(rows.len());
            for row in rows.iter() {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO transcripts
                     (id, meeting_id, speaker_id, text, start_ms, end_ms, confidence, is_final, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(&row.meeting_id)
                .bind(&row.speaker_id)
                .bind(&row.text)
                .bind(row.start_ms as i64)
                .bind(row.end_ms as i64)
                .bind(row.confidence)
                .bind(row.is_final)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                created.push(TranscriptRow {
                    id,
                    meeting_id: row.meeting_id.clone(),
                    speaker_id: row.speaker_id.clone(),
                    text: row.text.clone(),
                    start_ms: row.start_ms,
                    end_ms: row.end_ms,
                    confidence: row.confidence,
                    is_final: row.is_final,
                    created_at: now,
                });
            }
            tx.commit().await?;
            Ok(created)
        })
        .await
    }

    /// Promote a non-final row to final, optionally revising its text and
    /// confidence. The only update besides correction re-labels.
    pub async fn promote_to_final(
        &self,
        row_id: &str,
        text: &str,
        confidence: f32,
    ) -> Result<(), StoreError> {
        let result = with_retry(|| async {
            sqlx::query(
                "UPDATE transcripts SET is_final = TRUE, text = ?, confidence = ?
                 WHERE id = ? AND is_final = FALSE",
            )
            .bind(text)
            .bind(confidence)
            .bind(row_id)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "no non-final row with id {}",
                row_id
            )));
        }
        Ok(())
    }

    /// Apply a retroactive speaker correction to already-persisted rows in
    /// one transaction. Only the speaker id changes.
    pub async fn update_speaker_for_range(
        &self,
        meeting_id: &str,
        start_ms: u64,
        end_ms: u64,
        new_speaker_id: &str,
    ) -> Result<u64, StoreError> {
        if new_speaker_id.trim().is_empty() {
            return Err(StoreError::MissingSpeakerId);
        }
        let result = with_retry(|| async {
            let mut tx = self.db.begin().await?;
            let result = sqlx::query(
                "UPDATE transcripts SET speaker_id = ?
                 WHERE meeting_id = ? AND start_ms < ? AND end_ms > ? AND speaker_id != ?",
            )
            .bind(new_speaker_id)
            .bind(meeting_id)
            .bind(end_ms as i64)
            .bind(start_ms as i64)
            .bind(new_speaker_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(result)
        })
        .await?;

        let updated = result.rows_affected();
        if updated > 0 {
            info!(
                "Correction relabeled {} persisted rows in meeting {} to {}",
                updated, meeting_id, new_speaker_id
            );
        }
        Ok(updated)
    }

    pub async fn get_by_meeting_paginated(
        &self,
        meeting_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TranscriptRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, meeting_id, speaker_id, text, start_ms, end_ms, confidence, is_final, created_at
             FROM transcripts WHERE meeting_id = ?
             ORDER BY start_ms ASC
             LIMIT ? OFFSET ?",
        )
        .bind(meeting_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(row_from_sql).collect())
    }

    pub async fn count_by_meeting(&self, meeting_id: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM transcripts WHERE meeting_id = ?")
            .bind(meeting_id)
            .fetch_one(&self.db)
            .await?
            .get("c");
        Ok(count as u64)
    }

    pub async fn delete_by_meeting(&self, meeting_id: &str) -> Result<u64, StoreError> {
        let result = with_retry(|| async {
            sqlx::query("DELETE FROM transcripts WHERE meeting_id = ?")
                .bind(meeting_id)
                .execute(&self.db)
                .await
                .map_err(StoreError::from)
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Full-text search within one meeting, ordered by position.
    pub async fn search_in_meeting(
        &self,
        meeting_id: &str,
        query: &str,
    ) -> Result<Vec<TranscriptRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT t.id, t.meeting_id, t.speaker_id, t.text, t.start_ms, t.end_ms,
                    t.confidence, t.is_final, t.created_at
             FROM transcripts_fts f
             JOIN transcripts t ON t.rowid = f.rowid
             WHERE transcripts_fts MATCH ? AND t.meeting_id = ?
             ORDER BY t.start_ms ASC",
        )
        .bind(fts_escape(query))
        .bind(meeting_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(row_from_sql).collect())
    }

    /// Full-text search across all meetings, ordered by meeting start then
    /// row position.
    pub async fn search_all(&self, query: &str) -> Result<Vec<SearchHit>, StoreError> {
        let rows = sqlx::query(
            "SELECT t.id, t.meeting_id, t.speaker_id, t.text, t.start_ms, t.end_ms,
                    t.confidence, t.is_final, t.created_at, m.title AS meeting_title
             FROM transcripts_fts f
             JOIN transcripts t ON t.rowid = f.rowid
             JOIN meetings m ON m.id = t.meeting_id
             WHERE transcripts_fts MATCH ?
             ORDER BY m.start_time ASC, t.start_ms ASC",
        )
        .bind(fts_escape(query))
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| SearchHit {
                meeting_title: r.get("meeting_title"),
                row: row_from_sql(r),
            })
            .collect())
    }
}

/// Quote each term so punctuation in user queries cannot reach the FTS
/// query parser.
fn fts_escape(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn row_from_sql(r: sqlx::sqlite::SqliteRow) -> TranscriptRow {
    TranscriptRow {
        id: r.get("id"),
        meeting_id: r.get("meeting_id"),
        speaker_id: r.get("speaker_id"),
        text: r.get("text"),
        start_ms: r.get::<i64, _>("start_ms") as u64,
        end_ms: r.get::<i64, _>("end_ms") as u64,
        confidence: r.get("confidence"),
        is_final: r.get("is_final"),
        created_at: r.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_memory, MeetingStore};

    async fn store_with_meeting() -> (TranscriptStore, String) {
        let pool = open_memory().await;
        let meetings = MeetingStore::new(pool.clone());
        let meeting = meetings
            .create("Weekly sync".to_string())
            .await
            .expect("create meeting");
        (TranscriptStore::new(pool), meeting.id)
    }

    fn new_row(meeting_id: &str, speaker: &str, start_ms: u64, end_ms: u64, text: &str) -> NewRow {
        NewRow {
            meeting_id: meeting_id.to_string(),
            speaker_id: speaker.to_string(),
            text: text.to_string(),
            start_ms,
            end_ms,
            confidence: 0.9,
            is_final: true,
        }
    }

    #[tokio::test]
    async fn create_refuses_missing_speaker_id() {
        let (store, meeting_id) = store_with_meeting().await;
        let row = new_row(&meeting_id, "", 0, 1000, "who said this");

        match store.create(row).await {
            Err(StoreError::MissingSpeakerId) => {}
            other => panic!("expected MissingSpeakerId, got {:?}", other),
        }
        assert_eq!(store.count_by_meeting(&meeting_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rows_read_back_ordered_by_start() {
        let (store, meeting_id) = store_with_meeting().await;
        store
            .create(new_row(&meeting_id, "SPEAKER_1", 5000, 9000, "second"))
            .await
            .unwrap();
        store
            .create(new_row(&meeting_id, "SPEAKER_0", 0, 4000, "first"))
            .await
            .unwrap();
        store
            .create(new_row(&meeting_id, "SPEAKER_0", 9000, 12_000, "third"))
            .await
            .unwrap();

        let rows = store
            .get_by_meeting_paginated(&meeting_id, 10, 0)
            .await
            .unwrap();
        let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);

        let page = store
            .get_by_meeting_paginated(&meeting_id, 1, 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].text, "second");
    }

    #[tokio::test]
    async fn batch_is_atomic_on_failure() {
        let (store, meeting_id) = store_with_meeting().await;
        let rows = vec![
            new_row(&meeting_id, "SPEAKER_0", 0, 1000, "ok"),
            new_row(&meeting_id, "", 1000, 2000, "missing speaker"),
        ];

        match store.create_batch(rows).await {
            Err(StoreError::MissingSpeakerId) => {}
            other => panic!("expected MissingSpeakerId, got {:?}", other),
        }
        assert_eq!(store.count_by_meeting(&meeting_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn promote_only_touches_non_final_rows() {
        let (store, meeting_id) = store_with_meeting().await;
        let mut draft = new_row(&meeting_id, "SPEAKER_0", 0, 1000, "partial tex");
        draft.is_final = false;
        let draft = store.create(draft).await.unwrap();

        store
            .promote_to_final(&draft.id, "partial text resolved", 0.95)
            .await
            .unwrap();

        let rows = store
            .get_by_meeting_paginated(&meeting_id, 10, 0)
            .await
            .unwrap();
        assert!(rows[0].is_final);
        assert_eq!(rows[0].text, "partial text resolved");

        // A second promotion has nothing to promote
        match store.promote_to_final(&draft.id, "again", 0.9).await {
            Err(StoreError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn correction_updates_overlapping_rows_once() {
        let (store, meeting_id) = store_with_meeting().await;
        store
            .create(new_row(&meeting_id, "SPEAKER_0", 15_000, 19_000, "before range"))
            .await
            .unwrap();
        store
            .create(new_row(&meeting_id, "SPEAKER_0", 19_000, 21_000, "inside range"))
            .await
            .unwrap();
        store
            .create(new_row(&meeting_id, "SPEAKER_0", 23_000, 25_000, "after range"))
            .await
            .unwrap();

        let updated = store
            .update_speaker_for_range(&meeting_id, 18_000, 22_000, "SPEAKER_1")
            .await
            .unwrap();
        assert_eq!(updated, 2); // [15k,19k] overlaps and [19k,21k] overlaps

        let rows = store
            .get_by_meeting_paginated(&meeting_id, 10, 0)
            .await
            .unwrap();
        assert_eq!(rows[0].speaker_id, "SPEAKER_1");
        assert_eq!(rows[1].speaker_id, "SPEAKER_1");
        assert_eq!(rows[2].speaker_id, "SPEAKER_0");

        // Idempotent: nothing left to relabel
        let again = store
            .update_speaker_for_range(&meeting_id, 18_000, 22_000, "SPEAKER_1")
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn full_text_search_handles_punctuation_and_case() {
        let (store, meeting_id) = store_with_meeting().await;
        store
            .create(new_row(
                &meeting_id,
                "SPEAKER_0",
                0,
                4000,
                "We shipped the Billing-API yesterday!",
            ))
            .await
            .unwrap();
        store
            .create(new_row(&meeting_id, "SPEAKER_1", 4000, 8000, "unrelated chatter"))
            .await
            .unwrap();

        let hits = store
            .search_in_meeting(&meeting_id, "billing-api")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Billing-API"));

        let all = store.search_all("SHIPPED").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].meeting_title, "Weekly sync");
    }

    #[tokio::test]
    async fn delete_by_meeting_cascades_rows() {
        let (store, meeting_id) = store_with_meeting().await;
        store
            .create(new_row(&meeting_id, "SPEAKER_0", 0, 1000, "gone soon"))
            .await
            .unwrap();
        let deleted = store.delete_by_meeting(&meeting_id).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_by_meeting(&meeting_id).await.unwrap(), 0);
    }
}
