//! Insight notes and tasks store

use crate::insights::types::{NoteKind, NoteStatus, TaskPriority};
use crate::storage::{with_retry, StoreError};
use chrono::{DateTime, Utc};
use log::info;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A persisted insight note
#[derive(Debug, Clone)]
pub struct StoredNote {
    pub id: String,
    pub meeting_id: String,
    pub kind: NoteKind,
    pub body: String,
    pub evidence_start_ms: u64,
    pub evidence_end_ms: u64,
    pub confidence: f32,
    pub status: NoteStatus,
    pub created_at: DateTime<Utc>,
}

/// A persisted task extracted from an action item
#[derive(Debug, Clone)]
pub struct StoredTask {
    pub id: String,
    pub meeting_id: Option<String>,
    pub title: String,
    pub assignee: Option<String>,
    pub priority: TaskPriority,
    pub open: bool,
    pub due: Option<DateTime<Utc>>,
    pub source_note_id: Option<String>,
}

#[derive(Clone)]
pub struct NoteStore {
    db: SqlitePool,
}

impl NoteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn create_note(
        &self,
        meeting_id: &str,
        kind: NoteKind,
        body: &str,
        evidence_start_ms: u64,
        evidence_end_ms: u64,
        confidence: f32,
        status: NoteStatus,
    ) -> Result<StoredNote, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        with_retry(|| async {
            sqlx::query(
                "INSERT INTO meeting_notes
                 (id, meeting_id, kind, body, evidence_start_ms, evidence_end_ms, confidence, status, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(meeting_id)
            .bind(kind.as_str())
            .bind(body)
            .bind(evidence_start_ms as i64)
            .bind(evidence_end_ms as i64)
            .bind(confidence)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;

        Ok(StoredNote {
            id,
            meeting_id: meeting_id.to_string(),
            kind,
            body: body.to_string(),
            evidence_start_ms,
            evidence_end_ms,
            confidence,
            status,
            created_at: now,
        })
    }

    /// Merge a duplicate candidate into an existing note: extend its
    /// evidence range and keep the higher confidence.
    pub async fn extend_note_evidence(
        &self,
        note_id: &str,
        evidence_end_ms: u64,
        confidence: f32,
    ) -> Result<(), StoreError> {
        let result = with_retry(|| async {
            sqlx::query(
                "UPDATE meeting_notes
                 SET evidence_end_ms = MAX(evidence_end_ms, ?), confidence = MAX(confidence, ?)
                 WHERE id = ?",
            )
            .bind(evidence_end_ms as i64)
            .bind(confidence)
            .bind(note_id)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("note {}", note_id)));
        }
        Ok(())
    }

    pub async fn list_notes(
        &self,
        meeting_id: &str,
        kind: Option<NoteKind>,
    ) -> Result<Vec<StoredNote>, StoreError> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT id, meeting_id, kind, body, evidence_start_ms, evidence_end_ms,
                            confidence, status, created_at
                     FROM meeting_notes WHERE meeting_id = ? AND kind = ?
                     ORDER BY evidence_start_ms ASC",
                )
                .bind(meeting_id)
                .bind(kind.as_str())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, meeting_id, kind, body, evidence_start_ms, evidence_end_ms,
                            confidence, status, created_at
                     FROM meeting_notes WHERE meeting_id = ?
                     ORDER BY evidence_start_ms ASC",
                )
                .bind(meeting_id)
                .fetch_all(&self.db)
                .await?
            }
        };

        Ok(rows.into_iter().filter_map(note_from_sql).collect())
    }

    /// Finalization supersedes live notes of a kind: delete them in the
    /// same transaction that will insert the finalized replacements.
    /// Action-item notes that were promoted to tasks survive (the task
    /// keeps its link).
    pub async fn supersede_live_notes(
        &self,
        meeting_id: &str,
        kind: NoteKind,
    ) -> Result<u64, StoreError> {
        let result = with_retry(|| async {
            let mut tx = self.db.begin().await?;
            let result = sqlx::query(
                "DELETE FROM meeting_notes
                 WHERE meeting_id = ? AND kind = ? AND status = 'live'
                   AND id NOT IN (SELECT source_note_id FROM tasks WHERE source_note_id IS NOT NULL)",
            )
            .bind(meeting_id)
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(result)
        })
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn create_task(
        &self,
        meeting_id: Option<&str>,
        title: &str,
        assignee: Option<&str>,
        priority: TaskPriority,
        due: Option<DateTime<Utc>>,
        source_note_id: Option<&str>,
    ) -> Result<StoredTask, StoreError> {
        let id = Uuid::new_v4().to_string();

        with_retry(|| async {
            sqlx::query(
                "INSERT INTO tasks (id, meeting_id, title, assignee, priority, status, due, source_note_id)
                 VALUES (?, ?, ?, ?, ?, 'open', ?, ?)",
            )
            .bind(&id)
            .bind(meeting_id)
            .bind(title)
            .bind(assignee)
            .bind(priority.as_str())
            .bind(due)
            .bind(source_note_id)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;

        info!("Created task from action item: {}", title);
        Ok(StoredTask {
            id,
            meeting_id: meeting_id.map(String::from),
            title: title.to_string(),
            assignee: assignee.map(String::from),
            priority,
            open: true,
            due,
            source_note_id: source_note_id.map(String::from),
        })
    }

    pub async fn list_tasks(&self, meeting_id: &str) -> Result<Vec<StoredTask>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, meeting_id, title, assignee, priority, status, due, source_note_id
             FROM tasks WHERE meeting_id = ? ORDER BY rowid ASC",
        )
        .bind(meeting_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                Some(StoredTask {
                    id: r.get("id"),
                    meeting_id: r.get("meeting_id"),
                    title: r.get("title"),
                    assignee: r.get("assignee"),
                    priority: TaskPriority::parse(&r.get::<String, _>("priority"))?,
                    open: r.get::<String, _>("status") == "open",
                    due: r.get("due"),
                    source_note_id: r.get("source_note_id"),
                })
            })
            .collect())
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let result = with_retry(|| async {
            sqlx::query("UPDATE tasks SET status = 'done' WHERE id = ?")
                .bind(task_id)
                .execute(&self.db)
                .await
                .map_err(StoreError::from)
        })
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }
}

fn note_from_sql(r: sqlx::sqlite::SqliteRow) -> Option<StoredNote> {
    Some(StoredNote {
        id: r.get("id"),
        meeting_id: r.get("meeting_id"),
        kind: NoteKind::parse(&r.get::<String, _>("kind"))?,
        body: r.get("body"),
        evidence_start_ms: r.get::<i64, _>("evidence_start_ms") as u64,
        evidence_end_ms: r.get::<i64, _>("evidence_end_ms") as u64,
        confidence: r.get("confidence"),
        status: NoteStatus::parse(&r.get::<String, _>("status"))?,
        created_at: r.get("created_at"),
    })
}
