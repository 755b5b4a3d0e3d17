//! Pool construction and schema migrations
//!
//! Migrations are embedded SQL applied in numeric order, each inside its
//! own transaction, with the current version tracked in `schema_version`.

use crate::storage::StoreError;
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Numbered migrations; append only, never edit a shipped entry.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE meetings (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            start_time TIMESTAMP,
            end_time TIMESTAMP,
            status TEXT NOT NULL DEFAULT 'scheduled',
            audio_file_path TEXT
        );

        CREATE TABLE recordings (
            id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
            file_path TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            file_size_bytes INTEGER NOT NULL,
            start_time TIMESTAMP,
            end_time TIMESTAMP
        );

        CREATE TABLE speakers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            display_name TEXT NOT NULL,
            is_user BOOLEAN NOT NULL DEFAULT FALSE
        );

        CREATE TABLE meeting_speaker_names (
            meeting_id TEXT NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
            diarizer_label TEXT NOT NULL,
            speaker_id INTEGER NOT NULL REFERENCES speakers(id),
            display_name TEXT NOT NULL,
            PRIMARY KEY (meeting_id, diarizer_label)
        );

        CREATE TABLE transcripts (
            id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
            speaker_id TEXT NOT NULL,
            text TEXT NOT NULL,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER NOT NULL,
            confidence REAL NOT NULL,
            is_final BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMP NOT NULL
        );
        CREATE INDEX idx_transcripts_meeting_start ON transcripts(meeting_id, start_ms);

        CREATE TABLE meeting_notes (
            id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL REFERENCES meetings(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            body TEXT NOT NULL,
            evidence_start_ms INTEGER NOT NULL,
            evidence_end_ms INTEGER NOT NULL,
            confidence REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'live',
            created_at TIMESTAMP NOT NULL
        );
        CREATE INDEX idx_notes_meeting_kind ON meeting_notes(meeting_id, kind);

        CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            meeting_id TEXT REFERENCES meetings(id) ON DELETE SET NULL,
            title TEXT NOT NULL,
            assignee TEXT,
            priority TEXT NOT NULL DEFAULT 'medium',
            status TEXT NOT NULL DEFAULT 'open',
            due TIMESTAMP,
            source_note_id TEXT
        );

        CREATE TABLE settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        r#"
        CREATE VIRTUAL TABLE transcripts_fts USING fts5(
            text,
            content='transcripts',
            content_rowid='rowid',
            tokenize='unicode61 remove_diacritics 2'
        );

        CREATE TRIGGER transcripts_fts_insert AFTER INSERT ON transcripts BEGIN
            INSERT INTO transcripts_fts(rowid, text) VALUES (new.rowid, new.text);
        END;
        CREATE TRIGGER transcripts_fts_delete AFTER DELETE ON transcripts BEGIN
            INSERT INTO transcripts_fts(transcripts_fts, rowid, text)
            VALUES ('delete', old.rowid, old.text);
        END;
        CREATE TRIGGER transcripts_fts_update AFTER UPDATE OF text ON transcripts BEGIN
            INSERT INTO transcripts_fts(transcripts_fts, rowid, text)
            VALUES ('delete', old.rowid, old.text);
            INSERT INTO transcripts_fts(rowid, text) VALUES (new.rowid, new.text);
        END;
        "#,
    ),
    (
        3,
        r#"
        CREATE TABLE failure_events (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            meeting_id TEXT,
            message TEXT NOT NULL,
            raw_output TEXT,
            timestamp TIMESTAMP NOT NULL,
            acknowledged BOOLEAN NOT NULL DEFAULT FALSE
        );
        CREATE INDEX idx_failures_meeting ON failure_events(meeting_id);
        "#,
    ),
];

/// Open (creating if needed) the on-disk store and bring it to the current
/// schema version.
pub async fn open_pool(path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Database(format!("create data dir: {}", e)))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(StoreError::from)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// In-memory store for tests.
pub async fn open_memory() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("memory options")
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("open in-memory database");
    migrate(&pool).await.expect("migrate in-memory database");
    pool
}

/// Apply pending migrations in numeric order.
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let current: i64 = sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM schema_version")
        .fetch_one(pool)
        .await?
        .get("v");

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        info!("Applying schema migration {}", version);
        let mut tx = pool.begin().await?;
        // Statements within one migration run as a unit
        sqlx::raw_sql(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_once_and_track_version() {
        let pool = open_memory().await;

        let version: i64 = sqlx::query("SELECT MAX(version) AS v FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("v");
        assert_eq!(version, MIGRATIONS.last().unwrap().0);

        // Re-running is a no-op
        migrate(&pool).await.expect("second migrate");
        let rows: i64 = sqlx::query("SELECT COUNT(*) AS c FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(rows, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn fts_table_exists() {
        let pool = open_memory().await;
        sqlx::query("SELECT COUNT(*) FROM transcripts_fts")
            .fetch_one(&pool)
            .await
            .expect("fts virtual table queryable");
    }
}
