//! Key/value settings store
//!
//! Holds the handful of persisted toggles that must survive restarts, most
//! importantly the once-per-install transcription-only acknowledgement.

use crate::storage::{with_retry, StoreError};
use sqlx::{Row, SqlitePool};

/// Settings key for the transcription-only acknowledgement
const KEY_TRANSCRIPTION_ONLY_ACK: &str = "diarization.skip_enabled";

#[derive(Clone)]
pub struct SettingsStore {
    db: SqlitePool,
}

impl SettingsStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        with_retry(|| async {
            sqlx::query(
                "INSERT INTO settings (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&self.db)
            .await
            .map_err(StoreError::from)
        })
        .await?;
        Ok(())
    }

    pub async fn get_bool(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.as_deref() == Some("true"))
    }

    /// Has the user explicitly accepted running without speaker labels?
    pub async fn transcription_only_acknowledged(&self) -> Result<bool, StoreError> {
        self.get_bool(KEY_TRANSCRIPTION_ONLY_ACK).await
    }

    /// Record the acknowledgement; once per install.
    pub async fn acknowledge_transcription_only(&self) -> Result<(), StoreError> {
        self.set(KEY_TRANSCRIPTION_ONLY_ACK, "true").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory;

    #[tokio::test]
    async fn acknowledgement_defaults_off_and_persists() {
        let store = SettingsStore::new(open_memory().await);
        assert!(!store.transcription_only_acknowledged().await.unwrap());

        store.acknowledge_transcription_only().await.unwrap();
        assert!(store.transcription_only_acknowledged().await.unwrap());
    }

    #[tokio::test]
    async fn set_overwrites() {
        let store = SettingsStore::new(open_memory().await);
        store.set("llm.default_provider", "local").await.unwrap();
        store.set("llm.default_provider", "cloud").await.unwrap();
        assert_eq!(
            store.get("llm.default_provider").await.unwrap().as_deref(),
            Some("cloud")
        );
    }
}
