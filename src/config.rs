//! Typed application configuration
//!
//! Every option is an enumerated or range-checked field; unknown keys in a
//! configuration file are rejected at parse time rather than ignored, so a
//! typo in `settings.json` surfaces immediately instead of silently using a
//! default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::diarization::types::{SIMILARITY_THRESHOLD_MAX, SIMILARITY_THRESHOLD_MIN};

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Transcription model size, trading quality against latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl Default for ModelSize {
    fn default() -> Self {
        Self::Small
    }
}

/// How aggressively the insight engine discards off-topic candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    Strict,
    Balanced,
    Loose,
}

impl Default for Strictness {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Diarization backend tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiarizationSettings {
    /// Clustering similarity threshold; lower produces more distinct speakers
    pub similarity_threshold: f32,
    /// Minimum number of speakers the clusterer may settle on
    pub min_speakers: u32,
    /// Maximum number of speakers the clusterer may settle on
    pub max_speakers: u32,
    /// Transcription-only mode acknowledgement: allows transcript rows with
    /// the unknown-speaker sentinel when diarization is unavailable
    pub skip_enabled: bool,
}

impl Default for DiarizationSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: crate::diarization::types::STREAMING_SIMILARITY_THRESHOLD,
            min_speakers: 2,
            max_speakers: 10,
            skip_enabled: false,
        }
    }
}

/// Transcription backend tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranscriptionSettings {
    pub model_size: ModelSize,
    /// BCP-47 language tag, or "auto" for detection
    pub language: String,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            model_size: ModelSize::default(),
            language: "auto".to_string(),
        }
    }
}

/// Live insight engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InsightSettings {
    pub strictness: Strictness,
    /// Minimum new characters before a live batch is formed
    pub batch_min_chars: usize,
    /// Maximum wall time between live batches (milliseconds)
    pub batch_max_ms: u64,
    /// Characters of trailing context re-included in the next batch
    pub context_chars: usize,
}

impl Default for InsightSettings {
    fn default() -> Self {
        Self {
            strictness: Strictness::default(),
            batch_min_chars: 800,
            batch_max_ms: 20_000,
            context_chars: 300,
        }
    }
}

/// A single registered chat-completion backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    /// Backend kind: "openai-compatible", "ollama", or "anthropic"
    pub kind: String,
    /// Base URL; defaults per kind when omitted
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Model identifier passed to the backend
    pub model: String,
    /// API key; local backends leave this unset
    #[serde(default)]
    pub api_key: Option<String>,
    /// Per-provider request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// LLM routing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSettings {
    /// Name of the provider tried first
    pub default_provider: String,
    /// Registered providers, keyed by name
    pub providers: std::collections::BTreeMap<String, ProviderSettings>,
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub diarization: DiarizationSettings,
    pub transcription: TranscriptionSettings,
    pub insights: InsightSettings,
    pub llm: LlmSettings,
    /// Root of persisted state: db.sqlite, recordings/, models/
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            diarization: DiarizationSettings::default(),
            transcription: TranscriptionSettings::default(),
            insights: InsightSettings::default(),
            llm: LlmSettings::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flowscribe")
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for
    /// absent sections. Unknown keys are an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check fields that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.diarization.similarity_threshold;
        if !(SIMILARITY_THRESHOLD_MIN..=SIMILARITY_THRESHOLD_MAX).contains(&t) {
            return Err(ConfigError::InvalidValue {
                field: "diarization.similarity_threshold",
                reason: format!(
                    "{} outside [{}, {}]",
                    t, SIMILARITY_THRESHOLD_MIN, SIMILARITY_THRESHOLD_MAX
                ),
            });
        }
        if self.diarization.min_speakers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "diarization.min_speakers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.diarization.max_speakers < self.diarization.min_speakers {
            return Err(ConfigError::InvalidValue {
                field: "diarization.max_speakers",
                reason: "must be >= min_speakers".to_string(),
            });
        }
        if self.insights.batch_min_chars == 0 {
            return Err(ConfigError::InvalidValue {
                field: "insights.batch_min_chars",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Path of the primary SQLite store
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db.sqlite")
    }

    /// Directory holding a meeting's audio files
    pub fn recordings_dir(&self, meeting_id: &str) -> PathBuf {
        self.data_dir.join("recordings").join(meeting_id)
    }
}
