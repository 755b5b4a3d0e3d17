// Core types for the speaker diarization stream

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Clustering similarity threshold used while streaming. Lower values
/// produce more distinct speakers.
pub const STREAMING_SIMILARITY_THRESHOLD: f32 = 0.30;

/// Clustering similarity threshold for whole-file batch runs, where the
/// clusterer sees all embeddings at once and can afford to be stricter.
pub const BATCH_SIMILARITY_THRESHOLD: f32 = 0.35;

/// Accepted range for a configured similarity threshold
pub const SIMILARITY_THRESHOLD_MIN: f32 = 0.2;
pub const SIMILARITY_THRESHOLD_MAX: f32 = 0.7;

/// Sentinel speaker id written only under acknowledged transcription-only
/// mode. Semantics: "unknown speaker", never a real person.
pub const UNKNOWN_SPEAKER_ID: &str = "SPEAKER_UNKNOWN";

/// A finalized interval attributed to one speaker
///
/// Within a session, identical `speaker_id` values denote the same voice
/// identity; ids are assigned from audio embeddings only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiarizationSegment {
    /// Session-stable label (e.g. "SPEAKER_0")
    pub speaker_id: String,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Confidence score (0.0-1.0)
    pub confidence: f32,
    /// Other speakers active in the same interval, when the backend
    /// detected overlapped speech
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlapping_speakers: Option<Vec<String>>,
}

impl DiarizationSegment {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Reject segments that violate the wire contract.
    pub fn validate(&self) -> Result<(), String> {
        if self.speaker_id.is_empty() {
            return Err("empty speaker_id".to_string());
        }
        if self.end_ms <= self.start_ms {
            return Err(format!(
                "end_ms {} not after start_ms {}",
                self.end_ms, self.start_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0,1]", self.confidence));
        }
        Ok(())
    }
}

/// Retroactive re-label of an already-emitted range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerCorrection {
    pub start_ms: u64,
    pub end_ms: u64,
    pub new_speaker_id: String,
}

/// Periodic per-speaker talk-time statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiarizerStats {
    pub per_speaker_total_ms: BTreeMap<String, u64>,
    pub segment_count: u64,
}

/// Clustering parameters handed to the worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusteringParams {
    pub min_speakers: u32,
    pub max_speakers: u32,
    pub similarity_threshold: f32,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            min_speakers: 2,
            max_speakers: 10,
            similarity_threshold: STREAMING_SIMILARITY_THRESHOLD,
        }
    }
}

/// Terminal error codes the worker may report during or after init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiarizerErrorCode {
    ModelsMissing,
    TokenMissing,
    InitFailed,
    Crashed,
}

impl std::fmt::Display for DiarizerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiarizerErrorCode::ModelsMissing => write!(f, "MODELS_MISSING"),
            DiarizerErrorCode::TokenMissing => write!(f, "TOKEN_MISSING"),
            DiarizerErrorCode::InitFailed => write!(f, "INIT_FAILED"),
            DiarizerErrorCode::Crashed => write!(f, "CRASHED"),
        }
    }
}

/// Diarizer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiarizerState {
    Uninit,
    Initializing,
    Ready,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl DiarizerState {
    /// Legal transitions; everything else is a bug in the caller.
    pub fn can_transition_to(self, to: DiarizerState) -> bool {
        use DiarizerState::*;
        matches!(
            (self, to),
            (Uninit, Initializing)
                | (Initializing, Ready)
                | (Initializing, Failed)
                | (Ready, Running)
                | (Ready, Stopping)
                | (Ready, Failed)
                | (Running, Paused)
                | (Running, Stopping)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Paused, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }
}

/// Wire events from the diarizer worker. A closed enum: an unknown `type`
/// fails deserialization and is rejected upstream rather than ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiarizerWireEvent {
    Ready,
    Segment {
        speaker_id: String,
        start_ms: u64,
        end_ms: u64,
        confidence: f32,
        #[serde(default)]
        overlapping_speakers: Option<Vec<String>>,
    },
    Correction {
        start_ms: u64,
        end_ms: u64,
        new_speaker_id: String,
    },
    Stats {
        per_speaker_total_ms: BTreeMap<String, u64>,
        segment_count: u64,
    },
    Error {
        code: DiarizerErrorCode,
        message: String,
    },
    Complete,
}
