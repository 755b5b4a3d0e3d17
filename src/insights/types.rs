// Types for live and finalized meeting insights

use serde::{Deserialize, Serialize};

/// The six derived-insight kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Summary,
    ActionItem,
    Decision,
    KeyPoint,
    Topic,
    Sentiment,
}

/// All kinds, in the order the finalization pass runs them
pub const ALL_NOTE_KINDS: [NoteKind; 6] = [
    NoteKind::Summary,
    NoteKind::ActionItem,
    NoteKind::Decision,
    NoteKind::KeyPoint,
    NoteKind::Topic,
    NoteKind::Sentiment,
];

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Summary => "summary",
            NoteKind::ActionItem => "action_item",
            NoteKind::Decision => "decision",
            NoteKind::KeyPoint => "key_point",
            NoteKind::Topic => "topic",
            NoteKind::Sentiment => "sentiment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "summary" => NoteKind::Summary,
            "action_item" => NoteKind::ActionItem,
            "decision" => NoteKind::Decision,
            "key_point" => NoteKind::KeyPoint,
            "topic" => NoteKind::Topic,
            "sentiment" => NoteKind::Sentiment,
            _ => return None,
        })
    }
}

impl std::fmt::Display for NoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live notes may be superseded by finalization; finalized notes are the
/// canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteStatus {
    Live,
    Finalized,
}

impl NoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteStatus::Live => "live",
            NoteStatus::Finalized => "finalized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(NoteStatus::Live),
            "finalized" => Some(NoteStatus::Finalized),
            _ => None,
        }
    }
}

/// One extraction candidate returned by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightCandidate {
    pub kind: NoteKind,
    pub body: String,
    /// Evidence range in the transcript (milliseconds)
    pub start_ms: u64,
    pub end_ms: u64,
    /// Confidence score (0.0-1.0)
    pub confidence: f32,
}

/// Task priority for extracted action items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            _ => None,
        }
    }
}

/// Per-kind outcome of the finalization pass
#[derive(Debug, Clone)]
pub enum SectionOutcome {
    Ok { notes: usize },
    Error { reason: String },
}

/// Result of the orchestrated finalization across all six kinds.
/// Partial failure is normal: each kind reports independently.
#[derive(Debug, Clone)]
pub struct UnifiedInsightsResult {
    pub success: bool,
    pub partial_success: bool,
    pub sections_completed: usize,
    pub sections_failed: usize,
    pub sections: Vec<(NoteKind, SectionOutcome)>,
    pub notes_persisted: usize,
    pub tasks_created: usize,
}

impl UnifiedInsightsResult {
    pub fn from_sections(
        sections: Vec<(NoteKind, SectionOutcome)>,
        notes_persisted: usize,
        tasks_created: usize,
    ) -> Self {
        let completed = sections
            .iter()
            .filter(|(_, o)| matches!(o, SectionOutcome::Ok { .. }))
            .count();
        let failed = sections.len() - completed;
        Self {
            success: failed == 0,
            partial_success: failed > 0 && completed > 0,
            sections_completed: completed,
            sections_failed: failed,
            sections,
            notes_persisted,
            tasks_created,
        }
    }
}
