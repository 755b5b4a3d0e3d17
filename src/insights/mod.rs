//! Live insight generation over the transcript stream

pub mod engine;
pub mod prompts;
pub mod types;

pub use engine::{jaccard, InsightEngine, InsightError};
pub use types::{
    InsightCandidate, NoteKind, NoteStatus, SectionOutcome, TaskPriority, UnifiedInsightsResult,
    ALL_NOTE_KINDS,
};
