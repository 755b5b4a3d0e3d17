//! # Speaker diarization stream
//!
//! Turns the supervised diarizer worker into typed segment, correction,
//! stats, and failure events on a session-stable speaker timeline.
//!
//! Speaker identity here is derived from audio embeddings only; nothing in
//! this module (or downstream of it) infers a speaker from text. When the
//! backend cannot run — models missing, gated-model token missing, init
//! failure — the stream fails loudly and stays failed.

pub mod errors;
pub mod stream;
pub mod types;

pub use errors::DiarizationError;
pub use stream::{run_batch, DiarizerEvent, StreamingDiarizer, DIARIZER_EXECUTABLE};
pub use types::{
    ClusteringParams, DiarizationSegment, DiarizerErrorCode, DiarizerState, DiarizerStats,
    SpeakerCorrection, UNKNOWN_SPEAKER_ID,
};
