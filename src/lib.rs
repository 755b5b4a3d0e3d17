//! # flowscribe
//!
//! Diarization-first meeting transcription: a supervised pair of ML worker
//! processes turns live PCM into speaker intervals and time-stamped text,
//! a temporal aligner joins the two streams into speaker-attributed
//! transcript rows, and a live insight engine derives summaries, action
//! items, decisions, key points, topics, and sentiment as the meeting
//! runs.
//!
//! Speaker identity comes from audio embeddings only. When diarization
//! cannot run, the pipeline refuses to invent speakers: row creation is
//! vetoed until the user explicitly opts into transcription-only mode, and
//! a post-recording recovery pass re-runs diarization over the full file.
//!
//! The desktop shell, export formats, and model delivery live elsewhere;
//! this crate is the pipeline and its stores.

pub mod alignment;
pub mod audio;
pub mod config;
pub mod diarization;
pub mod health;
pub mod insights;
pub mod llm;
pub mod playback;
pub mod session;
pub mod storage;
pub mod transcription;
pub mod worker;

pub use config::Config;
pub use session::{run_post_recovery, SessionOrchestrator, SessionState, SessionSummary};
