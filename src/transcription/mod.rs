//! Streaming transcription over a supervised worker process

pub mod stream;
pub mod types;

pub use stream::{
    StreamingTranscriber, TranscriberEvent, TranscriptionError, TRANSCRIBER_EXECUTABLE,
};
pub use types::{TranscriberState, TranscriptSegment};
