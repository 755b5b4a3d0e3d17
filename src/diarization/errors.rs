// Error types for the diarization stream

use crate::diarization::types::DiarizerErrorCode;
use crate::worker::WorkerError;
use thiserror::Error;

/// Errors from the streaming and batch diarizer clients
#[derive(Debug, Error)]
pub enum DiarizationError {
    /// Model weights are not present locally and cannot be fetched
    #[error("Diarization models missing: {0}")]
    ModelsMissing(String),

    /// Gated models need an access token that was not provided
    #[error("Diarization access token missing: {0}")]
    TokenMissing(String),

    /// Backend failed to initialize for any other reason
    #[error("Diarization init failed: {0}")]
    InitFailed(String),

    /// Worker process died mid-stream
    #[error("Diarization worker crashed (exit {code}): {stderr_tail}")]
    Crashed { code: i32, stderr_tail: String },

    /// Batch run exceeded its deadline
    #[error("Diarization timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("Diarization cancelled")]
    Cancelled,

    /// Worker emitted something the protocol does not allow
    #[error("Diarization protocol violation: {0}")]
    Protocol(String),

    /// Lifecycle misuse by the caller
    #[error("Invalid diarizer transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::diarization::types::DiarizerState,
        to: crate::diarization::types::DiarizerState,
    },

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl DiarizationError {
    /// The wire code this error is reported under.
    pub fn code(&self) -> DiarizerErrorCode {
        match self {
            DiarizationError::ModelsMissing(_) => DiarizerErrorCode::ModelsMissing,
            DiarizationError::TokenMissing(_) => DiarizerErrorCode::TokenMissing,
            DiarizationError::Crashed { .. } => DiarizerErrorCode::Crashed,
            _ => DiarizerErrorCode::InitFailed,
        }
    }

    pub fn from_code(code: DiarizerErrorCode, message: String) -> Self {
        match code {
            DiarizerErrorCode::ModelsMissing => DiarizationError::ModelsMissing(message),
            DiarizerErrorCode::TokenMissing => DiarizationError::TokenMissing(message),
            DiarizerErrorCode::InitFailed => DiarizationError::InitFailed(message),
            DiarizerErrorCode::Crashed => DiarizationError::Crashed {
                code: -1,
                stderr_tail: message,
            },
        }
    }
}

/// Result type for diarization operations
pub type Result<T> = std::result::Result<T, DiarizationError>;
