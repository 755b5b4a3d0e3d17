// Types for the transcription stream

use serde::{Deserialize, Serialize};

/// A time-stamped text segment from the transcriber
///
/// Non-final segments are provisional and may be superseded by a later
/// `is_final = true` segment covering the same range. Segments carry no
/// speaker information by contract; attribution happens in alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Confidence score (0.0-1.0)
    pub confidence: f32,
    pub is_final: bool,
}

impl TranscriptSegment {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.end_ms < self.start_ms {
            return Err(format!(
                "end_ms {} before start_ms {}",
                self.end_ms, self.start_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0,1]", self.confidence));
        }
        Ok(())
    }
}

/// Transcriber lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriberState {
    Uninit,
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

/// Wire events from the transcriber worker. Closed enum; a `speaker` field
/// anywhere in the payload is a contract violation checked by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriberWireEvent {
    Ready,
    Segment {
        text: String,
        start_ms: u64,
        end_ms: u64,
        confidence: f32,
        is_final: bool,
    },
    Error {
        code: String,
        message: String,
    },
    Complete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_validation() {
        let seg = TranscriptSegment {
            text: "hello".to_string(),
            start_ms: 0,
            end_ms: 900,
            confidence: 0.8,
            is_final: true,
        };
        assert!(seg.validate().is_ok());

        let bad = TranscriptSegment {
            confidence: -0.1,
            ..seg
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn zero_length_segment_is_allowed_by_type() {
        // end == start is legal at the wire level; the aligner drops empties
        let seg = TranscriptSegment {
            text: String::new(),
            start_ms: 100,
            end_ms: 100,
            confidence: 1.0,
            is_final: true,
        };
        assert!(seg.validate().is_ok());
        assert_eq!(seg.duration_ms(), 0);
    }
}
