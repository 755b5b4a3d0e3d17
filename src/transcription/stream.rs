//! Streaming transcriber client
//!
//! Same supervised-worker shape as the diarizer stream, but the payload is
//! text: partial segments stream out early and are superseded by a final
//! segment over the same range. The transcriber is forbidden from inventing
//! speaker attribution — any `speaker` field in a segment payload is
//! rejected as a protocol violation rather than passed downstream.

use crate::config::{ModelSize, TranscriptionSettings};
use crate::transcription::types::{TranscriberState, TranscriberWireEvent, TranscriptSegment};
use crate::worker::protocol::{parse_line, ControlLine};
use crate::worker::{WorkerError, WorkerExit, WorkerLine, WorkerRole, WorkerSpec, WorkerSupervisor};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Default executable name of the transcriber worker on PATH
pub const TRANSCRIBER_EXECUTABLE: &str = "transcription-worker";

/// Deadline for one transcription chunk to produce output
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("Transcriber init failed: {0}")]
    InitFailed(String),

    #[error("Transcriber crashed (exit {code}): {stderr_tail}")]
    Crashed { code: i32, stderr_tail: String },

    #[error("Transcriber is {0:?}, cannot accept audio")]
    NotRunning(TranscriberState),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Typed events fanned out to subscribers
#[derive(Debug, Clone)]
pub enum TranscriberEvent {
    Ready,
    Segment(TranscriptSegment),
    Fatal { code: String, message: String },
    Completed,
    ProtocolViolation(String),
}

/// Streaming transcriber over a supervised worker process
pub struct StreamingTranscriber {
    supervisor: Arc<WorkerSupervisor>,
    settings: TranscriptionSettings,
    state: Arc<Mutex<TranscriberState>>,
    spec: Mutex<Option<WorkerSpec>>,
    events_tx: broadcast::Sender<TranscriberEvent>,
}

impl StreamingTranscriber {
    pub fn new(supervisor: Arc<WorkerSupervisor>, settings: TranscriptionSettings) -> Self {
        let (events_tx, _) = broadcast::channel(512);
        Self {
            supervisor,
            settings,
            state: Arc::new(Mutex::new(TranscriberState::Uninit)),
            spec: Mutex::new(None),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriberEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> TranscriberState {
        *self.state.lock().expect("transcriber state lock")
    }

    /// Spawn the worker. `offset_ms` shifts emitted timestamps, used when
    /// resuming a session against an already-partial recording.
    pub async fn start(&self, spec: WorkerSpec, offset_ms: u64) -> Result<(), TranscriptionError> {
        let spec = spec
            .arg("--model-size")
            .arg(model_size_arg(self.settings.model_size))
            .arg("--language")
            .arg(self.settings.language.clone())
            .arg("--offset-ms")
            .arg(offset_ms.to_string());

        *self.spec.lock().expect("spec lock") = Some(spec.clone());
        *self.state.lock().expect("transcriber state lock") = TranscriberState::Initializing;

        let (line_tx, line_rx) = mpsc::channel(1024);
        self.supervisor
            .start(WorkerRole::Transcriber, spec, line_tx)
            .await?;

        let state = Arc::clone(&self.state);
        let events_tx = self.events_tx.clone();
        tokio::spawn(pump_lines(line_rx, state, events_tx));
        Ok(())
    }

    /// Feed PCM. Valid while `Running` (or right after `Ready` arrived).
    pub async fn push_pcm(&self, pcm: Vec<u8>) -> Result<(), TranscriptionError> {
        let state = self.state();
        if !matches!(state, TranscriberState::Running) {
            return Err(TranscriptionError::NotRunning(state));
        }
        self.supervisor
            .send(WorkerRole::Transcriber, pcm)
            .await
            .map_err(TranscriptionError::from)
    }

    pub fn pause(&self) {
        let mut state = self.state.lock().expect("transcriber state lock");
        if *state == TranscriberState::Running {
            *state = TranscriberState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().expect("transcriber state lock");
        if *state == TranscriberState::Paused {
            *state = TranscriberState::Running;
        }
    }

    /// Kill and respawn the worker with the last spec. Unsticks a backend
    /// that stopped emitting finals; emitted offsets restart where the
    /// caller says.
    pub async fn force_reset(&self, offset_ms: u64) -> Result<(), TranscriptionError> {
        warn!("Force-resetting transcriber at offset {} ms", offset_ms);
        let _ = self.supervisor.cancel(WorkerRole::Transcriber).await;
        let spec = self
            .spec
            .lock()
            .expect("spec lock")
            .clone()
            .ok_or_else(|| TranscriptionError::InitFailed("never started".to_string()))?;

        // Swap the stale offset arg rather than re-deriving the whole spec
        let mut spec = spec;
        if let Some(pos) = spec.args.iter().position(|a| a == "--offset-ms") {
            spec.args[pos + 1] = offset_ms.to_string();
        }

        *self.state.lock().expect("transcriber state lock") = TranscriberState::Initializing;
        let (line_tx, line_rx) = mpsc::channel(1024);
        self.supervisor
            .start(WorkerRole::Transcriber, spec, line_tx)
            .await?;
        let state = Arc::clone(&self.state);
        let events_tx = self.events_tx.clone();
        tokio::spawn(pump_lines(line_rx, state, events_tx));
        Ok(())
    }

    pub async fn stop(&self, grace: Duration) -> Result<WorkerExit, TranscriptionError> {
        *self.state.lock().expect("transcriber state lock") = TranscriberState::Stopping;
        let exit = self.supervisor.stop(WorkerRole::Transcriber, grace).await?;
        let final_state = match &exit {
            WorkerExit::Failed { .. } => TranscriberState::Failed,
            _ => TranscriberState::Stopped,
        };
        *self.state.lock().expect("transcriber state lock") = final_state;
        Ok(exit)
    }
}

fn model_size_arg(size: ModelSize) -> &'static str {
    match size {
        ModelSize::Tiny => "tiny",
        ModelSize::Base => "base",
        ModelSize::Small => "small",
        ModelSize::Medium => "medium",
        ModelSize::Large => "large",
    }
}

async fn pump_lines(
    mut line_rx: mpsc::Receiver<WorkerLine>,
    state: Arc<Mutex<TranscriberState>>,
    events_tx: broadcast::Sender<TranscriberEvent>,
) {
    while let Some(line) = line_rx.recv().await {
        let event = match classify(&line.text) {
            Some(event) => event,
            None => continue,
        };

        match &event {
            TranscriberEvent::Ready => {
                let mut s = state.lock().expect("transcriber state lock");
                if *s == TranscriberState::Initializing {
                    *s = TranscriberState::Running;
                    info!("Transcriber backend ready");
                }
            }
            TranscriberEvent::Fatal { code, message } => {
                warn!("Transcriber terminal error {}: {}", code, message);
                *state.lock().expect("transcriber state lock") = TranscriberState::Failed;
            }
            _ => {}
        }

        let _ = events_tx.send(event);
    }
}

fn classify(text: &str) -> Option<TranscriberEvent> {
    match parse_line(text) {
        ControlLine::Event { payload, .. } => {
            // Contract: the transcriber must not invent speakers.
            if payload.get("speaker").is_some() || payload.get("speaker_id").is_some() {
                return Some(TranscriberEvent::ProtocolViolation(format!(
                    "transcriber emitted a speaker field: {}",
                    text
                )));
            }
            match serde_json::from_value::<TranscriberWireEvent>(payload) {
                Ok(TranscriberWireEvent::Ready) => Some(TranscriberEvent::Ready),
                Ok(TranscriberWireEvent::Segment {
                    text,
                    start_ms,
                    end_ms,
                    confidence,
                    is_final,
                }) => {
                    let segment = TranscriptSegment {
                        text,
                        start_ms,
                        end_ms,
                        confidence,
                        is_final,
                    };
                    match segment.validate() {
                        Ok(()) => Some(TranscriberEvent::Segment(segment)),
                        Err(reason) => Some(TranscriberEvent::ProtocolViolation(reason)),
                    }
                }
                Ok(TranscriberWireEvent::Error { code, message }) => {
                    Some(TranscriberEvent::Fatal { code, message })
                }
                Ok(TranscriberWireEvent::Complete) => Some(TranscriberEvent::Completed),
                Err(e) => Some(TranscriberEvent::ProtocolViolation(format!(
                    "unknown event: {} ({})",
                    text, e
                ))),
            }
        }
        ControlLine::Error { id, message } => Some(TranscriberEvent::Fatal { code: id, message }),
        ControlLine::Complete { .. } => Some(TranscriberEvent::Completed),
        ControlLine::Progress { .. } | ControlLine::LicenseRequired { .. } => None,
        ControlLine::Unrecognized(text) if text.is_empty() => None,
        ControlLine::Unrecognized(text) => {
            debug!("transcriber chatter: {}", text);
            None
        }
    }
}
