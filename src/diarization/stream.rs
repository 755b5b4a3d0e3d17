//! Streaming diarizer client
//!
//! Owns the diarizer worker process through the supervisor and turns its
//! line protocol into typed events on a broadcast channel (one sender, many
//! receivers: the aligner and the health monitor both subscribe).
//!
//! # Lifecycle
//!
//! `Uninit → Initializing → Ready → Running → (Paused → Running)* →
//! Stopping → Stopped | Failed`. A missing model or access token is a
//! terminal failure (`MODELS_MISSING` / `TOKEN_MISSING`): the stream
//! transitions to `Failed` and stays there. There is deliberately no
//! single-speaker stub to fall back to — downstream row creation is vetoed
//! instead, so a failure can never masquerade as a one-speaker meeting.

use crate::diarization::errors::{DiarizationError, Result};
use crate::diarization::types::{
    ClusteringParams, DiarizationSegment, DiarizerErrorCode, DiarizerState, DiarizerStats,
    DiarizerWireEvent, SpeakerCorrection,
};
use crate::worker::protocol::{parse_line, ControlLine};
use crate::worker::{WorkerExit, WorkerLine, WorkerRole, WorkerSpec, WorkerSupervisor};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Default executable name of the diarizer worker on PATH
pub const DIARIZER_EXECUTABLE: &str = "diarization-worker";

/// Deadline for a whole-file batch run
pub const BATCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Typed events fanned out to subscribers
#[derive(Debug, Clone)]
pub enum DiarizerEvent {
    Ready,
    Segment(DiarizationSegment),
    Correction(SpeakerCorrection),
    Stats(DiarizerStats),
    Progress {
        phase: String,
        percent: f32,
        message: String,
    },
    /// Terminal backend failure; the stream is `Failed` after this
    Fatal {
        code: DiarizerErrorCode,
        message: String,
    },
    /// Worker signalled end-of-stream
    Completed,
    /// Line that violated the protocol (kept visible for diagnosis)
    ProtocolViolation(String),
}

/// Streaming diarizer over a supervised worker process
pub struct StreamingDiarizer {
    supervisor: Arc<WorkerSupervisor>,
    params: ClusteringParams,
    state: Arc<Mutex<DiarizerState>>,
    events_tx: broadcast::Sender<DiarizerEvent>,
}

impl StreamingDiarizer {
    pub fn new(supervisor: Arc<WorkerSupervisor>, params: ClusteringParams) -> Self {
        let (events_tx, _) = broadcast::channel(512);
        Self {
            supervisor,
            params,
            state: Arc::new(Mutex::new(DiarizerState::Uninit)),
            events_tx,
        }
    }

    /// Subscribe to the event stream. Late subscribers only see events from
    /// the point of subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<DiarizerEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> DiarizerState {
        *self.state.lock().expect("diarizer state lock")
    }

    /// Spawn the worker in streaming mode and start pumping its events.
    /// Returns as soon as the process is up; readiness arrives as
    /// [`DiarizerEvent::Ready`].
    pub async fn start(&self, mut spec: WorkerSpec) -> Result<()> {
        self.transition(DiarizerState::Initializing)?;

        spec = spec
            .arg("--mode")
            .arg("stream")
            .arg("--min-speakers")
            .arg(self.params.min_speakers.to_string())
            .arg("--max-speakers")
            .arg(self.params.max_speakers.to_string())
            .arg("--similarity-threshold")
            .arg(self.params.similarity_threshold.to_string());
        spec = with_model_credentials(spec);

        let (line_tx, line_rx) = mpsc::channel(1024);
        self.supervisor
            .start(WorkerRole::Diarizer, spec, line_tx)
            .await?;

        let state = Arc::clone(&self.state);
        let events_tx = self.events_tx.clone();
        tokio::spawn(pump_lines(line_rx, state, events_tx));
        Ok(())
    }

    /// Feed 16 kHz mono s16le PCM to the worker.
    pub async fn push_pcm(&self, pcm: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state.lock().expect("diarizer state lock");
            match *state {
                DiarizerState::Ready => *state = DiarizerState::Running,
                DiarizerState::Running => {}
                DiarizerState::Paused => {
                    // Paused sessions buffer upstream; pushing here is a bug.
                    return Err(DiarizationError::InvalidTransition {
                        from: DiarizerState::Paused,
                        to: DiarizerState::Running,
                    });
                }
                other => {
                    return Err(DiarizationError::InvalidTransition {
                        from: other,
                        to: DiarizerState::Running,
                    })
                }
            }
        }
        self.supervisor
            .send(WorkerRole::Diarizer, pcm)
            .await
            .map_err(DiarizationError::from)
    }

    pub fn pause(&self) -> Result<()> {
        self.transition(DiarizerState::Paused)
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(DiarizerState::Running)
    }

    /// Drain and stop the worker. The exit status decides `Stopped` vs
    /// `Failed`. On a stream that already failed, the process is still
    /// reaped so no worker outlives the session.
    pub async fn stop(&self, grace: Duration) -> Result<WorkerExit> {
        if matches!(self.state(), DiarizerState::Failed | DiarizerState::Stopped) {
            if self.supervisor.is_running(WorkerRole::Diarizer).await {
                return Ok(self.supervisor.cancel(WorkerRole::Diarizer).await?);
            }
            // Reap the exited process entry if one is still tracked
            if let Ok(exit) = self.supervisor.stop(WorkerRole::Diarizer, grace).await {
                return Ok(exit);
            }
            return Ok(WorkerExit::Cancelled);
        }

        self.transition(DiarizerState::Stopping)?;
        let exit = self.supervisor.stop(WorkerRole::Diarizer, grace).await?;
        match &exit {
            WorkerExit::Failed { code, stderr_tail } => {
                self.force_state(DiarizerState::Failed);
                let _ = self.events_tx.send(DiarizerEvent::Fatal {
                    code: DiarizerErrorCode::Crashed,
                    message: format!("exit {}: {}", code, stderr_tail),
                });
            }
            _ => self.force_state(DiarizerState::Stopped),
        }
        Ok(exit)
    }

    fn transition(&self, to: DiarizerState) -> Result<()> {
        let mut state = self.state.lock().expect("diarizer state lock");
        if !state.can_transition_to(to) {
            return Err(DiarizationError::InvalidTransition { from: *state, to });
        }
        debug!("Diarizer {:?} -> {:?}", *state, to);
        *state = to;
        Ok(())
    }

    fn force_state(&self, to: DiarizerState) {
        *self.state.lock().expect("diarizer state lock") = to;
    }
}

/// Pass gated-model credentials through to the worker when present.
fn with_model_credentials(mut spec: WorkerSpec) -> WorkerSpec {
    if let Ok(token) = std::env::var("HF_TOKEN").or_else(|_| std::env::var("HUGGINGFACE_API_KEY"))
    {
        spec = spec.env("HF_TOKEN", token);
    }
    spec
}

/// Pump worker lines into typed events, driving the state machine.
async fn pump_lines(
    mut line_rx: mpsc::Receiver<WorkerLine>,
    state: Arc<Mutex<DiarizerState>>,
    events_tx: broadcast::Sender<DiarizerEvent>,
) {
    while let Some(line) = line_rx.recv().await {
        let event = match classify(&line.text) {
            Some(event) => event,
            None => continue,
        };

        match &event {
            DiarizerEvent::Ready => {
                let mut s = state.lock().expect("diarizer state lock");
                if s.can_transition_to(DiarizerState::Ready) {
                    *s = DiarizerState::Ready;
                    info!("Diarizer backend ready");
                } else {
                    warn!("Diarizer sent ready while {:?}", *s);
                }
            }
            DiarizerEvent::Fatal { code, message } => {
                warn!("Diarizer terminal error {}: {}", code, message);
                *state.lock().expect("diarizer state lock") = DiarizerState::Failed;
            }
            DiarizerEvent::Segment(segment) => {
                if let Err(reason) = segment.validate() {
                    warn!("Dropping invalid diarizer segment: {}", reason);
                    let _ = events_tx.send(DiarizerEvent::ProtocolViolation(reason));
                    continue;
                }
            }
            _ => {}
        }

        let _ = events_tx.send(event);
    }
}

/// Map one protocol line to an event; `None` for ignorable chatter.
fn classify(text: &str) -> Option<DiarizerEvent> {
    match parse_line(text) {
        ControlLine::Event { payload, .. } => {
            match serde_json::from_value::<DiarizerWireEvent>(payload) {
                Ok(DiarizerWireEvent::Ready) => Some(DiarizerEvent::Ready),
                Ok(DiarizerWireEvent::Segment {
                    speaker_id,
                    start_ms,
                    end_ms,
                    confidence,
                    overlapping_speakers,
                }) => Some(DiarizerEvent::Segment(DiarizationSegment {
                    speaker_id,
                    start_ms,
                    end_ms,
                    confidence,
                    overlapping_speakers,
                })),
                Ok(DiarizerWireEvent::Correction {
                    start_ms,
                    end_ms,
                    new_speaker_id,
                }) => Some(DiarizerEvent::Correction(SpeakerCorrection {
                    start_ms,
                    end_ms,
                    new_speaker_id,
                })),
                Ok(DiarizerWireEvent::Stats {
                    per_speaker_total_ms,
                    segment_count,
                }) => Some(DiarizerEvent::Stats(DiarizerStats {
                    per_speaker_total_ms,
                    segment_count,
                })),
                Ok(DiarizerWireEvent::Error { code, message }) => {
                    Some(DiarizerEvent::Fatal { code, message })
                }
                Ok(DiarizerWireEvent::Complete) => Some(DiarizerEvent::Completed),
                Err(e) => Some(DiarizerEvent::ProtocolViolation(format!(
                    "unknown event: {} ({})",
                    text, e
                ))),
            }
        }
        ControlLine::Progress {
            phase,
            percent,
            message,
        } => Some(DiarizerEvent::Progress {
            phase,
            percent,
            message,
        }),
        ControlLine::Error { id, message } => {
            let code = match id.as_str() {
                "models" => DiarizerErrorCode::ModelsMissing,
                "token" => DiarizerErrorCode::TokenMissing,
                _ => DiarizerErrorCode::InitFailed,
            };
            Some(DiarizerEvent::Fatal { code, message })
        }
        ControlLine::LicenseRequired { id, url } => Some(DiarizerEvent::Fatal {
            code: DiarizerErrorCode::TokenMissing,
            message: format!("model {} requires license acceptance: {}", id, url),
        }),
        ControlLine::Complete { .. } => Some(DiarizerEvent::Completed),
        ControlLine::Unrecognized(text) if text.is_empty() => None,
        ControlLine::Unrecognized(text) => {
            debug!("diarizer chatter: {}", text);
            None
        }
    }
}

/// Run the diarizer over a whole file and collect every segment. Used by
/// post-meeting recovery; corrections are folded in before returning.
pub async fn run_batch(
    supervisor: &WorkerSupervisor,
    mut spec: WorkerSpec,
    audio_path: &std::path::Path,
    params: ClusteringParams,
    cancel: &CancellationToken,
) -> Result<Vec<DiarizationSegment>> {
    spec = spec
        .arg("--mode")
        .arg("batch")
        .arg("--audio")
        .arg(audio_path.to_string_lossy().to_string())
        .arg("--min-speakers")
        .arg(params.min_speakers.to_string())
        .arg("--max-speakers")
        .arg(params.max_speakers.to_string())
        .arg("--similarity-threshold")
        .arg(params.similarity_threshold.to_string());
    spec = with_model_credentials(spec);

    let (line_tx, mut line_rx) = mpsc::channel(1024);
    supervisor
        .start(WorkerRole::Diarizer, spec, line_tx)
        .await?;

    let mut segments: Vec<DiarizationSegment> = Vec::new();
    let deadline = tokio::time::sleep(BATCH_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match classify(&line.text) {
                    Some(DiarizerEvent::Segment(segment)) => segments.push(segment),
                    Some(DiarizerEvent::Correction(c)) => apply_correction(&mut segments, &c),
                    Some(DiarizerEvent::Fatal { code, message }) => {
                        let _ = supervisor.cancel(WorkerRole::Diarizer).await;
                        return Err(DiarizationError::from_code(code, message));
                    }
                    Some(DiarizerEvent::Completed) => break,
                    _ => {}
                }
            }
            _ = cancel.cancelled() => {
                let _ = supervisor.cancel(WorkerRole::Diarizer).await;
                return Err(DiarizationError::Cancelled);
            }
            _ = &mut deadline => {
                let _ = supervisor.cancel(WorkerRole::Diarizer).await;
                return Err(DiarizationError::TimedOut(BATCH_TIMEOUT));
            }
        }
    }

    match supervisor.stop(WorkerRole::Diarizer, Duration::from_secs(5)).await? {
        WorkerExit::Ok | WorkerExit::Cancelled => {}
        WorkerExit::Failed { code, stderr_tail } => {
            return Err(DiarizationError::Crashed { code, stderr_tail });
        }
    }

    segments.sort_by_key(|s| s.start_ms);
    info!("Batch diarization produced {} segments", segments.len());
    Ok(segments)
}

/// Apply a retroactive re-label to the collected segments in place.
fn apply_correction(segments: &mut [DiarizationSegment], correction: &SpeakerCorrection) {
    for segment in segments.iter_mut() {
        if segment.start_ms < correction.end_ms && segment.end_ms > correction.start_ms {
            segment.speaker_id = correction.new_speaker_id.clone();
        }
    }
}
