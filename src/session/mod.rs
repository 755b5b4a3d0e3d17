//! Session orchestration
//!
//! Owns the recording-session state machine and the wiring between the
//! sanitizer, worker supervisor, diarizer and transcriber streams, aligner,
//! stores, health monitor, and insight engine. All session-scoped mutable
//! state — the speaker map, the alignment buffer, the state machine — lives
//! here and is mutated only through `&mut self`, so transitions are
//! total-order by construction; other components communicate with the
//! session through typed channels.
//!
//! The shell drives it: feed PCM while recording, call [`SessionOrchestrator::drive`]
//! from its event loop to drain pending worker events, and call `stop` to
//! finalize. Post-recording recovery (re-running diarization over the full
//! file when the live run was degraded) is [`run_post_recovery`].

use crate::alignment::{AlignedRow, AlignmentMode, AlignmentOutcome, AlignerConfig, TemporalAligner};
use crate::audio::wav;
use crate::config::Config;
use crate::diarization::stream::{run_batch, DiarizerEvent, StreamingDiarizer};
use crate::diarization::types::{ClusteringParams, BATCH_SIMILARITY_THRESHOLD};
use crate::diarization::DiarizationError;
use crate::health::{HealthMonitor, HealthState};
use crate::insights::{InsightEngine, UnifiedInsightsResult};
use crate::llm::ProviderRouter;
use crate::storage::{
    FailureKind, FailureStore, MeetingStatus, MeetingStore, NewRow, NoteStore, SettingsStore,
    SpeakerStore, StoreError, TranscriptStore,
};
use crate::transcription::stream::{StreamingTranscriber, TranscriberEvent};
use crate::transcription::TranscriptionError;
use crate::worker::{WorkerSpec, WorkerSupervisor};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace given to workers on stop before escalation
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Recording,
    Paused,
    Finalizing,
    Stopped,
    Failed,
}

impl SessionState {
    fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Preparing)
                | (Preparing, Recording)
                | (Preparing, Failed)
                | (Recording, Paused)
                | (Recording, Finalizing)
                | (Recording, Failed)
                | (Paused, Recording)
                | (Paused, Finalizing)
                | (Finalizing, Stopped)
                | (Finalizing, Failed)
                | (Stopped, Idle)
                | (Failed, Idle)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("No active session")]
    NoActiveSession,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Diarization(#[from] DiarizationError),

    #[error(transparent)]
    Transcription(#[from] TranscriptionError),

    #[error("WAV error: {0}")]
    Wav(#[from] wav::WavError),
}

/// What `stop` hands back to the shell
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub meeting_id: String,
    pub duration_ms: u64,
    pub audio_file_path: Option<String>,
    pub notes_persisted: usize,
    pub tasks_created: usize,
    pub diarization_state: HealthState,
    pub recovery_scheduled: bool,
    pub rows_persisted: u64,
    pub insights: Option<UnifiedInsightsResult>,
}

struct ActiveSession {
    meeting_id: String,
    started_at: Instant,
    diarizer: StreamingDiarizer,
    transcriber: StreamingTranscriber,
    diarizer_events: broadcast::Receiver<DiarizerEvent>,
    transcriber_events: broadcast::Receiver<TranscriberEvent>,
    aligner: TemporalAligner,
    monitor: HealthMonitor,
    insights: Option<InsightEngine>,
    /// Session-local diarizer label -> database speaker id; discarded on
    /// session end
    speaker_map: HashMap<String, i64>,
    cancel: CancellationToken,
    audio_file_path: Option<PathBuf>,
    rows_persisted: u64,
}

/// Owns one recording session at a time and the handles to every service
/// it wires together. Tests inject fakes by pointing the worker specs at
/// scripted executables and registering scripted providers on the router.
pub struct SessionOrchestrator {
    config: Config,
    supervisor: Arc<WorkerSupervisor>,
    router: Arc<ProviderRouter>,

    meetings: MeetingStore,
    transcripts: TranscriptStore,
    speakers: SpeakerStore,
    notes: NoteStore,
    settings: SettingsStore,
    failures: FailureStore,

    diarizer_spec: WorkerSpec,
    transcriber_spec: WorkerSpec,

    state: SessionState,
    active: Option<ActiveSession>,
}

impl SessionOrchestrator {
    pub fn new(
        config: Config,
        pool: SqlitePool,
        supervisor: Arc<WorkerSupervisor>,
        router: Arc<ProviderRouter>,
        diarizer_spec: WorkerSpec,
        transcriber_spec: WorkerSpec,
    ) -> Self {
        Self {
            config,
            supervisor,
            router,
            meetings: MeetingStore::new(pool.clone()),
            transcripts: TranscriptStore::new(pool.clone()),
            speakers: SpeakerStore::new(pool.clone()),
            notes: NoteStore::new(pool.clone()),
            settings: SettingsStore::new(pool.clone()),
            failures: FailureStore::new(pool),
            diarizer_spec,
            transcriber_spec,
            state: SessionState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!("Session {:?} -> {:?}", self.state, to);
        self.state = to;
        Ok(())
    }

    /// Start a session: create the meeting, spawn both workers, arm the
    /// monitor, and opt into live insights if requested.
    pub async fn start(
        &mut self,
        title: String,
        live_insights: bool,
    ) -> Result<String, SessionError> {
        self.transition(SessionState::Preparing)?;

        // Sanitize the working directory up front so a half-written capture
        // from a crashed session cannot poison this one
        let recordings_root = self.config.data_dir.join("recordings");
        if let Err(e) = std::fs::create_dir_all(&recordings_root) {
            self.state = SessionState::Failed;
            return Err(SessionError::Store(StoreError::Database(format!(
                "create recordings dir: {}",
                e
            ))));
        }

        let meeting = self.meetings.create(title).await?;
        self.meetings
            .set_status(&meeting.id, MeetingStatus::Recording)
            .await?;

        let params = ClusteringParams {
            min_speakers: self.config.diarization.min_speakers,
            max_speakers: self.config.diarization.max_speakers,
            similarity_threshold: self.config.diarization.similarity_threshold,
        };
        let diarizer = StreamingDiarizer::new(Arc::clone(&self.supervisor), params);
        let diarizer_events = diarizer.subscribe();
        diarizer.start(self.diarizer_spec.clone()).await?;

        let transcriber = StreamingTranscriber::new(
            Arc::clone(&self.supervisor),
            self.config.transcription.clone(),
        );
        let transcriber_events = transcriber.subscribe();
        transcriber.start(self.transcriber_spec.clone(), 0).await?;

        let monitor = HealthMonitor::new(
            meeting.id.clone(),
            self.failures.clone(),
            self.settings.clone(),
        );

        let insights = live_insights.then(|| {
            InsightEngine::new(
                meeting.id.clone(),
                Arc::clone(&self.router),
                self.notes.clone(),
                self.config.insights.clone(),
            )
        });

        self.active = Some(ActiveSession {
            meeting_id: meeting.id.clone(),
            started_at: Instant::now(),
            diarizer,
            transcriber,
            diarizer_events,
            transcriber_events,
            aligner: TemporalAligner::new(AlignerConfig::default()),
            monitor,
            insights,
            speaker_map: HashMap::new(),
            cancel: CancellationToken::new(),
            audio_file_path: None,
            rows_persisted: 0,
        });

        self.transition(SessionState::Recording)?;
        Ok(meeting.id)
    }

    /// Fan PCM out to both workers. Audio capture must never block on the
    /// database or the LLM; this path touches neither.
    pub async fn feed_pcm(&mut self, pcm: Vec<u8>) -> Result<(), SessionError> {
        if self.state != SessionState::Recording {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: SessionState::Recording,
            });
        }
        let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        session.diarizer.push_pcm(pcm.clone()).await?;
        session.transcriber.push_pcm(pcm).await?;
        Ok(())
    }

    /// Where the shell is writing the session's WAV file.
    pub fn set_audio_file_path(&mut self, path: PathBuf) -> Result<(), SessionError> {
        let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        session.audio_file_path = Some(path);
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Paused)?;
        let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        session.diarizer.pause()?;
        session.transcriber.pause();
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Recording)?;
        let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
        session.diarizer.resume()?;
        session.transcriber.resume();
        Ok(())
    }

    /// Drain pending worker events and run due work: alignment, row
    /// persistence, monitor bookkeeping, insight batching. Call this from
    /// the shell's event loop while recording.
    pub async fn drive(&mut self) -> Result<(), SessionError> {
        let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;

        // Diarizer events first: corrections must be applied before any row
        // that would overlap them is persisted
        loop {
            match session.diarizer_events.try_recv() {
                Ok(event) => {
                    Self::handle_diarizer_event(
                        session,
                        &self.transcripts,
                        &self.speakers,
                        &self.settings,
                        event,
                    )
                    .await?;
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Diarizer event stream lagged by {}", skipped);
                }
            }
        }

        loop {
            match session.transcriber_events.try_recv() {
                Ok(event) => {
                    Self::handle_transcriber_event(
                        session,
                        &self.transcripts,
                        &self.speakers,
                        &self.failures,
                        event,
                    )
                    .await?;
                }
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Transcriber event stream lagged by {}", skipped);
                }
            }
        }

        session.monitor.tick();

        // Live insight batching; a failed batch is logged, the next one
        // retries the text via the overlap tail
        if let Some(insights) = session.insights.as_mut() {
            if let Err(e) = insights.maybe_flush(&session.cancel).await {
                warn!("Live insight batch failed: {}", e);
            }
        }
        Ok(())
    }

    async fn handle_diarizer_event(
        session: &mut ActiveSession,
        transcripts: &TranscriptStore,
        speakers: &SpeakerStore,
        settings: &SettingsStore,
        event: DiarizerEvent,
    ) -> Result<(), SessionError> {
        session.monitor.observe(&event).await?;

        match event {
            DiarizerEvent::Segment(segment) => {
                // Lazily register the speaker identity for this label
                if !session.speaker_map.contains_key(&segment.speaker_id) {
                    let speaker = speakers
                        .ensure_for_label(&session.meeting_id, &segment.speaker_id)
                        .await?;
                    session
                        .speaker_map
                        .insert(segment.speaker_id.clone(), speaker.id);
                }
                session.aligner.push_segment(segment);

                // Diarizer catch-up may unblock parked text
                let resolved = session.aligner.retry_pending();
                Self::persist_rows(session, transcripts, speakers, resolved).await?;
            }
            DiarizerEvent::Correction(correction) => {
                session.aligner.apply_correction(&correction);
                // Already-persisted rows get the speaker change in place
                transcripts
                    .update_speaker_for_range(
                        &session.meeting_id,
                        correction.start_ms,
                        correction.end_ms,
                        &correction.new_speaker_id,
                    )
                    .await?;
                let resolved = session.aligner.retry_pending();
                Self::persist_rows(session, transcripts, speakers, resolved).await?;
            }
            DiarizerEvent::Fatal { .. } => {
                // The monitor recorded the failure; mirror its verdict into
                // the aligner so row creation stops (or degrades to the
                // sentinel under the acknowledged mode)
                let mode = if settings.transcription_only_acknowledged().await? {
                    AlignmentMode::TranscriptionOnly
                } else {
                    AlignmentMode::Vetoed
                };
                session.aligner.set_mode(mode);
                // Text parked before the failure settles under the new mode
                let resolved = session.aligner.retry_pending();
                Self::persist_rows(session, transcripts, speakers, resolved).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_transcriber_event(
        session: &mut ActiveSession,
        transcripts: &TranscriptStore,
        speakers: &SpeakerStore,
        failures: &FailureStore,
        event: TranscriberEvent,
    ) -> Result<(), SessionError> {
        match event {
            TranscriberEvent::Segment(segment) if segment.is_final => {
                match session.aligner.align(&segment) {
                    AlignmentOutcome::Rows(rows) => {
                        Self::persist_rows(session, transcripts, speakers, rows).await?;
                    }
                    AlignmentOutcome::Pending => {}
                    AlignmentOutcome::Refused(missing) => {
                        failures
                            .append(
                                FailureKind::InsufficientCoverage,
                                Some(&session.meeting_id),
                                &format!(
                                    "refused transcript rows for [{}ms, {}ms]: coverage {:.2}",
                                    missing.start_ms, missing.end_ms, missing.coverage
                                ),
                                None,
                            )
                            .await?;
                    }
                }
            }
            // Non-final segments are provisional; a later final covering
            // the range replaces them
            TranscriberEvent::Segment(_) => {}
            TranscriberEvent::Fatal { code, message } => {
                failures
                    .append(
                        FailureKind::WorkerCrashed,
                        Some(&session.meeting_id),
                        &format!("transcriber {}: {}", code, message),
                        None,
                    )
                    .await?;
            }
            TranscriberEvent::ProtocolViolation(detail) => {
                warn!("Transcriber protocol violation: {}", detail);
            }
            TranscriberEvent::Ready | TranscriberEvent::Completed => {}
        }
        Ok(())
    }

    async fn persist_rows(
        session: &mut ActiveSession,
        transcripts: &TranscriptStore,
        speakers: &SpeakerStore,
        rows: Vec<AlignedRow>,
    ) -> Result<(), SessionError> {
        for row in rows {
            if !session.speaker_map.contains_key(&row.speaker_id) {
                let speaker = speakers
                    .ensure_for_label(&session.meeting_id, &row.speaker_id)
                    .await?;
                session
                    .speaker_map
                    .insert(row.speaker_id.clone(), speaker.id);
            }
            let stored = transcripts
                .create(NewRow::from_aligned(&session.meeting_id, row))
                .await?;
            session.rows_persisted += 1;
            // The insight engine observes rows in persistence order
            if let Some(insights) = session.insights.as_mut() {
                insights.push_row(&stored);
            }
        }
        Ok(())
    }

    /// Batch variant used when settling the pending queue at stop: the
    /// whole settled set lands in one transaction, so a failure partway
    /// cannot leave a truncated tail of the meeting persisted.
    async fn persist_rows_atomic(
        session: &mut ActiveSession,
        transcripts: &TranscriptStore,
        speakers: &SpeakerStore,
        rows: Vec<AlignedRow>,
    ) -> Result<(), SessionError> {
        if rows.is_empty() {
            return Ok(());
        }
        for row in &rows {
            if !session.speaker_map.contains_key(&row.speaker_id) {
                let speaker = speakers
                    .ensure_for_label(&session.meeting_id, &row.speaker_id)
                    .await?;
                session
                    .speaker_map
                    .insert(row.speaker_id.clone(), speaker.id);
            }
        }

        let new_rows = rows
            .into_iter()
            .map(|row| NewRow::from_aligned(&session.meeting_id, row))
            .collect();
        let stored = transcripts.create_batch(new_rows).await?;
        session.rows_persisted += stored.len() as u64;
        for row in &stored {
            if let Some(insights) = session.insights.as_mut() {
                insights.push_row(row);
            }
        }
        Ok(())
    }

    /// Stop the session: drain workers, settle pending alignment, finalize
    /// insights, register the recording, and schedule recovery when the
    /// diarizer was not healthy.
    pub async fn stop(&mut self) -> Result<SessionSummary, SessionError> {
        self.transition(SessionState::Finalizing)?;

        // Cancel in-flight LLM work before waiting on workers
        if let Some(session) = self.active.as_ref() {
            session.cancel.cancel();
        }

        // Drain both workers, then pull every event they flushed on exit
        {
            let session = self.active.as_mut().ok_or(SessionError::NoActiveSession)?;
            if let Err(e) = session.transcriber.stop(STOP_GRACE).await {
                warn!("Transcriber stop: {}", e);
            }
            if let Err(e) = session.diarizer.stop(STOP_GRACE).await {
                warn!("Diarizer stop: {}", e);
            }
        }
        self.drive().await?;

        let transcription_only = self.settings.transcription_only_acknowledged().await?;
        let mut session = self.active.take().ok_or(SessionError::NoActiveSession)?;

        // Settle the pending queue: rows that never got coverage are
        // dropped, unless the user acknowledged transcription-only
        let (rows, dropped) = session.aligner.finalize(transcription_only);
        if !dropped.is_empty() {
            self.failures
                .append(
                    FailureKind::InsufficientCoverage,
                    Some(&session.meeting_id),
                    &format!(
                        "dropped {} uncovered text segments at session stop",
                        dropped.len()
                    ),
                    None,
                )
                .await?;
        }
        Self::persist_rows_atomic(&mut session, &self.transcripts, &self.speakers, rows).await?;

        // Insight finalization over the full transcript, fresh token (the
        // session token was cancelled above to abort live batches)
        let insights_result = match session.insights.as_mut() {
            Some(engine) => {
                let all_rows = self
                    .transcripts
                    .get_by_meeting_paginated(&session.meeting_id, u32::MAX, 0)
                    .await?;
                Some(engine.finalize_meeting(&all_rows, &CancellationToken::new()).await)
            }
            None => None,
        };

        // Register the recording; the sanitizer runs before any reader
        let mut audio_file_path = None;
        if let Some(path) = &session.audio_file_path {
            match wav::sanitize(path) {
                Ok(info) => {
                    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                    let now = chrono::Utc::now();
                    let started = now
                        - chrono::Duration::milliseconds(info.duration_ms() as i64);
                    self.meetings
                        .add_recording(
                            &session.meeting_id,
                            &path.to_string_lossy(),
                            info.duration_ms(),
                            file_size,
                            started,
                            now,
                        )
                        .await?;
                    self.meetings
                        .set_audio_file_path(&session.meeting_id, &path.to_string_lossy())
                        .await?;
                    audio_file_path = Some(path.to_string_lossy().to_string());
                }
                Err(e) => {
                    error!("WAV sanitize failed for {:?}: {}", path, e);
                    self.failures
                        .append(
                            FailureKind::InvalidWavHeader,
                            Some(&session.meeting_id),
                            &e.to_string(),
                            None,
                        )
                        .await?;
                }
            }
        }

        let status_result = self
            .meetings
            .set_status(&session.meeting_id, MeetingStatus::Stopped)
            .await;
        if let Err(e) = status_result {
            // Stopped -> Failed is the one allowed regression path
            error!("Failed to mark meeting stopped: {}", e);
            let _ = self
                .meetings
                .set_status(&session.meeting_id, MeetingStatus::Failed)
                .await;
            self.state = SessionState::Failed;
            return Err(SessionError::Store(e));
        }

        let recovery_scheduled = session.monitor.recovery_needed() && audio_file_path.is_some();
        let summary = SessionSummary {
            meeting_id: session.meeting_id.clone(),
            duration_ms: session.started_at.elapsed().as_millis() as u64,
            audio_file_path,
            notes_persisted: insights_result
                .as_ref()
                .map(|r| r.notes_persisted)
                .unwrap_or(0),
            tasks_created: insights_result
                .as_ref()
                .map(|r| r.tasks_created)
                .unwrap_or(0),
            diarization_state: session.monitor.state(),
            recovery_scheduled,
            rows_persisted: session.rows_persisted,
            insights: insights_result,
        };

        self.transition(SessionState::Stopped)?;
        self.transition(SessionState::Idle)?;
        info!(
            "Session stopped: meeting {}, {} rows, diarization {:?}, recovery {}",
            summary.meeting_id,
            summary.rows_persisted,
            summary.diarization_state,
            summary.recovery_scheduled
        );
        Ok(summary)
    }
}

/// Post-recording recovery: run the diarizer over the full WAV in batch
/// mode and re-attribute the stored rows. Idempotent — re-running produces
/// the same labels, and rows that already match are left untouched.
pub async fn run_post_recovery(
    supervisor: &WorkerSupervisor,
    diarizer_spec: WorkerSpec,
    transcripts: &TranscriptStore,
    meeting_id: &str,
    audio_path: &std::path::Path,
    mut params: ClusteringParams,
    cancel: &CancellationToken,
) -> Result<u64, SessionError> {
    // The sanitizer runs before any reader, including the batch worker
    wav::sanitize(audio_path)?;

    params.similarity_threshold = BATCH_SIMILARITY_THRESHOLD;
    let segments = run_batch(supervisor, diarizer_spec, audio_path, params, cancel).await?;
    if segments.is_empty() {
        warn!("Recovery diarization produced no segments for {}", meeting_id);
        return Ok(0);
    }

    let rows = transcripts
        .get_by_meeting_paginated(meeting_id, u32::MAX, 0)
        .await?;

    let mut relabeled = 0;
    for row in rows {
        // Dominant speaker for the row's interval under the batch labels
        let mut per_speaker: HashMap<&str, u64> = HashMap::new();
        for segment in &segments {
            let start = segment.start_ms.max(row.start_ms);
            let end = segment.end_ms.min(row.end_ms);
            if end > start {
                *per_speaker.entry(segment.speaker_id.as_str()).or_default() += end - start;
            }
        }
        let Some((dominant, _)) = per_speaker
            .into_iter()
            .max_by_key(|(speaker, overlap)| (*overlap, std::cmp::Reverse(speaker.to_string())))
        else {
            continue;
        };

        if dominant != row.speaker_id {
            relabeled += transcripts
                .update_speaker_for_range(meeting_id, row.start_ms, row.end_ms, dominant)
                .await?;
        }
    }

    info!(
        "Post-recording recovery for {} relabeled {} rows",
        meeting_id, relabeled
    );
    Ok(relabeled)
}
