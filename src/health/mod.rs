//! Diarization failure and health monitoring
//!
//! Watches the diarizer event stream and the alignment gap for one meeting
//! and keeps a rolling health state. Its one hard job is making failure
//! impossible to miss: a diarizer error appends a failure event, emits a
//! user-facing notification with remediation steps, and vetoes transcript
//! row creation. The veto stands until the user has explicitly acknowledged
//! transcription-only mode — there is no silent path to a one-speaker
//! transcript.
//!
//! The monitor never synthesizes diarization data. It also watches for the
//! shape silent fallback would take if it slipped in anyway: a single
//! speaker for a long stretch of a meeting that shows concurrent-speech
//! cues demotes health to degraded.

use crate::diarization::stream::DiarizerEvent;
use crate::diarization::types::DiarizerErrorCode;
use crate::storage::{FailureKind, FailureStore, SettingsStore, StoreError};
use log::{error, info, warn};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// No finalized segment for this long after `ready` means degraded
pub const SEGMENT_GAP_LIMIT: Duration = Duration::from_secs(60);

/// A lone speaker beyond this, with concurrent-speech cues, means degraded
pub const SINGLE_SPEAKER_WINDOW: Duration = Duration::from_secs(600);

/// Rolling per-meeting health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

/// User-facing failure notification with actionable remediation
#[derive(Debug, Clone)]
pub struct HealthNotification {
    pub meeting_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub remediation: Vec<String>,
}

/// Remediation steps keyed to the failure, shown verbatim in the shell.
pub fn remediation_steps(kind: FailureKind) -> Vec<String> {
    match kind {
        FailureKind::ModelsMissing => vec![
            "Download the diarization models from the model manager".to_string(),
            "Check that the models directory is readable".to_string(),
            "Restart the recording once models are in place".to_string(),
        ],
        FailureKind::TokenMissing => vec![
            "Set HF_TOKEN in the environment or in userData/.env".to_string(),
            "Accept the gated-model license on the model page".to_string(),
            "Restart the recording after setting the token".to_string(),
        ],
        FailureKind::WorkerCrashed | FailureKind::WorkerInitFailed => vec![
            "Check the failure log for the worker's last output".to_string(),
            "Verify the worker binary is installed and executable".to_string(),
            "Restart the recording; a post-meeting recovery run is scheduled automatically"
                .to_string(),
        ],
        FailureKind::DiskFull => vec![
            "Free disk space under the application data directory".to_string(),
            "The session was stopped to avoid losing audio".to_string(),
        ],
        _ => vec!["See the failure log for details".to_string()],
    }
}

fn failure_kind_for(code: DiarizerErrorCode) -> FailureKind {
    match code {
        DiarizerErrorCode::ModelsMissing => FailureKind::ModelsMissing,
        DiarizerErrorCode::TokenMissing => FailureKind::TokenMissing,
        DiarizerErrorCode::InitFailed => FailureKind::WorkerInitFailed,
        DiarizerErrorCode::Crashed => FailureKind::WorkerCrashed,
    }
}

/// Per-meeting monitor over the diarizer protocol and alignment gap
pub struct HealthMonitor {
    meeting_id: String,
    failures: FailureStore,
    settings: SettingsStore,
    notifications_tx: broadcast::Sender<HealthNotification>,

    state: HealthState,
    ready_at: Option<Instant>,
    last_segment_at: Option<Instant>,
    first_segment_at: Option<Instant>,
    speakers_seen: HashSet<String>,
    concurrent_speech_cues: bool,
    veto_active: bool,
    last_error: Option<FailureKind>,
}

impl HealthMonitor {
    pub fn new(meeting_id: String, failures: FailureStore, settings: SettingsStore) -> Self {
        let (notifications_tx, _) = broadcast::channel(64);
        Self {
            meeting_id,
            failures,
            settings,
            notifications_tx,
            state: HealthState::Healthy,
            ready_at: None,
            last_segment_at: None,
            first_segment_at: None,
            speakers_seen: HashSet::new(),
            concurrent_speech_cues: false,
            veto_active: false,
            last_error: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthNotification> {
        self.notifications_tx.subscribe()
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn last_error(&self) -> Option<FailureKind> {
        self.last_error
    }

    /// Is transcript row creation currently vetoed?
    pub fn veto_active(&self) -> bool {
        self.veto_active
    }

    pub fn speaker_count(&self) -> usize {
        self.speakers_seen.len()
    }

    /// Digest one diarizer event.
    pub async fn observe(&mut self, event: &DiarizerEvent) -> Result<(), StoreError> {
        self.observe_at(event, Instant::now()).await
    }

    /// Same as [`observe`](Self::observe) with an injectable clock.
    pub async fn observe_at(
        &mut self,
        event: &DiarizerEvent,
        now: Instant,
    ) -> Result<(), StoreError> {
        match event {
            DiarizerEvent::Ready => {
                self.ready_at = Some(now);
                info!("Diarizer ready for meeting {}", self.meeting_id);
            }
            DiarizerEvent::Segment(segment) => {
                self.last_segment_at = Some(now);
                self.first_segment_at.get_or_insert(now);
                self.speakers_seen.insert(segment.speaker_id.clone());
                if segment
                    .overlapping_speakers
                    .as_ref()
                    .is_some_and(|o| !o.is_empty())
                {
                    self.concurrent_speech_cues = true;
                    for other in segment.overlapping_speakers.iter().flatten() {
                        self.speakers_seen.insert(other.clone());
                    }
                }
                // A flowing segment stream recovers a degraded state, never
                // an unavailable one
                if self.state == HealthState::Degraded {
                    self.state = HealthState::Healthy;
                }
            }
            DiarizerEvent::Correction(_) | DiarizerEvent::Stats(_) => {}
            DiarizerEvent::Fatal { code, message } => {
                self.record_failure(failure_kind_for(*code), message, None)
                    .await?;
            }
            DiarizerEvent::ProtocolViolation(detail) => {
                warn!(
                    "Diarizer protocol violation in meeting {}: {}",
                    self.meeting_id, detail
                );
            }
            DiarizerEvent::Progress { .. } | DiarizerEvent::Completed => {}
        }
        Ok(())
    }

    /// Record a terminal diarizer failure: failure event, notification,
    /// state unavailable, veto on (unless transcription-only acknowledged).
    pub async fn record_failure(
        &mut self,
        kind: FailureKind,
        message: &str,
        raw_output: Option<&str>,
    ) -> Result<(), StoreError> {
        error!(
            "Diarization failure in meeting {}: {} ({})",
            self.meeting_id,
            message,
            kind.as_str()
        );

        self.failures
            .append(kind, Some(&self.meeting_id), message, raw_output)
            .await?;

        self.state = HealthState::Unavailable;
        self.last_error = Some(kind);

        let acknowledged = self.settings.transcription_only_acknowledged().await?;
        self.veto_active = !acknowledged;
        if acknowledged {
            warn!(
                "Diarization unavailable for meeting {}; continuing transcription-only per user acknowledgement",
                self.meeting_id
            );
        } else {
            warn!(
                "Diarization unavailable for meeting {}; transcript row creation is vetoed",
                self.meeting_id
            );
        }

        let _ = self.notifications_tx.send(HealthNotification {
            meeting_id: self.meeting_id.clone(),
            kind,
            message: message.to_string(),
            remediation: remediation_steps(kind),
        });
        Ok(())
    }

    /// Periodic check of the time-based degradation rules.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        if self.state == HealthState::Unavailable {
            return;
        }

        // Silent stall: ready but nothing finalized for too long
        if let Some(ready_at) = self.ready_at {
            let last_activity = self.last_segment_at.unwrap_or(ready_at);
            if now.duration_since(last_activity) > SEGMENT_GAP_LIMIT {
                if self.state != HealthState::Degraded {
                    warn!(
                        "Diarizer for meeting {} has produced no segments for {:?}; degraded",
                        self.meeting_id, SEGMENT_GAP_LIMIT
                    );
                }
                self.state = HealthState::Degraded;
                return;
            }
        }

        // The shape silent fallback would take: one voice for a long time
        // in a meeting the backend itself flagged for overlapped speech.
        // One speaker with no cues stays healthy; monologues are real.
        if self.speakers_seen.len() == 1 && self.concurrent_speech_cues {
            if let Some(first) = self.first_segment_at {
                if now.duration_since(first) > SINGLE_SPEAKER_WINDOW {
                    if self.state != HealthState::Degraded {
                        warn!(
                            "Meeting {} shows concurrent-speech cues but only one speaker for {:?}; degraded",
                            self.meeting_id, SINGLE_SPEAKER_WINDOW
                        );
                    }
                    self.state = HealthState::Degraded;
                }
            }
        }
    }

    /// Should session stop schedule the post-recording recovery job?
    pub fn recovery_needed(&self) -> bool {
        self.state != HealthState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diarization::types::DiarizationSegment;
    use crate::storage::open_memory;

    async fn monitor() -> HealthMonitor {
        let pool = open_memory().await;
        let meetings = crate::storage::MeetingStore::new(pool.clone());
        let meeting = meetings.create("Test".to_string()).await.unwrap();
        HealthMonitor::new(
            meeting.id,
            FailureStore::new(pool.clone()),
            SettingsStore::new(pool),
        )
    }

    fn segment(speaker: &str, start_ms: u64, overlapping: Option<Vec<String>>) -> DiarizerEvent {
        DiarizerEvent::Segment(DiarizationSegment {
            speaker_id: speaker.to_string(),
            start_ms,
            end_ms: start_ms + 2_000,
            confidence: 0.9,
            overlapping_speakers: overlapping,
        })
    }

    #[tokio::test]
    async fn fatal_event_vetoes_and_notifies_with_remediation() {
        let mut monitor = monitor().await;
        let mut notifications = monitor.subscribe();

        monitor
            .observe(&DiarizerEvent::Fatal {
                code: DiarizerErrorCode::TokenMissing,
                message: "set HF_TOKEN".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(monitor.state(), HealthState::Unavailable);
        assert!(monitor.veto_active());

        let notification = notifications.try_recv().expect("notification emitted");
        assert_eq!(notification.kind, FailureKind::TokenMissing);
        assert!(notification
            .remediation
            .iter()
            .any(|step| step.contains("HF_TOKEN")));
    }

    #[tokio::test]
    async fn acknowledged_transcription_only_lifts_the_veto() {
        let pool = open_memory().await;
        let meetings = crate::storage::MeetingStore::new(pool.clone());
        let meeting = meetings.create("Acked".to_string()).await.unwrap();
        let settings = SettingsStore::new(pool.clone());
        settings.acknowledge_transcription_only().await.unwrap();

        let mut monitor =
            HealthMonitor::new(meeting.id, FailureStore::new(pool.clone()), settings);
        monitor
            .observe(&DiarizerEvent::Fatal {
                code: DiarizerErrorCode::ModelsMissing,
                message: "weights not found".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(monitor.state(), HealthState::Unavailable);
        assert!(!monitor.veto_active());
        assert!(monitor.recovery_needed());
    }

    #[tokio::test]
    async fn segment_gap_degrades_then_segments_recover() {
        let mut monitor = monitor().await;
        let t0 = Instant::now();

        monitor
            .observe_at(&DiarizerEvent::Ready, t0)
            .await
            .unwrap();
        monitor.tick_at(t0 + Duration::from_secs(61));
        assert_eq!(monitor.state(), HealthState::Degraded);

        monitor
            .observe_at(&segment("SPEAKER_0", 0, None), t0 + Duration::from_secs(62))
            .await
            .unwrap();
        assert_eq!(monitor.state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn lone_speaker_with_overlap_cues_degrades() {
        let mut monitor = monitor().await;
        let t0 = Instant::now();
        monitor.observe_at(&DiarizerEvent::Ready, t0).await.unwrap();

        // Overlap cue naming only the same speaker: the cue counts, the
        // speaker set stays at one
        monitor
            .observe_at(
                &segment("SPEAKER_0", 0, Some(vec!["SPEAKER_0".to_string()])),
                t0,
            )
            .await
            .unwrap();
        monitor
            .observe_at(
                &segment("SPEAKER_0", 600_000, None),
                t0 + SINGLE_SPEAKER_WINDOW,
            )
            .await
            .unwrap();

        monitor.tick_at(t0 + SINGLE_SPEAKER_WINDOW + Duration::from_secs(1));
        assert_eq!(monitor.state(), HealthState::Degraded);
        assert!(monitor.recovery_needed());
    }

    #[tokio::test]
    async fn lone_speaker_without_cues_stays_healthy() {
        let mut monitor = monitor().await;
        let t0 = Instant::now();
        monitor.observe_at(&DiarizerEvent::Ready, t0).await.unwrap();
        monitor
            .observe_at(&segment("SPEAKER_0", 0, None), t0)
            .await
            .unwrap();
        monitor
            .observe_at(
                &segment("SPEAKER_0", 600_000, None),
                t0 + SINGLE_SPEAKER_WINDOW,
            )
            .await
            .unwrap();

        monitor.tick_at(t0 + SINGLE_SPEAKER_WINDOW + Duration::from_secs(1));
        assert_eq!(monitor.state(), HealthState::Healthy);
        assert!(!monitor.recovery_needed());
    }
}
