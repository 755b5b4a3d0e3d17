//! Live insight engine
//!
//! Consumes finalized transcript rows in persistence order, batches them,
//! and runs the two-stage extraction contract against the provider router.
//! Live notes accumulate during the session; on stop, one orchestrated pass
//! regenerates every kind from the full transcript and supersedes the live
//! notes (action items already promoted to tasks keep their link).
//!
//! # Batching
//!
//! A batch forms when enough new text has accumulated, enough wall time has
//! passed, or a flush is forced. Each batch re-includes a tail of the
//! previous one for continuity. At most one model request is in flight per
//! session; rows that arrive mid-request simply accumulate into the next
//! batch. A failed batch is not retried — the next batch covers its text
//! range again via the overlap tail, and the session never stops over it.

use crate::config::{InsightSettings, Strictness};
use crate::insights::prompts;
use crate::insights::types::{
    InsightCandidate, NoteKind, NoteStatus, SectionOutcome, TaskPriority, UnifiedInsightsResult,
    ALL_NOTE_KINDS,
};
use crate::llm::{ChatMessage, ChatParams, ProviderError, ProviderRouter};
use crate::storage::{NoteStore, StoreError, StoredNote, TranscriptRow};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Candidates at or above this become live notes
const NOTE_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Action items at or above this are promoted to tasks
const TASK_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Candidates this similar to an existing note of the same kind are merged
const DEDUP_JACCARD_THRESHOLD: f32 = 0.85;

#[derive(Debug, thiserror::Error)]
pub enum InsightError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unparseable model output: {0}")]
    Parse(String),
}

/// Live insight engine for one meeting
pub struct InsightEngine {
    meeting_id: String,
    router: Arc<ProviderRouter>,
    notes: NoteStore,
    config: InsightSettings,

    /// Timestamped lines waiting for the next batch
    buffer: String,
    buffered_chars: usize,
    /// Tail of the previous batch, re-included for continuity
    context_tail: String,
    last_flush: Instant,
    /// Backpressure: one model request in flight per session
    in_flight: Arc<tokio::sync::Mutex<()>>,

    /// Live notes kept in memory for deduplication
    live_notes: Vec<StoredNote>,
    task_titles: Vec<String>,
    detected_subject: Option<String>,
}

impl InsightEngine {
    pub fn new(
        meeting_id: String,
        router: Arc<ProviderRouter>,
        notes: NoteStore,
        config: InsightSettings,
    ) -> Self {
        Self {
            meeting_id,
            router,
            notes,
            config,
            buffer: String::new(),
            buffered_chars: 0,
            context_tail: String::new(),
            last_flush: Instant::now(),
            in_flight: Arc::new(tokio::sync::Mutex::new(())),
            live_notes: Vec::new(),
            task_titles: Vec::new(),
            detected_subject: None,
        }
    }

    pub fn detected_subject(&self) -> Option<&str> {
        self.detected_subject.as_deref()
    }

    /// Buffer one finalized row. Rows arrive in persistence order.
    pub fn push_row(&mut self, row: &TranscriptRow) {
        let line = format!(
            "{} {}: {}\n",
            prompts::format_timestamp(row.start_ms),
            row.speaker_id,
            row.text
        );
        self.buffered_chars += row.text.len();
        self.buffer.push_str(&line);
    }

    /// Is a batch due by size or age?
    pub fn batch_due(&self) -> bool {
        if self.buffered_chars == 0 {
            return false;
        }
        self.buffered_chars >= self.config.batch_min_chars
            || self.last_flush.elapsed().as_millis() as u64 >= self.config.batch_max_ms
    }

    /// Run one live batch if due. Returns the number of notes written.
    pub async fn maybe_flush(&mut self, cancel: &CancellationToken) -> Result<usize, InsightError> {
        if !self.batch_due() {
            return Ok(0);
        }
        self.flush(cancel).await
    }

    /// Force a batch regardless of thresholds.
    pub async fn flush(&mut self, cancel: &CancellationToken) -> Result<usize, InsightError> {
        if self.buffered_chars == 0 {
            return Ok(0);
        }

        let guard = Arc::clone(&self.in_flight);
        let _permit = guard.lock().await;

        let batch_text = if self.context_tail.is_empty() {
            self.buffer.clone()
        } else {
            format!("{}\n{}", self.context_tail, self.buffer)
        };

        // The tail carries over before the call so a failed batch's text
        // still reaches the model with the next one
        self.context_tail = tail_chars(&batch_text, self.config.context_chars);
        self.buffer.clear();
        self.buffered_chars = 0;
        self.last_flush = Instant::now();

        let candidates = self.extract_candidates(&batch_text, cancel).await?;
        let kept = self.filter_by_subject(candidates, cancel).await?;
        let written = self.persist_candidates(kept, NoteStatus::Live).await?;
        debug!(
            "Live insight batch for meeting {} wrote {} notes",
            self.meeting_id, written
        );
        Ok(written)
    }

    /// Stage one: candidate extraction.
    async fn extract_candidates(
        &mut self,
        batch_text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<InsightCandidate>, InsightError> {
        let messages = [
            ChatMessage::system(prompts::extraction_system_prompt()),
            ChatMessage::user(prompts::extraction_user_prompt(batch_text)),
        ];
        let response = self
            .router
            .chat(&messages, &ChatParams::default(), cancel)
            .await?;
        let candidates =
            prompts::parse_candidates(&response.content).map_err(InsightError::Parse)?;

        // First topic or summary candidate seeds the meeting subject used
        // by the filter stage
        if self.detected_subject.is_none() {
            if let Some(seed) = candidates
                .iter()
                .find(|c| matches!(c.kind, NoteKind::Topic | NoteKind::Summary))
            {
                info!("Detected meeting subject: {}", seed.body);
                self.detected_subject = Some(seed.body.clone());
            }
        }
        Ok(candidates)
    }

    /// Stage two: discard candidates unrelated to the detected subject.
    /// `loose` strictness skips the stage entirely; a filter failure under
    /// `balanced` keeps everything rather than losing the batch.
    async fn filter_by_subject(
        &self,
        candidates: Vec<InsightCandidate>,
        cancel: &CancellationToken,
    ) -> Result<Vec<InsightCandidate>, InsightError> {
        if candidates.is_empty() || self.config.strictness == Strictness::Loose {
            return Ok(candidates);
        }
        let Some(subject) = &self.detected_subject else {
            return Ok(candidates);
        };

        let prompt = prompts::subject_filter_prompt(subject, &candidates);
        let filtered = async {
            let response = self.router.chat_simple(&prompt, cancel).await?;
            let kept = prompts::parse_kept_indices(&response.content, candidates.len())
                .map_err(InsightError::Parse)?;
            Ok::<Vec<usize>, InsightError>(kept)
        }
        .await;

        match filtered {
            Ok(kept) => Ok(candidates
                .into_iter()
                .enumerate()
                .filter(|(i, _)| kept.contains(i))
                .map(|(_, c)| c)
                .collect()),
            Err(e) if self.config.strictness == Strictness::Balanced => {
                warn!("Subject filter failed ({}); keeping all candidates", e);
                Ok(candidates)
            }
            Err(e) => Err(e),
        }
    }

    /// Dedup, persist, and promote tasks for a set of candidates.
    async fn persist_candidates(
        &mut self,
        candidates: Vec<InsightCandidate>,
        status: NoteStatus,
    ) -> Result<usize, InsightError> {
        let mut written = 0;
        for candidate in candidates {
            if candidate.confidence < NOTE_CONFIDENCE_THRESHOLD {
                continue;
            }

            // Near-duplicates merge into the existing note, appending the
            // newer evidence range
            let duplicate = self
                .live_notes
                .iter()
                .find(|note| {
                    note.kind == candidate.kind
                        && jaccard(&note.body, &candidate.body) >= DEDUP_JACCARD_THRESHOLD
                })
                .map(|note| note.id.clone());
            if let Some(note_id) = duplicate {
                self.notes
                    .extend_note_evidence(&note_id, candidate.end_ms, candidate.confidence)
                    .await?;
                continue;
            }

            let note = self
                .notes
                .create_note(
                    &self.meeting_id,
                    candidate.kind,
                    &candidate.body,
                    candidate.start_ms,
                    candidate.end_ms,
                    candidate.confidence,
                    status,
                )
                .await?;

            if candidate.kind == NoteKind::ActionItem
                && candidate.confidence >= TASK_CONFIDENCE_THRESHOLD
                && !self
                    .task_titles
                    .iter()
                    .any(|title| jaccard(title, &candidate.body) >= DEDUP_JACCARD_THRESHOLD)
            {
                self.notes
                    .create_task(
                        Some(&self.meeting_id),
                        &candidate.body,
                        None,
                        TaskPriority::Medium,
                        None,
                        Some(&note.id),
                    )
                    .await?;
                self.task_titles.push(candidate.body.clone());
            }

            self.live_notes.push(note);
            written += 1;
        }
        Ok(written)
    }

    /// The orchestrated finalization pass: flush the live buffer, then
    /// regenerate every kind from the full transcript. Per-kind failures
    /// are reported, not fatal; notes of failed kinds keep their live
    /// versions.
    pub async fn finalize_meeting(
        &mut self,
        full_rows: &[TranscriptRow],
        cancel: &CancellationToken,
    ) -> UnifiedInsightsResult {
        if let Err(e) = self.flush(cancel).await {
            warn!("Final live flush failed ({}); continuing to finalization", e);
        }

        let transcript = full_rows
            .iter()
            .map(|row| {
                format!(
                    "{} {}: {}",
                    prompts::format_timestamp(row.start_ms),
                    row.speaker_id,
                    row.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut sections = Vec::with_capacity(ALL_NOTE_KINDS.len());
        let mut notes_persisted = 0;
        let tasks_before = self.task_titles.len();

        for kind in ALL_NOTE_KINDS {
            match self.finalize_section(kind, &transcript, cancel).await {
                Ok(count) => {
                    notes_persisted += count;
                    sections.push((kind, SectionOutcome::Ok { notes: count }));
                }
                Err(e) => {
                    warn!("Finalization of {} failed: {}", kind, e);
                    sections.push((
                        kind,
                        SectionOutcome::Error {
                            reason: e.to_string(),
                        },
                    ));
                }
            }
        }

        let tasks_created = self.task_titles.len() - tasks_before;
        let result =
            UnifiedInsightsResult::from_sections(sections, notes_persisted, tasks_created);
        info!(
            "Finalized insights for meeting {}: {}/{} sections, {} notes, {} tasks",
            self.meeting_id,
            result.sections_completed,
            result.sections_completed + result.sections_failed,
            result.notes_persisted,
            result.tasks_created,
        );
        result
    }

    async fn finalize_section(
        &mut self,
        kind: NoteKind,
        transcript: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, InsightError> {
        let (system, user) = prompts::section_prompt(kind, transcript);
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let response = self
            .router
            .chat(&messages, &ChatParams::default(), cancel)
            .await?;
        let candidates: Vec<InsightCandidate> =
            prompts::parse_candidates(&response.content)
                .map_err(InsightError::Parse)?
                .into_iter()
                .filter(|c| c.kind == kind)
                .collect();

        // The finalized set supersedes live notes of this kind; notes that
        // were promoted to tasks survive with their links
        self.notes
            .supersede_live_notes(&self.meeting_id, kind)
            .await?;
        self.live_notes.retain(|note| note.kind != kind);

        self.persist_candidates(candidates, NoteStatus::Finalized)
            .await
    }
}

/// Token-set Jaccard similarity over lowercased words.
pub fn jaccard(a: &str, b: &str) -> f32 {
    let set_a: std::collections::HashSet<String> =
        a.to_lowercase().split_whitespace().map(String::from).collect();
    let set_b: std::collections::HashSet<String> =
        b.to_lowercase().split_whitespace().map(String::from).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f32 / union as f32
}

/// Last `n` characters of `text`, on a char boundary.
fn tail_chars(text: &str, n: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}
