//! End-to-end session runs against scripted shell workers: the real
//! supervisor, streams, aligner, monitor, stores, and orchestrator, with
//! the ML backends replaced by `/bin/sh` processes that replay canned
//! protocol lines, and the LLM replaced by a scripted provider.

use async_trait::async_trait;
use flowscribe::config::Config;
use flowscribe::health::HealthState;
use flowscribe::insights::NoteKind;
use flowscribe::llm::{
    ChatMessage, ChatParams, ChatProvider, ProviderError, ProviderHealth, ProviderPriority,
    ProviderRouter,
};
use flowscribe::session::{SessionOrchestrator, SessionState};
use flowscribe::storage::{
    open_memory, FailureKind, FailureStore, NoteStore, SettingsStore, TranscriptStore,
};
use flowscribe::worker::{WorkerSpec, WorkerSupervisor};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn sh_worker(script: &str) -> WorkerSpec {
    WorkerSpec::new(PathBuf::from("/bin/sh"))
        .arg("-c")
        .arg(script.to_string())
}

/// Scripted chat provider replaying canned responses in call order.
struct ScriptedLlm {
    responses: Mutex<Vec<Result<String, ProviderError>>>,
}

impl ScriptedLlm {
    fn new(responses: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
        })
    }
}

#[async_trait]
impl ChatProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }
    async fn health(&self) -> ProviderHealth {
        ProviderHealth::Healthy { latency_ms: 1 }
    }
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![])
    }
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _params: &ChatParams,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("[]".to_string())
        } else {
            responses.remove(0)
        }
    }
}

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        ..Config::default()
    }
}

/// Poll `drive` until the predicate holds or the deadline passes.
async fn drive_until<F>(
    orchestrator: &mut SessionOrchestrator,
    mut predicate: F,
    deadline: Duration,
) -> bool
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool>>>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        orchestrator.drive().await.expect("drive");
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Two speakers, clean run: diarizer labels three turns, transcriber emits
/// one final segment per 5 s window; 12 rows land in A/B/A order.
#[tokio::test]
async fn two_speaker_session_clean_run() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_memory().await;
    let transcripts = TranscriptStore::new(pool.clone());

    let mut diarizer_script = String::from(r#"echo '{"type":"ready"}' 1>&2; "#);
    for (speaker, start, end) in [
        ("SPEAKER_0", 0u64, 20_000u64),
        ("SPEAKER_1", 20_000, 40_000),
        ("SPEAKER_0", 40_000, 60_000),
    ] {
        diarizer_script.push_str(&format!(
            r#"echo '{{"type":"segment","speaker_id":"{}","start_ms":{},"end_ms":{},"confidence":0.9}}' 1>&2; "#,
            speaker, start, end
        ));
    }
    diarizer_script.push_str("sleep 5");

    let mut transcriber_script = String::from(r#"echo '{"type":"ready"}' 1>&2; "#);
    for i in 0..12u64 {
        transcriber_script.push_str(&format!(
            r#"echo '{{"type":"segment","text":"window {} remarks","start_ms":{},"end_ms":{},"confidence":0.9,"is_final":true}}' 1>&2; "#,
            i,
            i * 5_000,
            (i + 1) * 5_000
        ));
    }
    transcriber_script.push_str("sleep 5");

    let mut orchestrator = SessionOrchestrator::new(
        test_config(dir.path()),
        pool.clone(),
        Arc::new(WorkerSupervisor::new()),
        Arc::new(ProviderRouter::new()),
        sh_worker(&diarizer_script),
        sh_worker(&transcriber_script),
    );

    let meeting_id = orchestrator
        .start("Two speaker sync".to_string(), false)
        .await
        .expect("start");
    assert_eq!(orchestrator.state(), SessionState::Recording);

    let transcripts_for_poll = transcripts.clone();
    let meeting_for_poll = meeting_id.clone();
    let done = drive_until(
        &mut orchestrator,
        move || {
            let store = transcripts_for_poll.clone();
            let id = meeting_for_poll.clone();
            Box::pin(async move { store.count_by_meeting(&id).await.unwrap() >= 12 })
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(done, "expected 12 rows within the deadline");

    let summary = orchestrator.stop().await.expect("stop");
    assert_eq!(summary.meeting_id, meeting_id);
    assert_eq!(summary.rows_persisted, 12);
    assert_eq!(summary.diarization_state, HealthState::Healthy);
    assert!(!summary.recovery_scheduled);

    let rows = transcripts
        .get_by_meeting_paginated(&meeting_id, 100, 0)
        .await
        .unwrap();
    let speakers: Vec<&str> = rows.iter().map(|r| r.speaker_id.as_str()).collect();
    assert_eq!(
        speakers,
        [
            "SPEAKER_0", "SPEAKER_0", "SPEAKER_0", "SPEAKER_0",
            "SPEAKER_1", "SPEAKER_1", "SPEAKER_1", "SPEAKER_1",
            "SPEAKER_0", "SPEAKER_0", "SPEAKER_0", "SPEAKER_0",
        ]
    );
}

/// Diarizer missing its token: a failure event lands promptly, no
/// transcript rows are created, and stop reports the unavailable state.
#[tokio::test]
async fn missing_token_vetoes_rows_and_schedules_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_memory().await;
    let transcripts = TranscriptStore::new(pool.clone());
    let failures = FailureStore::new(pool.clone());

    let diarizer_script = concat!(
        r#"echo '{"type":"error","code":"TOKEN_MISSING","message":"set HF_TOKEN for gated models"}' 1>&2; "#,
        "sleep 5",
    );
    let mut transcriber_script = String::from(r#"echo '{"type":"ready"}' 1>&2; "#);
    for i in 0..4u64 {
        transcriber_script.push_str(&format!(
            r#"echo '{{"type":"segment","text":"unattributable speech {}","start_ms":{},"end_ms":{},"confidence":0.9,"is_final":true}}' 1>&2; "#,
            i,
            i * 5_000,
            (i + 1) * 5_000
        ));
    }
    transcriber_script.push_str("sleep 5");

    let mut orchestrator = SessionOrchestrator::new(
        test_config(dir.path()),
        pool.clone(),
        Arc::new(WorkerSupervisor::new()),
        Arc::new(ProviderRouter::new()),
        sh_worker(diarizer_script),
        sh_worker(&transcriber_script),
    );

    let meeting_id = orchestrator
        .start("No token".to_string(), false)
        .await
        .expect("start");

    // The failure event must land well within the 5 s contract
    let failures_for_poll = failures.clone();
    let meeting_for_poll = meeting_id.clone();
    let failed = drive_until(
        &mut orchestrator,
        move || {
            let store = failures_for_poll.clone();
            let id = meeting_for_poll.clone();
            Box::pin(async move {
                store
                    .list_for_meeting(&id)
                    .await
                    .unwrap()
                    .iter()
                    .any(|e| e.kind == FailureKind::TokenMissing)
            })
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(failed, "token failure should be recorded within 5 s");

    // Give the transcriber time to emit everything, then drain
    tokio::time::sleep(Duration::from_millis(300)).await;
    orchestrator.drive().await.unwrap();

    assert_eq!(
        transcripts.count_by_meeting(&meeting_id).await.unwrap(),
        0,
        "no transcript rows after diarizer failure"
    );

    let summary = orchestrator.stop().await.expect("stop");
    assert_eq!(summary.rows_persisted, 0);
    assert_eq!(summary.diarization_state, HealthState::Unavailable);

    // Refused segments are themselves on the failure log
    let events = failures.list_for_meeting(&meeting_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == FailureKind::InsufficientCoverage));
}

/// Acknowledged transcription-only mode: same failing diarizer, but rows
/// land under the unknown-speaker sentinel.
#[tokio::test]
async fn acknowledged_transcription_only_uses_sentinel_rows() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_memory().await;
    let transcripts = TranscriptStore::new(pool.clone());
    SettingsStore::new(pool.clone())
        .acknowledge_transcription_only()
        .await
        .unwrap();

    let diarizer_script = concat!(
        r#"echo '{"type":"error","code":"MODELS_MISSING","message":"weights absent"}' 1>&2; "#,
        "sleep 5",
    );
    let transcriber_script = concat!(
        r#"echo '{"type":"ready"}' 1>&2; "#,
        r#"echo '{"type":"segment","text":"still worth keeping","start_ms":0,"end_ms":4000,"confidence":0.8,"is_final":true}' 1>&2; "#,
        "sleep 5",
    );

    let mut orchestrator = SessionOrchestrator::new(
        test_config(dir.path()),
        pool.clone(),
        Arc::new(WorkerSupervisor::new()),
        Arc::new(ProviderRouter::new()),
        sh_worker(diarizer_script),
        sh_worker(transcriber_script),
    );

    let meeting_id = orchestrator
        .start("Acked degraded".to_string(), false)
        .await
        .expect("start");

    let transcripts_for_poll = transcripts.clone();
    let meeting_for_poll = meeting_id.clone();
    let landed = drive_until(
        &mut orchestrator,
        move || {
            let store = transcripts_for_poll.clone();
            let id = meeting_for_poll.clone();
            Box::pin(async move { store.count_by_meeting(&id).await.unwrap() >= 1 })
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(landed);

    let rows = transcripts
        .get_by_meeting_paginated(&meeting_id, 10, 0)
        .await
        .unwrap();
    assert_eq!(rows[0].speaker_id, "SPEAKER_UNKNOWN");

    let summary = orchestrator.stop().await.expect("stop");
    assert_eq!(summary.diarization_state, HealthState::Unavailable);
}

/// Partial LLM failure during finalization: three kinds succeed, three
/// fail, the result reports partial success, and no tasks appear.
#[tokio::test]
async fn partial_llm_failure_reports_partial_success() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_memory().await;
    let notes = NoteStore::new(pool.clone());

    let diarizer_script = concat!(
        r#"echo '{"type":"ready"}' 1>&2; "#,
        r#"echo '{"type":"segment","speaker_id":"SPEAKER_0","start_ms":0,"end_ms":60000,"confidence":0.9}' 1>&2; "#,
        "sleep 5",
    );
    let transcriber_script = concat!(
        r#"echo '{"type":"ready"}' 1>&2; "#,
        r#"echo '{"type":"segment","text":"we discussed the quarterly roadmap in depth","start_ms":0,"end_ms":30000,"confidence":0.9,"is_final":true}' 1>&2; "#,
        "sleep 5",
    );

    let section = |kind: &str, body: &str| {
        Ok(format!(
            r#"[{{"kind":"{}","body":"{}","start_ms":0,"end_ms":30000,"confidence":0.9}}]"#,
            kind, body
        ))
    };
    let timeout = || Err(ProviderError::Timeout(Duration::from_secs(60)));
    let router = ProviderRouter::new();
    router
        .register(
            "scripted",
            ProviderPriority::Primary,
            ScriptedLlm::new(vec![
                Ok("[]".to_string()),                          // live flush
                section("summary", "Roadmap reviewed"),        // summary
                timeout(),                                     // action_item
                timeout(),                                     // decision
                section("key_point", "Q3 scope is fixed"),     // key_point
                section("topic", "Quarterly roadmap"),         // topic
                timeout(),                                     // sentiment
            ]),
        )
        .await;

    let mut orchestrator = SessionOrchestrator::new(
        test_config(dir.path()),
        pool.clone(),
        Arc::new(WorkerSupervisor::new()),
        Arc::new(router),
        sh_worker(diarizer_script),
        sh_worker(transcriber_script),
    );

    let meeting_id = orchestrator
        .start("Insights run".to_string(), true)
        .await
        .expect("start");

    let pool_for_poll = pool.clone();
    let meeting_for_poll = meeting_id.clone();
    let landed = drive_until(
        &mut orchestrator,
        move || {
            let store = TranscriptStore::new(pool_for_poll.clone());
            let id = meeting_for_poll.clone();
            Box::pin(async move { store.count_by_meeting(&id).await.unwrap() >= 1 })
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(landed);

    let summary = orchestrator.stop().await.expect("stop");
    let insights = summary.insights.expect("insights ran");
    assert!(!insights.success);
    assert!(insights.partial_success);
    assert_eq!(insights.sections_completed, 3);
    assert_eq!(insights.sections_failed, 3);

    let stored = notes.list_notes(&meeting_id, None).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().any(|n| n.kind == NoteKind::Summary));
    assert!(notes.list_tasks(&meeting_id).await.unwrap().is_empty());
    assert_eq!(summary.tasks_created, 0);
}
