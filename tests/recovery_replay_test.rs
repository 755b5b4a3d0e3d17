//! Post-recording recovery: a degraded live session left rows under the
//! unknown-speaker sentinel; the batch diarizer re-runs over the full WAV
//! and the stored rows are re-attributed idempotently.

use flowscribe::audio::wav::write_wav_header;
use flowscribe::diarization::types::ClusteringParams;
use flowscribe::session::run_post_recovery;
use flowscribe::storage::{open_memory, MeetingStore, NewRow, TranscriptStore};
use flowscribe::worker::{WorkerSpec, WorkerSupervisor};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

fn batch_worker_script() -> WorkerSpec {
    let script = concat!(
        r#"echo '{"type":"segment","speaker_id":"SPEAKER_0","start_ms":0,"end_ms":20000,"confidence":0.9}' 1>&2; "#,
        r#"echo '{"type":"segment","speaker_id":"SPEAKER_1","start_ms":20000,"end_ms":40000,"confidence":0.9}' 1>&2; "#,
        r#"echo '{"type":"complete"}' 1>&2"#,
    );
    WorkerSpec::new(PathBuf::from("/bin/sh"))
        .arg("-c")
        .arg(script.to_string())
}

fn write_fixture_wav(path: &std::path::Path, seconds: u32) {
    let data_size = 16_000 * 2 * seconds;
    let mut file = std::fs::File::create(path).unwrap();
    write_wav_header(&mut file, 16_000, 1, 16, data_size).unwrap();
    file.write_all(&vec![0u8; data_size as usize]).unwrap();
    file.sync_all().unwrap();
}

#[tokio::test]
async fn recovery_relabels_sentinel_rows_idempotently() {
    let pool = open_memory().await;
    let meetings = MeetingStore::new(pool.clone());
    let transcripts = TranscriptStore::new(pool);
    let meeting = meetings.create("Degraded run".to_string()).await.unwrap();

    // Rows from an acknowledged transcription-only session
    for (text, start, end) in [
        ("first half speech", 0u64, 18_000u64),
        ("second half speech", 21_000, 39_000),
    ] {
        transcripts
            .create(NewRow {
                meeting_id: meeting.id.clone(),
                speaker_id: "SPEAKER_UNKNOWN".to_string(),
                text: text.to_string(),
                start_ms: start,
                end_ms: end,
                confidence: 0.8,
                is_final: true,
            })
            .await
            .unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let audio = dir.path().join("meeting.wav");
    write_fixture_wav(&audio, 40);

    let supervisor = WorkerSupervisor::new();
    let relabeled = run_post_recovery(
        &supervisor,
        batch_worker_script(),
        &transcripts,
        &meeting.id,
        &audio,
        ClusteringParams::default(),
        &CancellationToken::new(),
    )
    .await
    .expect("recovery");
    assert_eq!(relabeled, 2);

    let rows = transcripts
        .get_by_meeting_paginated(&meeting.id, 10, 0)
        .await
        .unwrap();
    assert_eq!(rows[0].speaker_id, "SPEAKER_0");
    assert_eq!(rows[1].speaker_id, "SPEAKER_1");

    // Idempotent: a second run has nothing to change
    let again = run_post_recovery(
        &supervisor,
        batch_worker_script(),
        &transcripts,
        &meeting.id,
        &audio,
        ClusteringParams::default(),
        &CancellationToken::new(),
    )
    .await
    .expect("second recovery");
    assert_eq!(again, 0);
}
