// =====================================================================================
// RECORDING MANAGER TESTS
// Consent gating, pause/resume accounting, finalization to storage
// =====================================================================================

use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use video_session_cell::capabilities::{RecordingSink, RecordingSinkError};
use video_session_cell::events::{self, EventStream};
use video_session_cell::storage::{ManifestStatus, RecordingManifest};
use video_session_cell::testing::{remote_stream, FakeRecordingSink};
use video_session_cell::{
    FileRecordingSink, MediaStream, MediaTrack, RecordingManager, RecordingState, SessionEvent,
    SessionState, StreamSource, TrackKind, VideoSessionError,
};

const ALL_STATES: [SessionState; 8] = [
    SessionState::Idle,
    SessionState::AcquiringPermissions,
    SessionState::Initializing,
    SessionState::Connecting,
    SessionState::Connected,
    SessionState::Reconnecting,
    SessionState::Ended,
    SessionState::Failed,
];

fn local_stream() -> MediaStream {
    MediaStream::new(
        "local-1",
        StreamSource::LocalCapture,
        vec![
            MediaTrack::new("audio-1", TrackKind::Audio, "Built-in Microphone"),
            MediaTrack::new("video-1", TrackKind::Video, "Built-in Camera"),
        ],
    )
}

fn streams() -> Vec<MediaStream> {
    vec![local_stream(), remote_stream()]
}

fn manager_with(sink: Arc<dyn RecordingSink>) -> (RecordingManager, EventStream) {
    let (events, stream) = events::channel();
    (RecordingManager::new(sink, events), stream)
}

fn manager() -> (RecordingManager, Arc<FakeRecordingSink>, EventStream) {
    let sink = Arc::new(FakeRecordingSink::new());
    let (manager, events) = manager_with(sink.clone());
    (manager, sink, events)
}

#[tokio::test]
async fn test_consent_is_required_in_every_session_state() {
    let (manager, sink, mut events) = manager();

    for state in ALL_STATES {
        assert_matches!(
            manager.start(streams(), false, state).await,
            Err(VideoSessionError::ConsentRequired),
            "state {}",
            state
        );
    }

    assert_eq!(manager.state().await, RecordingState::Idle);
    assert!(sink.ledger().begun.is_empty());
    assert!(events.drain().is_empty());
}

#[tokio::test]
async fn test_recording_requires_a_connected_session() {
    let (manager, sink, _events) = manager();

    for state in ALL_STATES.into_iter().filter(|s| *s != SessionState::Connected) {
        assert_matches!(
            manager.start(streams(), true, state).await,
            Err(VideoSessionError::InvalidSessionState { state: s }) if s == state
        );
    }
    assert!(sink.ledger().begun.is_empty());
}

#[tokio::test]
async fn test_start_records_every_source() {
    let (manager, sink, mut events) = manager();

    let job = manager.start(streams(), true, SessionState::Connected).await.unwrap();

    assert_eq!(job.state, RecordingState::Recording);
    assert!(job.consent_granted);
    assert!(job.started_at.is_some());
    assert_eq!(job.source_stream_ids, vec!["local-1".to_string(), "remote-1".to_string()]);
    assert_eq!(sink.ledger().sources[&job.id], job.source_stream_ids);
    assert_eq!(
        events.try_recv(),
        Some(SessionEvent::RecordingStarted {
            job_id: job.id,
            source_stream_ids: job.source_stream_ids.clone(),
        })
    );
}

#[tokio::test]
async fn test_only_one_active_job() {
    let (manager, _sink, _events) = manager();
    manager.start(streams(), true, SessionState::Connected).await.unwrap();
    manager.pause().await.unwrap();

    assert_matches!(
        manager.start(streams(), true, SessionState::Connected).await,
        Err(VideoSessionError::RecordingAlreadyActive)
    );
}

#[tokio::test]
async fn test_pause_and_resume_only_from_valid_states() {
    let (manager, sink, _events) = manager();

    assert_matches!(
        manager.pause().await,
        Err(VideoSessionError::InvalidRecordingState { state: RecordingState::Idle })
    );
    assert_matches!(
        manager.stop().await,
        Err(VideoSessionError::InvalidRecordingState { state: RecordingState::Idle })
    );

    manager.start(streams(), true, SessionState::Connected).await.unwrap();
    assert_matches!(
        manager.resume(SessionState::Connected).await,
        Err(VideoSessionError::InvalidRecordingState { state: RecordingState::Recording })
    );

    manager.pause().await.unwrap();
    assert_matches!(
        manager.pause().await,
        Err(VideoSessionError::InvalidRecordingState { state: RecordingState::Paused })
    );
    manager.resume(SessionState::Connected).await.unwrap();

    manager.stop().await.unwrap();
    assert_matches!(
        manager.resume(SessionState::Connected).await,
        Err(VideoSessionError::InvalidRecordingState { state: RecordingState::Stopped })
    );

    let ledger = sink.ledger();
    assert_eq!((ledger.pauses, ledger.resumes), (1, 1));
}

#[tokio::test]
async fn test_resume_requires_a_connected_session() {
    let (manager, sink, mut events) = manager();
    manager.start(streams(), true, SessionState::Connected).await.unwrap();
    manager.pause().await.unwrap();
    events.drain();

    for state in ALL_STATES.into_iter().filter(|s| *s != SessionState::Connected) {
        assert_matches!(
            manager.resume(state).await,
            Err(VideoSessionError::InvalidSessionState { state: s }) if s == state
        );
    }

    assert_eq!(manager.state().await, RecordingState::Paused);
    assert_eq!(sink.ledger().resumes, 0);
    assert!(events.drain().is_empty());

    manager.resume(SessionState::Connected).await.unwrap();
    assert_eq!(manager.state().await, RecordingState::Recording);
}

#[tokio::test(start_paused = true)]
async fn test_duration_excludes_paused_spans() {
    let (manager, sink, _events) = manager();
    let job = manager.start(streams(), true, SessionState::Connected).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    manager.pause().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    manager.resume(SessionState::Connected).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let artifact = manager.stop().await.unwrap();

    assert_eq!(artifact.duration_ms, 5_000);
    assert_eq!(manager.job().await.accumulated_duration_ms, 5_000);
    assert_eq!(sink.ledger().finalized, vec![(job.id, Duration::from_secs(5))]);
}

#[tokio::test]
async fn test_stop_emits_the_artifact() {
    let (manager, _sink, mut events) = manager();
    let job = manager.start(streams(), true, SessionState::Connected).await.unwrap();

    let artifact = manager.stop().await.unwrap();

    assert_eq!(artifact.job_id, job.id);
    assert_eq!(artifact.storage_ref, format!("memory://recordings/{}", job.id));
    assert_eq!(manager.state().await, RecordingState::Stopped);

    let seen = events.drain();
    assert_eq!(seen.last(), Some(&SessionEvent::RecordingStopped { artifact }));
}

#[tokio::test]
async fn test_finalize_failure_fails_the_job_and_discards_it() {
    let (manager, sink, mut events) = manager();
    let job = manager.start(streams(), true, SessionState::Connected).await.unwrap();
    sink.fail_finalize(true);

    assert_matches!(manager.stop().await, Err(VideoSessionError::RecordingFailed { .. }));

    assert_eq!(manager.state().await, RecordingState::Failed);
    assert_eq!(sink.ledger().discarded, vec![job.id]);
    assert_matches!(
        events.drain().last(),
        Some(SessionEvent::RecordingFailed { job_id, .. }) if *job_id == job.id
    );

    // A failed job does not block a new one.
    sink.fail_finalize(false);
    manager.start(streams(), true, SessionState::Connected).await.unwrap();
}

#[tokio::test]
async fn test_begin_failure_reports_failed() {
    let (manager, sink, mut events) = manager();
    sink.fail_begin(true);

    assert_matches!(
        manager.start(streams(), true, SessionState::Connected).await,
        Err(VideoSessionError::RecordingFailed { .. })
    );
    assert_eq!(manager.state().await, RecordingState::Failed);
    assert_matches!(events.try_recv(), Some(SessionEvent::RecordingFailed { .. }));
}

#[tokio::test]
async fn test_release_only_acts_on_an_active_job() {
    let (manager, sink, _events) = manager();
    assert!(manager.release().await.is_none());

    manager.start(streams(), true, SessionState::Connected).await.unwrap();
    assert_matches!(manager.release().await, Some(Ok(_)));
    assert!(manager.release().await.is_none());
    assert_eq!(sink.ledger().finalized.len(), 1);
}

// =====================================================================================
// FILE STORAGE
// =====================================================================================

#[tokio::test]
async fn test_file_sink_writes_a_finalized_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("recordings");
    let sink = Arc::new(FileRecordingSink::new(&root));
    let (manager, _events) = manager_with(sink.clone());

    let job = manager.start(streams(), true, SessionState::Connected).await.unwrap();
    assert!(root.join(format!("{}.part", job.id)).exists());

    manager.pause().await.unwrap();
    manager.resume(SessionState::Connected).await.unwrap();
    let artifact = manager.stop().await.unwrap();

    let final_path = root.join(format!("{}.json", job.id));
    assert!(!root.join(format!("{}.part", job.id)).exists());
    assert_eq!(artifact.storage_ref, final_path.display().to_string());
    assert_eq!(artifact.size_bytes, std::fs::metadata(&final_path).unwrap().len());

    let manifest: RecordingManifest =
        serde_json::from_slice(&std::fs::read(&final_path).unwrap()).unwrap();
    assert_eq!(manifest.job_id, job.id);
    assert_eq!(manifest.status, ManifestStatus::Finalized);
    assert_eq!(manifest.pause_count, 1);
    assert_eq!(manifest.sources.len(), 2);
    assert_eq!(manifest.sources[0].track_ids, vec!["audio-1", "video-1"]);
    assert_eq!(manifest.duration_ms, Some(artifact.duration_ms));
}

#[tokio::test]
async fn test_file_sink_rejects_unknown_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileRecordingSink::new(dir.path());
    let job_id = Uuid::new_v4();

    assert_matches!(sink.pause(job_id).await, Err(RecordingSinkError::UnknownJob(id)) if id == job_id);
    assert_matches!(
        sink.finalize(job_id, Duration::from_secs(1)).await,
        Err(RecordingSinkError::UnknownJob(_))
    );
    // Discarding something that never existed is a no-op.
    sink.discard(job_id).await;
}

#[tokio::test]
async fn test_file_sink_discard_removes_partial_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let sink = FileRecordingSink::new(dir.path());
    let job_id = Uuid::new_v4();

    sink.begin(job_id, &streams()).await.unwrap();
    let part = dir.path().join(format!("{}.part", job_id));
    assert!(part.exists());

    sink.discard(job_id).await;
    assert!(!part.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
