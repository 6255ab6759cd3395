// =====================================================================================
// DEVICE MANAGER TESTS
// Enumeration, acquisition, switching and release of local capture
// =====================================================================================

use assert_matches::assert_matches;
use async_trait::async_trait;
use mockall::mock;
use std::sync::Arc;

use video_session_cell::capabilities::{
    CaptureError, CapturedStream, CapturedTrack, MediaCapture,
};
use video_session_cell::events::{self, EventSink};
use video_session_cell::testing::FakeMediaCapture;
use video_session_cell::{
    DeviceDescriptor, DeviceKind, DeviceManager, ErrorKind, MediaConstraints, SessionEvent,
    TrackKind, VideoSessionError,
};

mock! {
    pub Capture {}

    #[async_trait]
    impl MediaCapture for Capture {
        async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;
        async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<CapturedStream, CaptureError>;
        async fn open_device_track(&self, kind: DeviceKind, device_id: &str) -> Result<CapturedTrack, CaptureError>;
        async fn open_display_media(&self) -> Result<CapturedStream, CaptureError>;
    }
}

fn camera() -> DeviceDescriptor {
    DeviceDescriptor::new(DeviceKind::Camera, "Built-in Camera", "camera-builtin")
}

fn microphone() -> DeviceDescriptor {
    DeviceDescriptor::new(DeviceKind::Microphone, "Built-in Microphone", "mic-builtin")
}

fn fake_manager() -> (DeviceManager, Arc<FakeMediaCapture>, events::EventStream) {
    let capture = Arc::new(FakeMediaCapture::new());
    let (sink, stream) = events::channel();
    (DeviceManager::new(capture.clone(), sink), capture, stream)
}

#[tokio::test]
async fn test_initialize_requires_a_camera() {
    let mut capture = MockCapture::new();
    capture
        .expect_enumerate_devices()
        .times(1)
        .returning(|| Ok(vec![microphone()]));

    let manager = DeviceManager::new(Arc::new(capture), EventSink::detached());
    assert_matches!(manager.initialize().await, Err(VideoSessionError::NoCameraAvailable));
    assert!(manager.devices().await.is_empty());
}

#[tokio::test]
async fn test_initialize_requires_a_microphone() {
    let mut capture = MockCapture::new();
    capture
        .expect_enumerate_devices()
        .times(1)
        .returning(|| Ok(vec![camera()]));

    let manager = DeviceManager::new(Arc::new(capture), EventSink::detached());
    assert_matches!(manager.initialize().await, Err(VideoSessionError::NoMicrophoneAvailable));
}

#[tokio::test]
async fn test_initialize_stores_descriptors() {
    let (manager, _capture, _events) = fake_manager();

    let devices = manager.initialize().await.unwrap();
    assert_eq!(devices.len(), 4);
    assert_eq!(manager.devices().await, devices);
}

#[tokio::test]
async fn test_acquire_after_destroy_never_reaches_capture() {
    let mut capture = MockCapture::new();
    capture.expect_open_user_media().never();

    let manager = DeviceManager::new(Arc::new(capture), EventSink::detached());
    manager.destroy().await;

    assert_matches!(
        manager.acquire_stream(&MediaConstraints::default()).await,
        Err(VideoSessionError::Cancelled)
    );
}

#[tokio::test]
async fn test_acquire_reuses_the_held_stream() {
    let (manager, capture, _events) = fake_manager();

    let first = manager.acquire_stream(&MediaConstraints::default()).await.unwrap();
    let second = manager.acquire_stream(&MediaConstraints::default()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(capture.user_media_requests(), 1);
    assert_eq!(first.tracks.len(), 2);
}

#[tokio::test]
async fn test_permission_denied_acquires_nothing() {
    let (manager, capture, _events) = fake_manager();
    capture.deny_permission();

    assert_matches!(
        manager.acquire_stream(&MediaConstraints::default()).await,
        Err(VideoSessionError::PermissionDenied)
    );
    assert!(manager.local_stream().await.is_none());
    assert!(capture.opened_tracks().is_empty());
}

#[tokio::test]
async fn test_selected_device_missing_is_unavailable() {
    let (manager, _capture, _events) = fake_manager();
    let constraints = MediaConstraints {
        camera_id: Some("camera-unplugged".into()),
        ..MediaConstraints::default()
    };

    assert_matches!(
        manager.acquire_stream(&constraints).await,
        Err(VideoSessionError::DeviceUnavailable { .. })
    );
}

#[tokio::test]
async fn test_toggle_flips_only_the_enabled_flag() {
    let (manager, capture, mut events) = fake_manager();
    let stream = manager.acquire_stream(&MediaConstraints::default()).await.unwrap();
    let audio_id = stream.track(TrackKind::Audio).unwrap().id.clone();

    assert!(!manager.toggle(TrackKind::Audio).await.unwrap());
    let after = manager.local_stream().await.unwrap();

    assert_eq!(after.id, stream.id);
    assert_eq!(after.track_ids(), stream.track_ids());
    assert!(!after.track(TrackKind::Audio).unwrap().enabled);
    assert!(after.track(TrackKind::Video).unwrap().enabled);
    assert_eq!(capture.is_track_enabled(&audio_id), Some(false));
    assert_eq!(
        events.try_recv(),
        Some(SessionEvent::LocalTrackToggled { kind: TrackKind::Audio, enabled: false })
    );
}

#[tokio::test]
async fn test_concurrent_toggles_both_take_effect() {
    let (manager, capture, mut events) = fake_manager();
    let stream = manager.acquire_stream(&MediaConstraints::default()).await.unwrap();
    let audio_id = stream.track(TrackKind::Audio).unwrap().id.clone();

    let (first, second) = tokio::join!(
        manager.toggle(TrackKind::Audio),
        manager.toggle(TrackKind::Audio)
    );
    let mut flags = vec![first.unwrap(), second.unwrap()];
    flags.sort();
    assert_eq!(flags, vec![false, true]);

    let after = manager.local_stream().await.unwrap();
    assert!(after.track(TrackKind::Audio).unwrap().enabled);
    assert_eq!(capture.is_track_enabled(&audio_id), Some(true));
    assert_eq!(
        events.drain(),
        vec![
            SessionEvent::LocalTrackToggled { kind: TrackKind::Audio, enabled: false },
            SessionEvent::LocalTrackToggled { kind: TrackKind::Audio, enabled: true },
        ]
    );
}

#[tokio::test]
async fn test_abandoned_switch_leaves_the_stream_untouched() {
    let (manager, capture, mut events) = fake_manager();
    let before = manager.acquire_stream(&MediaConstraints::default()).await.unwrap();

    let pending = manager.prepare_switch(DeviceKind::Camera, "camera-usb").await.unwrap();
    let new_id = pending.new_track().id.clone();
    assert_eq!(pending.old_track_id(), before.track(TrackKind::Video).unwrap().id);
    assert_eq!(manager.local_stream().await.unwrap(), before);

    manager.abandon_switch(pending);

    assert_eq!(manager.local_stream().await.unwrap(), before);
    assert_eq!(capture.stopped_tracks(), vec![new_id]);
    assert_eq!(capture.live_tracks().len(), 2);
    assert_eq!(events.try_recv(), None);
}

#[tokio::test]
async fn test_audio_only_stream_has_no_video_to_toggle() {
    let (manager, _capture, _events) = fake_manager();
    let constraints = MediaConstraints {
        video: false,
        ..MediaConstraints::default()
    };
    manager.acquire_stream(&constraints).await.unwrap();

    assert_matches!(
        manager.toggle(TrackKind::Video).await,
        Err(VideoSessionError::NoLocalTrack { kind: TrackKind::Video })
    );
}

#[tokio::test]
async fn test_switch_device_swaps_one_track() {
    let (manager, capture, _events) = fake_manager();
    let before = manager.acquire_stream(&MediaConstraints::default()).await.unwrap();
    let old_video = before.track(TrackKind::Video).unwrap().clone();

    let switch = manager.switch_device(DeviceKind::Camera, "camera-usb").await.unwrap();
    let after = manager.local_stream().await.unwrap();

    assert_eq!(switch.old_track_id, old_video.id);
    assert_eq!(switch.stream_id, before.id);
    assert_eq!(after.track(TrackKind::Video).unwrap().device_id.as_deref(), Some("camera-usb"));
    assert_eq!(after.track(TrackKind::Audio), before.track(TrackKind::Audio));
    assert!(capture.stopped_tracks().contains(&old_video.id));
    assert_eq!(capture.live_tracks().len(), 2);
}

#[tokio::test]
async fn test_failed_switch_leaves_previous_track_active() {
    let (manager, capture, _events) = fake_manager();
    let before = manager.acquire_stream(&MediaConstraints::default()).await.unwrap();

    assert_matches!(
        manager.switch_device(DeviceKind::Microphone, "mic-missing").await,
        Err(VideoSessionError::DeviceSwitchFailed { kind: DeviceKind::Microphone, .. })
    );
    assert_eq!(manager.local_stream().await.unwrap(), before);
    assert!(capture.stopped_tracks().is_empty());
}

#[tokio::test]
async fn test_refresh_reports_changes_and_lost_devices() {
    let (manager, capture, mut events) = fake_manager();
    manager.initialize().await.unwrap();
    manager.acquire_stream(&MediaConstraints::default()).await.unwrap();

    manager.refresh().await.unwrap();
    assert_eq!(events.try_recv(), None);

    // The built-in microphone in use disappears.
    capture.set_devices(vec![
        camera(),
        DeviceDescriptor::new(DeviceKind::Microphone, "Headset Microphone", "mic-headset"),
    ]);
    manager.refresh().await.unwrap();

    assert_matches!(events.try_recv(), Some(SessionEvent::DevicesChanged { devices }) if devices.len() == 2);
    assert_matches!(
        events.try_recv(),
        Some(SessionEvent::Error { kind: ErrorKind::DeviceUnavailable, .. })
    );
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_stops_every_track() {
    let (manager, capture, _events) = fake_manager();
    manager.acquire_stream(&MediaConstraints::default()).await.unwrap();
    manager.switch_device(DeviceKind::Camera, "camera-usb").await.unwrap();

    manager.destroy().await;
    manager.destroy().await;

    assert!(capture.live_tracks().is_empty());
    assert!(manager.local_stream().await.is_none());
    assert_matches!(
        manager.switch_device(DeviceKind::Camera, "camera-builtin").await,
        Err(VideoSessionError::NoLocalStream)
    );
}

#[tokio::test]
async fn test_stream_arriving_after_destroy_is_released() {
    let (manager, capture, _events) = fake_manager();
    let gate = capture.hold_user_media();

    let constraints = MediaConstraints::default();
    let acquire = manager.acquire_stream(&constraints);
    let teardown = async {
        manager.destroy().await;
        drop(gate);
    };
    let (result, ()) = tokio::join!(acquire, teardown);

    assert_matches!(result, Err(VideoSessionError::Cancelled));
    assert_eq!(capture.opened_tracks().len(), 2);
    assert!(capture.live_tracks().is_empty());
}
