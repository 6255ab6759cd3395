// libs/video-session-cell/src/testing.rs
//! In-memory implementations of the capability traits.
//!
//! Used by the integration tests and by the session simulator. Every fake
//! keeps a ledger of what was asked of it so tests can assert on released
//! resources.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::capabilities::{
    CaptureError, CaptureHandle, CapturedStream, CapturedTrack, MediaCapture, RecordingSink,
    RecordingSinkError, StoredArtifact, TransportConnection, TransportError, TransportEvent,
    TransportFactory, TransportSession,
};
use crate::models::{
    DeviceDescriptor, DeviceKind, MediaConstraints, MediaStream, MediaTrack, StreamSource,
    TrackKind, TransportStats,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ==============================================================================
// MEDIA CAPTURE
// ==============================================================================

#[derive(Default)]
struct CaptureLedger {
    opened: Vec<String>,
    stopped: HashSet<String>,
    enabled: HashMap<String, bool>,
}

pub struct FakeCaptureHandle {
    track_ids: Vec<String>,
    ledger: Arc<Mutex<CaptureLedger>>,
}

impl CaptureHandle for FakeCaptureHandle {
    fn set_track_enabled(&self, track_id: &str, enabled: bool) {
        lock(&self.ledger).enabled.insert(track_id.to_string(), enabled);
    }

    fn stop_track(&self, track_id: &str) {
        lock(&self.ledger).stopped.insert(track_id.to_string());
    }

    fn stop_all(&self) {
        let mut ledger = lock(&self.ledger);
        for id in &self.track_ids {
            ledger.stopped.insert(id.clone());
        }
    }
}

/// Camera, microphone and display capture without hardware.
pub struct FakeMediaCapture {
    devices: Mutex<Vec<DeviceDescriptor>>,
    ledger: Arc<Mutex<CaptureLedger>>,
    next_id: AtomicUsize,
    user_media_requests: AtomicUsize,
    user_media_error: Mutex<Option<CaptureError>>,
    display_error: Mutex<Option<CaptureError>>,
    device_track_error: Mutex<Option<CaptureError>>,
    user_media_gate: Mutex<Option<oneshot::Receiver<()>>>,
    display_gate: Mutex<Option<oneshot::Receiver<()>>>,
    display_enders: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Default for FakeMediaCapture {
    fn default() -> Self {
        Self::with_devices(vec![
            DeviceDescriptor::new(DeviceKind::Camera, "Built-in Camera", "camera-builtin"),
            DeviceDescriptor::new(DeviceKind::Camera, "USB Document Camera", "camera-usb"),
            DeviceDescriptor::new(DeviceKind::Microphone, "Built-in Microphone", "mic-builtin"),
            DeviceDescriptor::new(DeviceKind::Microphone, "Headset Microphone", "mic-headset"),
        ])
    }
}

impl FakeMediaCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ledger: Arc::new(Mutex::new(CaptureLedger::default())),
            next_id: AtomicUsize::new(1),
            user_media_requests: AtomicUsize::new(0),
            user_media_error: Mutex::new(None),
            display_error: Mutex::new(None),
            device_track_error: Mutex::new(None),
            user_media_gate: Mutex::new(None),
            display_gate: Mutex::new(None),
            display_enders: Mutex::new(Vec::new()),
        }
    }

    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *lock(&self.devices) = devices;
    }

    /// The user refuses the camera/microphone prompt.
    pub fn deny_permission(&self) {
        self.fail_user_media(CaptureError::PermissionDenied);
    }

    pub fn fail_user_media(&self, error: CaptureError) {
        *lock(&self.user_media_error) = Some(error);
    }

    /// The user closes the display picker without choosing anything.
    pub fn cancel_display_picker(&self) {
        *lock(&self.display_error) = Some(CaptureError::Cancelled);
    }

    pub fn fail_device_track(&self, error: CaptureError) {
        *lock(&self.device_track_error) = Some(error);
    }

    /// Keep the next permission prompt open until the returned sender fires or drops.
    pub fn hold_user_media(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.user_media_gate) = Some(rx);
        tx
    }

    /// Keep the next display picker open until the returned sender fires or drops.
    pub fn hold_display_media(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.display_gate) = Some(rx);
        tx
    }

    /// Simulate the OS "stop sharing" button on the most recent display capture.
    pub fn end_display_capture(&self) -> bool {
        match lock(&self.display_enders).pop() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    pub fn opened_tracks(&self) -> Vec<String> {
        lock(&self.ledger).opened.clone()
    }

    pub fn stopped_tracks(&self) -> Vec<String> {
        let ledger = lock(&self.ledger);
        ledger
            .opened
            .iter()
            .filter(|id| ledger.stopped.contains(*id))
            .cloned()
            .collect()
    }

    /// Tracks opened and not yet stopped.
    pub fn live_tracks(&self) -> Vec<String> {
        let ledger = lock(&self.ledger);
        ledger
            .opened
            .iter()
            .filter(|id| !ledger.stopped.contains(*id))
            .cloned()
            .collect()
    }

    pub fn is_track_enabled(&self, track_id: &str) -> Option<bool> {
        lock(&self.ledger).enabled.get(track_id).copied()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn default_device(&self, kind: DeviceKind) -> Option<DeviceDescriptor> {
        lock(&self.devices).iter().find(|d| d.kind == kind).cloned()
    }

    fn device(&self, kind: DeviceKind, device_id: &str) -> Option<DeviceDescriptor> {
        lock(&self.devices)
            .iter()
            .find(|d| d.kind == kind && d.device_id == device_id)
            .cloned()
    }

    fn open_track(&self, device: &DeviceDescriptor) -> MediaTrack {
        let kind = device.kind.track_kind();
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let track = MediaTrack::new(self.next_id(prefix), kind, device.label.clone())
            .with_device(device.device_id.clone());
        lock(&self.ledger).opened.push(track.id.clone());
        track
    }

    fn handle_for(&self, tracks: &[MediaTrack]) -> Arc<dyn CaptureHandle> {
        Arc::new(FakeCaptureHandle {
            track_ids: tracks.iter().map(|t| t.id.clone()).collect(),
            ledger: Arc::clone(&self.ledger),
        })
    }

    fn select(&self, kind: DeviceKind, requested: Option<&str>) -> Result<DeviceDescriptor, CaptureError> {
        match requested {
            Some(id) => self
                .device(kind, id)
                .ok_or_else(|| CaptureError::DeviceUnavailable(format!("{} {} not found", kind, id))),
            None => self
                .default_device(kind)
                .ok_or_else(|| CaptureError::DeviceUnavailable(format!("no {} present", kind))),
        }
    }
}

#[async_trait]
impl MediaCapture for FakeMediaCapture {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        Ok(lock(&self.devices).clone())
    }

    async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<CapturedStream, CaptureError> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);

        let gate = lock(&self.user_media_gate).take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(error) = lock(&self.user_media_error).clone() {
            return Err(error);
        }

        let mut selected = Vec::new();
        if constraints.audio {
            selected.push(self.select(DeviceKind::Microphone, constraints.microphone_id.as_deref())?);
        }
        if constraints.video {
            selected.push(self.select(DeviceKind::Camera, constraints.camera_id.as_deref())?);
        }

        let tracks: Vec<MediaTrack> = selected.iter().map(|d| self.open_track(d)).collect();
        let handle = self.handle_for(&tracks);
        Ok(CapturedStream {
            stream: MediaStream::new(self.next_id("local"), StreamSource::LocalCapture, tracks),
            handle,
            ended: None,
        })
    }

    async fn open_device_track(&self, kind: DeviceKind, device_id: &str) -> Result<CapturedTrack, CaptureError> {
        if let Some(error) = lock(&self.device_track_error).clone() {
            return Err(error);
        }
        let device = self.select(kind, Some(device_id))?;
        let track = self.open_track(&device);
        let handle = self.handle_for(std::slice::from_ref(&track));
        Ok(CapturedTrack { track, handle })
    }

    async fn open_display_media(&self) -> Result<CapturedStream, CaptureError> {
        let gate = lock(&self.display_gate).take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(error) = lock(&self.display_error).clone() {
            return Err(error);
        }

        let track = MediaTrack::new(self.next_id("screen"), TrackKind::Video, "Entire screen");
        lock(&self.ledger).opened.push(track.id.clone());
        let tracks = vec![track];
        let handle = self.handle_for(&tracks);

        let (tx, rx) = oneshot::channel();
        lock(&self.display_enders).push(tx);

        Ok(CapturedStream {
            stream: MediaStream::new(self.next_id("display"), StreamSource::ScreenShare, tracks),
            handle,
            ended: Some(rx),
        })
    }
}

// ==============================================================================
// PEER TRANSPORT
// ==============================================================================

#[derive(Debug, Default, Clone)]
pub struct TransportLedger {
    pub added_streams: Vec<String>,
    pub removed_streams: Vec<String>,
    pub replaced_tracks: Vec<(String, String)>,
    pub negotiations: usize,
    pub ice_restarts: usize,
    pub stats_requests: usize,
    pub closes: usize,
}

/// A peer connection that answers instantly and is driven from the test.
pub struct FakeTransport {
    session_id: Uuid,
    events: mpsc::UnboundedSender<TransportEvent>,
    ledger: Mutex<TransportLedger>,
    stats: Mutex<VecDeque<TransportStats>>,
    last_stats: Mutex<Option<TransportStats>>,
    auto_answer: bool,
    answered: AtomicBool,
    closed: AtomicBool,
    fail_negotiate: AtomicBool,
    fail_replace_track: AtomicBool,
}

impl FakeTransport {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn ledger(&self) -> TransportLedger {
        lock(&self.ledger).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn push_stats(&self, stats: impl IntoIterator<Item = TransportStats>) {
        lock(&self.stats).extend(stats);
    }

    pub fn fail_negotiation(&self, fail: bool) {
        self.fail_negotiate.store(fail, Ordering::SeqCst);
    }

    pub fn fail_replace_track(&self, fail: bool) {
        self.fail_replace_track.store(fail, Ordering::SeqCst);
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn deliver_remote_stream(&self) -> bool {
        self.emit(TransportEvent::RemoteStream(remote_stream()))
    }

    pub fn disconnect(&self) -> bool {
        self.emit(TransportEvent::Disconnected)
    }

    pub fn reconnect(&self) -> bool {
        self.emit(TransportEvent::Connected)
    }

    pub fn hang_up(&self) -> bool {
        self.emit(TransportEvent::RemoteHangup)
    }

    pub fn fail(&self, message: &str) -> bool {
        self.emit(TransportEvent::Failed(message.to_string()))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Remote participant's camera and microphone.
pub fn remote_stream() -> MediaStream {
    MediaStream::new(
        "remote-1",
        StreamSource::Remote,
        vec![
            MediaTrack::new("remote-audio-1", TrackKind::Audio, "Remote microphone"),
            MediaTrack::new("remote-video-1", TrackKind::Video, "Remote camera"),
        ],
    )
}

#[async_trait]
impl TransportSession for FakeTransport {
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.ledger).added_streams.push(stream.id.clone());
        Ok(())
    }

    async fn remove_stream(&self, stream_id: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.ledger).removed_streams.push(stream_id.to_string());
        Ok(())
    }

    async fn replace_track(
        &self,
        _stream_id: &str,
        old_track_id: &str,
        track: &MediaTrack,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.fail_replace_track.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("sender rejected the track".to_string()));
        }
        lock(&self.ledger)
            .replaced_tracks
            .push((old_track_id.to_string(), track.id.clone()));
        Ok(())
    }

    async fn negotiate(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.ledger).negotiations += 1;
        if self.fail_negotiate.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("remote rejected the offer".to_string()));
        }
        if self.auto_answer && !self.answered.swap(true, Ordering::SeqCst) {
            self.deliver_remote_stream();
        }
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.ledger).ice_restarts += 1;
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.ensure_open()?;
        lock(&self.ledger).stats_requests += 1;

        let next = lock(&self.stats).pop_front();
        let mut last = lock(&self.last_stats);
        let stats = match next.or_else(|| last.clone()) {
            Some(stats) => stats,
            None => return Err(TransportError::Failed("no statistics available".to_string())),
        };
        *last = Some(stats.clone());
        Ok(stats)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.ledger).closes += 1;
    }
}

/// Hands out [`FakeTransport`]s and remembers them.
pub struct FakeTransportFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    connect_error: Mutex<Option<TransportError>>,
    initial_stats: Mutex<Vec<TransportStats>>,
    auto_answer: bool,
}

impl Default for FakeTransportFactory {
    fn default() -> Self {
        Self {
            transports: Mutex::new(Vec::new()),
            connect_error: Mutex::new(None),
            initial_stats: Mutex::new(Vec::new()),
            auto_answer: true,
        }
    }
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The remote side never answers on its own; tests deliver streams by hand.
    pub fn without_auto_answer() -> Self {
        Self {
            auto_answer: false,
            ..Self::default()
        }
    }

    pub fn with_stats(self, stats: Vec<TransportStats>) -> Self {
        self.queue_stats(stats);
        self
    }

    /// Stats handed to the next transport this factory creates.
    pub fn queue_stats(&self, stats: Vec<TransportStats>) {
        lock(&self.initial_stats).extend(stats);
    }

    pub fn fail_connect(&self, error: TransportError) {
        *lock(&self.connect_error) = Some(error);
    }

    pub fn connections(&self) -> usize {
        lock(&self.transports).len()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        lock(&self.transports).last().cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(&self, session_id: Uuid) -> Result<TransportConnection, TransportError> {
        if let Some(error) = lock(&self.connect_error).clone() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport {
            session_id,
            events: tx,
            ledger: Mutex::new(TransportLedger::default()),
            stats: Mutex::new(lock(&self.initial_stats).iter().cloned().collect()),
            last_stats: Mutex::new(None),
            auto_answer: self.auto_answer,
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_negotiate: AtomicBool::new(false),
            fail_replace_track: AtomicBool::new(false),
        });
        lock(&self.transports).push(Arc::clone(&transport));

        Ok(TransportConnection {
            session: transport,
            events: rx,
        })
    }
}

/// Cumulative stats snapshots, one per `interval`, reproducing the given
/// `(rtt_ms, loss_ratio, jitter_ms)` readings once deltas are taken.
pub fn stats_sequence(readings: &[(f64, f64, f64)], interval: Duration) -> Vec<TransportStats> {
    const PACKETS_PER_INTERVAL: u64 = 1_000;
    const BYTES_PER_INTERVAL: u64 = 250_000;

    let start: DateTime<Utc> = Utc::now();
    let step = chrono::Duration::milliseconds(interval.as_millis() as i64);
    let mut received = 0u64;
    let mut lost = 0u64;
    let mut bytes = 0u64;

    readings
        .iter()
        .enumerate()
        .map(|(i, &(rtt, loss, jitter))| {
            let interval_lost = (PACKETS_PER_INTERVAL as f64 * loss).round() as u64;
            lost += interval_lost;
            received += PACKETS_PER_INTERVAL - interval_lost;
            bytes += BYTES_PER_INTERVAL;
            TransportStats {
                timestamp: start + step * (i as i32 + 1),
                round_trip_time_ms: rtt,
                jitter_ms: jitter,
                packets_received: received,
                packets_lost: lost,
                bytes_received: bytes,
            }
        })
        .collect()
}

// ==============================================================================
// RECORDING STORAGE
// ==============================================================================

#[derive(Debug, Default, Clone)]
pub struct SinkLedger {
    pub begun: Vec<Uuid>,
    pub sources: HashMap<Uuid, Vec<String>>,
    pub pauses: usize,
    pub resumes: usize,
    pub finalized: Vec<(Uuid, Duration)>,
    pub discarded: Vec<Uuid>,
}

#[derive(Default)]
pub struct FakeRecordingSink {
    ledger: Mutex<SinkLedger>,
    fail_begin: AtomicBool,
    fail_finalize: AtomicBool,
}

impl FakeRecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Storage write errors on finalize.
    pub fn fail_finalize(&self, fail: bool) {
        self.fail_finalize.store(fail, Ordering::SeqCst);
    }

    pub fn ledger(&self) -> SinkLedger {
        lock(&self.ledger).clone()
    }
}

#[async_trait]
impl RecordingSink for FakeRecordingSink {
    async fn begin(&self, job_id: Uuid, sources: &[MediaStream]) -> Result<(), RecordingSinkError> {
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err(RecordingSinkError::Storage("recording volume unavailable".to_string()));
        }
        let mut ledger = lock(&self.ledger);
        ledger.begun.push(job_id);
        ledger
            .sources
            .insert(job_id, sources.iter().map(|s| s.id.clone()).collect());
        Ok(())
    }

    async fn pause(&self, job_id: Uuid) -> Result<(), RecordingSinkError> {
        let mut ledger = lock(&self.ledger);
        if !ledger.begun.contains(&job_id) {
            return Err(RecordingSinkError::UnknownJob(job_id));
        }
        ledger.pauses += 1;
        Ok(())
    }

    async fn resume(&self, job_id: Uuid) -> Result<(), RecordingSinkError> {
        let mut ledger = lock(&self.ledger);
        if !ledger.begun.contains(&job_id) {
            return Err(RecordingSinkError::UnknownJob(job_id));
        }
        ledger.resumes += 1;
        Ok(())
    }

    async fn finalize(&self, job_id: Uuid, duration: Duration) -> Result<StoredArtifact, RecordingSinkError> {
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(RecordingSinkError::Storage("disk full".to_string()));
        }
        let mut ledger = lock(&self.ledger);
        if !ledger.begun.contains(&job_id) {
            return Err(RecordingSinkError::UnknownJob(job_id));
        }
        ledger.finalized.push((job_id, duration));

        Ok(StoredArtifact {
            storage_ref: format!("memory://recordings/{}", job_id),
            // Roughly 1 Mbit/s of encoded media.
            size_bytes: duration.as_millis() as u64 * 125,
        })
    }

    async fn discard(&self, job_id: Uuid) {
        lock(&self.ledger).discarded.push(job_id);
    }
}
