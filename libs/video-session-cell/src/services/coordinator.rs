// libs/video-session-cell/src/services/coordinator.rs
//! Session coordinator.
//!
//! Owns the lifecycle of one call. The four managers are handed in at
//! construction; each of them reports to the UI on the shared event sink,
//! while the coordinator runs a single driver task per session that reacts
//! to peer-connection events, renegotiation requests from screen sharing,
//! and its own negotiation and reconnect timers.
//!
//! A coordinator is single-use: once the session is `ended` or `failed` it
//! stays there.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::{
    MediaCapture, RecordingSink, TransportEvent, TransportFactory, TransportSession,
};
use crate::error::{ErrorKind, VideoSessionError};
use crate::events::{self, EventSink, EventStream, SessionCommand, SessionEvent};
use crate::models::{
    DeviceDescriptor, DeviceKind, MediaConstraints, MediaStream, Participant, QualityLevel,
    RecordingArtifact, RecordingJob, Session, SessionConfig, SessionState, TerminationReason,
    TrackKind,
};
use crate::services::devices::DeviceManager;
use crate::services::quality::ConnectionQualityMonitor;
use crate::services::recording::RecordingManager;
use crate::services::screen_share::{RenegotiationRequest, ScreenShareManager};

/// The per-session managers, constructed by the caller.
pub struct SessionManagers {
    pub devices: Arc<DeviceManager>,
    pub screen_share: Arc<ScreenShareManager>,
    pub recording: Arc<RecordingManager>,
    pub quality: Arc<ConnectionQualityMonitor>,
}

impl SessionManagers {
    pub fn new(
        config: &SessionConfig,
        capture: Arc<dyn MediaCapture>,
        recording_sink: Arc<dyn RecordingSink>,
        events: &EventSink,
    ) -> Self {
        Self {
            devices: Arc::new(DeviceManager::new(Arc::clone(&capture), events.clone())),
            screen_share: Arc::new(ScreenShareManager::new(capture, events.clone())),
            recording: Arc::new(RecordingManager::new(recording_sink, events.clone())),
            quality: Arc::new(ConnectionQualityMonitor::new(config, events.clone())),
        }
    }
}

struct SessionSlot {
    state: SessionState,
    session: Option<Session>,
    transport: Option<Arc<dyn TransportSession>>,
    // Set while a teardown is releasing resources; the state is still the old one.
    terminating: bool,
}

impl SessionSlot {
    fn is_live(&self) -> bool {
        !self.terminating && !self.state.is_terminal()
    }
}

struct CoordinatorInner {
    id: Uuid,
    config: SessionConfig,
    devices: Arc<DeviceManager>,
    screen_share: Arc<ScreenShareManager>,
    recording: Arc<RecordingManager>,
    quality: Arc<ConnectionQualityMonitor>,
    transport_factory: Arc<dyn TransportFactory>,
    events: EventSink,
    slot: Mutex<SessionSlot>,
    // Serializes teardowns so a second caller waits for the first to finish.
    teardown: Mutex<()>,
    shutdown: CancellationToken,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
    renegotiation: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RenegotiationRequest>>>,
    destroyed: AtomicBool,
}

pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        managers: SessionManagers,
        transport_factory: Arc<dyn TransportFactory>,
        events: EventSink,
    ) -> Self {
        let renegotiation = managers.screen_share.take_renegotiation_requests();
        if renegotiation.is_none() {
            warn!("Screen share renegotiation requests already claimed; shares will not reach the peer");
        }

        Self {
            inner: Arc::new(CoordinatorInner {
                id: Uuid::new_v4(),
                config,
                devices: managers.devices,
                screen_share: managers.screen_share,
                recording: managers.recording,
                quality: managers.quality,
                transport_factory,
                events,
                slot: Mutex::new(SessionSlot {
                    state: SessionState::Idle,
                    session: None,
                    transport: None,
                    terminating: false,
                }),
                teardown: Mutex::new(()),
                shutdown: CancellationToken::new(),
                driver: std::sync::Mutex::new(None),
                renegotiation: std::sync::Mutex::new(renegotiation),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Wire a coordinator and its managers to the given capabilities.
    pub fn with_capabilities(
        config: SessionConfig,
        capture: Arc<dyn MediaCapture>,
        transport_factory: Arc<dyn TransportFactory>,
        recording_sink: Arc<dyn RecordingSink>,
    ) -> (Self, EventStream) {
        let (sink, stream) = events::channel();
        let managers = SessionManagers::new(&config, capture, recording_sink, &sink);
        (Self::new(config, managers, transport_factory, sink), stream)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub async fn state(&self) -> SessionState {
        self.inner.slot.lock().await.state
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.slot.lock().await.session.clone()
    }

    pub fn quality_level(&self) -> QualityLevel {
        self.inner.quality.level()
    }

    pub fn quality_monitor(&self) -> &ConnectionQualityMonitor {
        &self.inner.quality
    }

    pub async fn recording_job(&self) -> RecordingJob {
        self.inner.recording.job().await
    }

    pub fn screen_share_stream(&self) -> Option<MediaStream> {
        self.inner.screen_share.active_stream()
    }

    // ==========================================================================
    // LIFECYCLE
    // ==========================================================================

    /// Acquire local media, build the peer connection and start negotiating.
    /// Returns once the session is `connecting`; reaching `connected` is
    /// reported on the event stream.
    #[instrument(skip(self, constraints), fields(session_id = %self.inner.id))]
    pub async fn start(
        &self,
        participant: Participant,
        constraints: MediaConstraints,
    ) -> Result<Session, VideoSessionError> {
        let inner = &self.inner;

        {
            let mut slot = inner.slot.lock().await;
            if slot.state != SessionState::Idle || slot.terminating {
                return Err(VideoSessionError::InvalidSessionState { state: slot.state });
            }
            let mut session = Session::new(participant);
            session.id = inner.id;
            info!(
                "Starting video session {} for {:?} {}",
                inner.id, session.participant.participant_type, session.participant.id
            );
            slot.session = Some(session);
            inner.transition(&mut slot, SessionState::AcquiringPermissions, None);
        }

        let local = match inner.devices.acquire_stream(&constraints).await {
            Ok(stream) => stream,
            Err(e) => return Err(inner.abort_start(e).await),
        };

        {
            let mut slot = inner.slot.lock().await;
            if !slot.is_live() {
                info!("Session {} torn down while acquiring media", inner.id);
                return Err(VideoSessionError::Cancelled);
            }
            if let Some(session) = slot.session.as_mut() {
                session.local_stream = Some(local.clone());
            }
            inner.transition(&mut slot, SessionState::Initializing, None);
        }

        let connection = match inner.transport_factory.connect(inner.id).await {
            Ok(connection) => connection,
            Err(e) => return Err(inner.abort_start(e.into()).await),
        };
        let transport = connection.session;

        {
            let mut slot = inner.slot.lock().await;
            if !slot.is_live() {
                drop(slot);
                info!("Session {} torn down while building the peer connection", inner.id);
                transport.close().await;
                return Err(VideoSessionError::Cancelled);
            }
            slot.transport = Some(Arc::clone(&transport));
        }

        if let Err(e) = transport.add_stream(&local).await {
            return Err(inner.abort_start(e.into()).await);
        }

        {
            let mut slot = inner.slot.lock().await;
            if !slot.is_live() {
                return Err(VideoSessionError::Cancelled);
            }
            inner.transition(&mut slot, SessionState::Connecting, None);

            let renegotiation = inner
                .renegotiation
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            let driver = SessionDriver {
                inner: Arc::clone(inner),
                transport: Arc::clone(&transport),
                timer: Some((
                    Instant::now() + inner.config.negotiation_timeout,
                    DriverTimer::ConnectTimeout,
                )),
                reconnect_attempt: 0,
            };
            let handle = tokio::spawn(driver.run(connection.events, renegotiation));
            *inner.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        if let Err(e) = transport.negotiate().await {
            return Err(inner.abort_start(e.into()).await);
        }

        let slot = inner.slot.lock().await;
        slot.session
            .clone()
            .ok_or(VideoSessionError::InvalidSessionState { state: slot.state })
    }

    /// End the call. A no-op once the session is terminal.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn end(&self, reason: TerminationReason) {
        if !self.inner.terminate(SessionState::Ended, reason).await {
            debug!("Session {} already ended", self.inner.id);
        }
    }

    /// Scoped teardown: ends the session if needed, then releases the peer
    /// connection, the local tracks and the event listeners, in that order.
    /// Safe to call any number of times.
    pub async fn destroy(&self) {
        self.inner.destroy().await;
    }

    // ==========================================================================
    // LOCAL MEDIA
    // ==========================================================================

    /// Flip the microphone track. Returns whether audio is now enabled.
    pub async fn toggle_mute(&self) -> Result<bool, VideoSessionError> {
        self.toggle(TrackKind::Audio).await
    }

    /// Flip the camera track. Returns whether video is now enabled.
    pub async fn toggle_video(&self) -> Result<bool, VideoSessionError> {
        self.toggle(TrackKind::Video).await
    }

    async fn toggle(&self, kind: TrackKind) -> Result<bool, VideoSessionError> {
        let enabled = self.inner.devices.toggle(kind).await?;
        self.inner.sync_local_stream().await;
        Ok(enabled)
    }

    /// Switch the capture device of `kind`. The peer connection swaps the
    /// track first; the local stream only changes once that succeeded.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn switch_device(&self, kind: DeviceKind, device_id: &str) -> Result<(), VideoSessionError> {
        let inner = &self.inner;

        let pending = match inner.devices.prepare_switch(kind, device_id).await {
            Ok(pending) => pending,
            Err(e) => {
                if matches!(e, VideoSessionError::DeviceSwitchFailed { .. }) {
                    inner.report(&e);
                }
                return Err(e);
            }
        };

        let transport = inner.slot.lock().await.transport.clone();
        if let Some(transport) = transport {
            if let Err(e) = transport
                .replace_track(pending.stream_id(), pending.old_track_id(), pending.new_track())
                .await
            {
                inner.devices.abandon_switch(pending);
                let err = VideoSessionError::from(e);
                warn!("Peer connection rejected the switched {} track: {}", kind, err);
                inner.report(&err);
                return Err(err);
            }
        }

        let switch = match inner.devices.commit_switch(pending).await {
            Ok(switch) => switch,
            Err(e) => {
                if matches!(e, VideoSessionError::DeviceSwitchFailed { .. }) {
                    inner.report(&e);
                }
                return Err(e);
            }
        };
        debug!("Local stream {} now carries track {}", switch.stream_id, switch.new_track.id);
        inner.sync_local_stream().await;
        Ok(())
    }

    pub async fn refresh_devices(&self) -> Result<Vec<DeviceDescriptor>, VideoSessionError> {
        self.inner.devices.refresh().await
    }

    // ==========================================================================
    // SCREEN SHARE
    // ==========================================================================

    /// Start sharing the screen alongside the camera. A refused picker is
    /// reported as an error event; the call continues.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn start_screen_share(&self) -> Result<MediaStream, VideoSessionError> {
        {
            let slot = self.inner.slot.lock().await;
            if slot.state != SessionState::Connected || slot.terminating {
                return Err(VideoSessionError::InvalidSessionState { state: slot.state });
            }
        }

        match self.inner.screen_share.start().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                if e == VideoSessionError::ScreenShareDenied {
                    self.inner.report(&e);
                }
                Err(e)
            }
        }
    }

    /// Returns `false` when nothing was being shared.
    pub fn stop_screen_share(&self) -> bool {
        self.inner.screen_share.stop()
    }

    // ==========================================================================
    // RECORDING
    // ==========================================================================

    /// Record the local, remote and shared-screen streams into one artifact.
    #[instrument(skip(self), fields(session_id = %self.inner.id))]
    pub async fn start_recording(&self, consent: bool) -> Result<RecordingJob, VideoSessionError> {
        // Held across the start so a teardown cannot slip in between the state
        // check and the job becoming active.
        let slot = self.inner.slot.lock().await;
        let state = if slot.terminating {
            SessionState::Ended
        } else {
            slot.state
        };

        let mut streams = Vec::new();
        if let Some(session) = slot.session.as_ref() {
            streams.extend(session.local_stream.clone());
            streams.extend(session.remote_stream.clone());
        }
        streams.extend(self.inner.screen_share.active_stream());

        self.inner.recording.start(streams, consent, state).await
    }

    pub async fn pause_recording(&self) -> Result<RecordingJob, VideoSessionError> {
        self.inner.recording.pause().await
    }

    /// Resume a paused job. Only a connected session may record.
    pub async fn resume_recording(&self) -> Result<RecordingJob, VideoSessionError> {
        let slot = self.inner.slot.lock().await;
        let state = if slot.terminating {
            SessionState::Ended
        } else {
            slot.state
        };
        self.inner.recording.resume(state).await
    }

    pub async fn stop_recording(&self) -> Result<RecordingArtifact, VideoSessionError> {
        self.inner.recording.stop().await
    }

    // ==========================================================================
    // COMMAND DISPATCH
    // ==========================================================================

    /// Apply one inbound command from the UI surface.
    pub async fn dispatch(&self, command: SessionCommand) -> Result<(), VideoSessionError> {
        debug!("Dispatching {:?}", command);
        match command {
            SessionCommand::StartSession {
                participant,
                constraints,
            } => self.start(participant, constraints).await.map(|_| ()),
            SessionCommand::EndSession { reason } => {
                self.end(reason.unwrap_or(TerminationReason::UserEnded)).await;
                Ok(())
            }
            SessionCommand::ToggleMute => self.toggle_mute().await.map(|_| ()),
            SessionCommand::ToggleVideo => self.toggle_video().await.map(|_| ()),
            SessionCommand::StartScreenShare => self.start_screen_share().await.map(|_| ()),
            SessionCommand::StopScreenShare => {
                self.stop_screen_share();
                Ok(())
            }
            SessionCommand::StartRecording { consent } => {
                self.start_recording(consent).await.map(|_| ())
            }
            SessionCommand::PauseRecording => self.pause_recording().await.map(|_| ()),
            SessionCommand::ResumeRecording => self.resume_recording().await.map(|_| ()),
            SessionCommand::StopRecording => self.stop_recording().await.map(|_| ()),
            SessionCommand::SwitchDevice { kind, device_id } => {
                self.switch_device(kind, &device_id).await
            }
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move { inner.destroy().await });
            }
            Err(_) => {
                warn!("Session {} dropped outside a runtime; releasing synchronously", self.inner.id);
                self.inner.quality.stop();
                self.inner.screen_share.destroy();
                self.inner.events.close();
            }
        }
    }
}

impl CoordinatorInner {
    /// Apply a state change on the locked slot and announce it.
    fn transition(
        &self,
        slot: &mut SessionSlot,
        to: SessionState,
        reason: Option<TerminationReason>,
    ) -> bool {
        let from = slot.state;
        if !from.can_transition_to(to) {
            warn!("Ignoring invalid session transition {} -> {}", from, to);
            return false;
        }

        slot.state = to;
        if let Some(session) = slot.session.as_mut() {
            session.state = to;
            match to {
                SessionState::Connected if session.connected_at.is_none() => {
                    session.connected_at = Some(chrono::Utc::now());
                }
                SessionState::Ended | SessionState::Failed => {
                    session.ended_at = Some(chrono::Utc::now());
                    session.termination_reason = reason;
                }
                _ => {}
            }
        }

        info!("Session {} {} -> {}", self.id, from, to);
        self.events.emit(SessionEvent::SessionStateChanged {
            session_id: self.id,
            state: to,
            reason,
        });
        true
    }

    fn report(&self, err: &VideoSessionError) {
        self.events.emit(SessionEvent::Error {
            kind: err.kind(),
            detail: err.to_string(),
        });
    }

    async fn is_live(&self) -> bool {
        self.slot.lock().await.is_live()
    }

    async fn sync_local_stream(&self) {
        let stream = self.devices.local_stream().await;
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.session.as_mut() {
            if stream.is_some() {
                session.local_stream = stream;
            }
        }
    }

    /// Fail a session whose start sequence broke. If a teardown already
    /// claimed the session, the result is discarded as `Cancelled`.
    async fn abort_start(&self, err: VideoSessionError) -> VideoSessionError {
        if !self.is_live().await {
            info!("Start of session {} abandoned after teardown: {}", self.id, err);
            return VideoSessionError::Cancelled;
        }

        error!("Session {} failed to start: {}", self.id, err);
        self.report(&err);
        if self.terminate(SessionState::Failed, termination_reason(&err)).await {
            err
        } else {
            VideoSessionError::Cancelled
        }
    }

    /// Release everything the session holds, then move to `target`.
    /// Returns `false` if the session was already terminal.
    async fn terminate(&self, target: SessionState, reason: TerminationReason) -> bool {
        let _teardown = self.teardown.lock().await;

        let transport = {
            let mut slot = self.slot.lock().await;
            if !slot.is_live() {
                return false;
            }
            slot.terminating = true;
            slot.transport.take()
        };
        self.shutdown.cancel();
        info!("Tearing down session {} ({:?})", self.id, reason);

        self.quality.stop();
        if let Some(Err(e)) = self.recording.release().await {
            warn!("Recording for session {} did not finalize: {}", self.id, e);
        }
        self.screen_share.destroy();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.devices.destroy().await;

        let mut slot = self.slot.lock().await;
        slot.terminating = false;
        self.transition(&mut slot, target, Some(reason));
        true
    }

    async fn destroy(&self) {
        self.terminate(SessionState::Ended, TerminationReason::Destroyed)
            .await;

        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let transport = self.slot.lock().await.transport.take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.devices.destroy().await;

        self.shutdown.cancel();
        if let Some(driver) = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take() {
            driver.abort();
        }
        self.events.close();
        info!("Session {} destroyed", self.id);
    }
}

/// Reason recorded on the session when `err` ends it.
pub(crate) fn termination_reason(err: &VideoSessionError) -> TerminationReason {
    match err {
        VideoSessionError::PermissionDenied => TerminationReason::PermissionDenied,
        VideoSessionError::DeviceUnavailable { .. }
        | VideoSessionError::NoCameraAvailable
        | VideoSessionError::NoMicrophoneAvailable
        | VideoSessionError::NoLocalStream
        | VideoSessionError::NoLocalTrack { .. } => TerminationReason::DeviceUnavailable,
        VideoSessionError::NegotiationTimeout => TerminationReason::NegotiationTimeout,
        VideoSessionError::Cancelled => TerminationReason::Destroyed,
        _ => TerminationReason::TransportFailed,
    }
}

// ==============================================================================
// SESSION DRIVER
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum DriverTimer {
    ConnectTimeout,
    ReconnectAttempt,
}

enum DriverInput {
    Shutdown,
    Transport(Option<TransportEvent>),
    Renegotiation(Option<RenegotiationRequest>),
    Timer(DriverTimer),
}

struct SessionDriver {
    inner: Arc<CoordinatorInner>,
    transport: Arc<dyn TransportSession>,
    timer: Option<(Instant, DriverTimer)>,
    reconnect_attempt: u32,
}

async fn next_request(
    rx: &mut Option<mpsc::UnboundedReceiver<RenegotiationRequest>>,
) -> Option<RenegotiationRequest> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn fire_at(timer: Option<(Instant, DriverTimer)>) -> DriverTimer {
    match timer {
        Some((deadline, kind)) => {
            sleep_until(deadline).await;
            kind
        }
        None => std::future::pending().await,
    }
}

impl SessionDriver {
    async fn run(
        mut self,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut renegotiation: Option<mpsc::UnboundedReceiver<RenegotiationRequest>>,
    ) {
        let shutdown = self.inner.shutdown.clone();
        let mut transport_open = true;

        loop {
            let input = tokio::select! {
                biased;
                _ = shutdown.cancelled() => DriverInput::Shutdown,
                event = transport_events.recv(), if transport_open => DriverInput::Transport(event),
                request = next_request(&mut renegotiation) => DriverInput::Renegotiation(request),
                kind = fire_at(self.timer) => DriverInput::Timer(kind),
            };

            match input {
                DriverInput::Shutdown => break,
                DriverInput::Transport(Some(event)) => self.on_transport_event(event).await,
                DriverInput::Transport(None) => {
                    debug!("Transport event channel for session {} closed", self.inner.id);
                    transport_open = false;
                }
                DriverInput::Renegotiation(Some(request)) => self.renegotiate(request).await,
                DriverInput::Renegotiation(None) => renegotiation = None,
                DriverInput::Timer(kind) => {
                    self.timer = None;
                    self.on_timer(kind).await;
                }
            }
        }

        debug!("Driver for session {} exited", self.inner.id);
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let inner = Arc::clone(&self.inner);
        match event {
            TransportEvent::RemoteStream(stream) => self.on_remote_stream(stream).await,
            TransportEvent::Connected => {
                let mut slot = inner.slot.lock().await;
                if slot.is_live() && slot.state == SessionState::Reconnecting {
                    self.mark_connected(&mut slot);
                }
            }
            TransportEvent::Disconnected => {
                let mut slot = inner.slot.lock().await;
                if slot.is_live() && slot.state == SessionState::Connected {
                    self.enter_reconnecting(&mut slot);
                }
            }
            TransportEvent::Failed(message) => {
                let state = {
                    let mut slot = inner.slot.lock().await;
                    if !slot.is_live() {
                        return;
                    }
                    if slot.state == SessionState::Connected {
                        warn!("Transport failure on session {}: {}", self.inner.id, message);
                        self.enter_reconnecting(&mut slot);
                    }
                    slot.state
                };

                match state {
                    SessionState::Connecting => {
                        let err = VideoSessionError::Transport { message };
                        error!("Session {} failed while connecting: {}", self.inner.id, err);
                        self.inner.report(&err);
                        self.inner
                            .terminate(SessionState::Failed, TerminationReason::TransportFailed)
                            .await;
                    }
                    SessionState::Reconnecting => {
                        debug!("Transport failure absorbed by reconnect loop: {}", message);
                    }
                    _ => {}
                }
            }
            TransportEvent::RemoteHangup => {
                info!("Remote party hung up session {}", self.inner.id);
                self.inner
                    .terminate(SessionState::Ended, TerminationReason::RemoteHangup)
                    .await;
            }
            TransportEvent::NegotiationNeeded => {
                if !self.inner.is_live().await {
                    return;
                }
                if let Err(e) = self.transport.negotiate().await {
                    warn!("Renegotiation of session {} failed: {}", self.inner.id, e);
                    self.inner.report(&VideoSessionError::from(e));
                }
            }
        }
    }

    async fn on_remote_stream(&mut self, stream: MediaStream) {
        if !stream.is_usable() {
            warn!("Ignoring remote stream {} without tracks", stream.id);
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut slot = inner.slot.lock().await;
        if !slot.is_live() {
            return;
        }
        if let Some(session) = slot.session.as_mut() {
            session.remote_stream = Some(stream.clone());
        }

        debug!("Remote stream {} available on session {}", stream.id, self.inner.id);
        self.inner
            .events
            .emit(SessionEvent::RemoteStreamAvailable { stream });

        if matches!(slot.state, SessionState::Connecting | SessionState::Reconnecting) {
            self.mark_connected(&mut slot);
        }
    }

    fn mark_connected(&mut self, slot: &mut SessionSlot) {
        if !self.inner.transition(slot, SessionState::Connected, None) {
            return;
        }
        self.timer = None;
        self.reconnect_attempt = 0;

        if let Some(session) = slot.session.as_ref() {
            if let Err(e) = self.inner.quality.start(session, Arc::clone(&self.transport)) {
                warn!("Quality monitor did not start: {}", e);
            }
        }
    }

    fn enter_reconnecting(&mut self, slot: &mut SessionSlot) {
        if !self.inner.transition(slot, SessionState::Reconnecting, None) {
            return;
        }
        self.inner.quality.stop();
        self.reconnect_attempt = 0;
        self.schedule_reconnect(1);
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let delay = self.inner.config.reconnect_delay(attempt) + jitter(self.inner.config.reconnect_jitter);
        debug!("Reconnect attempt {} for session {} in {:?}", attempt, self.inner.id, delay);
        self.timer = Some((Instant::now() + delay, DriverTimer::ReconnectAttempt));
    }

    async fn on_timer(&mut self, kind: DriverTimer) {
        match kind {
            DriverTimer::ConnectTimeout => {
                if self.inner.slot.lock().await.state != SessionState::Connecting {
                    return;
                }
                self.fail_negotiation().await;
            }
            DriverTimer::ReconnectAttempt => {
                let inner = Arc::clone(&self.inner);
                {
                    let mut slot = inner.slot.lock().await;
                    if !slot.is_live() || slot.state != SessionState::Reconnecting {
                        return;
                    }
                    self.reconnect_attempt += 1;
                    if self.reconnect_attempt <= self.inner.config.reconnect_max_attempts {
                        if let Some(session) = slot.session.as_mut() {
                            session.reconnect_attempts = self.reconnect_attempt;
                        }
                    }
                }

                if self.reconnect_attempt > self.inner.config.reconnect_max_attempts {
                    warn!(
                        "Session {} gave up after {} reconnect attempts",
                        self.inner.id, self.inner.config.reconnect_max_attempts
                    );
                    self.fail_negotiation().await;
                    return;
                }

                info!("Reconnect attempt {} for session {}", self.reconnect_attempt, self.inner.id);
                if let Err(e) = self.transport.restart_ice().await {
                    warn!("ICE restart failed: {}", e);
                }
                self.schedule_reconnect(self.reconnect_attempt + 1);
            }
        }
    }

    async fn fail_negotiation(&self) {
        let err = VideoSessionError::NegotiationTimeout;
        if self.inner.is_live().await {
            self.inner.report(&err);
        }
        self.inner
            .terminate(SessionState::Failed, TerminationReason::NegotiationTimeout)
            .await;
    }

    async fn renegotiate(&self, request: RenegotiationRequest) {
        if !self.inner.is_live().await {
            debug!("Dropping {:?} for a session being torn down", request);
            return;
        }

        let result = match &request {
            RenegotiationRequest::AddStream(stream) => self.transport.add_stream(stream).await,
            RenegotiationRequest::RemoveStream(stream_id) => {
                self.transport.remove_stream(stream_id).await
            }
        };
        let result = match result {
            Ok(()) => self.transport.negotiate().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Renegotiation for {:?} failed: {}", request, e);
            self.inner.events.emit(SessionEvent::Error {
                kind: ErrorKind::Transport,
                detail: e.to_string(),
            });
        }
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_reason_mapping() {
        assert_eq!(
            termination_reason(&VideoSessionError::PermissionDenied),
            TerminationReason::PermissionDenied
        );
        assert_eq!(
            termination_reason(&VideoSessionError::NoCameraAvailable),
            TerminationReason::DeviceUnavailable
        );
        assert_eq!(
            termination_reason(&VideoSessionError::Transport { message: "ice".into() }),
            TerminationReason::TransportFailed
        );
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..50 {
            assert!(jitter(Duration::from_millis(20)) <= Duration::from_millis(20));
        }
    }
}
