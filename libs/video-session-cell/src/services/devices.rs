// libs/video-session-cell/src/services/devices.rs
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{CaptureHandle, MediaCapture};
use crate::error::{ErrorKind, VideoSessionError};
use crate::events::{EventSink, SessionEvent};
use crate::models::{
    DeviceDescriptor, DeviceKind, MediaConstraints, MediaStream, MediaTrack, TrackKind,
};

struct LocalCapture {
    stream: MediaStream,
    // track id -> handle that controls it
    handles: HashMap<String, Arc<dyn CaptureHandle>>,
}

impl LocalCapture {
    fn stop(self) {
        for track in &self.stream.tracks {
            if let Some(handle) = self.handles.get(&track.id) {
                handle.stop_track(&track.id);
            }
        }
    }
}

/// Result of a successful device switch, for the transport to swap in place.
#[derive(Debug, Clone)]
pub struct DeviceSwitch {
    pub stream_id: String,
    pub old_track_id: String,
    pub new_track: MediaTrack,
}

/// A replacement track opened by `prepare_switch`, not yet in the local stream.
pub struct PendingSwitch {
    kind: DeviceKind,
    device_id: String,
    stream_id: String,
    old_track_id: String,
    new_track: MediaTrack,
    handle: Arc<dyn CaptureHandle>,
}

impl PendingSwitch {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn old_track_id(&self) -> &str {
        &self.old_track_id
    }

    pub fn new_track(&self) -> &MediaTrack {
        &self.new_track
    }
}

/// Owns the local capture stream (camera + microphone).
pub struct DeviceManager {
    capture: Arc<dyn MediaCapture>,
    events: EventSink,
    devices: RwLock<Vec<DeviceDescriptor>>,
    local: Mutex<Option<LocalCapture>>,
    shutdown: CancellationToken,
}

impl DeviceManager {
    pub fn new(capture: Arc<dyn MediaCapture>, events: EventSink) -> Self {
        Self {
            capture,
            events,
            devices: RwLock::new(Vec::new()),
            local: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enumerate devices. Fails if either a camera or a microphone is missing.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<Vec<DeviceDescriptor>, VideoSessionError> {
        let found = self.capture.enumerate_devices().await?;

        if !found.iter().any(|d| d.kind == DeviceKind::Camera) {
            warn!("Device enumeration found no camera");
            return Err(VideoSessionError::NoCameraAvailable);
        }
        if !found.iter().any(|d| d.kind == DeviceKind::Microphone) {
            warn!("Device enumeration found no microphone");
            return Err(VideoSessionError::NoMicrophoneAvailable);
        }

        info!("Enumerated {} capture devices", found.len());
        *self.devices.write().await = found.clone();
        Ok(found)
    }

    /// Re-enumerate after an OS device-change notification.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Vec<DeviceDescriptor>, VideoSessionError> {
        let found = self.capture.enumerate_devices().await?;

        let changed = {
            let mut devices = self.devices.write().await;
            if *devices == found {
                false
            } else {
                *devices = found.clone();
                true
            }
        };

        if changed {
            info!("Capture devices changed, {} now present", found.len());
            self.events.emit(SessionEvent::DevicesChanged {
                devices: found.clone(),
            });

            let local = self.local.lock().await;
            if let Some(capture) = local.as_ref() {
                for track in &capture.stream.tracks {
                    let Some(device_id) = track.device_id.as_deref() else {
                        continue;
                    };
                    if !found.iter().any(|d| d.device_id == device_id) {
                        warn!("Active {:?} device {} disappeared", track.kind, device_id);
                        self.events.emit(SessionEvent::Error {
                            kind: ErrorKind::DeviceUnavailable,
                            detail: format!("{:?} device {} was removed", track.kind, device_id),
                        });
                    }
                }
            }
        }

        Ok(found)
    }

    pub async fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.read().await.clone()
    }

    /// Acquire the local capture stream. Suspends while the user answers the
    /// permission prompt; if the manager is destroyed meanwhile, the stream is
    /// stopped on arrival and `Cancelled` is returned.
    #[instrument(skip(self))]
    pub async fn acquire_stream(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, VideoSessionError> {
        if self.shutdown.is_cancelled() {
            return Err(VideoSessionError::Cancelled);
        }
        if let Some(existing) = self.local.lock().await.as_ref() {
            debug!("Local stream {} already acquired", existing.stream.id);
            return Ok(existing.stream.clone());
        }

        let captured = self.capture.open_user_media(constraints).await.map_err(|e| {
            warn!("Local media acquisition failed: {}", e);
            VideoSessionError::from(e)
        })?;

        let mut local = self.local.lock().await;
        if self.shutdown.is_cancelled() {
            info!("Discarding stream {} acquired after teardown", captured.stream.id);
            captured.handle.stop_all();
            return Err(VideoSessionError::Cancelled);
        }
        if let Some(existing) = local.as_ref() {
            captured.handle.stop_all();
            return Ok(existing.stream.clone());
        }

        let handles = captured
            .stream
            .tracks
            .iter()
            .map(|t| (t.id.clone(), Arc::clone(&captured.handle)))
            .collect();
        let stream = captured.stream.clone();
        *local = Some(LocalCapture {
            stream: captured.stream,
            handles,
        });

        info!("Acquired local stream {} with {} tracks", stream.id, stream.tracks.len());
        Ok(stream)
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.local.lock().await.as_ref().map(|c| c.stream.clone())
    }

    pub async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<MediaStream, VideoSessionError> {
        let mut local = self.local.lock().await;
        let capture = local.as_mut().ok_or(VideoSessionError::NoLocalStream)?;
        self.apply_enabled(capture, kind, |_| enabled)?;
        Ok(capture.stream.clone())
    }

    /// Flip the enabled flag of the local track of `kind`. Returns the new flag.
    pub async fn toggle(&self, kind: TrackKind) -> Result<bool, VideoSessionError> {
        let mut local = self.local.lock().await;
        let capture = local.as_mut().ok_or(VideoSessionError::NoLocalStream)?;
        self.apply_enabled(capture, kind, |current| !current)
    }

    fn apply_enabled(
        &self,
        capture: &mut LocalCapture,
        kind: TrackKind,
        next: impl FnOnce(bool) -> bool,
    ) -> Result<bool, VideoSessionError> {
        let track = capture
            .stream
            .track_mut(kind)
            .ok_or(VideoSessionError::NoLocalTrack { kind })?;
        let enabled = next(track.enabled);
        track.enabled = enabled;
        if let Some(handle) = capture.handles.get(&track.id) {
            handle.set_track_enabled(&track.id, enabled);
        }

        debug!("Local {:?} track enabled={}", kind, enabled);
        self.events.emit(SessionEvent::LocalTrackToggled { kind, enabled });
        Ok(enabled)
    }

    /// Swap the active track of `kind` for one from `device_id`. On failure the
    /// previous track stays active.
    pub async fn switch_device(
        &self,
        kind: DeviceKind,
        device_id: &str,
    ) -> Result<DeviceSwitch, VideoSessionError> {
        let pending = self.prepare_switch(kind, device_id).await?;
        self.commit_switch(pending).await
    }

    /// Open the replacement track without touching the local stream. The
    /// result must be handed to `commit_switch` or `abandon_switch`.
    #[instrument(skip(self))]
    pub async fn prepare_switch(
        &self,
        kind: DeviceKind,
        device_id: &str,
    ) -> Result<PendingSwitch, VideoSessionError> {
        let track_kind = kind.track_kind();
        let (stream_id, old_track_id, enabled) = {
            let local = self.local.lock().await;
            let capture = local.as_ref().ok_or(VideoSessionError::NoLocalStream)?;
            let track = capture
                .stream
                .track(track_kind)
                .ok_or(VideoSessionError::NoLocalTrack { kind: track_kind })?;
            (capture.stream.id.clone(), track.id.clone(), track.enabled)
        };

        let opened = self
            .capture
            .open_device_track(kind, device_id)
            .await
            .map_err(|e| VideoSessionError::DeviceSwitchFailed {
                kind,
                message: e.to_string(),
            })?;

        // Muted stays muted across a switch.
        let mut new_track = opened.track;
        new_track.enabled = enabled;
        opened.handle.set_track_enabled(&new_track.id, enabled);

        debug!("Opened {} track {} for switch from {}", kind, new_track.id, old_track_id);
        Ok(PendingSwitch {
            kind,
            device_id: device_id.to_string(),
            stream_id,
            old_track_id,
            new_track,
            handle: opened.handle,
        })
    }

    /// Put a prepared track into the local stream and stop the one it replaces.
    pub async fn commit_switch(&self, pending: PendingSwitch) -> Result<DeviceSwitch, VideoSessionError> {
        let PendingSwitch {
            kind,
            device_id,
            stream_id,
            old_track_id,
            mut new_track,
            handle,
        } = pending;

        let mut local = self.local.lock().await;
        if self.shutdown.is_cancelled() {
            handle.stop_track(&new_track.id);
            return Err(VideoSessionError::Cancelled);
        }
        let Some(capture) = local.as_mut() else {
            handle.stop_track(&new_track.id);
            return Err(VideoSessionError::NoLocalStream);
        };
        let Some(slot) = capture.stream.tracks.iter_mut().find(|t| t.id == old_track_id) else {
            handle.stop_track(&new_track.id);
            return Err(VideoSessionError::DeviceSwitchFailed {
                kind,
                message: format!("track {} was replaced during the switch", old_track_id),
            });
        };

        if new_track.enabled != slot.enabled {
            new_track.enabled = slot.enabled;
            handle.set_track_enabled(&new_track.id, new_track.enabled);
        }

        let old_track = std::mem::replace(slot, new_track.clone());
        if let Some(old_handle) = capture.handles.remove(&old_track.id) {
            old_handle.stop_track(&old_track.id);
        }
        capture.handles.insert(new_track.id.clone(), handle);

        info!("Switched {} from track {} to {}", kind, old_track.id, new_track.id);
        self.events.emit(SessionEvent::DeviceSwitched { kind, device_id });

        Ok(DeviceSwitch {
            stream_id,
            old_track_id: old_track.id,
            new_track,
        })
    }

    /// Drop a prepared track; the current one stays in place.
    pub fn abandon_switch(&self, pending: PendingSwitch) {
        info!(
            "Abandoning {} switch, keeping track {}",
            pending.kind, pending.old_track_id
        );
        pending.handle.stop_track(&pending.new_track.id);
    }

    /// Stop every owned track and release the capture. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn destroy(&self) {
        self.shutdown.cancel();
        if let Some(capture) = self.local.lock().await.take() {
            info!("Releasing local stream {}", capture.stream.id);
            capture.stop();
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(capture) = self.local.get_mut().take() {
            capture.stop();
        }
    }
}
