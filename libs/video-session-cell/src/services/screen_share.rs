// libs/video-session-cell/src/services/screen_share.rs
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{CaptureError, CaptureHandle, MediaCapture};
use crate::error::VideoSessionError;
use crate::events::{EventSink, SessionEvent};
use crate::models::MediaStream;

/// Asks the coordinator to update the peer connection. The screen-share
/// manager never touches the transport itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RenegotiationRequest {
    AddStream(MediaStream),
    RemoveStream(String),
}

struct ActiveShare {
    cycle: u64,
    stream: MediaStream,
    handle: Arc<dyn CaptureHandle>,
    watcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ShareState {
    starting: bool,
    cycle: u64,
    active: Option<ActiveShare>,
}

struct ShareInner {
    events: EventSink,
    renegotiation: mpsc::UnboundedSender<RenegotiationRequest>,
    state: Mutex<ShareState>,
    shutdown: CancellationToken,
}

impl ShareInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, ShareState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tear down the active share, if it belongs to `cycle` (any cycle when `None`).
    /// Whoever takes the share out of the slot emits the one `ScreenShareStopped`.
    fn stop_cycle(&self, cycle: Option<u64>) -> bool {
        let mut state = self.lock();
        let owns_cycle = match (&state.active, cycle) {
            (Some(active), Some(cycle)) => active.cycle == cycle,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !owns_cycle {
            return false;
        }
        let Some(share) = state.active.take() else {
            return false;
        };

        for track in &share.stream.tracks {
            share.handle.stop_track(&track.id);
        }
        info!("Screen share {} stopped (cycle {})", share.stream.id, share.cycle);

        self.events.emit(SessionEvent::ScreenShareStopped {
            stream_id: share.stream.id.clone(),
        });
        let _ = self
            .renegotiation
            .send(RenegotiationRequest::RemoveStream(share.stream.id.clone()));

        if let Some(watcher) = share.watcher {
            watcher.abort();
        }
        true
    }
}

/// Resets the `starting` flag even if the `start` future is dropped mid-picker.
struct StartingGuard<'a> {
    inner: &'a ShareInner,
    armed: bool,
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().starting = false;
        }
    }
}

/// Owns the display-capture stream, independent of the camera stream.
pub struct ScreenShareManager {
    capture: Arc<dyn MediaCapture>,
    inner: Arc<ShareInner>,
    requests: Mutex<Option<mpsc::UnboundedReceiver<RenegotiationRequest>>>,
}

impl ScreenShareManager {
    pub fn new(capture: Arc<dyn MediaCapture>, events: EventSink) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            capture,
            inner: Arc::new(ShareInner {
                events,
                renegotiation: tx,
                state: Mutex::new(ShareState::default()),
                shutdown: CancellationToken::new(),
            }),
            requests: Mutex::new(Some(rx)),
        }
    }

    /// Receiver for renegotiation requests. Can be taken once.
    pub fn take_renegotiation_requests(&self) -> Option<mpsc::UnboundedReceiver<RenegotiationRequest>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Open the display picker and start sharing. Only one share at a time.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<MediaStream, VideoSessionError> {
        {
            let mut state = self.inner.lock();
            if self.inner.shutdown.is_cancelled() {
                return Err(VideoSessionError::Cancelled);
            }
            if state.starting || state.active.is_some() {
                return Err(VideoSessionError::ScreenShareAlreadyActive);
            }
            state.starting = true;
        }
        let mut guard = StartingGuard {
            inner: &self.inner,
            armed: true,
        };

        let captured = match self.capture.open_display_media().await {
            Ok(captured) => captured,
            Err(CaptureError::Cancelled) | Err(CaptureError::PermissionDenied) => {
                info!("Screen share picker cancelled or denied");
                return Err(VideoSessionError::ScreenShareDenied);
            }
            Err(e) => {
                warn!("Display capture failed: {}", e);
                return Err(VideoSessionError::ScreenShareDenied);
            }
        };

        let mut state = self.inner.lock();
        state.starting = false;
        guard.armed = false;

        if self.inner.shutdown.is_cancelled() {
            info!("Discarding display stream {} acquired after teardown", captured.stream.id);
            captured.handle.stop_all();
            return Err(VideoSessionError::Cancelled);
        }

        state.cycle += 1;
        let cycle = state.cycle;
        let stream = captured.stream.clone();
        let watcher = captured
            .ended
            .map(|ended| self.spawn_watcher(cycle, ended));

        state.active = Some(ActiveShare {
            cycle,
            stream: captured.stream,
            handle: captured.handle,
            watcher,
        });

        info!("Screen share {} started (cycle {})", stream.id, cycle);
        self.inner.events.emit(SessionEvent::ScreenShareStarted {
            stream: stream.clone(),
        });
        let _ = self
            .inner
            .renegotiation
            .send(RenegotiationRequest::AddStream(stream.clone()));

        Ok(stream)
    }

    fn spawn_watcher(&self, cycle: u64, ended: oneshot::Receiver<()>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => {}
                result = ended => {
                    if result.is_ok() {
                        debug!("Display capture ended by its source (cycle {})", cycle);
                        inner.stop_cycle(Some(cycle));
                    }
                }
            }
        })
    }

    /// Stop the active share. Returns `false` when nothing was being shared.
    pub fn stop(&self) -> bool {
        self.inner.stop_cycle(None)
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    pub fn active_stream(&self) -> Option<MediaStream> {
        self.inner.lock().active.as_ref().map(|a| a.stream.clone())
    }

    /// Release everything and refuse further shares. Safe to call repeatedly.
    pub fn destroy(&self) {
        self.inner.shutdown.cancel();
        self.inner.stop_cycle(None);
    }
}

impl Drop for ScreenShareManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
