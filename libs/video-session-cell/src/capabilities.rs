// libs/video-session-cell/src/capabilities.rs
//! Seams to the hosting environment's media stack.
//!
//! The session engine never talks to capture devices or the peer connection
//! directly. The host supplies implementations of these traits (a browser or
//! native WebRTC binding in production, the fakes in [`crate::testing`] in
//! tests and the simulator).

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::models::{
    DeviceDescriptor, DeviceKind, MediaConstraints, MediaStream, MediaTrack, TransportStats,
};

// ==============================================================================
// MEDIA CAPTURE
// ==============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptureError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("capture picker cancelled by the user")]
    Cancelled,

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture failed: {0}")]
    Failed(String),
}

/// Control surface of an open capture. Only the manager that opened it holds one.
pub trait CaptureHandle: Send + Sync {
    fn set_track_enabled(&self, track_id: &str, enabled: bool);
    fn stop_track(&self, track_id: &str);
    fn stop_all(&self);
}

pub struct CapturedStream {
    pub stream: MediaStream,
    pub handle: Arc<dyn CaptureHandle>,
    /// Fires if the capture ends on its own (device lost, OS "stop sharing" button).
    pub ended: Option<oneshot::Receiver<()>>,
}

pub struct CapturedTrack {
    pub track: MediaTrack,
    pub handle: Arc<dyn CaptureHandle>,
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    /// Camera/microphone capture. May suspend while the user answers a permission prompt.
    async fn open_user_media(&self, constraints: &MediaConstraints) -> Result<CapturedStream, CaptureError>;

    async fn open_device_track(&self, kind: DeviceKind, device_id: &str) -> Result<CapturedTrack, CaptureError>;

    /// Display capture. Suspends while the capture picker is open.
    async fn open_display_media(&self) -> Result<CapturedStream, CaptureError>;
}

// ==============================================================================
// PEER TRANSPORT
// ==============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("peer connection is closed")]
    Closed,

    #[error("transport failure: {0}")]
    Failed(String),
}

/// Notifications from the peer connection (track, ICE and negotiation callbacks).
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    RemoteStream(MediaStream),
    Connected,
    Disconnected,
    Failed(String),
    RemoteHangup,
    NegotiationNeeded,
}

pub struct TransportConnection {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, session_id: Uuid) -> Result<TransportConnection, TransportError>;
}

/// One peer connection. Signaling (offer/answer/candidates) happens behind `negotiate`.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError>;

    async fn remove_stream(&self, stream_id: &str) -> Result<(), TransportError>;

    /// Swap a sending track in place; no renegotiation required.
    async fn replace_track(
        &self,
        stream_id: &str,
        old_track_id: &str,
        track: &MediaTrack,
    ) -> Result<(), TransportError>;

    async fn negotiate(&self) -> Result<(), TransportError>;

    async fn restart_ice(&self) -> Result<(), TransportError>;

    async fn stats(&self) -> Result<TransportStats, TransportError>;

    async fn close(&self);
}

// ==============================================================================
// RECORDING STORAGE
// ==============================================================================

#[derive(Debug, Error)]
pub enum RecordingSinkError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown recording job {0}")]
    UnknownJob(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub storage_ref: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait RecordingSink: Send + Sync {
    async fn begin(&self, job_id: Uuid, sources: &[MediaStream]) -> Result<(), RecordingSinkError>;

    async fn pause(&self, job_id: Uuid) -> Result<(), RecordingSinkError>;

    async fn resume(&self, job_id: Uuid) -> Result<(), RecordingSinkError>;

    async fn finalize(&self, job_id: Uuid, duration: Duration) -> Result<StoredArtifact, RecordingSinkError>;

    /// Drop any partial output for a job that will never be finalized.
    async fn discard(&self, job_id: Uuid);
}
