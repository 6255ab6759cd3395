// libs/video-session-cell/src/error.rs
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{CaptureError, RecordingSinkError, TransportError};
use crate::models::{DeviceKind, RecordingState, SessionState, TrackKind};

/// How an error affects the running call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Session moves to `failed`, no retry.
    Fatal,
    /// Retried automatically with bounded backoff.
    Transient,
    /// Reported to the UI, call continues.
    FeatureLocal,
    /// Contract violation, rejected synchronously.
    InvalidUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    DeviceUnavailable,
    NoCameraAvailable,
    NoMicrophoneAvailable,
    NegotiationTimeout,
    Transport,
    ScreenShareDenied,
    ScreenShareAlreadyActive,
    DeviceSwitchFailed,
    RecordingFailed,
    ConsentRequired,
    InvalidRecordingState,
    RecordingAlreadyActive,
    InvalidSessionState,
    NoLocalStream,
    NoLocalTrack,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VideoSessionError {
    #[error("Camera or microphone access was denied")]
    PermissionDenied,

    #[error("Capture device unavailable: {message}")]
    DeviceUnavailable { message: String },

    #[error("No camera available")]
    NoCameraAvailable,

    #[error("No microphone available")]
    NoMicrophoneAvailable,

    #[error("Peer connection could not be (re)established in time")]
    NegotiationTimeout,

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Screen share was denied or cancelled")]
    ScreenShareDenied,

    #[error("A screen share is already active")]
    ScreenShareAlreadyActive,

    #[error("Switching {kind} failed: {message}")]
    DeviceSwitchFailed { kind: DeviceKind, message: String },

    #[error("Recording failed: {message}")]
    RecordingFailed { message: String },

    #[error("Recording requires participant consent")]
    ConsentRequired,

    #[error("Recording is not in a state that allows this operation: {state}")]
    InvalidRecordingState { state: RecordingState },

    #[error("A recording is already active")]
    RecordingAlreadyActive,

    #[error("Video session is not in a state that allows this operation: {state}")]
    InvalidSessionState { state: SessionState },

    #[error("No local stream has been acquired")]
    NoLocalStream,

    #[error("Local stream has no {kind:?} track")]
    NoLocalTrack { kind: TrackKind },

    #[error("Operation cancelled because the session was torn down")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl VideoSessionError {
    pub fn severity(&self) -> ErrorSeverity {
        use VideoSessionError::*;

        match self {
            PermissionDenied
            | DeviceUnavailable { .. }
            | NoCameraAvailable
            | NoMicrophoneAvailable
            | NegotiationTimeout
            | Internal { .. } => ErrorSeverity::Fatal,
            Transport { .. } => ErrorSeverity::Transient,
            ScreenShareDenied
            | DeviceSwitchFailed { .. }
            | RecordingFailed { .. } => ErrorSeverity::FeatureLocal,
            Cancelled
            | ConsentRequired
            | InvalidRecordingState { .. }
            | RecordingAlreadyActive
            | ScreenShareAlreadyActive
            | InvalidSessionState { .. }
            | NoLocalStream
            | NoLocalTrack { .. } => ErrorSeverity::InvalidUsage,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        use VideoSessionError::*;

        match self {
            PermissionDenied => ErrorKind::PermissionDenied,
            DeviceUnavailable { .. } => ErrorKind::DeviceUnavailable,
            NoCameraAvailable => ErrorKind::NoCameraAvailable,
            NoMicrophoneAvailable => ErrorKind::NoMicrophoneAvailable,
            NegotiationTimeout => ErrorKind::NegotiationTimeout,
            Transport { .. } => ErrorKind::Transport,
            ScreenShareDenied => ErrorKind::ScreenShareDenied,
            ScreenShareAlreadyActive => ErrorKind::ScreenShareAlreadyActive,
            DeviceSwitchFailed { .. } => ErrorKind::DeviceSwitchFailed,
            RecordingFailed { .. } => ErrorKind::RecordingFailed,
            ConsentRequired => ErrorKind::ConsentRequired,
            InvalidRecordingState { .. } => ErrorKind::InvalidRecordingState,
            RecordingAlreadyActive => ErrorKind::RecordingAlreadyActive,
            InvalidSessionState { .. } => ErrorKind::InvalidSessionState,
            NoLocalStream => ErrorKind::NoLocalStream,
            NoLocalTrack { .. } => ErrorKind::NoLocalTrack,
            Cancelled => ErrorKind::Cancelled,
            Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }
}

impl From<CaptureError> for VideoSessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => VideoSessionError::PermissionDenied,
            CaptureError::Cancelled => VideoSessionError::PermissionDenied,
            CaptureError::DeviceUnavailable(message) => VideoSessionError::DeviceUnavailable { message },
            CaptureError::Failed(message) => VideoSessionError::DeviceUnavailable { message },
        }
    }
}

impl From<TransportError> for VideoSessionError {
    fn from(err: TransportError) -> Self {
        VideoSessionError::Transport {
            message: err.to_string(),
        }
    }
}

impl From<RecordingSinkError> for VideoSessionError {
    fn from(err: RecordingSinkError) -> Self {
        VideoSessionError::RecordingFailed {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_taxonomy() {
        assert_eq!(VideoSessionError::PermissionDenied.severity(), ErrorSeverity::Fatal);
        assert_eq!(VideoSessionError::NegotiationTimeout.severity(), ErrorSeverity::Fatal);
        assert_eq!(VideoSessionError::ScreenShareDenied.severity(), ErrorSeverity::FeatureLocal);
        assert_eq!(VideoSessionError::ConsentRequired.severity(), ErrorSeverity::InvalidUsage);
        assert_eq!(VideoSessionError::Cancelled.severity(), ErrorSeverity::InvalidUsage);
        assert_eq!(
            VideoSessionError::Transport { message: "ice".into() }.severity(),
            ErrorSeverity::Transient
        );
    }

    #[test]
    fn test_capture_error_mapping() {
        let err: VideoSessionError = CaptureError::DeviceUnavailable("unplugged".into()).into();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);

        let err: VideoSessionError = CaptureError::PermissionDenied.into();
        assert!(err.is_fatal());
    }
}
