// libs/video-session-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use shared_config::AppConfig;

// ==============================================================================
// SESSION DOMAIN MODELS
// ==============================================================================

/// One logical call between a provider and a patient.
/// Owned by the coordinator; callers only ever see snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub participant: Participant,
    pub state: SessionState,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub termination_reason: Option<TerminationReason>,
}

impl Session {
    pub fn new(participant: Participant) -> Self {
        Self {
            id: Uuid::new_v4(),
            participant,
            state: SessionState::Idle,
            local_stream: None,
            remote_stream: None,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            reconnect_attempts: 0,
            termination_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub id: Uuid,
    pub participant_type: ParticipantType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Participant {
    pub fn new(id: Uuid, participant_type: ParticipantType) -> Self {
        Self {
            id,
            participant_type,
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ParticipantType {
    #[serde(rename = "patient")]
    Patient,
    #[serde(rename = "doctor")]
    Doctor,
    #[serde(rename = "specialist")]
    Specialist,
    #[serde(rename = "nurse")]
    Nurse,
    #[serde(rename = "guardian")]
    Guardian,            // Parent/guardian for pediatric patients
}

/// Session lifecycle.
///
/// `idle -> acquiring_permissions -> initializing -> connecting -> connected <-> reconnecting`,
/// with `ended` and `failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AcquiringPermissions,
    Initializing,
    Connecting,
    Connected,
    Reconnecting,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Ended) | (_, Failed) => true,
            (Idle, AcquiringPermissions)
            | (AcquiringPermissions, Initializing)
            | (Initializing, Connecting)
            | (Connecting, Connected)
            | (Connected, Reconnecting)
            | (Reconnecting, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringPermissions => "acquiring_permissions",
            SessionState::Initializing => "initializing",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserEnded,
    RemoteHangup,
    PermissionDenied,
    DeviceUnavailable,
    NegotiationTimeout,
    TransportFailed,
    Destroyed,
}

// ==============================================================================
// MEDIA MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Camera,
    Microphone,
}

impl DeviceKind {
    pub fn track_kind(self) -> TrackKind {
        match self {
            DeviceKind::Camera => TrackKind::Video,
            DeviceKind::Microphone => TrackKind::Audio,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Camera => write!(f, "camera"),
            DeviceKind::Microphone => write!(f, "microphone"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    LocalCapture,
    Remote,
    ScreenShare,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub enabled: bool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            device_id: None,
            enabled: true,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Ordered set of tracks. Values handed out by managers are read-only
/// snapshots; enabling or disabling a track goes through the owning manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaStream {
    pub id: String,
    pub source: StreamSource,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, source: StreamSource, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            source,
            tracks,
        }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub(crate) fn track_mut(&mut self, kind: TrackKind) -> Option<&mut MediaTrack> {
        self.tracks.iter_mut().find(|t| t.kind == kind)
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id.clone()).collect()
    }

    /// A stream with no tracks cannot carry a call.
    pub fn is_usable(&self) -> bool {
        !self.tracks.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub microphone_id: Option<String>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            camera_id: None,
            microphone_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub kind: DeviceKind,
    pub label: String,
    pub device_id: String,
}

impl DeviceDescriptor {
    pub fn new(kind: DeviceKind, label: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            device_id: device_id.into(),
        }
    }
}

// ==============================================================================
// CONNECTION QUALITY MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Unknown,
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLevel::Excellent => write!(f, "excellent"),
            QualityLevel::Good => write!(f, "good"),
            QualityLevel::Fair => write!(f, "fair"),
            QualityLevel::Poor => write!(f, "poor"),
            QualityLevel::Unknown => write!(f, "unknown"),
        }
    }
}

/// Raw transport statistics. Packet and byte counters are cumulative since
/// the peer connection was created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportStats {
    pub timestamp: DateTime<Utc>,
    pub round_trip_time_ms: f64,
    pub jitter_ms: f64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualitySample {
    pub timestamp: DateTime<Utc>,
    pub round_trip_time_ms: f64,
    pub packet_loss_ratio: f64,
    pub jitter_ms: f64,
    pub bitrate_kbps: f64,
}

// ==============================================================================
// RECORDING MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Stopped,
    Failed,
}

impl RecordingState {
    pub fn is_active(self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Stopped => "stopped",
            RecordingState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingJob {
    pub id: Uuid,
    pub state: RecordingState,
    pub started_at: Option<DateTime<Utc>>,
    pub accumulated_duration_ms: u64,
    pub consent_granted: bool,
    pub source_stream_ids: Vec<String>,
}

impl RecordingJob {
    pub fn idle() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RecordingState::Idle,
            started_at: None,
            accumulated_duration_ms: 0,
            consent_granted: false,
            source_stream_ids: Vec::new(),
        }
    }
}

/// Finalized output of a recording job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingArtifact {
    pub job_id: Uuid,
    pub duration_ms: u64,
    pub size_bytes: u64,
    pub storage_ref: String,
    pub finalized_at: DateTime<Utc>,
}

// ==============================================================================
// CONFIGURATION
// ==============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub quality_sample_interval: Duration,
    pub quality_window_size: usize,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_jitter: Duration,
    pub negotiation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            quality_sample_interval: Duration::from_millis(config.quality_sample_interval_ms.max(1)),
            quality_window_size: config.quality_window_size.max(1),
            reconnect_max_attempts: config.reconnect_max_attempts,
            reconnect_base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            reconnect_jitter: Duration::from_millis(config.reconnect_jitter_ms),
            negotiation_timeout: Duration::from_millis(config.negotiation_timeout_ms),
        }
    }

    /// Exponential backoff for reconnect attempt `attempt` (1-based), jitter excluded.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.reconnect_base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.reconnect_max_delay)
    }
}
