// libs/video-session-cell/src/lib.rs
//! # Video Session Cell
//!
//! Real-time session engine for patient/provider video consultations. It owns
//! the lifecycle of one call: local media capture, the peer connection,
//! screen sharing, consented recording and connection-quality reporting.
//!
//! ## Features
//!
//! - **Session lifecycle**: `idle -> acquiring_permissions -> initializing -> connecting -> connected`,
//!   bounded reconnects with backoff, terminal `ended` / `failed`
//! - **Device management**: enumeration, acquisition, mute/camera toggles, live device switching
//! - **Screen sharing**: independent display stream, renegotiated onto the same peer connection
//! - **Recording**: consent-gated jobs with pause/resume and finalized artifacts
//! - **Quality monitoring**: periodic transport sampling with hysteresis
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                 Video Session Cell                  |
//! +-----------------------------------------------------+
//! |  models.rs       |  Session, media and quality data |
//! |  events.rs       |  Outbound events, inbound commands|
//! |  capabilities.rs |  Capture / transport / storage   |
//! |  storage.rs      |  File-backed recording sink      |
//! |  testing.rs      |  In-memory capabilities          |
//! |  services/       |  Session engine                  |
//! |    coordinator.rs|  Lifecycle and driver task       |
//! |    devices.rs    |  Camera and microphone           |
//! |    screen_share.rs| Display capture                 |
//! |    recording.rs  |  Recording jobs                  |
//! |    quality.rs    |  Connection quality              |
//! +-----------------------------------------------------+
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use uuid::Uuid;
//! use video_session_cell::testing::{FakeMediaCapture, FakeRecordingSink, FakeTransportFactory};
//! use video_session_cell::{
//!     MediaConstraints, Participant, ParticipantType, SessionConfig, SessionCoordinator,
//!     TerminationReason,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (coordinator, mut events) = SessionCoordinator::with_capabilities(
//!     SessionConfig::default(),
//!     Arc::new(FakeMediaCapture::new()),
//!     Arc::new(FakeTransportFactory::new()),
//!     Arc::new(FakeRecordingSink::new()),
//! );
//!
//! let doctor = Participant::new(Uuid::new_v4(), ParticipantType::Doctor);
//! coordinator.start(doctor, MediaConstraints::default()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! #   break;
//! }
//!
//! coordinator.end(TerminationReason::UserEnded).await;
//! coordinator.destroy().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Tunables come from [`shared_config::AppConfig`] (`VIDEO_*` environment
//! variables) and are converted with [`SessionConfig::from_app_config`].

pub mod capabilities;
pub mod error;
pub mod events;
pub mod models;
pub mod services;
pub mod storage;
pub mod testing;

// Re-export commonly used types
pub use models::{
    DeviceDescriptor, DeviceKind, MediaConstraints, MediaStream, MediaTrack, Participant,
    ParticipantType, QualityLevel, QualitySample, RecordingArtifact, RecordingJob,
    RecordingState, Session, SessionConfig, SessionState, StreamSource, TerminationReason,
    TrackKind, TransportStats,
};

pub use error::{ErrorKind, ErrorSeverity, VideoSessionError};
pub use events::{EventSink, EventStream, SessionCommand, SessionEvent};

pub use services::{
    ConnectionQualityMonitor, DeviceManager, RecordingManager, ScreenShareManager,
    SessionCoordinator, SessionManagers,
};

pub use storage::FileRecordingSink;
