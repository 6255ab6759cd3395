// libs/video-session-cell/src/services/mod.rs

pub mod coordinator;
pub mod devices;
pub mod quality;
pub mod recording;
pub mod screen_share;

pub use coordinator::{SessionCoordinator, SessionManagers};
pub use devices::{DeviceManager, DeviceSwitch, PendingSwitch};
pub use quality::ConnectionQualityMonitor;
pub use recording::RecordingManager;
pub use screen_share::{RenegotiationRequest, ScreenShareManager};
