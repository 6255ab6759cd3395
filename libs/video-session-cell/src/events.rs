// libs/video-session-cell/src/events.rs
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::{
    DeviceDescriptor, DeviceKind, MediaConstraints, MediaStream, Participant, QualityLevel,
    QualitySample, RecordingArtifact, SessionState, TerminationReason, TrackKind,
};

// ==============================================================================
// OUTBOUND EVENTS (session -> UI surface)
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStateChanged {
        session_id: Uuid,
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<TerminationReason>,
    },
    RemoteStreamAvailable {
        stream: MediaStream,
    },
    LocalTrackToggled {
        kind: TrackKind,
        enabled: bool,
    },
    DeviceSwitched {
        kind: DeviceKind,
        device_id: String,
    },
    DevicesChanged {
        devices: Vec<DeviceDescriptor>,
    },
    ScreenShareStarted {
        stream: MediaStream,
    },
    ScreenShareStopped {
        stream_id: String,
    },
    RecordingStarted {
        job_id: Uuid,
        source_stream_ids: Vec<String>,
    },
    RecordingPaused {
        job_id: Uuid,
    },
    RecordingResumed {
        job_id: Uuid,
    },
    RecordingStopped {
        artifact: RecordingArtifact,
    },
    RecordingFailed {
        job_id: Uuid,
        error: String,
    },
    QualityChanged {
        level: QualityLevel,
        sample: QualitySample,
    },
    Error {
        kind: ErrorKind,
        detail: String,
    },
}

/// Sending half shared by the coordinator and every manager of one session.
///
/// All clones feed the same ordered channel, so events caused by sequential
/// operations reach the UI in that order. `close` unsubscribes the listener
/// for every clone at once.
#[derive(Clone)]
pub struct EventSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>>,
}

impl EventSink {
    /// A sink with no listener. Events are dropped.
    pub fn detached() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }

    pub fn emit(&self, event: SessionEvent) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => true,
                Err(err) => {
                    debug!("Event listener gone, dropping {:?}", err.0);
                    false
                }
            },
            None => false,
        }
    }

    pub fn close(&self) {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            debug!("Event sink closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything buffered right now, without waiting.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        EventStream { rx },
    )
}

// ==============================================================================
// INBOUND COMMANDS (UI surface -> session)
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SessionCommand {
    StartSession {
        participant: Participant,
        #[serde(default)]
        constraints: MediaConstraints,
    },
    EndSession {
        #[serde(default)]
        reason: Option<TerminationReason>,
    },
    ToggleMute,
    ToggleVideo,
    StartScreenShare,
    StopScreenShare,
    StartRecording {
        consent: bool,
    },
    PauseRecording,
    ResumeRecording,
    StopRecording,
    SwitchDevice {
        kind: DeviceKind,
        device_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_emit_order() {
        let (sink, mut stream) = channel();
        let job_id = Uuid::new_v4();
        sink.emit(SessionEvent::RecordingStarted { job_id, source_stream_ids: vec![] });
        sink.emit(SessionEvent::RecordingPaused { job_id });

        assert_eq!(
            stream.recv().await,
            Some(SessionEvent::RecordingStarted { job_id, source_stream_ids: vec![] })
        );
        assert_eq!(stream.recv().await, Some(SessionEvent::RecordingPaused { job_id }));
    }

    #[tokio::test]
    async fn test_close_unsubscribes_all_clones() {
        let (sink, mut stream) = channel();
        let clone = sink.clone();
        sink.close();

        assert!(!clone.emit(SessionEvent::ScreenShareStopped { stream_id: "s".into() }));
        assert!(clone.is_closed());
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn test_command_deserialization() {
        let command: SessionCommand =
            serde_json::from_str(r#"{"command":"start_recording","consent":false}"#).unwrap();
        assert_eq!(command, SessionCommand::StartRecording { consent: false });

        let command: SessionCommand = serde_json::from_str(r#"{"command":"end_session"}"#).unwrap();
        assert_eq!(command, SessionCommand::EndSession { reason: None });
    }
}
