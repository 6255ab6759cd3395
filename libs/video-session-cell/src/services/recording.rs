// libs/video-session-cell/src/services/recording.rs
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::RecordingSink;
use crate::error::VideoSessionError;
use crate::events::{EventSink, SessionEvent};
use crate::models::{MediaStream, RecordingArtifact, RecordingJob, RecordingState, SessionState};

struct RecordingSlot {
    job: RecordingJob,
    // Start of the current un-paused span.
    segment_started: Option<Instant>,
}

impl RecordingSlot {
    fn close_segment(&mut self) {
        if let Some(started) = self.segment_started.take() {
            self.job.accumulated_duration_ms += started.elapsed().as_millis() as u64;
        }
    }
}

/// Records a set of session streams into one artifact. At most one job is
/// active at a time; every state change is reported on the event sink in the
/// order it happened.
pub struct RecordingManager {
    sink: Arc<dyn RecordingSink>,
    events: EventSink,
    slot: Mutex<RecordingSlot>,
}

impl RecordingManager {
    pub fn new(sink: Arc<dyn RecordingSink>, events: EventSink) -> Self {
        Self {
            sink,
            events,
            slot: Mutex::new(RecordingSlot {
                job: RecordingJob::idle(),
                segment_started: None,
            }),
        }
    }

    pub async fn job(&self) -> RecordingJob {
        self.slot.lock().await.job.clone()
    }

    pub async fn state(&self) -> RecordingState {
        self.slot.lock().await.job.state
    }

    /// Start recording `streams`. Consent is checked before anything else, so a
    /// refused consent never changes the job, whatever the session state.
    #[instrument(skip(self, streams))]
    pub async fn start(
        &self,
        streams: Vec<MediaStream>,
        consent_granted: bool,
        session_state: SessionState,
    ) -> Result<RecordingJob, VideoSessionError> {
        if !consent_granted {
            warn!("Recording refused: consent not granted");
            return Err(VideoSessionError::ConsentRequired);
        }

        let mut slot = self.slot.lock().await;
        if slot.job.state.is_active() {
            return Err(VideoSessionError::RecordingAlreadyActive);
        }
        if session_state != SessionState::Connected {
            return Err(VideoSessionError::InvalidSessionState {
                state: session_state,
            });
        }

        let job_id = Uuid::new_v4();
        let source_stream_ids: Vec<String> = streams.iter().map(|s| s.id.clone()).collect();
        info!("Starting recording {} of {} streams", job_id, streams.len());

        if let Err(e) = self.sink.begin(job_id, &streams).await {
            error!("Recording {} could not start: {}", job_id, e);
            slot.job = RecordingJob {
                id: job_id,
                state: RecordingState::Failed,
                started_at: None,
                accumulated_duration_ms: 0,
                consent_granted,
                source_stream_ids,
            };
            slot.segment_started = None;
            let err = VideoSessionError::from(e);
            self.events.emit(SessionEvent::RecordingFailed {
                job_id,
                error: err.to_string(),
            });
            return Err(err);
        }

        slot.job = RecordingJob {
            id: job_id,
            state: RecordingState::Recording,
            started_at: Some(Utc::now()),
            accumulated_duration_ms: 0,
            consent_granted,
            source_stream_ids: source_stream_ids.clone(),
        };
        slot.segment_started = Some(Instant::now());

        self.events.emit(SessionEvent::RecordingStarted {
            job_id,
            source_stream_ids,
        });
        Ok(slot.job.clone())
    }

    #[instrument(skip(self))]
    pub async fn pause(&self) -> Result<RecordingJob, VideoSessionError> {
        let mut slot = self.slot.lock().await;
        if slot.job.state != RecordingState::Recording {
            return Err(VideoSessionError::InvalidRecordingState {
                state: slot.job.state,
            });
        }

        let job_id = slot.job.id;
        self.sink.pause(job_id).await?;
        slot.close_segment();
        slot.job.state = RecordingState::Paused;

        info!("Recording {} paused at {}ms", job_id, slot.job.accumulated_duration_ms);
        self.events.emit(SessionEvent::RecordingPaused { job_id });
        Ok(slot.job.clone())
    }

    /// Resume a paused job. Like `start`, recording only runs while the
    /// session is connected.
    #[instrument(skip(self))]
    pub async fn resume(&self, session_state: SessionState) -> Result<RecordingJob, VideoSessionError> {
        let mut slot = self.slot.lock().await;
        if slot.job.state != RecordingState::Paused {
            return Err(VideoSessionError::InvalidRecordingState {
                state: slot.job.state,
            });
        }
        if session_state != SessionState::Connected {
            warn!("Recording {} stays paused while session is {}", slot.job.id, session_state);
            return Err(VideoSessionError::InvalidSessionState {
                state: session_state,
            });
        }

        let job_id = slot.job.id;
        self.sink.resume(job_id).await?;
        slot.segment_started = Some(Instant::now());
        slot.job.state = RecordingState::Recording;

        info!("Recording {} resumed", job_id);
        self.events.emit(SessionEvent::RecordingResumed { job_id });
        Ok(slot.job.clone())
    }

    /// Finalize the artifact. A storage failure moves the job to `failed` and
    /// is returned to the caller; it never touches the call itself.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<RecordingArtifact, VideoSessionError> {
        let mut slot = self.slot.lock().await;
        if !slot.job.state.is_active() {
            return Err(VideoSessionError::InvalidRecordingState {
                state: slot.job.state,
            });
        }
        self.finalize(&mut slot).await
    }

    /// Stop the active job, if any, during session teardown.
    pub async fn release(&self) -> Option<Result<RecordingArtifact, VideoSessionError>> {
        let mut slot = self.slot.lock().await;
        if !slot.job.state.is_active() {
            return None;
        }
        info!("Releasing active recording {}", slot.job.id);
        Some(self.finalize(&mut slot).await)
    }

    async fn finalize(&self, slot: &mut RecordingSlot) -> Result<RecordingArtifact, VideoSessionError> {
        slot.close_segment();
        let job_id = slot.job.id;
        let duration = Duration::from_millis(slot.job.accumulated_duration_ms);

        match self.sink.finalize(job_id, duration).await {
            Ok(stored) => {
                slot.job.state = RecordingState::Stopped;
                let artifact = RecordingArtifact {
                    job_id,
                    duration_ms: slot.job.accumulated_duration_ms,
                    size_bytes: stored.size_bytes,
                    storage_ref: stored.storage_ref,
                    finalized_at: Utc::now(),
                };
                info!(
                    "Recording {} finalized: {}ms, {} bytes at {}",
                    job_id, artifact.duration_ms, artifact.size_bytes, artifact.storage_ref
                );
                self.events.emit(SessionEvent::RecordingStopped {
                    artifact: artifact.clone(),
                });
                Ok(artifact)
            }
            Err(e) => {
                error!("Recording {} finalization failed: {}", job_id, e);
                slot.job.state = RecordingState::Failed;
                self.sink.discard(job_id).await;
                let err = VideoSessionError::from(e);
                self.events.emit(SessionEvent::RecordingFailed {
                    job_id,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }
}
