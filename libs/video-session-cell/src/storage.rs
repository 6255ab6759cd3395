// libs/video-session-cell/src/storage.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::capabilities::{RecordingSink, RecordingSinkError, StoredArtifact};
use crate::models::{MediaStream, StreamSource};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    InProgress,
    Paused,
    Finalized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSource {
    pub stream_id: String,
    pub source: StreamSource,
    pub track_ids: Vec<String>,
}

/// On-disk description of a recording job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingManifest {
    pub job_id: Uuid,
    pub status: ManifestStatus,
    pub sources: Vec<ManifestSource>,
    pub started_at: DateTime<Utc>,
    pub pause_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Keeps `<job>.part` while a job runs and finalizes it to `<job>.json`.
pub struct FileRecordingSink {
    dir: PathBuf,
}

impl FileRecordingSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(&config.recording_storage_dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn part_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.part", job_id))
    }

    fn final_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    async fn read_manifest(&self, job_id: Uuid) -> Result<RecordingManifest, RecordingSinkError> {
        match tokio::fs::read(self.part_path(job_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(RecordingSinkError::UnknownJob(job_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(path: &Path, manifest: &RecordingManifest) -> Result<(), RecordingSinkError> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn set_status(&self, job_id: Uuid, status: ManifestStatus) -> Result<(), RecordingSinkError> {
        let mut manifest = self.read_manifest(job_id).await?;
        if status == ManifestStatus::Paused {
            manifest.pause_count += 1;
        }
        manifest.status = status;
        Self::write_manifest(&self.part_path(job_id), &manifest).await
    }
}

#[async_trait]
impl RecordingSink for FileRecordingSink {
    async fn begin(&self, job_id: Uuid, sources: &[MediaStream]) -> Result<(), RecordingSinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let manifest = RecordingManifest {
            job_id,
            status: ManifestStatus::InProgress,
            sources: sources
                .iter()
                .map(|s| ManifestSource {
                    stream_id: s.id.clone(),
                    source: s.source,
                    track_ids: s.track_ids(),
                })
                .collect(),
            started_at: Utc::now(),
            pause_count: 0,
            duration_ms: None,
            finalized_at: None,
        };

        Self::write_manifest(&self.part_path(job_id), &manifest).await?;
        debug!("Opened recording manifest for {} in {}", job_id, self.dir.display());
        Ok(())
    }

    async fn pause(&self, job_id: Uuid) -> Result<(), RecordingSinkError> {
        self.set_status(job_id, ManifestStatus::Paused).await
    }

    async fn resume(&self, job_id: Uuid) -> Result<(), RecordingSinkError> {
        self.set_status(job_id, ManifestStatus::InProgress).await
    }

    async fn finalize(&self, job_id: Uuid, duration: Duration) -> Result<StoredArtifact, RecordingSinkError> {
        let mut manifest = self.read_manifest(job_id).await?;
        manifest.status = ManifestStatus::Finalized;
        manifest.duration_ms = Some(duration.as_millis() as u64);
        manifest.finalized_at = Some(Utc::now());

        let final_path = self.final_path(job_id);
        Self::write_manifest(&final_path, &manifest).await?;
        if let Err(e) = tokio::fs::remove_file(self.part_path(job_id)).await {
            warn!("Could not remove partial manifest for {}: {}", job_id, e);
        }

        let size_bytes = tokio::fs::metadata(&final_path).await?.len();
        info!("Finalized recording {} to {}", job_id, final_path.display());

        Ok(StoredArtifact {
            storage_ref: final_path.display().to_string(),
            size_bytes,
        })
    }

    async fn discard(&self, job_id: Uuid) {
        match tokio::fs::remove_file(self.part_path(job_id)).await {
            Ok(()) => debug!("Discarded partial recording {}", job_id),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not discard partial recording {}: {}", job_id, e),
        }
    }
}
