use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::errors::{Result, TaskFailure, UploadError};
use super::types::{MetadataUpdate, Payload, TaskId, UploadState, VideoMetadata};

/// One file's journey through transfer and server-side processing.
///
/// Only the manager worker mutates a task; callers receive clones.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadTask {
    pub id: TaskId,
    pub payload: Payload,
    pub metadata: VideoMetadata,
    pub state: UploadState,
    /// None until the first transfer starts
    pub progress: Option<u8>,
    pub remote_id: Option<String>,
    pub failure: Option<TaskFailure>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadTask {
    pub(crate) fn new(payload: Payload, metadata: VideoMetadata) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            metadata,
            state: UploadState::Pending,
            progress: None,
            remote_id: None,
            failure: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Human-readable failure reason, present only in `Error`.
    pub fn error_detail(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    pub(crate) fn update_metadata(&mut self, update: MetadataUpdate) -> Result<()> {
        if self.state != UploadState::Pending {
            return Err(UploadError::invalid_state(self.id, self.state, "edit metadata of"));
        }

        self.metadata.apply(update);
        Ok(())
    }

    /// Pending -> Uploading
    pub(crate) fn begin_attempt(&mut self) -> bool {
        if self.state != UploadState::Pending {
            return false;
        }

        self.state = UploadState::Uploading;
        self.progress = Some(0);
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        true
    }

    /// Clamp to [0, 100] and never go backwards. Returns the new value when it changed.
    pub(crate) fn apply_progress(&mut self, percent: f64) -> Option<u8> {
        if self.state != UploadState::Uploading {
            return None;
        }

        // NaN 按 0 处理
        let percent = percent.clamp(0.0, 100.0) as u8;
        if percent <= self.progress.unwrap_or(0) {
            return None;
        }

        self.progress = Some(percent);
        Some(percent)
    }

    /// Uploading -> Processing once the channel assigned a remote id.
    pub(crate) fn accept(&mut self, remote_id: String) -> bool {
        if self.state != UploadState::Uploading {
            return false;
        }

        self.state = UploadState::Processing;
        self.progress = Some(100);
        self.remote_id = Some(remote_id);
        true
    }

    /// Processing -> Completed
    pub(crate) fn complete(&mut self) -> bool {
        if self.state != UploadState::Processing {
            return false;
        }

        self.state = UploadState::Completed;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Uploading | Processing -> Error. A remote id assigned earlier is kept.
    pub(crate) fn fail(&mut self, failure: TaskFailure) -> bool {
        if !self.state.is_in_flight() {
            return false;
        }

        self.state = UploadState::Error;
        self.failure = Some(failure);
        self.completed_at = Some(Utc::now());
        true
    }

    /// Error -> Pending, discarding everything the previous attempt produced.
    pub(crate) fn reset_for_retry(&mut self) -> bool {
        if self.state != UploadState::Error {
            return false;
        }

        self.state = UploadState::Pending;
        self.progress = None;
        self.remote_id = None;
        self.failure = None;
        self.started_at = None;
        self.completed_at = None;
        true
    }
}
