use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The clip is missing or cannot be opened. Never retried.
    #[error("media unavailable at {path:?}: {reason}")]
    MediaUnavailable { path: PathBuf, reason: String },

    /// The stream exists but probing it failed (corrupt or partial file).
    #[error("failed to probe {path:?} after {attempts} attempt(s): {reason}")]
    MediaProbe {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("job {job_id} exhausted {attempts} attempt(s): {reason}")]
    TaskRetryExhausted {
        job_id: i64,
        attempts: u32,
        reason: String,
    },

    #[error("job {job_id} blocked: parent job {parent} was dead-lettered")]
    DependencyFailed { job_id: i64, parent: i64 },

    #[error("event {0} not found")]
    EventNotFound(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Probe and decode hiccups are retried in place; everything else fails the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::MediaProbe { .. } | PipelineError::Decode(_))
    }
}
