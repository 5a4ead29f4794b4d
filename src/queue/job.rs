use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub type JobId = i64;

pub const QUEUE_EVENT_VIDEO: &str = "event_video";
pub const QUEUE_WRITE_IMAGE: &str = "write_image";
pub const QUEUE_PREDICTION: &str = "prediction";

pub const ALL_QUEUES: [&str; 3] = [QUEUE_EVENT_VIDEO, QUEUE_WRITE_IMAGE, QUEUE_PREDICTION];

/// Every kind of background work the pipeline knows how to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Find the significant frame of an event's clip.
    AnalyzeEvent { event_name: String },
    /// Store the encoded still carried in the job attachment at `image_path`.
    WriteImage {
        event_name: String,
        frame_index: usize,
        image_path: String,
    },
    /// Run the still classifier on a written image.
    ClassifyFrame {
        event_name: String,
        image_path: String,
    },
}

impl Task {
    pub fn analyze(event_name: impl Into<String>) -> Self {
        Task::AnalyzeEvent {
            event_name: event_name.into(),
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Task::AnalyzeEvent { .. } => QUEUE_EVENT_VIDEO,
            Task::WriteImage { .. } => QUEUE_WRITE_IMAGE,
            Task::ClassifyFrame { .. } => QUEUE_PREDICTION,
        }
    }

    /// Name under which outcomes are recorded in the computation ledger.
    pub fn method_name(&self) -> &'static str {
        match self {
            Task::AnalyzeEvent { .. } => "significant_frame",
            Task::WriteImage { .. } => "write_image",
            Task::ClassifyFrame { .. } => "predict_still",
        }
    }

    pub fn event_name(&self) -> &str {
        match self {
            Task::AnalyzeEvent { event_name }
            | Task::WriteImage { event_name, .. }
            | Task::ClassifyFrame { event_name, .. } => event_name,
        }
    }

    pub fn default_policy(&self) -> RetryPolicy {
        match self {
            Task::AnalyzeEvent { .. } => RetryPolicy::once(),
            Task::WriteImage { .. } => RetryPolicy::new(3, Duration::from_secs(5 * 60)),
            Task::ClassifyFrame { .. } => RetryPolicy::new(3, Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Retrying,
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Retrying => "retrying",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLettered)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "retrying" => Ok(JobStatus::Retrying),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown job status {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub task: Task,
    pub status: JobStatus,
    pub attempts: u32,
    pub policy: RetryPolicy,
    pub depends_on: Option<JobId>,
    pub last_error: Option<String>,
    pub attachment: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_serialize_with_kind_tag() {
        let task = Task::ClassifyFrame {
            event_name: "e1".into(),
            image_path: "front/e1_f7.jpg".into(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "classify_frame");
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn tasks_route_to_their_queues() {
        assert_eq!(Task::analyze("e").queue(), QUEUE_EVENT_VIDEO);
        assert_eq!(Task::analyze("e").method_name(), "significant_frame");
        let write = Task::WriteImage {
            event_name: "e".into(),
            frame_index: 3,
            image_path: "x.jpg".into(),
        };
        assert_eq!(write.queue(), QUEUE_WRITE_IMAGE);
        assert_eq!(write.default_policy().max_attempts, 3);
        assert_eq!(write.event_name(), "e");
    }

    #[test]
    fn status_strings_parse_back() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Retrying,
            JobStatus::DeadLettered,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("lost".parse::<JobStatus>().is_err());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }
}
