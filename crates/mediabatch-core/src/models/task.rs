use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TaskErrorInfo;

use super::quality::QualityMode;
use super::rendition::RenditionCandidate;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Active states accept progress updates.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Paused)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Paused => write!(f, "paused"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// The unit of work for one source URL within a batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub source_url: String,
    /// Source platform reported by the retrieval engine, when known.
    pub platform: Option<String>,
    pub requested_quality: QualityMode,
    pub status: TaskStatus,
    pub progress_percent: f32,
    pub selected_rendition: Option<RenditionCandidate>,
    pub staged_file_path: Option<PathBuf>,
    pub remote_object_key: Option<String>,
    pub remote_url: Option<String>,
    pub thumbnail_key: Option<String>,
    pub size_bytes: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_info: Option<TaskErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MediaTask {
    pub fn new(job_id: Uuid, source_url: impl Into<String>, requested_quality: QualityMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            source_url: source_url.into(),
            platform: None,
            requested_quality,
            status: TaskStatus::Pending,
            progress_percent: 0.0,
            selected_rendition: None,
            staged_file_path: None,
            remote_object_key: None,
            remote_url: None,
            thumbnail_key: None,
            size_bytes: None,
            retry_count: 0,
            max_retries: crate::constants::DEFAULT_MAX_RETRIES,
            error_info: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Clamp and record a progress value.
    pub fn set_progress(&mut self, percent: f32) {
        self.progress_percent = percent.clamp(0.0, 100.0);
    }
}
