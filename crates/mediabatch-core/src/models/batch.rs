use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::quality::QualityPolicy;
use super::task::TaskStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "completed_with_errors" => Ok(JobStatus::CompletedWithErrors),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// A user-submitted group of source URLs processed together, optionally
/// yielding one archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    /// Task ids in submission order.
    pub task_ids: Vec<Uuid>,
    pub total_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub archive_requested: bool,
    pub archive_key: Option<String>,
    pub policy: QualityPolicy,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(policy: QualityPolicy, archive_requested: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_ids: Vec::new(),
            total_count: 0,
            completed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            archive_requested,
            archive_key: None,
            policy,
            status: JobStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Count invariant: terminal counts never exceed the total.
    pub fn counts_consistent(&self) -> bool {
        self.completed_count + self.failed_count + self.skipped_count <= self.total_count
    }

    /// All accounted tasks are terminal.
    pub fn all_tasks_terminal(&self) -> bool {
        self.completed_count + self.failed_count + self.skipped_count >= self.total_count
    }

    /// Derive the terminal status from final task counts.
    pub fn derive_terminal_status(&self, cancelled: bool) -> JobStatus {
        if cancelled {
            JobStatus::Cancelled
        } else if self.completed_count == 0 && self.total_count > 0 {
            JobStatus::Failed
        } else if self.failed_count > 0 || self.skipped_count > 0 {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        }
    }

    /// Record a terminal task outcome.
    pub fn record_task_outcome(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed_count += 1,
            TaskStatus::Failed => self.failed_count += 1,
            TaskStatus::Cancelled => self.skipped_count += 1,
            _ => {}
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.completed_count as f64 / self.total_count as f64 * 100.0
    }
}
