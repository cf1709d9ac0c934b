use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskStatus;

/// Read-only snapshot of one task's progress.
///
/// Owned and mutated exclusively by the progress tracker; everything handed to
/// subscribers or status queries is a clone of this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: Uuid,
    pub task_name: String,
    pub status: TaskStatus,
    /// Percent complete, 0..=100.
    pub progress: f32,
    pub total_steps: u32,
    pub current_step: u32,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    /// Naive linear extrapolation from elapsed time and percent done.
    pub estimated_completion: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl ProgressRecord {
    pub fn new(task_id: Uuid, task_name: impl Into<String>, total_steps: u32) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            total_steps,
            current_step: 0,
            message: String::new(),
            started_at: None,
            updated_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            estimated_completion: None,
            metadata: serde_json::Value::Null,
            error: None,
            warnings: Vec::new(),
        }
    }
}
