//! Hooks for downstream integration
//!
//! The pipeline owns no durable business records. When a job finishes, the
//! embedding application (bot, admin surface, billing) is notified through
//! this trait and persists whatever it needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable result of one uploaded task output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    pub task_id: Uuid,
    pub object_key: String,
    pub size_bytes: u64,
    pub public_url: Option<String>,
    pub thumbnail_key: Option<String>,
}

/// Callback fired once per job after every task reached a terminal state and
/// the optional archive was handled.
#[async_trait]
pub trait JobCompletionHook: Send + Sync {
    async fn on_job_complete(
        &self,
        job_id: Uuid,
        outputs: &[JobOutput],
        archive_key: Option<&str>,
    );
}

/// No-op implementation for callers that do not persist results.
pub struct NoopCompletionHook;

#[async_trait]
impl JobCompletionHook for NoopCompletionHook {
    async fn on_job_complete(
        &self,
        _job_id: Uuid,
        _outputs: &[JobOutput],
        _archive_key: Option<&str>,
    ) {
    }
}
