//! Stage-boundary error type.
//!
//! Every per-task stage (retrieve, select, transcode, thumbnail, upload)
//! surfaces failures as a [`StageError`]. The orchestrator catches it at the
//! stage boundary and downgrades it to a task-level failure record; it never
//! propagates to sibling tasks or the job.

use mediabatch_core::error::{ErrorKind, StorageKind, TaskErrorInfo};
use mediabatch_storage::StorageError;
use thiserror::Error;

use crate::retrieval::RetrievalError;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("No rendition candidate satisfies the quality policy")]
    NoCandidate,

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Stage exceeded its {0}s budget")]
    StageTimeout(u64),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::InvalidUrl(_) => ErrorKind::Validation,
            StageError::Retrieval(e) => e.error_kind(),
            // An empty or fully filtered candidate list means the request
            // asked for something the tier or source cannot provide.
            StageError::NoCandidate => ErrorKind::Validation,
            StageError::Processing(_) => ErrorKind::Processing,
            StageError::Storage(e) => e.error_kind(),
            StageError::StageTimeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether the orchestrator may retry the failed stage automatically.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Message safe to surface to the submitting user.
    fn user_message(&self) -> String {
        match self {
            StageError::InvalidUrl(_) => {
                "The submitted URL is not a valid http(s) address".to_string()
            }
            StageError::Retrieval(RetrievalError::UnsupportedPlatform(_)) => {
                "Downloads from this platform are not supported".to_string()
            }
            StageError::Retrieval(RetrievalError::NotFound(_)) => {
                "The media could not be found at the source".to_string()
            }
            StageError::Retrieval(RetrievalError::RateLimited(_)) => {
                "The source is limiting downloads right now, try again later".to_string()
            }
            StageError::Retrieval(RetrievalError::Network(_)) => {
                "A network error interrupted the download".to_string()
            }
            StageError::NoCandidate => {
                "No downloadable version matches the quality settings".to_string()
            }
            StageError::Processing(_) => "Processing the media failed".to_string(),
            StageError::Storage(e) => match e.error_kind() {
                ErrorKind::Storage(StorageKind::Quota) => {
                    "Not enough storage space for this file".to_string()
                }
                _ => "Storing the result failed".to_string(),
            },
            StageError::StageTimeout(secs) => {
                format!("Processing took longer than the {}s limit", secs)
            }
        }
    }

    /// Failure record attached to the task: user-safe message plus the raw
    /// error text in the operator-only detail field.
    pub fn to_error_info(&self) -> TaskErrorInfo {
        TaskErrorInfo::new(self.kind(), self.user_message()).with_detail(self.to_string())
    }
}
