//! Batch pipeline orchestration.
//!
//! Everything between a submitted list of media URLs and their uploaded
//! results: the retrieval and encoder seams, per-task progress tracking with
//! batch aggregation, upload coordination with failover, and the
//! orchestrator that drives each task through its
//! retrieve/select/process/upload stages under bounded concurrency.
//!
//! The crate owns no storage or ffmpeg logic of its own; it composes the
//! storage and processing crates and adds the control plane: stage pools,
//! pause/resume/cancel, retry with backoff, and the completion hook.

pub mod encode;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod retrieval;
pub mod upload;

#[cfg(test)]
mod support;

pub use encode::{FfmpegEncoder, MediaEncoder};
pub use error::StageError;
pub use orchestrator::{BatchOrchestrator, BatchSubmission, PipelineHandle};
pub use progress::{
    BatchProgress, BatchStatistics, DebouncedProgress, ProgressTracker, ProgressUpdate,
};
pub use retrieval::{
    detect_platform, validate_source_url, MediaRetriever, RetrievalError, RetrievalRequest,
    RetrievedMedia,
};
pub use upload::{UploadCoordinator, UploadOutcome, UploadRequest};
