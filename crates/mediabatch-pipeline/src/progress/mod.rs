//! Task and batch progress tracking.

mod batch;
mod tracker;

pub use batch::{BatchProgress, BatchStatistics};
pub use tracker::{DebouncedProgress, ProgressTracker, ProgressUpdate};
