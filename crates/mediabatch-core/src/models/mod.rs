//! Data models for the pipeline
//!
//! This module contains the data structures shared across the pipeline
//! crates, organized by domain.

mod batch;
mod progress;
mod quality;
mod rendition;
mod task;

// Re-export all models for convenient imports
pub use batch::*;
pub use progress::*;
pub use quality::*;
pub use rendition::*;
pub use task::*;
