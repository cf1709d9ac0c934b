//! Mediabatch Core Library
//!
//! This crate provides core domain models, the error taxonomy, and configuration
//! that are shared across all mediabatch components.

pub mod capacity_gate;
pub mod config;
pub mod constants;
pub mod error;
pub mod hooks;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use capacity_gate::CapacityGate;
pub use config::{Config, PipelineConfig, S3ProviderConfig};
pub use error::{AppError, ErrorKind, RetrievalKind, StorageKind, TaskErrorInfo};
pub use hooks::{JobCompletionHook, JobOutput, NoopCompletionHook};
pub use storage_types::StorageBackendKind;
