//! Mediabatch Storage Library
//!
//! Storage abstraction and implementations for the batch pipeline: the
//! `Storage` trait, S3-compatible provider backends (Wasabi, Backblaze B2,
//! DigitalOcean Spaces), a quota-guarded local-disk backend, the staging area
//! with per-category TTLs, and shared object key generation.
//!
//! # Storage key format
//!
//! Finished media objects use `{tier}/{YYYY}/{MM}/{hash12}_{task_id}{ext}`,
//! archives use `archives/{YYYY}/{MM}/batch_{job_id}_{timestamp}.zip`. Keys
//! must not contain `..` or a leading `/`. Key generation is centralized in
//! the `keys` module so all backends stay consistent.

pub mod factory;
pub mod keys;
pub mod local;
pub mod quota;
pub mod s3;
pub mod staging;
pub mod traits;

// Re-export commonly used types
pub use factory::{create_failover_chain, create_storage};
pub use local::LocalDiskStorage;
pub use mediabatch_core::StorageBackendKind;
pub use quota::{DiskQuota, QuotaLimits};
pub use s3::{S3Config, S3Provider, S3Storage};
pub use staging::{
    CleanupReport, Reservation, StagingCategory, StagingConfig, StagingStats, StagingStore,
};
pub use traits::{Storage, StorageError, StorageResult, StorageStats, StoredObjectInfo};
