//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::Method;
use mediabatch_core::{ErrorKind, StorageBackendKind, StorageKind};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("File too large: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    FileTooLarge { size_bytes: u64, limit_bytes: u64 },

    #[error("Quota exceeded: {required} bytes required, {available} bytes available")]
    QuotaExceeded { required: u64, available: u64 },

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    /// Classify this error into the serializable taxonomy used on task records.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            StorageError::ConnectionFailed(_) => ErrorKind::Storage(StorageKind::Connection),
            StorageError::AuthFailed(_) => ErrorKind::Storage(StorageKind::Auth),
            StorageError::NotFound(_) => ErrorKind::Storage(StorageKind::NotFound),
            StorageError::FileTooLarge { .. } | StorageError::QuotaExceeded { .. } => {
                ErrorKind::Storage(StorageKind::Quota)
            }
            StorageError::InvalidKey(_) | StorageError::ConfigError(_) => ErrorKind::Validation,
            StorageError::UploadFailed(_)
            | StorageError::DownloadFailed(_)
            | StorageError::DeleteFailed(_)
            | StorageError::BackendError(_)
            | StorageError::IoError(_) => ErrorKind::Storage(StorageKind::Upload),
        }
    }

    /// Whether retrying the same operation against the same backend can succeed.
    pub fn is_retryable(&self) -> bool {
        self.error_kind().is_retryable()
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata for an object held by a storage backend.
#[derive(Debug, Clone, Serialize)]
pub struct StoredObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    pub backend: StorageBackendKind,
}

/// Aggregate usage for a storage backend.
///
/// `object_count`/`total_bytes` are `None` when the backend cannot enumerate
/// cheaply; `available_bytes` is only known for disk-backed stores.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub backend: StorageBackendKind,
    pub object_count: Option<u64>,
    pub total_bytes: Option<u64>,
    pub available_bytes: Option<u64>,
    pub connected: bool,
}

/// Storage abstraction trait
///
/// All storage backends (S3-compatible providers, local filesystem) implement
/// this trait, so the upload coordinator can walk a failover chain without
/// coupling to provider details.
///
/// **Key format:** Keys are produced by the `keys` module:
/// `{tier}/{YYYY}/{MM}/{hash12}_{task_id}{ext}`. Keys must not contain `..` or
/// a leading `/`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Establish (or re-establish) the backend connection. Idempotent.
    async fn connect(&self) -> StorageResult<()>;

    /// Release any cached connection state. Always succeeds; idempotent.
    async fn disconnect(&self) -> StorageResult<()>;

    /// Upload a local file to the given key and return the stored object metadata.
    ///
    /// The per-object size limit is enforced before any network call.
    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<StoredObjectInfo>;

    /// Upload an in-memory buffer to the given key.
    async fn upload_bytes(
        &self,
        data: Bytes,
        key: &str,
        content_type: &str,
    ) -> StorageResult<StoredObjectInfo>;

    /// Download an object to a local path, returning the number of bytes written.
    async fn download_file(&self, key: &str, dest: &Path) -> StorageResult<u64>;

    /// Download an object fully into memory.
    async fn download_bytes(&self, key: &str) -> StorageResult<Bytes>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Fetch object metadata, with `StorageError::NotFound` when absent.
    async fn get_info(&self, key: &str) -> StorageResult<StoredObjectInfo>;

    /// List up to `limit` objects under an optional key prefix.
    async fn list(&self, prefix: Option<&str>, limit: usize)
        -> StorageResult<Vec<StoredObjectInfo>>;

    /// Generate a presigned/temporary URL for direct access
    ///
    /// This is useful for giving clients temporary access to files
    /// without going through the pipeline host.
    async fn presigned_url(
        &self,
        key: &str,
        expires_in: Duration,
        method: Method,
    ) -> StorageResult<String>;

    /// Aggregate usage stats for this backend.
    async fn stats(&self) -> StorageResult<StorageStats>;

    /// Get the storage backend type
    fn backend_kind(&self) -> StorageBackendKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = StorageError::NotFound("free/2026/01/abc.mp4".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.error_kind(), ErrorKind::Storage(StorageKind::NotFound));
    }

    #[test]
    fn test_quota_errors_are_not_retryable() {
        let err = StorageError::QuotaExceeded {
            required: 100,
            available: 10,
        };
        assert!(!err.is_retryable());

        let err = StorageError::FileTooLarge {
            size_bytes: 600,
            limit_bytes: 500,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.error_kind(), ErrorKind::Storage(StorageKind::Quota));
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(StorageError::ConnectionFailed("timeout".to_string()).is_retryable());
        assert!(StorageError::UploadFailed("broken pipe".to_string()).is_retryable());
        assert!(StorageError::AuthFailed("token expired".to_string()).is_retryable());
    }

    #[test]
    fn test_invalid_key_maps_to_validation() {
        let err = StorageError::InvalidKey("../escape".to_string());
        assert_eq!(err.error_kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }
}
