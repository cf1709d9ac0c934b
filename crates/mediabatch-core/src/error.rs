//! Error types module
//!
//! This module provides the shared error classification used throughout the
//! pipeline. Stage-specific error enums live in the crates that produce them
//! (`mediabatch-storage`, `mediabatch-pipeline`); they all map into the
//! [`ErrorKind`] taxonomy recorded on tasks and surfaced to consumers.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Retrieval failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalKind {
    UnsupportedPlatform,
    NotFound,
    RateLimited,
    Network,
}

/// Storage failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Connection,
    Quota,
    NotFound,
    Upload,
    Auth,
}

/// User-facing classification of a task failure.
///
/// Retries are automatic and bounded only for `Retrieval(Network | RateLimited)`
/// and `Storage(Connection | Upload | Auth)`; never for validation, quota, or
/// unsupported-platform failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class", content = "subclass")]
pub enum ErrorKind {
    Validation,
    Retrieval(RetrievalKind),
    Processing,
    Storage(StorageKind),
    Timeout,
}

impl ErrorKind {
    /// Whether the pipeline may retry the failed stage automatically.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::Retrieval(RetrievalKind::Network)
            | ErrorKind::Retrieval(RetrievalKind::RateLimited) => true,
            ErrorKind::Storage(StorageKind::Connection)
            | ErrorKind::Storage(StorageKind::Upload)
            | ErrorKind::Storage(StorageKind::Auth) => true,
            _ => false,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Retrieval(RetrievalKind::UnsupportedPlatform) => {
                write!(f, "retrieval/unsupported_platform")
            }
            ErrorKind::Retrieval(RetrievalKind::NotFound) => write!(f, "retrieval/not_found"),
            ErrorKind::Retrieval(RetrievalKind::RateLimited) => write!(f, "retrieval/rate_limited"),
            ErrorKind::Retrieval(RetrievalKind::Network) => write!(f, "retrieval/network"),
            ErrorKind::Processing => write!(f, "processing"),
            ErrorKind::Storage(StorageKind::Connection) => write!(f, "storage/connection"),
            ErrorKind::Storage(StorageKind::Quota) => write!(f, "storage/quota"),
            ErrorKind::Storage(StorageKind::NotFound) => write!(f, "storage/not_found"),
            ErrorKind::Storage(StorageKind::Upload) => write!(f, "storage/upload"),
            ErrorKind::Storage(StorageKind::Auth) => write!(f, "storage/auth"),
            ErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Failure record attached to a task.
///
/// `message` is safe to show to end users; `detail` carries raw internal
/// context and is operator-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Resource-pressure errors raised by capacity checks.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Insufficient disk space: {available} bytes available, {required} bytes required")]
    InsufficientDiskSpace { available: u64, required: u64 },

    #[error("Insufficient memory: {available} bytes available, {required} bytes required")]
    InsufficientMemory { available: u64, required: u64 },

    #[error("High CPU usage: {usage_percent}% exceeds threshold of {threshold}%")]
    HighCpuUsage { usage_percent: f64, threshold: f64 },

    #[error("High memory usage: {usage_percent}% exceeds threshold of {threshold}%")]
    HighMemoryUsage { usage_percent: f64, threshold: f64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
