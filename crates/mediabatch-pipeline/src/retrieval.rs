//! Interface to the external media retrieval engine.
//!
//! Downloading from source platforms is delegated to an external engine
//! (yt-dlp or similar) behind the [`MediaRetriever`] trait. The pipeline
//! depends only on the trait, so tests drive the orchestrator with an
//! in-memory implementation.

use async_trait::async_trait;
use mediabatch_core::error::{ErrorKind, RetrievalKind};
use mediabatch_core::models::{QualityLevel, RenditionCandidate};
use std::path::PathBuf;
use thiserror::Error;

/// Failure modes of the retrieval engine.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Media not found: {0}")]
    NotFound(String),

    #[error("Rate limited by source: {0}")]
    RateLimited(String),

    #[error("Network failure: {0}")]
    Network(String),
}

impl RetrievalError {
    /// Classify this error into the serializable taxonomy used on task records.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            RetrievalError::UnsupportedPlatform(_) => {
                ErrorKind::Retrieval(RetrievalKind::UnsupportedPlatform)
            }
            RetrievalError::NotFound(_) => ErrorKind::Retrieval(RetrievalKind::NotFound),
            RetrievalError::RateLimited(_) => ErrorKind::Retrieval(RetrievalKind::RateLimited),
            RetrievalError::Network(_) => ErrorKind::Retrieval(RetrievalKind::Network),
        }
    }

    /// Whether retrying the same request can succeed.
    pub fn is_retryable(&self) -> bool {
        self.error_kind().is_retryable()
    }
}

/// One fetch request handed to the engine.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub url: String,
    /// Preferred level when the caller asked for an explicit quality.
    pub quality_hint: Option<QualityLevel>,
    /// Staging directory the downloaded file must land in.
    pub dest_dir: PathBuf,
}

/// A completed download plus the rendition candidates the source offered.
///
/// `candidates` is ephemeral: it feeds rendition selection and is never
/// persisted beyond the selected entry recorded on the task.
#[derive(Debug, Clone)]
pub struct RetrievedMedia {
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub duration_seconds: Option<f64>,
    pub title: String,
    pub candidates: Vec<RenditionCandidate>,
}

/// Retrieval engine abstraction.
#[async_trait]
pub trait MediaRetriever: Send + Sync {
    async fn retrieve(&self, request: &RetrievalRequest) -> Result<RetrievedMedia, RetrievalError>;
}

/// Check that a submitted URL is an absolute http(s) address with a host.
///
/// Rejections carry a reason suitable for the user-facing error message.
pub fn validate_source_url(url: &str) -> Result<(), String> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| format!("Not a valid URL: {}", e))?;

    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => return Err(format!("Unsupported URL scheme: {}", other)),
        None => return Err("URL is missing a scheme".to_string()),
    }

    match uri.host() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err("URL is missing a host".to_string()),
    }
}

/// Source platform implied by the URL host, when recognized.
pub fn detect_platform(url: &str) -> Option<String> {
    let lower = url.to_lowercase();
    if lower.contains("youtube.com") || lower.contains("youtu.be") {
        Some("youtube".to_string())
    } else if lower.contains("tiktok.com") {
        Some("tiktok".to_string())
    } else if lower.contains("instagram.com") {
        Some("instagram".to_string())
    } else {
        None
    }
}
