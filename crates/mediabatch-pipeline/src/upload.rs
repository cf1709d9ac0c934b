//! Upload coordination: bounded retries, backend failover, size verification.
//!
//! One coordinator serves every task in the pipeline. It walks the configured
//! failover chain in order; retries stay within one backend and only failover
//! moves to the next. Falling over is best-effort delivery, not a
//! transaction: the task records a warning naming the backend that failed.

use futures::StreamExt;
use http::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mediabatch_core::constants::MAX_RETRY_BACKOFF_SECS;
use mediabatch_core::models::UserTier;
use mediabatch_storage::keys::{generate_object_key, thumbnail_object_key};
use mediabatch_storage::{Storage, StorageError, StoredObjectInfo};

/// Delay before retry attempt `attempt` (1-based): 2, 4, 8... seconds,
/// capped at [`MAX_RETRY_BACKOFF_SECS`].
#[inline]
pub(crate) fn compute_retry_backoff_seconds(attempt: u32) -> u64 {
    (2_u64.pow(attempt)).min(MAX_RETRY_BACKOFF_SECS)
}

/// Staged outputs of one task, ready for upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub task_id: Uuid,
    pub tier: UserTier,
    pub main_file: PathBuf,
    /// File name the object key is derived from.
    pub filename: String,
    /// (size name, staged path) pairs.
    pub thumbnails: Vec<(String, PathBuf)>,
    /// Keep staged copies after upload; the archive step still reads them.
    pub retain_staged: bool,
}

/// What uploading one task's files produced.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub object: StoredObjectInfo,
    /// Presigned access URL with tier-based expiry, or the backend's public
    /// URL when presigning is unavailable.
    pub remote_url: Option<String>,
    pub thumbnail_keys: Vec<String>,
    /// Failovers and per-file derivative failures, in occurrence order.
    pub warnings: Vec<String>,
}

pub struct UploadCoordinator {
    chain: Vec<Arc<dyn Storage>>,
    max_retries: u32,
    file_concurrency: usize,
}

impl UploadCoordinator {
    pub fn new(chain: Vec<Arc<dyn Storage>>, max_retries: u32, file_concurrency: usize) -> Self {
        Self {
            chain,
            max_retries,
            file_concurrency: file_concurrency.max(1),
        }
    }

    pub fn backend_count(&self) -> usize {
        self.chain.len()
    }

    /// Upload one file and verify the backend stored the expected size.
    /// The staged copy must never be deleted on the word of `upload_file`
    /// alone.
    async fn upload_and_verify(
        &self,
        backend: &Arc<dyn Storage>,
        path: &Path,
        key: &str,
    ) -> Result<StoredObjectInfo, StorageError> {
        let expected = tokio::fs::metadata(path).await?.len();
        let info = backend.upload_file(path, key).await?;

        let stored = backend.get_info(key).await?;
        if stored.size_bytes != expected {
            return Err(StorageError::UploadFailed(format!(
                "Size mismatch after upload of {}: expected {} bytes, backend reports {}",
                key, expected, stored.size_bytes
            )));
        }
        Ok(info)
    }

    /// Bounded retries against a single backend. Only retryable errors are
    /// retried; quota and not-found surface immediately.
    async fn upload_with_retries(
        &self,
        backend: &Arc<dyn Storage>,
        path: &Path,
        key: &str,
    ) -> Result<StoredObjectInfo, StorageError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.upload_and_verify(backend, path, key).await {
                Ok(info) => return Ok(info),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = compute_retry_backoff_seconds(attempt);
                    warn!(
                        key = %key,
                        backend = %backend.backend_kind(),
                        attempt = attempt,
                        delay_secs = delay,
                        error = %e,
                        "Upload attempt failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Walk the failover chain until one backend accepts the file. Each
    /// exhausted backend adds a warning; the last error surfaces when the
    /// whole chain fails.
    async fn upload_with_failover(
        &self,
        path: &Path,
        key: &str,
    ) -> Result<(StoredObjectInfo, Arc<dyn Storage>, Vec<String>), StorageError> {
        let mut warnings = Vec::new();
        let mut last_error = None;

        for backend in &self.chain {
            match self.upload_with_retries(backend, path, key).await {
                Ok(info) => return Ok((info, backend.clone(), warnings)),
                Err(e) => {
                    warn!(
                        key = %key,
                        backend = %backend.backend_kind(),
                        error = %e,
                        "Backend exhausted, trying next in chain"
                    );
                    warnings.push(format!("Upload to {} failed: {}", backend.backend_kind(), e));
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            StorageError::ConfigError("No storage backends configured".to_string())
        }))
    }

    /// Upload a task's staged outputs: main file first, then thumbnails with
    /// bounded concurrency on the backend that took the main file.
    ///
    /// A main-file failure fails the whole upload. A thumbnail failure only
    /// adds a warning; the staged thumbnail is kept for the archive step.
    pub async fn upload_task_files(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, StorageError> {
        let key = generate_object_key(request.tier, request.task_id, &request.filename);
        let (object, backend, mut warnings) =
            self.upload_with_failover(&request.main_file, &key).await?;

        info!(
            task_id = %request.task_id,
            key = %object.key,
            backend = %object.backend,
            size_bytes = object.size_bytes,
            "Main file uploaded"
        );

        if !request.retain_staged {
            if let Err(e) = tokio::fs::remove_file(&request.main_file).await {
                warn!(
                    path = %request.main_file.display(),
                    error = %e,
                    "Failed to remove staged file after verified upload"
                );
            }
        }

        // Collected eagerly: a lazy map here leaves a higher-ranked closure in
        // the future's state, which rustc cannot prove Send (rust-lang #89976).
        let uploads: Vec<_> = request
            .thumbnails
            .iter()
            .map(|(size_name, path)| {
                let backend = backend.clone();
                let thumb_key = thumbnail_object_key(&object.key, size_name);
                async move {
                    let result = self.upload_with_retries(&backend, path, &thumb_key).await;
                    (thumb_key, path, result)
                }
            })
            .collect();
        let results = futures::stream::iter(uploads)
            .buffer_unordered(self.file_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut thumbnail_keys = Vec::new();
        for (thumb_key, path, result) in results {
            match result {
                Ok(_) => {
                    thumbnail_keys.push(thumb_key);
                    if !request.retain_staged {
                        if let Err(e) = tokio::fs::remove_file(path).await {
                            warn!(
                                path = %path.display(),
                                error = %e,
                                "Failed to remove staged thumbnail after upload"
                            );
                        }
                    }
                }
                Err(e) => {
                    warnings.push(format!("Thumbnail upload failed for {}: {}", thumb_key, e));
                }
            }
        }

        let expiry = Duration::from_secs(request.tier.presign_expiry_secs());
        let remote_url = match backend.presigned_url(&object.key, expiry, Method::GET).await {
            Ok(url) => Some(url),
            Err(e) => {
                debug!(key = %object.key, error = %e, "Presigning unavailable, using public URL");
                object.public_url.clone()
            }
        };

        Ok(UploadOutcome {
            object,
            remote_url,
            thumbnail_keys,
            warnings,
        })
    }

    /// Upload a built batch archive under an explicit key.
    pub async fn upload_archive(
        &self,
        path: &Path,
        key: &str,
    ) -> Result<(StoredObjectInfo, Vec<String>), StorageError> {
        let (object, _backend, warnings) = self.upload_with_failover(path, key).await?;
        Ok((object, warnings))
    }
}
