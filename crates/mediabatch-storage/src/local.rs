use crate::keys;
use crate::quota::{available_space_for, DiskQuota};
use crate::traits::{Storage, StorageError, StorageResult, StorageStats, StoredObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::Method;
use mediabatch_core::StorageBackendKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Local filesystem storage implementation
///
/// Terminal member of the failover chain: objects land under a root directory
/// using the same key layout as the S3 backends, served through a static base
/// URL. Writes pass quota admission first so a full disk degrades into a typed
/// error instead of a half-written object.
pub struct LocalDiskStorage {
    base_path: PathBuf,
    base_url: String,
    quota: DiskQuota,
}

impl LocalDiskStorage {
    /// Create a new LocalDiskStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for object storage
    /// * `base_url` - Base URL for serving files (e.g., "http://localhost:8080/media")
    /// * `quota` - Per-file and free-space admission limits
    pub async fn new(
        base_path: impl Into<PathBuf>,
        base_url: String,
        quota: DiskQuota,
    ) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalDiskStorage {
            base_path,
            base_url,
            quota,
        })
    }

    /// Convert storage key to filesystem path with traversal validation.
    fn key_to_path(&self, key: &str) -> StorageResult<PathBuf> {
        keys::validate_key(key)?;

        let path = self.base_path.join(key);

        if let Ok(canonical) = path.canonicalize() {
            let base_canonical = self.base_path.canonicalize().map_err(|e| {
                StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
            })?;
            if canonical.strip_prefix(&base_canonical).is_err() {
                return Err(StorageError::InvalidKey(
                    "Storage key resolves outside storage directory".to_string(),
                ));
            }
        }

        Ok(path)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn admit(&self, size_bytes: u64) -> StorageResult<()> {
        self.quota.check_file_size(size_bytes)?;
        self.quota
            .check_free_space_async(&self.base_path, size_bytes)
            .await
    }

    fn info_for(&self, key: &str, size_bytes: u64, modified: Option<DateTime<Utc>>) -> StoredObjectInfo {
        StoredObjectInfo {
            key: key.to_string(),
            size_bytes,
            content_type: Some(keys::content_type_for(Path::new(key)).to_string()),
            etag: None,
            last_modified: modified,
            public_url: Some(self.object_url(key)),
            backend: StorageBackendKind::Local,
        }
    }
}

#[async_trait]
impl Storage for LocalDiskStorage {
    async fn connect(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<StoredObjectInfo> {
        let src_meta = fs::metadata(path).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to stat source file {}: {}",
                path.display(),
                e
            ))
        })?;
        let size = src_meta.len();

        self.admit(size).await?;

        let dest = self.key_to_path(key)?;
        self.ensure_parent_dir(&dest).await?;

        let start = std::time::Instant::now();

        fs::copy(path, &dest).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to copy {} to {}: {}",
                path.display(),
                dest.display(),
                e
            ))
        })?;

        let file = fs::File::open(&dest).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to open file {}: {}", dest.display(), e))
        })?;
        file.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", dest.display(), e))
        })?;

        tracing::info!(
            path = %dest.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        Ok(self.info_for(key, size, Some(Utc::now())))
    }

    async fn upload_bytes(
        &self,
        data: Bytes,
        key: &str,
        content_type: &str,
    ) -> StorageResult<StoredObjectInfo> {
        let size = data.len() as u64;

        self.admit(size).await?;

        let path = self.key_to_path(key)?;
        self.ensure_parent_dir(&path).await?;

        let start = std::time::Instant::now();

        let mut file = fs::File::create(&path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", path.display(), e))
        })?;

        file.write_all(&data).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to write file {}: {}", path.display(), e))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", path.display(), e))
        })?;

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        let mut info = self.info_for(key, size, Some(Utc::now()));
        info.content_type = Some(content_type.to_string());
        Ok(info)
    }

    async fn download_file(&self, key: &str, dest: &Path) -> StorageResult<u64> {
        let path = self.key_to_path(key)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(key.to_string()));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let bytes_copied = fs::copy(&path, dest).await.map_err(|e| {
            StorageError::DownloadFailed(format!(
                "Failed to copy {} to {}: {}",
                path.display(),
                dest.display(),
                e
            ))
        })?;

        Ok(bytes_copied)
    }

    async fn download_bytes(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_to_path(key)?;
        let start = std::time::Instant::now();

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let data = fs::read(&path).await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = data.len() as u64,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage download successful"
        );

        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_to_path(key)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        fs::remove_file(&path).await.map_err(|e| {
            StorageError::DeleteFailed(format!("Failed to delete file {}: {}", path.display(), e))
        })?;

        tracing::info!(path = %path.display(), key = %key, "Local storage delete successful");

        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn get_info(&self, key: &str) -> StorageResult<StoredObjectInfo> {
        let path = self.key_to_path(key)?;

        let meta = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::BackendError(e.to_string())
            }
        })?;

        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(self.info_for(key, meta.len(), modified))
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<StoredObjectInfo>> {
        let mut out = Vec::new();
        let mut stack = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::BackendError(e.to_string()))?
            {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };

                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }

                let Ok(rel) = path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let key = rel.to_string_lossy().into_owned();

                if let Some(p) = prefix {
                    if !key.starts_with(p) {
                        continue;
                    }
                }

                let modified = meta.modified().ok().map(DateTime::<Utc>::from);
                out.push(self.info_for(&key, meta.len(), modified));
            }
        }

        out.sort_by(|a, b| a.key.cmp(&b.key));
        out.truncate(limit);
        Ok(out)
    }

    async fn presigned_url(
        &self,
        key: &str,
        _expires_in: Duration,
        method: Method,
    ) -> StorageResult<String> {
        if method != Method::GET {
            return Err(StorageError::ConfigError(format!(
                "presigned {} URLs are not supported by local storage",
                method
            )));
        }

        self.key_to_path(key)?;
        Ok(self.object_url(key))
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let objects = self.list(None, usize::MAX).await?;
        let total_bytes = objects.iter().map(|o| o.size_bytes).sum::<u64>();

        let base = self.base_path.clone();
        let available_bytes = tokio::task::spawn_blocking(move || available_space_for(&base))
            .await
            .unwrap_or(None);

        Ok(StorageStats {
            backend: StorageBackendKind::Local,
            object_count: Some(objects.len() as u64),
            total_bytes: Some(total_bytes),
            available_bytes,
            connected: true,
        })
    }

    fn backend_kind(&self) -> StorageBackendKind {
        StorageBackendKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaLimits;
    use tempfile::tempdir;

    async fn test_storage(dir: &Path) -> LocalDiskStorage {
        let quota = DiskQuota::new(QuotaLimits::new(500, 50, 0));
        LocalDiskStorage::new(dir, "http://localhost:8080/media".to_string(), quota)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = test_storage(dir.path()).await;

        let data = Bytes::from_static(b"test data");
        let info = storage
            .upload_bytes(data.clone(), "free/2026/01/abc_task.mp4", "video/mp4")
            .await
            .unwrap();

        assert_eq!(info.size_bytes, 9);
        assert_eq!(info.backend, StorageBackendKind::Local);
        assert_eq!(
            info.public_url.as_deref(),
            Some("http://localhost:8080/media/free/2026/01/abc_task.mp4")
        );

        let downloaded = storage.download_bytes("free/2026/01/abc_task.mp4").await.unwrap();
        assert_eq!(data, downloaded);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempdir().unwrap();
        let storage = test_storage(dir.path()).await;

        let result = storage.download_bytes("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.delete("../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.exists("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_ok() {
        let dir = tempdir().unwrap();
        let storage = test_storage(dir.path()).await;

        assert!(storage.delete("nonexistent/file.mp4").await.is_ok());
    }

    #[tokio::test]
    async fn test_get_info_not_found() {
        let dir = tempdir().unwrap();
        let storage = test_storage(dir.path()).await;

        let err = storage.get_info("missing.mp4").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upload_rejects_oversized_file() {
        let dir = tempdir().unwrap();
        let quota = DiskQuota::new(QuotaLimits::new(1, 50, 0));
        let storage =
            LocalDiskStorage::new(dir.path(), "http://localhost:8080/media".to_string(), quota)
                .await
                .unwrap();

        let data = Bytes::from(vec![0u8; 2 * 1024 * 1024]);
        let err = storage
            .upload_bytes(data, "big.mp4", "video/mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::FileTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_list_with_prefix_and_limit() {
        let dir = tempdir().unwrap();
        let storage = test_storage(dir.path()).await;

        for key in ["free/a.mp4", "free/b.mp4", "premium/c.mp4"] {
            storage
                .upload_bytes(Bytes::from_static(b"x"), key, "video/mp4")
                .await
                .unwrap();
        }

        let all = storage.list(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let free = storage.list(Some("free/"), 10).await.unwrap();
        assert_eq!(free.len(), 2);
        assert!(free.iter().all(|o| o.key.starts_with("free/")));

        let limited = storage.list(None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_presigned_url_get_only() {
        let dir = tempdir().unwrap();
        let storage = test_storage(dir.path()).await;

        let url = storage
            .presigned_url("free/a.mp4", Duration::from_secs(3600), Method::GET)
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:8080/media/free/a.mp4");

        let err = storage
            .presigned_url("free/a.mp4", Duration::from_secs(3600), Method::PUT)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_upload_file_and_download_file() {
        let dir = tempdir().unwrap();
        let storage = test_storage(dir.path()).await;

        let staging = tempdir().unwrap();
        let src = staging.path().join("source.mp4");
        tokio::fs::write(&src, b"file contents").await.unwrap();

        let info = storage.upload_file(&src, "trial/2026/02/video.mp4").await.unwrap();
        assert_eq!(info.size_bytes, 13);
        assert_eq!(info.content_type.as_deref(), Some("video/mp4"));

        let dest = staging.path().join("restored.mp4");
        let written = storage
            .download_file("trial/2026/02/video.mp4", &dest)
            .await
            .unwrap();
        assert_eq!(written, 13);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"file contents");
    }

    #[tokio::test]
    async fn test_stats_counts_objects() {
        let dir = tempdir().unwrap();
        let storage = test_storage(dir.path()).await;

        storage
            .upload_bytes(Bytes::from_static(b"abcd"), "free/one.mp4", "video/mp4")
            .await
            .unwrap();
        storage
            .upload_bytes(Bytes::from_static(b"efgh"), "free/two.mp4", "video/mp4")
            .await
            .unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.object_count, Some(2));
        assert_eq!(stats.total_bytes, Some(8));
        assert!(stats.connected);
    }
}
