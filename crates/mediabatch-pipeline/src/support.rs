//! Shared in-memory test doubles: storage backend with failure injection,
//! scripted retriever, copying encoder, recording completion hook.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::Method;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use mediabatch_core::models::RenditionCandidate;
use mediabatch_core::{
    Config, JobCompletionHook, JobOutput, PipelineConfig, S3ProviderConfig, StorageBackendKind,
};
use mediabatch_storage::{Storage, StorageError, StorageResult, StorageStats, StoredObjectInfo};

use crate::encode::MediaEncoder;
use crate::retrieval::{MediaRetriever, RetrievalError, RetrievalRequest, RetrievedMedia};

/// Full pipeline configuration with test-friendly values rooted at `staging_dir`.
pub(crate) fn test_config(staging_dir: &Path) -> Config {
    Config(Box::new(PipelineConfig {
        environment: "test".to_string(),
        failover_order: vec![StorageBackendKind::Local],
        wasabi: S3ProviderConfig::default(),
        backblaze: S3ProviderConfig::default(),
        digitalocean: S3ProviderConfig::default(),
        local_storage_path: None,
        local_storage_base_url: None,
        max_file_size_mb: 500,
        staging_dir: staging_dir.to_path_buf(),
        staging_ceiling_gb: 50,
        min_free_space_gb: 0,
        temp_ttl_secs: 3600,
        downloads_ttl_secs: 43200,
        thumbnails_ttl_secs: 43200,
        archives_ttl_secs: 21600,
        retrieval_concurrency: 3,
        processing_concurrency: 2,
        upload_concurrency: 3,
        max_retries: 3,
        stage_timeout_secs: 3600,
        max_archive_size_mb: 2048,
        archive_compression_level: 6,
        ffmpeg_path: "ffmpeg".to_string(),
        thumbnail_sizes: Vec::new(),
        thumbnail_jpeg_quality: 85,
        watermark_path: None,
        min_disk_free_gb: 0,
        max_memory_usage_percent: 100.0,
        max_cpu_usage_percent: 100.0,
        disk_check_behavior: "warn".to_string(),
        memory_check_behavior: "warn".to_string(),
        cpu_check_behavior: "warn".to_string(),
        progress_debounce_ms: 500,
    }))
}

/// Candidate with consistent 16:9 geometry for selection and planning tests.
pub(crate) fn candidate(
    format_id: &str,
    height: u32,
    codec: &str,
    bitrate_kbps: Option<f64>,
) -> RenditionCandidate {
    RenditionCandidate {
        format_id: format_id.to_string(),
        container: "mp4".to_string(),
        width: Some(height * 16 / 9),
        height: Some(height),
        fps: Some(30.0),
        bitrate_kbps,
        video_codec: Some(codec.to_string()),
        audio_codec: Some("aac".to_string()),
        filesize_bytes: Some(10 * 1024 * 1024),
        filesize_approx_bytes: None,
        protocol: Some("https".to_string()),
    }
}

/// Candidate set whose best option passes through without re-encoding.
pub(crate) fn passthrough_candidates() -> Vec<RenditionCandidate> {
    vec![candidate("22", 720, "h264", Some(2500.0))]
}

/// In-memory storage backend with failure injection.
pub(crate) struct MemoryStorage {
    kind: StorageBackendKind,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_uploads_remaining: AtomicU32,
    quota_exceeded: AtomicBool,
    lie_about_size: AtomicBool,
    presign_fails: AtomicBool,
    upload_attempts: AtomicU32,
}

impl MemoryStorage {
    pub(crate) fn new(kind: StorageBackendKind) -> Self {
        Self {
            kind,
            objects: Mutex::new(HashMap::new()),
            fail_uploads_remaining: AtomicU32::new(0),
            quota_exceeded: AtomicBool::new(false),
            lie_about_size: AtomicBool::new(false),
            presign_fails: AtomicBool::new(false),
            upload_attempts: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` uploads with a retryable error.
    pub(crate) fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads_remaining.store(n, Ordering::SeqCst);
    }

    /// Reject every upload with a quota error (not retryable).
    pub(crate) fn set_quota_exceeded(&self, value: bool) {
        self.quota_exceeded.store(value, Ordering::SeqCst);
    }

    /// Under-report object sizes from `get_info`, failing verification.
    pub(crate) fn set_lie_about_size(&self, value: bool) {
        self.lie_about_size.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_presign_fails(&self, value: bool) {
        self.presign_fails.store(value, Ordering::SeqCst);
    }

    pub(crate) fn upload_attempts(&self) -> u32 {
        self.upload_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    fn store(&self, key: &str, data: Vec<u8>) -> StorageResult<StoredObjectInfo> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);

        if self.quota_exceeded.load(Ordering::SeqCst) {
            return Err(StorageError::QuotaExceeded {
                required: data.len() as u64,
                available: 0,
            });
        }
        if self
            .fail_uploads_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::UploadFailed("injected failure".to_string()));
        }

        let size = data.len() as u64;
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(self.info(key, size))
    }

    fn info(&self, key: &str, size_bytes: u64) -> StoredObjectInfo {
        StoredObjectInfo {
            key: key.to_string(),
            size_bytes,
            content_type: None,
            etag: None,
            last_modified: Some(Utc::now()),
            public_url: None,
            backend: self.kind,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn connect(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<StoredObjectInfo> {
        let data = tokio::fs::read(path).await?;
        self.store(key, data)
    }

    async fn upload_bytes(
        &self,
        data: Bytes,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<StoredObjectInfo> {
        self.store(key, data.to_vec())
    }

    async fn download_file(&self, key: &str, dest: &Path) -> StorageResult<u64> {
        let data = self.download_bytes(key).await?;
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn download_bytes(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|data| Bytes::from(data.clone()))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.contains(key))
    }

    async fn get_info(&self, key: &str) -> StorageResult<StoredObjectInfo> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let mut size = data.len() as u64;
        if self.lie_about_size.load(Ordering::SeqCst) {
            size = size.saturating_sub(1);
        }
        Ok(self.info(key, size))
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<StoredObjectInfo>> {
        let objects = self.objects.lock().unwrap();
        let mut infos: Vec<StoredObjectInfo> = objects
            .iter()
            .filter(|(key, _)| prefix.map_or(true, |p| key.starts_with(p)))
            .map(|(key, data)| self.info(key, data.len() as u64))
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos.truncate(limit);
        Ok(infos)
    }

    async fn presigned_url(
        &self,
        key: &str,
        _expires_in: Duration,
        _method: Method,
    ) -> StorageResult<String> {
        if self.presign_fails.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError(
                "presigning not supported".to_string(),
            ));
        }
        Ok(format!("memory://{}/{}", self.kind, key))
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let objects = self.objects.lock().unwrap();
        Ok(StorageStats {
            backend: self.kind,
            object_count: Some(objects.len() as u64),
            total_bytes: Some(objects.values().map(|d| d.len() as u64).sum()),
            available_bytes: None,
            connected: true,
        })
    }

    fn backend_kind(&self) -> StorageBackendKind {
        self.kind
    }
}

/// One scripted retrieval outcome. Unscripted URLs succeed with the
/// retriever's default candidates.
pub(crate) enum ScriptStep {
    Succeed,
    FailNetwork,
    FailNotFound,
    FailRateLimited,
    FailUnsupported,
}

/// Scripted retrieval engine writing small files into the request directory.
pub(crate) struct MockRetriever {
    candidates: Vec<RenditionCandidate>,
    scripts: Mutex<HashMap<String, VecDeque<ScriptStep>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU32,
}

impl MockRetriever {
    pub(crate) fn new(candidates: Vec<RenditionCandidate>) -> Self {
        Self {
            candidates,
            scripts: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    /// Queue outcomes for one URL, consumed in order; afterwards the URL
    /// succeeds like any unscripted one.
    pub(crate) fn script(&self, url: &str, steps: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.into());
    }

    /// Sleep this long inside every retrieve call.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaRetriever for MockRetriever {
    async fn retrieve(
        &self,
        request: &RetrievalRequest,
    ) -> Result<RetrievedMedia, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(ScriptStep::Succeed);

        match step {
            ScriptStep::Succeed => {}
            ScriptStep::FailNetwork => {
                return Err(RetrievalError::Network("connection reset".to_string()))
            }
            ScriptStep::FailNotFound => {
                return Err(RetrievalError::NotFound(request.url.clone()))
            }
            ScriptStep::FailRateLimited => {
                return Err(RetrievalError::RateLimited("HTTP 429".to_string()))
            }
            ScriptStep::FailUnsupported => {
                return Err(RetrievalError::UnsupportedPlatform(request.url.clone()))
            }
        }

        let content = b"retrieved media bytes".to_vec();
        tokio::fs::create_dir_all(&request.dest_dir)
            .await
            .map_err(|e| RetrievalError::Network(e.to_string()))?;
        let local_path = request.dest_dir.join("media.mp4");
        tokio::fs::write(&local_path, &content)
            .await
            .map_err(|e| RetrievalError::Network(e.to_string()))?;

        Ok(RetrievedMedia {
            local_path,
            size_bytes: content.len() as u64,
            duration_seconds: Some(120.0),
            title: title_for(&request.url),
            candidates: self.candidates.clone(),
        })
    }
}

fn title_for(url: &str) -> String {
    url.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("media")
        .to_string()
}

/// Encoder that copies input to output, optionally failing instead.
pub(crate) struct MockEncoder {
    fail: AtomicBool,
    calls: AtomicU32,
}

impl MockEncoder {
    pub(crate) fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn set_fail(&self, value: bool) {
        self.fail.store(value, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEncoder for MockEncoder {
    async fn encode(
        &self,
        _spec: &mediabatch_processing::EncodeSpec,
        input: &Path,
        output: &Path,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("simulated encode failure");
        }
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

/// Completion hook recording every invocation.
#[derive(Default)]
pub(crate) struct RecordingHook {
    calls: Mutex<Vec<(Uuid, Vec<JobOutput>, Option<String>)>>,
}

impl RecordingHook {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn calls(&self) -> Vec<(Uuid, Vec<JobOutput>, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobCompletionHook for RecordingHook {
    async fn on_job_complete(
        &self,
        job_id: Uuid,
        outputs: &[JobOutput],
        archive_key: Option<&str>,
    ) {
        self.calls.lock().unwrap().push((
            job_id,
            outputs.to_vec(),
            archive_key.map(String::from),
        ));
    }
}
