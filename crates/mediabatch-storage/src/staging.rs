//! Staging area for in-flight pipeline files.
//!
//! Staged files live in four category directories under one root, each with
//! its own TTL. Capacity admission runs as a single critical section: quota
//! checks, then expired-file cleanup, then oldest-first eviction in category
//! priority order, and only then a typed refusal.

use crate::keys::sanitize_filename;
use crate::quota::{available_space_for, DiskQuota, QuotaLimits};
use crate::traits::{StorageError, StorageResult};
use mediabatch_core::Config;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Lifecycle bucket for a staged file.
///
/// `ALL` doubles as the cleanup priority order: scratch data is reclaimed
/// before anything a user may still be waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingCategory {
    Temp,
    Downloads,
    Thumbnails,
    Archives,
}

impl StagingCategory {
    pub const ALL: [StagingCategory; 4] = [
        StagingCategory::Temp,
        StagingCategory::Downloads,
        StagingCategory::Thumbnails,
        StagingCategory::Archives,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            StagingCategory::Temp => "temp",
            StagingCategory::Downloads => "downloads",
            StagingCategory::Thumbnails => "thumbnails",
            StagingCategory::Archives => "archives",
        }
    }
}

impl fmt::Display for StagingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Settings for the staging area.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub base_dir: PathBuf,
    pub max_file_size_mb: u64,
    pub max_total_size_gb: u64,
    pub min_free_space_gb: u64,
    pub temp_ttl_secs: u64,
    pub downloads_ttl_secs: u64,
    pub thumbnails_ttl_secs: u64,
    pub archives_ttl_secs: u64,
}

impl StagingConfig {
    pub fn from_config(config: &Config) -> Self {
        StagingConfig {
            base_dir: config.staging_dir().clone(),
            max_file_size_mb: config.max_file_size_mb(),
            max_total_size_gb: config.staging_ceiling_gb(),
            min_free_space_gb: config.min_free_space_gb(),
            temp_ttl_secs: config.temp_ttl_secs(),
            downloads_ttl_secs: config.downloads_ttl_secs(),
            thumbnails_ttl_secs: config.thumbnails_ttl_secs(),
            archives_ttl_secs: config.archives_ttl_secs(),
        }
    }

    pub fn ttl_for(&self, category: StagingCategory) -> Duration {
        let secs = match category {
            StagingCategory::Temp => self.temp_ttl_secs,
            StagingCategory::Downloads => self.downloads_ttl_secs,
            StagingCategory::Thumbnails => self.thumbnails_ttl_secs,
            StagingCategory::Archives => self.archives_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Booked staging capacity.
///
/// `commit` after the file is on disk (the scanner takes over accounting),
/// `release` to abandon. Dropping an unfinished reservation releases it.
#[derive(Debug)]
pub struct Reservation {
    reserved: Arc<AtomicU64>,
    size_bytes: u64,
    released: bool,
}

impl Reservation {
    fn new(reserved: Arc<AtomicU64>, size_bytes: u64) -> Self {
        reserved.fetch_add(size_bytes, Ordering::SeqCst);
        Reservation {
            reserved,
            size_bytes,
            released: false,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn commit(mut self) {
        self.release_once();
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.reserved.fetch_sub(self.size_bytes, Ordering::SeqCst);
            self.released = true;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Outcome of a cleanup or eviction sweep.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CleanupReport {
    pub files_removed: u64,
    pub bytes_freed: u64,
}

/// Usage counters for one staging category.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CategoryStats {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Usage snapshot across the staging area.
#[derive(Debug, Clone, Serialize)]
pub struct StagingStats {
    pub temp: CategoryStats,
    pub downloads: CategoryStats,
    pub thumbnails: CategoryStats,
    pub archives: CategoryStats,
    pub total_bytes: u64,
    pub reserved_bytes: u64,
    pub available_bytes: Option<u64>,
}

struct StagedFile {
    path: PathBuf,
    size_bytes: u64,
    modified: SystemTime,
}

/// Disk staging area with per-category TTLs and quota-guarded admission.
pub struct StagingStore {
    config: StagingConfig,
    quota: DiskQuota,
    reserve_lock: Mutex<()>,
    reserved_bytes: Arc<AtomicU64>,
}

impl StagingStore {
    pub async fn new(config: StagingConfig) -> StorageResult<Self> {
        let limits = QuotaLimits::new(
            config.max_file_size_mb,
            config.max_total_size_gb,
            config.min_free_space_gb,
        );
        Self::with_limits(config, limits).await
    }

    /// Construct with explicit byte-granular limits.
    pub async fn with_limits(config: StagingConfig, limits: QuotaLimits) -> StorageResult<Self> {
        for category in StagingCategory::ALL {
            let dir = config.base_dir.join(category.dir_name());
            fs::create_dir_all(&dir).await.map_err(|e| {
                StorageError::ConfigError(format!(
                    "Failed to create staging directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(StagingStore {
            config,
            quota: DiskQuota::new(limits),
            reserve_lock: Mutex::new(()),
            reserved_bytes: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn category_dir(&self, category: StagingCategory) -> PathBuf {
        self.config.base_dir.join(category.dir_name())
    }

    /// Target path for a staged file. The filename is sanitized; no file is
    /// created.
    pub fn open_path(&self, category: StagingCategory, filename: &str) -> PathBuf {
        self.category_dir(category).join(sanitize_filename(filename))
    }

    /// Book capacity for an incoming file.
    ///
    /// Runs the whole check-then-reclaim sequence under one lock so two
    /// concurrent reservations cannot both pass against the same free bytes.
    pub async fn reserve(
        &self,
        category: StagingCategory,
        size_bytes: u64,
    ) -> StorageResult<Reservation> {
        let _guard = self.reserve_lock.lock().await;

        self.quota.check_file_size(size_bytes)?;

        if self.admission(size_bytes).await.is_err() {
            let report = self.cleanup_expired_inner().await?;
            if report.files_removed > 0 {
                tracing::debug!(
                    files_removed = report.files_removed,
                    bytes_freed = report.bytes_freed,
                    "Reclaimed expired staging files before reservation"
                );
            }
        }

        if self.admission(size_bytes).await.is_err() {
            self.evict_for(size_bytes).await?;
        }

        self.admission(size_bytes).await?;

        tracing::debug!(
            category = %category,
            size_bytes = size_bytes,
            "Staging reservation granted"
        );

        Ok(Reservation::new(self.reserved_bytes.clone(), size_bytes))
    }

    /// Stage an in-memory buffer, reserving capacity first.
    pub async fn store_bytes(
        &self,
        category: StagingCategory,
        filename: &str,
        data: &[u8],
    ) -> StorageResult<PathBuf> {
        let reservation = self.reserve(category, data.len() as u64).await?;
        let path = self.open_path(category, filename);

        let mut file = fs::File::create(&path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", path.display(), e))
        })?;

        file.write_all(data).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to write file {}: {}", path.display(), e))
        })?;

        file.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", path.display(), e))
        })?;

        reservation.commit();

        tracing::debug!(
            path = %path.display(),
            category = %category,
            size_bytes = data.len() as u64,
            "Staged file written"
        );

        Ok(path)
    }

    /// Copy an existing file into staging.
    pub async fn store_file(
        &self,
        category: StagingCategory,
        filename: &str,
        src: &Path,
    ) -> StorageResult<PathBuf> {
        let meta = fs::metadata(src).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to stat source file {}: {}",
                src.display(),
                e
            ))
        })?;

        let reservation = self.reserve(category, meta.len()).await?;
        let path = self.open_path(category, filename);

        fs::copy(src, &path).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to copy {} to {}: {}",
                src.display(),
                path.display(),
                e
            ))
        })?;

        reservation.commit();

        Ok(path)
    }

    /// Remove a staged file. Removing a missing file is not an error.
    pub async fn remove(&self, category: StagingCategory, filename: &str) -> StorageResult<()> {
        let path = self.open_path(category, filename);

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        fs::remove_file(&path).await.map_err(|e| {
            StorageError::DeleteFailed(format!("Failed to delete file {}: {}", path.display(), e))
        })?;

        Ok(())
    }

    /// Remove staged files older than their category TTL.
    pub async fn cleanup_expired(&self) -> StorageResult<CleanupReport> {
        let _guard = self.reserve_lock.lock().await;
        self.cleanup_expired_inner().await
    }

    /// Usage snapshot per category plus reservation and free-space counters.
    pub async fn stats(&self) -> StorageResult<StagingStats> {
        let mut per_category = [CategoryStats::default(); 4];

        for (i, category) in StagingCategory::ALL.iter().enumerate() {
            for file in self.scan_category(*category).await? {
                per_category[i].file_count += 1;
                per_category[i].total_bytes += file.size_bytes;
            }
        }

        let total_bytes = per_category.iter().map(|c| c.total_bytes).sum();

        let base = self.config.base_dir.clone();
        let available_bytes = tokio::task::spawn_blocking(move || available_space_for(&base))
            .await
            .unwrap_or(None);

        Ok(StagingStats {
            temp: per_category[0],
            downloads: per_category[1],
            thumbnails: per_category[2],
            archives: per_category[3],
            total_bytes,
            reserved_bytes: self.reserved_bytes.load(Ordering::SeqCst),
            available_bytes,
        })
    }

    /// Delete every staged file, keeping the category directories.
    pub async fn purge_all(&self) -> StorageResult<()> {
        let _guard = self.reserve_lock.lock().await;
        let mut removed = 0u64;

        for category in StagingCategory::ALL {
            for file in self.scan_category(category).await? {
                match fs::remove_file(&file.path).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(
                        error = %e,
                        path = %file.path.display(),
                        "Failed to purge staged file"
                    ),
                }
            }
        }

        tracing::info!(files_removed = removed, "Staging area purged");
        Ok(())
    }

    /// Aggregate and free-space admission against tracked usage plus
    /// outstanding reservations. Caller holds the reserve lock.
    async fn admission(&self, size_bytes: u64) -> StorageResult<()> {
        let used = self.scan_total_bytes().await?;
        let reserved = self.reserved_bytes.load(Ordering::SeqCst);
        self.quota.check_aggregate(used + reserved, size_bytes)?;
        self.quota
            .check_free_space_async(&self.config.base_dir, size_bytes)
            .await
    }

    async fn cleanup_expired_inner(&self) -> StorageResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let now = SystemTime::now();

        for category in StagingCategory::ALL {
            let ttl = self.config.ttl_for(category);

            for file in self.scan_category(category).await? {
                let age = now.duration_since(file.modified).unwrap_or_default();
                if age <= ttl {
                    continue;
                }

                match fs::remove_file(&file.path).await {
                    Ok(()) => {
                        report.files_removed += 1;
                        report.bytes_freed += file.size_bytes;
                        tracing::debug!(
                            path = %file.path.display(),
                            category = %category,
                            age_secs = age.as_secs(),
                            "Removed expired staged file"
                        );
                    }
                    Err(e) => tracing::warn!(
                        error = %e,
                        path = %file.path.display(),
                        "Failed to remove expired staged file"
                    ),
                }
            }
        }

        if report.files_removed > 0 {
            tracing::info!(
                files_removed = report.files_removed,
                bytes_freed = report.bytes_freed,
                "Staging cleanup finished"
            );
        }

        Ok(report)
    }

    /// Evict oldest files, category by category in priority order, until the
    /// incoming size can be admitted. Best effort; the caller re-checks.
    async fn evict_for(&self, size_bytes: u64) -> StorageResult<()> {
        for category in StagingCategory::ALL {
            let mut files = self.scan_category(category).await?;
            files.sort_by_key(|f| f.modified);

            for file in files {
                if self.admission(size_bytes).await.is_ok() {
                    return Ok(());
                }

                match fs::remove_file(&file.path).await {
                    Ok(()) => tracing::warn!(
                        path = %file.path.display(),
                        category = %category,
                        size_bytes = file.size_bytes,
                        "Evicted staged file to reclaim space"
                    ),
                    Err(e) => tracing::warn!(
                        error = %e,
                        path = %file.path.display(),
                        "Failed to evict staged file"
                    ),
                }
            }
        }

        Ok(())
    }

    async fn scan_category(&self, category: StagingCategory) -> StorageResult<Vec<StagedFile>> {
        let dir = self.category_dir(category);
        let mut out = Vec::new();

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::BackendError(e.to_string()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::BackendError(e.to_string()))?
        {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            out.push(StagedFile {
                path: entry.path(),
                size_bytes: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        Ok(out)
    }

    async fn scan_total_bytes(&self) -> StorageResult<u64> {
        let mut total = 0u64;
        for category in StagingCategory::ALL {
            for file in self.scan_category(category).await? {
                total += file.size_bytes;
            }
        }
        Ok(total)
    }
}
