//! Disk quota arithmetic shared by the local backend and the staging store.

use crate::traits::{StorageError, StorageResult};
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Limits applied to disk-backed stores.
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
    pub min_free_bytes: u64,
}

impl QuotaLimits {
    pub fn new(max_file_size_mb: u64, max_total_size_gb: u64, min_free_space_gb: u64) -> Self {
        Self {
            max_file_bytes: max_file_size_mb * 1024 * 1024,
            max_total_bytes: max_total_size_gb * 1024 * 1024 * 1024,
            min_free_bytes: min_free_space_gb * 1024 * 1024 * 1024,
        }
    }
}

/// Admission checks against [`QuotaLimits`].
///
/// The quota itself holds no usage state; callers pass their current usage so
/// the check-then-act sequence can run under the caller's own lock.
#[derive(Debug, Clone)]
pub struct DiskQuota {
    limits: QuotaLimits,
}

impl DiskQuota {
    pub fn new(limits: QuotaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Reject a single object larger than the per-file ceiling.
    pub fn check_file_size(&self, size_bytes: u64) -> StorageResult<()> {
        if size_bytes > self.limits.max_file_bytes {
            return Err(StorageError::FileTooLarge {
                size_bytes,
                limit_bytes: self.limits.max_file_bytes,
            });
        }
        Ok(())
    }

    /// Reject an incoming object that would push tracked usage past the
    /// aggregate ceiling.
    pub fn check_aggregate(&self, used_bytes: u64, incoming_bytes: u64) -> StorageResult<()> {
        if used_bytes + incoming_bytes > self.limits.max_total_bytes {
            return Err(StorageError::QuotaExceeded {
                required: incoming_bytes,
                available: self.limits.max_total_bytes.saturating_sub(used_bytes),
            });
        }
        Ok(())
    }

    /// Reject an incoming object that would eat into the filesystem free-space
    /// reserve. A path whose disk cannot be identified passes the check.
    pub fn check_free_space(&self, path: &Path, incoming_bytes: u64) -> StorageResult<()> {
        let Some(available) = available_space_for(path) else {
            tracing::debug!(
                path = %path.display(),
                "Could not determine disk free space, skipping free-space check"
            );
            return Ok(());
        };

        let required = incoming_bytes + self.limits.min_free_bytes;
        if available < required {
            return Err(StorageError::QuotaExceeded {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Free-space check off the runtime (disk probing is blocking).
    pub async fn check_free_space_async(
        &self,
        path: &Path,
        incoming_bytes: u64,
    ) -> StorageResult<()> {
        let quota = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || quota.check_free_space(&path, incoming_bytes))
            .await
            .map_err(|e| {
                StorageError::BackendError(format!("spawn_blocking for free-space check: {}", e))
            })?
    }
}

/// Available bytes on the filesystem holding `path`, when it can be resolved
/// to a mounted disk.
pub fn available_space_for(path: &Path) -> Option<u64> {
    let probe: PathBuf = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|disk| probe.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
