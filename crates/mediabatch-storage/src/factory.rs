use crate::local::LocalDiskStorage;
use crate::quota::{DiskQuota, QuotaLimits};
use crate::s3::{S3Config, S3Provider, S3Storage};
use crate::traits::{Storage, StorageError, StorageResult};
use mediabatch_core::{Config, StorageBackendKind};
use std::sync::Arc;

/// Create a storage backend of the given kind from configuration.
pub async fn create_storage(
    kind: StorageBackendKind,
    config: &Config,
) -> StorageResult<Arc<dyn Storage>> {
    match kind {
        StorageBackendKind::Wasabi => {
            let s3_config = S3Config::from_provider_config(S3Provider::Wasabi, config.wasabi())?;
            Ok(Arc::new(S3Storage::new(
                s3_config,
                config.max_file_size_mb(),
            )))
        }

        StorageBackendKind::Backblaze => {
            let s3_config =
                S3Config::from_provider_config(S3Provider::Backblaze, config.backblaze())?;
            Ok(Arc::new(S3Storage::new(
                s3_config,
                config.max_file_size_mb(),
            )))
        }

        StorageBackendKind::DigitalOcean => {
            let s3_config =
                S3Config::from_provider_config(S3Provider::DigitalOcean, config.digitalocean())?;
            Ok(Arc::new(S3Storage::new(
                s3_config,
                config.max_file_size_mb(),
            )))
        }

        StorageBackendKind::Local => {
            let base_path = config.local_storage_path().map(String::from).ok_or_else(|| {
                StorageError::ConfigError("LOCAL_STORAGE_PATH not configured".to_string())
            })?;
            let base_url = config
                .local_storage_base_url()
                .map(String::from)
                .ok_or_else(|| {
                    StorageError::ConfigError("LOCAL_STORAGE_BASE_URL not configured".to_string())
                })?;

            // The terminal backend carries no aggregate ceiling, only the
            // per-file limit and the filesystem free-space reserve.
            let quota = DiskQuota::new(QuotaLimits {
                max_file_bytes: config.max_file_size_bytes(),
                max_total_bytes: u64::MAX,
                min_free_bytes: config.min_free_space_gb() * 1024 * 1024 * 1024,
            });

            let storage = LocalDiskStorage::new(base_path, base_url, quota).await?;
            Ok(Arc::new(storage))
        }
    }
}

/// Whether the configuration carries enough to even try this backend.
pub fn is_configured(kind: StorageBackendKind, config: &Config) -> bool {
    match kind {
        StorageBackendKind::Wasabi => config.wasabi().is_configured(),
        StorageBackendKind::Backblaze => config.backblaze().is_configured(),
        StorageBackendKind::DigitalOcean => config.digitalocean().is_configured(),
        StorageBackendKind::Local => {
            config.local_storage_path().is_some() && config.local_storage_base_url().is_some()
        }
    }
}

/// Build the upload failover chain in configured order, skipping backends
/// without credentials. An empty chain is a configuration error.
pub async fn create_failover_chain(config: &Config) -> StorageResult<Vec<Arc<dyn Storage>>> {
    let mut chain: Vec<Arc<dyn Storage>> = Vec::new();

    for kind in config.failover_order() {
        if !is_configured(*kind, config) {
            tracing::warn!(
                backend = %kind,
                "Skipping unconfigured storage backend in failover order"
            );
            continue;
        }

        match create_storage(*kind, config).await {
            Ok(storage) => chain.push(storage),
            Err(e) => tracing::warn!(
                backend = %kind,
                error = %e,
                "Failed to initialize storage backend, skipping"
            ),
        }
    }

    if chain.is_empty() {
        return Err(StorageError::ConfigError(
            "No storage backends available; configure at least one provider or local storage"
                .to_string(),
        ));
    }

    let order: Vec<StorageBackendKind> = chain.iter().map(|s| s.backend_kind()).collect();
    tracing::info!(backends = ?order, "Storage failover chain ready");

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // Environment mutation happens in this one test only, so parallel test
    // threads in this binary never race on the same variables.
    #[tokio::test]
    async fn test_failover_chain_from_env() {
        for var in [
            "WASABI_BUCKET",
            "WASABI_ACCESS_KEY_ID",
            "WASABI_SECRET_ACCESS_KEY",
            "BACKBLAZE_BUCKET",
            "BACKBLAZE_ACCESS_KEY_ID",
            "BACKBLAZE_SECRET_ACCESS_KEY",
            "DO_SPACES_BUCKET",
            "DO_SPACES_ACCESS_KEY_ID",
            "DO_SPACES_SECRET_ACCESS_KEY",
            "LOCAL_STORAGE_PATH",
            "LOCAL_STORAGE_BASE_URL",
        ] {
            std::env::remove_var(var);
        }

        let config = Config::from_env().unwrap();
        // `.err()` instead of `.unwrap_err()`: the Ok side holds trait
        // objects without a Debug impl.
        let err = create_failover_chain(&config)
            .await
            .err()
            .expect("empty chain must be refused");
        assert!(matches!(err, StorageError::ConfigError(_)));

        let dir = tempdir().unwrap();
        std::env::set_var("LOCAL_STORAGE_PATH", dir.path());
        std::env::set_var("LOCAL_STORAGE_BASE_URL", "http://localhost:8080/media");

        let config = Config::from_env().unwrap();
        let chain = create_failover_chain(&config).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].backend_kind(), StorageBackendKind::Local);

        std::env::set_var("WASABI_BUCKET", "media");
        std::env::set_var("WASABI_ACCESS_KEY_ID", "key");
        std::env::set_var("WASABI_SECRET_ACCESS_KEY", "secret");

        let config = Config::from_env().unwrap();
        let chain = create_failover_chain(&config).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].backend_kind(), StorageBackendKind::Wasabi);
        assert_eq!(chain[1].backend_kind(), StorageBackendKind::Local);

        for var in [
            "WASABI_BUCKET",
            "WASABI_ACCESS_KEY_ID",
            "WASABI_SECRET_ACCESS_KEY",
            "LOCAL_STORAGE_PATH",
            "LOCAL_STORAGE_BASE_URL",
        ] {
            std::env::remove_var(var);
        }
    }
}
