use crate::keys;
use crate::traits::{Storage, StorageError, StorageResult, StorageStats, StoredObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use http::Method;
use mediabatch_core::{S3ProviderConfig, StorageBackendKind};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::Error as ObjectStoreError;
use object_store::{ObjectMeta, ObjectStore, ObjectStoreExt, PutPayload, Result as ObjectResult};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// S3-compatible object storage providers supported by the failover chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Provider {
    Wasabi,
    Backblaze,
    DigitalOcean,
}

impl S3Provider {
    /// Endpoint used when the provider config does not override it.
    pub fn default_endpoint(&self, region: &str) -> String {
        match self {
            S3Provider::Wasabi => format!("https://s3.{}.wasabisys.com", region),
            S3Provider::Backblaze => format!("https://s3.{}.backblazeb2.com", region),
            S3Provider::DigitalOcean => format!("https://{}.digitaloceanspaces.com", region),
        }
    }

    pub fn backend_kind(&self) -> StorageBackendKind {
        match self {
            S3Provider::Wasabi => StorageBackendKind::Wasabi,
            S3Provider::Backblaze => StorageBackendKind::Backblaze,
            S3Provider::DigitalOcean => StorageBackendKind::DigitalOcean,
        }
    }
}

impl fmt::Display for S3Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            S3Provider::Wasabi => write!(f, "wasabi"),
            S3Provider::Backblaze => write!(f, "backblaze"),
            S3Provider::DigitalOcean => write!(f, "digitalocean"),
        }
    }
}

/// Resolved settings for one S3-compatible provider.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub provider: S3Provider,
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub public_base_url: Option<String>,
}

impl S3Config {
    /// Build from the environment-driven provider block, requiring bucket and
    /// both key halves. Region falls back to `us-east-1`.
    pub fn from_provider_config(
        provider: S3Provider,
        config: &S3ProviderConfig,
    ) -> StorageResult<Self> {
        let require = |field: &Option<String>, name: &str| {
            field.clone().ok_or_else(|| {
                StorageError::ConfigError(format!("{} is not configured for {}", name, provider))
            })
        };

        Ok(S3Config {
            provider,
            bucket: require(&config.bucket, "bucket")?,
            region: config
                .region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: config.endpoint.clone(),
            access_key_id: require(&config.access_key_id, "access_key_id")?,
            secret_access_key: require(&config.secret_access_key, "secret_access_key")?,
            public_base_url: config.public_base_url.clone(),
        })
    }

    fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| self.provider.default_endpoint(&self.region))
    }
}

/// S3-compatible storage implementation
///
/// One instance wraps one provider/bucket pair. The `object_store` client is
/// built lazily on first use and cached; an auth-classified failure rebuilds
/// the client and retries the in-flight operation exactly once, so expired
/// credentials recover without tearing down the failover chain.
pub struct S3Storage {
    config: S3Config,
    max_object_bytes: u64,
    client: RwLock<Option<Arc<AmazonS3>>>,
}

impl S3Storage {
    pub fn new(config: S3Config, max_file_size_mb: u64) -> Self {
        S3Storage {
            config,
            max_object_bytes: max_file_size_mb * 1024 * 1024,
            client: RwLock::new(None),
        }
    }

    fn build_client(&self) -> StorageResult<AmazonS3> {
        let endpoint = self.config.endpoint_url();
        let allow_http = endpoint.starts_with("http://");

        // Path-style addressing for compatibility across providers.
        AmazonS3Builder::new()
            .with_bucket_name(self.config.bucket.clone())
            .with_region(self.config.region.clone())
            .with_endpoint(endpoint)
            .with_allow_http(allow_http)
            .with_access_key_id(self.config.access_key_id.clone())
            .with_secret_access_key(self.config.secret_access_key.clone())
            .with_virtual_hosted_style_request(false)
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))
    }

    async fn client(&self) -> StorageResult<Arc<AmazonS3>> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(client.clone());
        }

        let mut guard = self.client.write().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let built = Arc::new(self.build_client()?);
        *guard = Some(built.clone());

        tracing::debug!(
            provider = %self.config.provider,
            bucket = %self.config.bucket,
            "S3 client initialized"
        );

        Ok(built)
    }

    async fn rebuild_client(&self) -> StorageResult<Arc<AmazonS3>> {
        let mut guard = self.client.write().await;
        let built = Arc::new(self.build_client()?);
        *guard = Some(built.clone());

        tracing::warn!(
            provider = %self.config.provider,
            bucket = %self.config.bucket,
            "S3 client rebuilt after auth failure"
        );

        Ok(built)
    }

    /// Credential problems are worth one client rebuild before giving up.
    fn is_auth_error(err: &ObjectStoreError) -> bool {
        match err {
            ObjectStoreError::Unauthenticated { .. } | ObjectStoreError::PermissionDenied { .. } => {
                true
            }
            other => {
                let text = other.to_string();
                text.contains("ExpiredToken")
                    || text.contains("InvalidAccessKeyId")
                    || text.contains("SignatureDoesNotMatch")
            }
        }
    }

    /// Public URL for an object, preferring the provider CDN base when set.
    fn object_url(&self, key: &str) -> String {
        if let Some(ref base) = self.config.public_base_url {
            format!("{}/{}", base.trim_end_matches('/'), key)
        } else {
            format!(
                "{}/{}/{}",
                self.config.endpoint_url().trim_end_matches('/'),
                self.config.bucket,
                key
            )
        }
    }

    fn info_from_meta(&self, meta: &ObjectMeta) -> StoredObjectInfo {
        let key = meta.location.to_string();
        StoredObjectInfo {
            content_type: Some(keys::content_type_for(Path::new(&key)).to_string()),
            etag: meta.e_tag.clone(),
            last_modified: Some(meta.last_modified),
            public_url: Some(self.object_url(&key)),
            size_bytes: meta.size,
            key,
            backend: self.backend_kind(),
        }
    }

    async fn get_with_retry(&self, location: &ObjectPath) -> StorageResult<object_store::GetResult> {
        let client = self.client().await?;
        let result: ObjectResult<_> = match client.get(location).await {
            Err(e) if Self::is_auth_error(&e) => {
                let client = self.rebuild_client().await?;
                client.get(location).await
            }
            other => other,
        };

        result.map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(location.to_string()),
            other => StorageError::DownloadFailed(other.to_string()),
        })
    }

    async fn head_with_retry(&self, location: &ObjectPath) -> Result<ObjectMeta, ObjectStoreError> {
        let client = self.client().await.map_err(|e| ObjectStoreError::Generic {
            store: "S3",
            source: Box::new(e),
        })?;

        match client.head(location).await {
            Err(e) if Self::is_auth_error(&e) => match self.rebuild_client().await {
                Ok(client) => client.head(location).await,
                Err(rebuild_err) => Err(ObjectStoreError::Generic {
                    store: "S3",
                    source: Box::new(rebuild_err),
                }),
            },
            other => other,
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn connect(&self) -> StorageResult<()> {
        self.client().await.map(|_| ())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        *self.client.write().await = None;

        tracing::debug!(
            provider = %self.config.provider,
            bucket = %self.config.bucket,
            "S3 client released"
        );

        Ok(())
    }

    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<StoredObjectInfo> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to stat source file {}: {}",
                path.display(),
                e
            ))
        })?;

        let size = meta.len();
        if size > self.max_object_bytes {
            return Err(StorageError::FileTooLarge {
                size_bytes: size,
                limit_bytes: self.max_object_bytes,
            });
        }

        // Read fully and upload in a single put. This is bounded by the
        // per-object size limit checked above, which keeps memory predictable
        // while still benefiting from object_store's S3 integration.
        let data = tokio::fs::read(path).await.map_err(|e| {
            StorageError::UploadFailed(format!(
                "Failed to read source file {}: {}",
                path.display(),
                e
            ))
        })?;

        let content_type = keys::content_type_for(path);
        self.upload_bytes(Bytes::from(data), key, content_type)
            .await
    }

    async fn upload_bytes(
        &self,
        data: Bytes,
        key: &str,
        content_type: &str,
    ) -> StorageResult<StoredObjectInfo> {
        let size = data.len() as u64;
        if size > self.max_object_bytes {
            return Err(StorageError::FileTooLarge {
                size_bytes: size,
                limit_bytes: self.max_object_bytes,
            });
        }

        let location = ObjectPath::from(key.to_string());
        let start = std::time::Instant::now();

        let client = self.client().await?;
        let result: ObjectResult<_> = match client
            .put(&location, PutPayload::from(data.clone()))
            .await
        {
            Err(e) if Self::is_auth_error(&e) => {
                let client = self.rebuild_client().await?;
                client.put(&location, PutPayload::from(data)).await
            }
            other => other,
        };

        let put_result = result.map_err(|e| {
            tracing::error!(
                error = %e,
                provider = %self.config.provider,
                bucket = %self.config.bucket,
                key = %key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 upload failed"
            );
            StorageError::UploadFailed(e.to_string())
        })?;

        tracing::info!(
            provider = %self.config.provider,
            bucket = %self.config.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(StoredObjectInfo {
            key: key.to_string(),
            size_bytes: size,
            content_type: Some(content_type.to_string()),
            etag: put_result.e_tag,
            last_modified: Some(Utc::now()),
            public_url: Some(self.object_url(key)),
            backend: self.backend_kind(),
        })
    }

    async fn download_file(&self, key: &str, dest: &Path) -> StorageResult<u64> {
        let location = ObjectPath::from(key.to_string());
        let start = std::time::Instant::now();

        let result = self.get_with_retry(&location).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            StorageError::DownloadFailed(format!(
                "Failed to create file {}: {}",
                dest.display(),
                e
            ))
        })?;

        let mut stream = result.into_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::DownloadFailed(e.to_string()))?;
            file.write_all(&chunk).await.map_err(|e| {
                StorageError::DownloadFailed(format!(
                    "Failed to write file {}: {}",
                    dest.display(),
                    e
                ))
            })?;
            written += chunk.len() as u64;
        }

        file.sync_all().await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to sync file {}: {}", dest.display(), e))
        })?;

        tracing::info!(
            provider = %self.config.provider,
            bucket = %self.config.bucket,
            key = %key,
            dest = %dest.display(),
            size_bytes = written,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 download to file successful"
        );

        Ok(written)
    }

    async fn download_bytes(&self, key: &str) -> StorageResult<Bytes> {
        let location = ObjectPath::from(key.to_string());
        let start = std::time::Instant::now();

        let result = self.get_with_retry(&location).await?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;

        tracing::info!(
            provider = %self.config.provider,
            bucket = %self.config.bucket,
            key = %key,
            size_bytes = bytes.len() as u64,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 download successful"
        );

        Ok(bytes)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let location = ObjectPath::from(key.to_string());
        let start = std::time::Instant::now();

        let client = self.client().await?;
        let result: ObjectResult<_> = match client.delete(&location).await {
            Err(e) if Self::is_auth_error(&e) => {
                let client = self.rebuild_client().await?;
                client.delete(&location).await
            }
            other => other,
        };

        match result {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {
                tracing::info!(
                    provider = %self.config.provider,
                    bucket = %self.config.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete successful"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    provider = %self.config.provider,
                    bucket = %self.config.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                Err(StorageError::DeleteFailed(e.to_string()))
            }
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let location = ObjectPath::from(key.to_string());
        match self.head_with_retry(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn get_info(&self, key: &str) -> StorageResult<StoredObjectInfo> {
        let location = ObjectPath::from(key.to_string());
        match self.head_with_retry(&location).await {
            Ok(meta) => Ok(self.info_from_meta(&meta)),
            Err(ObjectStoreError::NotFound { .. }) => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<StoredObjectInfo>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let prefix_path = prefix.map(|p| ObjectPath::from(p.to_string()));
        let mut out = Vec::new();

        // Listing is a stream, so the single auth retry restarts it from the top.
        for attempt in 0..2 {
            out.clear();
            let client = self.client().await?;
            let mut stream = client.list(prefix_path.as_ref());
            let mut retry = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(meta) => {
                        out.push(self.info_from_meta(&meta));
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                    Err(e) if Self::is_auth_error(&e) && attempt == 0 => {
                        self.rebuild_client().await?;
                        retry = true;
                        break;
                    }
                    Err(e) => return Err(StorageError::BackendError(e.to_string())),
                }
            }

            if !retry {
                return Ok(out);
            }
        }

        Err(StorageError::AuthFailed(format!(
            "list against {} failed after client rebuild",
            self.config.provider
        )))
    }

    async fn presigned_url(
        &self,
        key: &str,
        expires_in: Duration,
        method: Method,
    ) -> StorageResult<String> {
        let location = ObjectPath::from(key.to_string());

        let client = self.client().await?;
        let url_result: ObjectResult<_> = match client
            .signed_url(method.clone(), &location, expires_in)
            .await
        {
            Err(e) if Self::is_auth_error(&e) => {
                let client = self.rebuild_client().await?;
                client.signed_url(method, &location, expires_in).await
            }
            other => other,
        };

        let url = url_result
            .map_err(|e| StorageError::BackendError(e.to_string()))?
            .to_string();

        Ok(url)
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let client = self.client().await?;

        let mut object_count: u64 = 0;
        let mut total_bytes: u64 = 0;
        let mut stream = client.list(None);

        while let Some(item) = stream.next().await {
            let meta = item.map_err(|e| StorageError::BackendError(e.to_string()))?;
            object_count += 1;
            total_bytes += meta.size;
        }

        Ok(StorageStats {
            backend: self.backend_kind(),
            object_count: Some(object_count),
            total_bytes: Some(total_bytes),
            available_bytes: None,
            connected: true,
        })
    }

    fn backend_kind(&self) -> StorageBackendKind {
        self.config.provider.backend_kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_config(bucket: Option<&str>) -> S3ProviderConfig {
        S3ProviderConfig {
            bucket: bucket.map(String::from),
            region: Some("eu-central-1".to_string()),
            endpoint: None,
            access_key_id: Some("key".to_string()),
            secret_access_key: Some("secret".to_string()),
            public_base_url: None,
        }
    }

    #[test]
    fn test_default_endpoints() {
        assert_eq!(
            S3Provider::Wasabi.default_endpoint("us-east-1"),
            "https://s3.us-east-1.wasabisys.com"
        );
        assert_eq!(
            S3Provider::Backblaze.default_endpoint("eu-central-003"),
            "https://s3.eu-central-003.backblazeb2.com"
        );
        assert_eq!(
            S3Provider::DigitalOcean.default_endpoint("nyc3"),
            "https://nyc3.digitaloceanspaces.com"
        );
    }

    #[test]
    fn test_config_requires_bucket_and_keys() {
        let config = S3Config::from_provider_config(S3Provider::Wasabi, &provider_config(None));
        assert!(matches!(config, Err(StorageError::ConfigError(_))));

        let config =
            S3Config::from_provider_config(S3Provider::Wasabi, &provider_config(Some("media")));
        assert!(config.is_ok());
    }

    #[test]
    fn test_object_url_prefers_public_base() {
        let mut config =
            S3Config::from_provider_config(S3Provider::DigitalOcean, &provider_config(Some("m")))
                .unwrap();
        config.region = "nyc3".to_string();

        let storage = S3Storage::new(config.clone(), 500);
        assert_eq!(
            storage.object_url("free/2026/01/a.mp4"),
            "https://nyc3.digitaloceanspaces.com/m/free/2026/01/a.mp4"
        );

        config.public_base_url = Some("https://cdn.example.com/".to_string());
        let storage = S3Storage::new(config, 500);
        assert_eq!(
            storage.object_url("free/2026/01/a.mp4"),
            "https://cdn.example.com/free/2026/01/a.mp4"
        );
    }

    #[tokio::test]
    async fn test_upload_rejects_oversized_payload() {
        let config =
            S3Config::from_provider_config(S3Provider::Wasabi, &provider_config(Some("media")))
                .unwrap();
        let storage = S3Storage::new(config, 1);

        let data = Bytes::from(vec![0u8; 2 * 1024 * 1024]);
        let err = storage
            .upload_bytes(data, "free/2026/01/too-big.mp4", "video/mp4")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::FileTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let config =
            S3Config::from_provider_config(S3Provider::Backblaze, &provider_config(Some("media")))
                .unwrap();
        let storage = S3Storage::new(config, 500);

        assert!(storage.disconnect().await.is_ok());
        assert!(storage.disconnect().await.is_ok());
    }
}
