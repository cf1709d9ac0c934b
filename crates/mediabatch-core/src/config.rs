//! Configuration module
//!
//! This module provides configuration structures for the pipeline, including
//! storage provider credentials, staging quotas, concurrency limits, and
//! processing settings.

use std::env;
use std::path::PathBuf;

use crate::storage_types::StorageBackendKind;

/// Credentials and addressing for one S3-compatible provider.
#[derive(Clone, Debug, Default)]
pub struct S3ProviderConfig {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub public_base_url: Option<String>,
}

impl S3ProviderConfig {
    /// A provider is usable once bucket and both key halves are present.
    pub fn is_configured(&self) -> bool {
        self.bucket.is_some() && self.access_key_id.is_some() && self.secret_access_key.is_some()
    }

    fn from_env(prefix: &str) -> Self {
        let var = |suffix: &str| env::var(format!("{}_{}", prefix, suffix)).ok();
        Self {
            bucket: var("BUCKET"),
            region: var("REGION"),
            endpoint: var("ENDPOINT"),
            access_key_id: var("ACCESS_KEY_ID"),
            secret_access_key: var("SECRET_ACCESS_KEY"),
            public_base_url: var("PUBLIC_BASE_URL"),
        }
    }
}

/// Pipeline configuration
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub environment: String,
    // Storage configuration
    pub failover_order: Vec<StorageBackendKind>,
    pub wasabi: S3ProviderConfig,
    pub backblaze: S3ProviderConfig,
    pub digitalocean: S3ProviderConfig,
    pub local_storage_path: Option<String>,
    pub local_storage_base_url: Option<String>,
    pub max_file_size_mb: u64,
    // Staging configuration
    pub staging_dir: PathBuf,
    pub staging_ceiling_gb: u64,
    pub min_free_space_gb: u64,
    pub temp_ttl_secs: u64,
    pub downloads_ttl_secs: u64,
    pub thumbnails_ttl_secs: u64,
    pub archives_ttl_secs: u64,
    // Pipeline concurrency and retry configuration
    pub retrieval_concurrency: usize,
    pub processing_concurrency: usize,
    pub upload_concurrency: usize,
    pub max_retries: u32,
    pub stage_timeout_secs: u64,
    // Archive configuration
    pub max_archive_size_mb: u64,
    pub archive_compression_level: u32,
    // Thumbnail configuration
    pub ffmpeg_path: String,
    pub thumbnail_sizes: Vec<String>,
    pub thumbnail_jpeg_quality: u8,
    pub watermark_path: Option<PathBuf>,
    // Capacity check configuration
    pub min_disk_free_gb: u64,
    pub max_memory_usage_percent: f64,
    pub max_cpu_usage_percent: f64,
    pub disk_check_behavior: String,
    pub memory_check_behavior: String,
    pub cpu_check_behavior: String,
    // Progress notification configuration
    pub progress_debounce_ms: u64,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<PipelineConfig>);

impl Config {
    fn inner(&self) -> &PipelineConfig {
        &self.0
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.inner().environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = PipelineConfig::from_env()?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.inner().validate()
    }

    // Convenience getters for common fields
    pub fn environment(&self) -> &str {
        &self.inner().environment
    }

    pub fn failover_order(&self) -> &[StorageBackendKind] {
        &self.inner().failover_order
    }

    pub fn wasabi(&self) -> &S3ProviderConfig {
        &self.inner().wasabi
    }

    pub fn backblaze(&self) -> &S3ProviderConfig {
        &self.inner().backblaze
    }

    pub fn digitalocean(&self) -> &S3ProviderConfig {
        &self.inner().digitalocean
    }

    pub fn local_storage_path(&self) -> Option<&str> {
        self.inner().local_storage_path.as_deref()
    }

    pub fn local_storage_base_url(&self) -> Option<&str> {
        self.inner().local_storage_base_url.as_deref()
    }

    pub fn max_file_size_mb(&self) -> u64 {
        self.inner().max_file_size_mb
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.inner().max_file_size_mb * 1024 * 1024
    }

    pub fn staging_dir(&self) -> &PathBuf {
        &self.inner().staging_dir
    }

    pub fn staging_ceiling_gb(&self) -> u64 {
        self.inner().staging_ceiling_gb
    }

    pub fn min_free_space_gb(&self) -> u64 {
        self.inner().min_free_space_gb
    }

    pub fn temp_ttl_secs(&self) -> u64 {
        self.inner().temp_ttl_secs
    }

    pub fn downloads_ttl_secs(&self) -> u64 {
        self.inner().downloads_ttl_secs
    }

    pub fn thumbnails_ttl_secs(&self) -> u64 {
        self.inner().thumbnails_ttl_secs
    }

    pub fn archives_ttl_secs(&self) -> u64 {
        self.inner().archives_ttl_secs
    }

    pub fn retrieval_concurrency(&self) -> usize {
        self.inner().retrieval_concurrency
    }

    pub fn processing_concurrency(&self) -> usize {
        self.inner().processing_concurrency
    }

    pub fn upload_concurrency(&self) -> usize {
        self.inner().upload_concurrency
    }

    pub fn max_retries(&self) -> u32 {
        self.inner().max_retries
    }

    pub fn stage_timeout_secs(&self) -> u64 {
        self.inner().stage_timeout_secs
    }

    pub fn max_archive_size_mb(&self) -> u64 {
        self.inner().max_archive_size_mb
    }

    pub fn archive_compression_level(&self) -> u32 {
        self.inner().archive_compression_level
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.inner().ffmpeg_path
    }

    pub fn thumbnail_sizes(&self) -> &[String] {
        &self.inner().thumbnail_sizes
    }

    pub fn thumbnail_jpeg_quality(&self) -> u8 {
        self.inner().thumbnail_jpeg_quality
    }

    pub fn watermark_path(&self) -> Option<&PathBuf> {
        self.inner().watermark_path.as_ref()
    }

    pub fn min_disk_free_gb(&self) -> u64 {
        self.inner().min_disk_free_gb
    }

    pub fn max_memory_usage_percent(&self) -> f64 {
        self.inner().max_memory_usage_percent
    }

    pub fn max_cpu_usage_percent(&self) -> f64 {
        self.inner().max_cpu_usage_percent
    }

    pub fn disk_check_behavior(&self) -> String {
        self.inner().disk_check_behavior.clone()
    }

    pub fn memory_check_behavior(&self) -> String {
        self.inner().memory_check_behavior.clone()
    }

    pub fn cpu_check_behavior(&self) -> String {
        self.inner().cpu_check_behavior.clone()
    }

    pub fn progress_debounce_ms(&self) -> u64 {
        self.inner().progress_debounce_ms
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        const MAX_FILE_SIZE_MB: u64 = 500;
        const STAGING_CEILING_GB: u64 = 50;
        const MIN_FREE_SPACE_GB: u64 = 1;
        const TEMP_TTL_SECS: u64 = 3600;
        const DOWNLOADS_TTL_SECS: u64 = 12 * 3600;
        const THUMBNAILS_TTL_SECS: u64 = 12 * 3600;
        const ARCHIVES_TTL_SECS: u64 = 6 * 3600;
        const RETRIEVAL_CONCURRENCY: usize = 3;
        const PROCESSING_CONCURRENCY: usize = 2;
        const UPLOAD_CONCURRENCY: usize = 3;
        const MAX_RETRIES: u32 = 3;
        const STAGE_TIMEOUT_SECS: u64 = 3600;
        const MAX_ARCHIVE_SIZE_MB: u64 = 2048;
        const ARCHIVE_COMPRESSION_LEVEL: u32 = 6;
        const THUMBNAIL_JPEG_QUALITY: u8 = 85;
        const MIN_DISK_FREE_GB: u64 = 10;
        const MAX_MEMORY_USAGE_PERCENT: f64 = 85.0;
        const MAX_CPU_USAGE_PERCENT: f64 = 90.0;
        const PROGRESS_DEBOUNCE_MS: u64 = 500;

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let parse_u64 = |name: &str, default: u64| {
            env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(default)
        };
        let parse_usize = |name: &str, default: usize| {
            env::var(name)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(default)
        };
        let parse_f64 = |name: &str, default: f64| {
            env::var(name)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(default)
        };

        let failover_order = env::var("STORAGE_FAILOVER_ORDER")
            .unwrap_or_else(|_| "wasabi,backblaze,digitalocean,local".to_string())
            .split(',')
            .map(|s| s.trim().parse::<StorageBackendKind>())
            .collect::<Result<Vec<_>, _>>()?;

        let thumbnail_sizes = env::var("THUMBNAIL_SIZES")
            .unwrap_or_else(|_| "medium".to_string())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .collect();

        Ok(PipelineConfig {
            environment,
            failover_order,
            wasabi: S3ProviderConfig::from_env("WASABI"),
            backblaze: S3ProviderConfig::from_env("BACKBLAZE"),
            digitalocean: S3ProviderConfig::from_env("DO_SPACES"),
            local_storage_path: env::var("LOCAL_STORAGE_PATH").ok(),
            local_storage_base_url: env::var("LOCAL_STORAGE_BASE_URL").ok(),
            max_file_size_mb: parse_u64("MAX_FILE_SIZE_MB", MAX_FILE_SIZE_MB),
            staging_dir: env::var("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("mediabatch-staging")),
            staging_ceiling_gb: parse_u64("STAGING_CEILING_GB", STAGING_CEILING_GB),
            min_free_space_gb: parse_u64("MIN_FREE_SPACE_GB", MIN_FREE_SPACE_GB),
            temp_ttl_secs: parse_u64("STAGING_TEMP_TTL_SECS", TEMP_TTL_SECS),
            downloads_ttl_secs: parse_u64("STAGING_DOWNLOADS_TTL_SECS", DOWNLOADS_TTL_SECS),
            thumbnails_ttl_secs: parse_u64("STAGING_THUMBNAILS_TTL_SECS", THUMBNAILS_TTL_SECS),
            archives_ttl_secs: parse_u64("STAGING_ARCHIVES_TTL_SECS", ARCHIVES_TTL_SECS),
            retrieval_concurrency: parse_usize("RETRIEVAL_CONCURRENCY", RETRIEVAL_CONCURRENCY),
            processing_concurrency: parse_usize("PROCESSING_CONCURRENCY", PROCESSING_CONCURRENCY),
            upload_concurrency: parse_usize("UPLOAD_CONCURRENCY", UPLOAD_CONCURRENCY),
            max_retries: env::var("MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(MAX_RETRIES),
            stage_timeout_secs: parse_u64("STAGE_TIMEOUT_SECS", STAGE_TIMEOUT_SECS),
            max_archive_size_mb: parse_u64("MAX_ARCHIVE_SIZE_MB", MAX_ARCHIVE_SIZE_MB),
            archive_compression_level: env::var("ARCHIVE_COMPRESSION_LEVEL")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(ARCHIVE_COMPRESSION_LEVEL),
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            thumbnail_sizes,
            thumbnail_jpeg_quality: env::var("THUMBNAIL_JPEG_QUALITY")
                .ok()
                .and_then(|s| s.parse::<u8>().ok())
                .unwrap_or(THUMBNAIL_JPEG_QUALITY),
            watermark_path: env::var("WATERMARK_PATH").ok().map(PathBuf::from),
            min_disk_free_gb: parse_u64("MIN_DISK_FREE_GB", MIN_DISK_FREE_GB),
            max_memory_usage_percent: parse_f64(
                "MAX_MEMORY_USAGE_PERCENT",
                MAX_MEMORY_USAGE_PERCENT,
            ),
            max_cpu_usage_percent: parse_f64("MAX_CPU_USAGE_PERCENT", MAX_CPU_USAGE_PERCENT),
            disk_check_behavior: env::var("DISK_CHECK_BEHAVIOR")
                .unwrap_or_else(|_| "fail".to_string())
                .to_lowercase(),
            memory_check_behavior: env::var("MEMORY_CHECK_BEHAVIOR")
                .unwrap_or_else(|_| "warn".to_string())
                .to_lowercase(),
            cpu_check_behavior: env::var("CPU_CHECK_BEHAVIOR")
                .unwrap_or_else(|_| "warn".to_string())
                .to_lowercase(),
            progress_debounce_ms: parse_u64("PROGRESS_DEBOUNCE_MS", PROGRESS_DEBOUNCE_MS),
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.failover_order.is_empty() {
            return Err(anyhow::anyhow!(
                "STORAGE_FAILOVER_ORDER must name at least one backend"
            ));
        }
        if self.retrieval_concurrency == 0 || self.processing_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "Concurrency limits must be greater than zero"
            ));
        }
        if self.upload_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "UPLOAD_CONCURRENCY must be greater than zero"
            ));
        }
        if self.archive_compression_level > 9 {
            return Err(anyhow::anyhow!(
                "ARCHIVE_COMPRESSION_LEVEL must be between 0 and 9"
            ));
        }
        if !(0.0..=100.0).contains(&self.max_memory_usage_percent)
            || !(0.0..=100.0).contains(&self.max_cpu_usage_percent)
        {
            return Err(anyhow::anyhow!(
                "Usage thresholds must be percentages between 0 and 100"
            ));
        }
        for behavior in [
            &self.disk_check_behavior,
            &self.memory_check_behavior,
            &self.cpu_check_behavior,
        ] {
            if behavior != "fail" && behavior != "warn" {
                return Err(anyhow::anyhow!(
                    "Capacity check behavior must be 'fail' or 'warn', got '{}'",
                    behavior
                ));
            }
        }
        Ok(())
    }
}
