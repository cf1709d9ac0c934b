//! Shared defaults used across the pipeline crates.

/// Default number of concurrent retrieval workers per job.
pub const DEFAULT_RETRIEVAL_CONCURRENCY: usize = 3;

/// Default number of concurrent processing workers per job.
pub const DEFAULT_PROCESSING_CONCURRENCY: usize = 2;

/// Default number of concurrent file uploads per task.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 3;

/// Default maximum retry attempts for retryable stage errors.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Ceiling for exponential retry backoff, in seconds.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Default per-object size limit accepted by storage backends, in MB.
pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 500;

/// Default aggregate ceiling for the staging area, in GB.
pub const DEFAULT_STAGING_CEILING_GB: u64 = 50;

/// Free disk space the staging area always leaves untouched, in GB.
pub const DEFAULT_MIN_FREE_SPACE_GB: u64 = 1;

/// Default ceiling for a batch archive, in MB. Larger batches fall back to
/// per-file delivery.
pub const DEFAULT_MAX_ARCHIVE_SIZE_MB: u64 = 2048;

/// Deflate level used for batch archives.
pub const DEFAULT_ARCHIVE_COMPRESSION_LEVEL: u32 = 6;

/// Minimum interval between progress notifications to one subscriber, in
/// milliseconds.
pub const DEFAULT_PROGRESS_DEBOUNCE_MS: u64 = 500;
