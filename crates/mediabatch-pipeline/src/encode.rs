//! External encoder invocation.
//!
//! Parameter synthesis lives in the processing crate; this module only runs
//! the resulting argument list. Behind a trait so tests substitute a no-op
//! encoder.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mediabatch_processing::EncodeSpec;
use std::path::Path;
use tokio::process::Command;

#[async_trait]
pub trait MediaEncoder: Send + Sync {
    async fn encode(&self, spec: &EncodeSpec, input: &Path, output: &Path) -> Result<()>;
}

/// Drives an ffmpeg subprocess with the synthesized arguments.
pub struct FfmpegEncoder {
    ffmpeg_path: String,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: String) -> Result<Self> {
        if !ffmpeg_path.chars().all(|c| {
            c.is_alphanumeric() || c == '/' || c == '-' || c == '_' || c == '.' || c == '\\'
        }) {
            return Err(anyhow!("Invalid ffmpeg_path: contains unsafe characters"));
        }

        Ok(Self { ffmpeg_path })
    }
}

#[async_trait]
impl MediaEncoder for FfmpegEncoder {
    #[tracing::instrument(skip(self, spec), fields(profile = spec.profile_name))]
    async fn encode(&self, spec: &EncodeSpec, input: &Path, output: &Path) -> Result<()> {
        let start = std::time::Instant::now();

        let result = Command::new(&self.ffmpeg_path)
            .args(spec.to_ffmpeg_args(input, output))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .context("Failed to execute ffmpeg")?;

        if !result.status.success() {
            return Err(anyhow!(
                "ffmpeg failed: {}",
                String::from_utf8_lossy(&result.stderr)
            ));
        }

        tracing::info!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Encode completed"
        );
        Ok(())
    }
}
