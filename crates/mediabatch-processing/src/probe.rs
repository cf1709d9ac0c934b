//! Source media inspection via ffprobe.

use anyhow::{anyhow, Context, Result};
use mediabatch_core::models::QualityLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Validate that a path doesn't contain shell metacharacters or dangerous sequences
pub(crate) fn validate_path(path: &str) -> Result<()> {
    let dangerous_chars = [';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r'];
    if path.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(anyhow!("Path contains dangerous characters: {}", path));
    }

    if path.contains("..") {
        return Err(anyhow!("Path contains directory traversal: {}", path));
    }

    Ok(())
}

/// Validate and canonicalize a file path to prevent directory traversal
pub(crate) fn validate_and_canonicalize_path(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    validate_path(&path_str)?;

    if path.exists() {
        path.canonicalize()
            .map_err(|e| anyhow!("Failed to canonicalize path: {}", e))
    } else {
        if let Some(parent) = path.parent() {
            parent
                .canonicalize()
                .map_err(|e| anyhow!("Failed to canonicalize parent path: {}", e))?;
        }
        Ok(path.to_path_buf())
    }
}

/// Parse an ffprobe `r_frame_rate` fraction such as "30000/1001".
fn parse_frame_rate(raw: &str) -> Option<f32> {
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() == 2 {
        let num: f32 = parts[0].parse().ok()?;
        let den: f32 = parts[1].parse().ok()?;
        if den != 0.0 {
            Some(num / den)
        } else {
            None
        }
    } else {
        None
    }
}

/// Properties of a downloaded source file that drive transcode planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVideoMeta {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub video_codec: String,
    /// Container bitrate in kbps, when the format reports one.
    pub bitrate_kbps: Option<u32>,
    pub fps: Option<f32>,
    pub size_bytes: u64,
}

impl SourceVideoMeta {
    /// Quality level implied by the source frame height.
    pub fn quality_level(&self) -> QualityLevel {
        QualityLevel::from_height(self.height)
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Thin ffprobe wrapper producing [`SourceVideoMeta`] for local files.
pub struct VideoProbe {
    ffprobe_path: String,
}

impl VideoProbe {
    pub fn new(ffprobe_path: String) -> Result<Self> {
        validate_path(&ffprobe_path)
            .context("Invalid ffprobe_path: contains dangerous characters")?;

        if !ffprobe_path.chars().all(|c| {
            c.is_alphanumeric() || c == '/' || c == '-' || c == '_' || c == '.' || c == '\\'
        }) {
            return Err(anyhow!("Invalid ffprobe_path: contains unsafe characters"));
        }

        Ok(Self { ffprobe_path })
    }

    #[tracing::instrument(skip(self))]
    pub async fn probe(&self, video_path: &Path) -> Result<SourceVideoMeta> {
        let start = std::time::Instant::now();

        let validated_path =
            validate_and_canonicalize_path(video_path).context("Invalid video path")?;

        let size_bytes = tokio::fs::metadata(&validated_path)
            .await
            .context("Failed to stat video file")?
            .len();

        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "-select_streams",
                "v:0",
            ])
            .arg(&validated_path)
            .output()
            .await
            .context("Failed to execute ffprobe")?;

        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let probe_data: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("Failed to parse ffprobe output")?;

        let stream = probe_data["streams"]
            .get(0)
            .ok_or_else(|| anyhow!("No video stream found"))?;

        let format = &probe_data["format"];

        let duration_secs = format["duration"]
            .as_str()
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| anyhow!("Could not parse duration"))?;

        let width = stream["width"]
            .as_u64()
            .ok_or_else(|| anyhow!("Could not parse width"))? as u32;

        let height = stream["height"]
            .as_u64()
            .ok_or_else(|| anyhow!("Could not parse height"))? as u32;

        let video_codec = stream["codec_name"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        let bitrate_kbps = format["bit_rate"]
            .as_str()
            .and_then(|b| b.parse::<u64>().ok())
            .map(|bps| (bps / 1000) as u32);

        let fps = stream["r_frame_rate"].as_str().and_then(parse_frame_rate);

        tracing::info!(
            duration_ms = start.elapsed().as_millis() as u64,
            video_duration = duration_secs,
            width = width,
            height = height,
            codec = %video_codec,
            "Source probe completed"
        );

        Ok(SourceVideoMeta {
            duration_secs,
            width,
            height,
            video_codec,
            bitrate_kbps,
            fps,
            size_bytes,
        })
    }
}
