//! Thumbnail extraction and post-processing.
//!
//! Frames are grabbed with ffmpeg at the source midpoint, then enhanced
//! and re-encoded as JPEG. One size failing does not abort the others;
//! failures are carried in the returned set.

use crate::probe::{validate_and_canonicalize_path, validate_path};
use crate::watermark::{Watermark, WatermarkConfig};
use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use imageproc::filter::filter3x3;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use tokio::process::Command;

/// Contrast boost applied to every thumbnail, in percent.
const CONTRAST_BOOST: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailSize {
    Small,
    Medium,
    Large,
    /// Square crop target for social embeds.
    Square,
}

impl ThumbnailSize {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ThumbnailSize::Small => (320, 180),
            ThumbnailSize::Medium => (640, 360),
            ThumbnailSize::Large => (1280, 720),
            ThumbnailSize::Square => (300, 300),
        }
    }

    /// Sizes large enough to carry the watermark overlay.
    pub fn watermarked(&self) -> bool {
        matches!(self, ThumbnailSize::Medium | ThumbnailSize::Large)
    }

    pub fn all() -> [ThumbnailSize; 4] {
        [
            ThumbnailSize::Small,
            ThumbnailSize::Medium,
            ThumbnailSize::Large,
            ThumbnailSize::Square,
        ]
    }
}

impl Display for ThumbnailSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ThumbnailSize::Small => write!(f, "small"),
            ThumbnailSize::Medium => write!(f, "medium"),
            ThumbnailSize::Large => write!(f, "large"),
            ThumbnailSize::Square => write!(f, "square"),
        }
    }
}

impl FromStr for ThumbnailSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" => Ok(ThumbnailSize::Small),
            "medium" => Ok(ThumbnailSize::Medium),
            "large" => Ok(ThumbnailSize::Large),
            "square" => Ok(ThumbnailSize::Square),
            _ => Err(anyhow!("Invalid thumbnail size: {}", s)),
        }
    }
}

/// Parse configured size names, skipping anything unknown with a warning.
pub fn parse_sizes(names: &[String]) -> Vec<ThumbnailSize> {
    let mut sizes = Vec::new();
    for name in names {
        match name.parse::<ThumbnailSize>() {
            Ok(size) => sizes.push(size),
            Err(_) => tracing::warn!(size = %name, "Unknown thumbnail size, skipping"),
        }
    }
    sizes
}

#[derive(Debug, Clone)]
pub struct GeneratedThumbnail {
    pub size: ThumbnailSize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ThumbnailFailure {
    pub size: ThumbnailSize,
    pub message: String,
}

/// Result of one extraction run: produced files plus per-size failures.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailSet {
    pub generated: Vec<GeneratedThumbnail>,
    pub failures: Vec<ThumbnailFailure>,
}

impl ThumbnailSet {
    pub fn is_empty(&self) -> bool {
        self.generated.is_empty()
    }

    pub fn path_for(&self, size: ThumbnailSize) -> Option<&Path> {
        self.generated
            .iter()
            .find(|t| t.size == size)
            .map(|t| t.path.as_path())
    }
}

fn output_file_name(size: ThumbnailSize, timestamp: f64) -> String {
    format!("thumbnail_{}_{}s.jpg", size, timestamp as u64)
}

pub struct ThumbnailExtractor {
    ffmpeg_path: String,
    jpeg_quality: u8,
    watermark_data: Option<Vec<u8>>,
    watermark_config: WatermarkConfig,
}

impl ThumbnailExtractor {
    pub fn new(ffmpeg_path: String, jpeg_quality: u8) -> Result<Self> {
        validate_path(&ffmpeg_path)
            .context("Invalid ffmpeg_path: contains dangerous characters")?;

        if !ffmpeg_path.chars().all(|c| {
            c.is_alphanumeric() || c == '/' || c == '-' || c == '_' || c == '.' || c == '\\'
        }) {
            return Err(anyhow!("Invalid ffmpeg_path: contains unsafe characters"));
        }

        Ok(Self {
            ffmpeg_path,
            jpeg_quality,
            watermark_data: None,
            watermark_config: WatermarkConfig::default(),
        })
    }

    /// Attach a decoded-on-demand watermark image (PNG bytes).
    pub fn with_watermark(mut self, data: Vec<u8>, config: WatermarkConfig) -> Self {
        self.watermark_data = Some(data);
        self.watermark_config = config;
        self
    }

    /// Generate thumbnails for every requested size.
    ///
    /// The frame is taken at the source midpoint, or at zero when the
    /// duration is unknown.
    #[tracing::instrument(skip(self, sizes))]
    pub async fn extract(
        &self,
        video_path: &Path,
        duration_secs: Option<f64>,
        sizes: &[ThumbnailSize],
        out_dir: &Path,
    ) -> Result<ThumbnailSet> {
        let validated =
            validate_and_canonicalize_path(video_path).context("Invalid video path")?;
        tokio::fs::create_dir_all(out_dir)
            .await
            .context("Failed to create thumbnail directory")?;

        let timestamp = match duration_secs {
            Some(d) if d > 0.0 => d * 0.5,
            _ => 0.0,
        };

        let mut set = ThumbnailSet::default();
        for &size in sizes {
            match self
                .generate_single(&validated, out_dir, size, timestamp)
                .await
            {
                Ok(path) => set.generated.push(GeneratedThumbnail { size, path }),
                Err(e) => {
                    tracing::warn!(size = %size, error = %e, "Thumbnail generation failed");
                    set.failures.push(ThumbnailFailure {
                        size,
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            generated = set.generated.len(),
            failed = set.failures.len(),
            "Thumbnail extraction finished"
        );
        Ok(set)
    }

    async fn generate_single(
        &self,
        video_path: &Path,
        out_dir: &Path,
        size: ThumbnailSize,
        timestamp: f64,
    ) -> Result<PathBuf> {
        let (width, height) = size.dimensions();
        let output_path = out_dir.join(output_file_name(size, timestamp));

        self.extract_frame(video_path, &output_path, timestamp, width, height)
            .await?;
        self.post_process(&output_path, size).await?;

        Ok(output_path)
    }

    async fn extract_frame(
        &self,
        video_path: &Path,
        output_path: &Path,
        timestamp: f64,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let args = vec![
            "-i".to_string(),
            video_path.to_string_lossy().to_string(),
            "-ss".to_string(),
            timestamp.to_string(),
            "-vframes".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
                w = width,
                h = height
            ),
            "-q:v".to_string(),
            "2".to_string(),
            "-y".to_string(),
            output_path.to_string_lossy().to_string(),
        ];

        let output = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute ffmpeg")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("FFmpeg failed: {}", stderr));
        }

        Ok(())
    }

    async fn post_process(&self, path: &Path, size: ThumbnailSize) -> Result<()> {
        let path = path.to_path_buf();
        let quality = self.jpeg_quality;
        let watermark = if size.watermarked() {
            self.watermark_data.clone()
        } else {
            None
        };
        let wm_config = self.watermark_config.clone();

        tokio::task::spawn_blocking(move || {
            post_process_file(&path, quality, watermark.as_deref(), &wm_config)
        })
        .await
        .map_err(|e| anyhow!("Post-processing task failed: {}", e))?
    }
}

/// Enhance a grabbed frame in place: contrast, sharpen, optional
/// watermark, then JPEG re-encode.
fn post_process_file(
    path: &Path,
    jpeg_quality: u8,
    watermark: Option<&[u8]>,
    wm_config: &WatermarkConfig,
) -> Result<()> {
    let img = image::open(path).context("Failed to open thumbnail")?;

    let enhanced = img.adjust_contrast(CONTRAST_BOOST);
    // imageproc's sharpen3x3 is grayscale-only; apply its kernel per RGB channel.
    let sharpen_kernel: [i32; 9] = [0, -1, 0, -1, 5, -1, 0, -1, 0];
    let mut img = DynamicImage::ImageRgb8(filter3x3(&enhanced.to_rgb8(), &sharpen_kernel));

    if let Some(data) = watermark {
        match Watermark::apply(img.clone(), data, wm_config) {
            Ok(marked) => img = marked,
            Err(e) => {
                tracing::warn!(error = %e, "Watermark overlay failed, keeping plain thumbnail")
            }
        }
    }

    let rgb = img.to_rgb8();
    let file = std::fs::File::create(path).context("Failed to rewrite thumbnail")?;
    let mut writer = std::io::BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, jpeg_quality);
    rgb.write_with_encoder(encoder)
        .context("Failed to encode thumbnail")?;

    Ok(())
}
