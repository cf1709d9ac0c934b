use serde::{Deserialize, Serialize};

use super::quality::QualityLevel;

/// Assumed duration when estimating size from bitrate alone, in seconds.
const BITRATE_ESTIMATE_DURATION_SECS: f64 = 180.0;

/// One concrete encoded variant offered by the retrieval engine for a source.
///
/// Ephemeral: produced during retrieval, consumed by quality selection, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenditionCandidate {
    pub format_id: String,
    /// Container extension, e.g. "mp4", "webm".
    pub container: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    /// Total bitrate in kbps as reported by the source.
    pub bitrate_kbps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub filesize_bytes: Option<u64>,
    pub filesize_approx_bytes: Option<u64>,
    /// Delivery protocol, e.g. "https", "http_dash_segments".
    pub protocol: Option<String>,
}

impl RenditionCandidate {
    /// Quality level implied by the candidate's frame height.
    pub fn quality_level(&self) -> QualityLevel {
        QualityLevel::from_height(self.height.unwrap_or(0))
    }

    /// Estimated download size in MB.
    ///
    /// Falls back through reported size, approximate size, bitrate over an
    /// assumed duration, and finally a height-based guess.
    pub fn estimated_size_mb(&self) -> f64 {
        if let Some(size) = self.filesize_bytes {
            return size as f64 / (1024.0 * 1024.0);
        }
        if let Some(size) = self.filesize_approx_bytes {
            return size as f64 / (1024.0 * 1024.0);
        }
        if let Some(tbr) = self.bitrate_kbps {
            if tbr > 0.0 {
                return tbr * BITRATE_ESTIMATE_DURATION_SECS / 8.0 / 1024.0;
            }
        }
        match self.height.unwrap_or(0) {
            h if h >= 1080 => 50.0,
            h if h >= 720 => 25.0,
            h if h >= 480 => 15.0,
            _ => 8.0,
        }
    }
}
