//! Transcode parameter synthesis.
//!
//! A profile is picked from a fixed table by tier and source properties,
//! then turned into either a passthrough decision or a concrete
//! [`EncodeSpec`]. Nothing here runs ffmpeg; the pipeline hands the
//! resolved parameters to an encoder adapter.

use crate::probe::SourceVideoMeta;
use mediabatch_core::models::{QualityLevel, QualityPolicy};
use std::path::Path;

/// One row of the encoding ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeProfile {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub crf: u8,
    pub preset: &'static str,
    /// H.264 profile restriction, used by the mobile presets.
    pub profile: Option<&'static str>,
}

pub static PROFILES: [TranscodeProfile; 8] = [
    TranscodeProfile {
        name: "2160p",
        width: 3840,
        height: 2160,
        video_bitrate_kbps: 15000,
        audio_bitrate_kbps: 192,
        crf: 22,
        preset: "medium",
        profile: None,
    },
    TranscodeProfile {
        name: "1440p",
        width: 2560,
        height: 1440,
        video_bitrate_kbps: 10000,
        audio_bitrate_kbps: 192,
        crf: 23,
        preset: "medium",
        profile: None,
    },
    TranscodeProfile {
        name: "1080p",
        width: 1920,
        height: 1080,
        video_bitrate_kbps: 6000,
        audio_bitrate_kbps: 128,
        crf: 23,
        preset: "medium",
        profile: None,
    },
    TranscodeProfile {
        name: "720p",
        width: 1280,
        height: 720,
        video_bitrate_kbps: 3000,
        audio_bitrate_kbps: 128,
        crf: 24,
        preset: "medium",
        profile: None,
    },
    TranscodeProfile {
        name: "480p",
        width: 854,
        height: 480,
        video_bitrate_kbps: 1500,
        audio_bitrate_kbps: 96,
        crf: 25,
        preset: "fast",
        profile: None,
    },
    TranscodeProfile {
        name: "360p",
        width: 640,
        height: 360,
        video_bitrate_kbps: 800,
        audio_bitrate_kbps: 96,
        crf: 26,
        preset: "fast",
        profile: None,
    },
    TranscodeProfile {
        name: "1080p-mobile",
        width: 1920,
        height: 1080,
        video_bitrate_kbps: 4000,
        audio_bitrate_kbps: 128,
        crf: 24,
        preset: "fast",
        profile: Some("baseline"),
    },
    TranscodeProfile {
        name: "720p-mobile",
        width: 1280,
        height: 720,
        video_bitrate_kbps: 2000,
        audio_bitrate_kbps: 96,
        crf: 25,
        preset: "fast",
        profile: Some("baseline"),
    },
];

/// Ladder row for a level. Mobile variants exist for 1080p and 720p only.
pub fn profile_for_level(level: QualityLevel, mobile: bool) -> &'static TranscodeProfile {
    match (level, mobile) {
        (QualityLevel::P2160, _) => &PROFILES[0],
        (QualityLevel::P1440, _) => &PROFILES[1],
        (QualityLevel::P1080, true) => &PROFILES[6],
        (QualityLevel::P1080, false) => &PROFILES[2],
        (QualityLevel::P720, true) => &PROFILES[7],
        (QualityLevel::P720, false) => &PROFILES[3],
        (QualityLevel::P480, _) => &PROFILES[4],
        (QualityLevel::P360, _) => &PROFILES[5],
    }
}

/// Pick the target profile for a source under the given policy.
///
/// The target never exceeds the source level (no upscaling) or the tier's
/// ceiling. Mobile requests cap at 1080p, as do sources that are both
/// large and long.
pub fn choose_profile(source: &SourceVideoMeta, policy: &QualityPolicy) -> &'static TranscodeProfile {
    let mut target = source.quality_level().min(policy.tier.max_level());

    if policy.mobile && target > QualityLevel::P1080 {
        target = QualityLevel::P1080;
    }

    if source.size_mb() > 500.0 && source.duration_secs > 300.0 && target > QualityLevel::P1080 {
        target = QualityLevel::P1080;
    }

    profile_for_level(target, policy.mobile)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    Crf(u8),
    /// Target video bitrate in kbps, used when a hard size ceiling applies.
    Bitrate(u32),
}

/// Fully resolved encoder parameters for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSpec {
    pub profile_name: &'static str,
    pub width: u32,
    pub height: u32,
    pub audio_bitrate_kbps: u32,
    pub preset: &'static str,
    pub h264_profile: Option<&'static str>,
    pub rate_control: RateControl,
}

/// Outcome of transcode planning for one source.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodePlan {
    /// Source already satisfies the profile; ship it unchanged.
    Passthrough,
    Encode(EncodeSpec),
}

fn fits_profile(source: &SourceVideoMeta, profile: &TranscodeProfile) -> bool {
    let codec_ok =
        source.video_codec.contains("h264") || source.video_codec.contains("avc");
    let bitrate_ok = source
        .bitrate_kbps
        .map_or(false, |b| b as f64 <= profile.video_bitrate_kbps as f64 * 1.2);
    source.width <= profile.width && source.height <= profile.height && bitrate_ok && codec_ok
}

/// Video bitrate that lands the output under `ceiling_bytes`, leaving room
/// for the audio track. Floored at 100 kbps.
fn ceiling_bitrate_kbps(ceiling_bytes: u64, duration_secs: f64, audio_kbps: u32) -> u32 {
    if duration_secs <= 0.0 {
        return 100;
    }
    let total_kbps = ceiling_bytes as f64 * 8.0 / duration_secs / 1000.0;
    (total_kbps - audio_kbps as f64).max(100.0) as u32
}

/// Decide between passthrough and a concrete encode for one source.
pub fn optimize(
    source: &SourceVideoMeta,
    profile: &'static TranscodeProfile,
    size_ceiling_bytes: Option<u64>,
) -> TranscodePlan {
    let within_ceiling = size_ceiling_bytes.map_or(true, |c| source.size_bytes <= c);
    if within_ceiling && fits_profile(source, profile) {
        return TranscodePlan::Passthrough;
    }

    let rate_control = match size_ceiling_bytes {
        Some(ceiling) if source.size_bytes > ceiling => RateControl::Bitrate(
            ceiling_bitrate_kbps(ceiling, source.duration_secs, profile.audio_bitrate_kbps),
        ),
        _ => RateControl::Crf(profile.crf),
    };

    TranscodePlan::Encode(EncodeSpec {
        profile_name: profile.name,
        width: profile.width,
        height: profile.height,
        audio_bitrate_kbps: profile.audio_bitrate_kbps,
        preset: profile.preset,
        h264_profile: profile.profile,
        rate_control,
    })
}

impl EncodeSpec {
    /// Scale preserving aspect ratio, then pad to the exact target frame.
    pub fn video_filter(&self) -> String {
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
            w = self.width,
            h = self.height
        )
    }

    pub fn to_ffmpeg_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vf".to_string(),
            self.video_filter(),
            "-c:v".to_string(),
            "libx264".to_string(),
        ];

        match self.rate_control {
            RateControl::Crf(crf) => {
                args.extend_from_slice(&["-crf".to_string(), crf.to_string()]);
            }
            RateControl::Bitrate(kbps) => {
                args.extend_from_slice(&["-b:v".to_string(), format!("{}k", kbps)]);
            }
        }

        args.extend_from_slice(&["-preset".to_string(), self.preset.to_string()]);

        if let Some(profile) = self.h264_profile {
            args.extend_from_slice(&[
                "-profile:v".to_string(),
                profile.to_string(),
                "-level".to_string(),
                "3.1".to_string(),
            ]);
        }

        args.extend_from_slice(&[
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", self.audio_bitrate_kbps),
            "-ar".to_string(),
            "44100".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            "-y".to_string(),
            output.to_string_lossy().to_string(),
        ]);

        args
    }
}
