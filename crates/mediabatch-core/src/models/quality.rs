use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Standard rendition quality levels, ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    P360,
    P480,
    P720,
    P1080,
    P1440,
    P2160,
}

impl QualityLevel {
    /// Nominal frame height for this level.
    pub fn height(&self) -> u32 {
        match self {
            QualityLevel::P360 => 360,
            QualityLevel::P480 => 480,
            QualityLevel::P720 => 720,
            QualityLevel::P1080 => 1080,
            QualityLevel::P1440 => 1440,
            QualityLevel::P2160 => 2160,
        }
    }

    /// Classify an arbitrary frame height into the nearest level at or below it.
    pub fn from_height(height: u32) -> Self {
        match height {
            h if h >= 2160 => QualityLevel::P2160,
            h if h >= 1440 => QualityLevel::P1440,
            h if h >= 1080 => QualityLevel::P1080,
            h if h >= 720 => QualityLevel::P720,
            h if h >= 480 => QualityLevel::P480,
            _ => QualityLevel::P360,
        }
    }

    pub fn all() -> [QualityLevel; 6] {
        [
            QualityLevel::P360,
            QualityLevel::P480,
            QualityLevel::P720,
            QualityLevel::P1080,
            QualityLevel::P1440,
            QualityLevel::P2160,
        ]
    }
}

impl Display for QualityLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}p", self.height())
    }
}

impl FromStr for QualityLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "360p" | "360" => Ok(QualityLevel::P360),
            "480p" | "480" => Ok(QualityLevel::P480),
            "720p" | "720" => Ok(QualityLevel::P720),
            "1080p" | "1080" => Ok(QualityLevel::P1080),
            "1440p" | "1440" => Ok(QualityLevel::P1440),
            "2160p" | "2160" | "4k" => Ok(QualityLevel::P2160),
            _ => Err(anyhow::anyhow!("Invalid quality level: {}", s)),
        }
    }
}

/// Subscription tier of the submitting user. Caps the selectable rendition
/// levels and per-file size, and sets how long presigned result URLs stay
/// valid.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    #[default]
    Free,
    Trial,
    Premium,
    Admin,
}

impl UserTier {
    /// Rendition levels this tier may select.
    pub fn allowed_levels(&self) -> &'static [QualityLevel] {
        match self {
            UserTier::Free => &[QualityLevel::P360, QualityLevel::P480, QualityLevel::P720],
            UserTier::Trial => &[
                QualityLevel::P360,
                QualityLevel::P480,
                QualityLevel::P720,
                QualityLevel::P1080,
            ],
            UserTier::Premium | UserTier::Admin => &[
                QualityLevel::P360,
                QualityLevel::P480,
                QualityLevel::P720,
                QualityLevel::P1080,
                QualityLevel::P1440,
                QualityLevel::P2160,
            ],
        }
    }

    /// Per-file size cap in MB.
    pub fn max_size_mb(&self) -> u64 {
        match self {
            UserTier::Free => 100,
            UserTier::Trial => 250,
            UserTier::Premium => 1000,
            UserTier::Admin => 2000,
        }
    }

    /// Highest rendition level this tier may select.
    pub fn max_level(&self) -> QualityLevel {
        match self {
            UserTier::Free => QualityLevel::P720,
            UserTier::Trial => QualityLevel::P1080,
            UserTier::Premium | UserTier::Admin => QualityLevel::P2160,
        }
    }

    /// Validity window for presigned result URLs, in seconds.
    pub fn presign_expiry_secs(&self) -> u64 {
        match self {
            UserTier::Free => 24 * 3600,
            UserTier::Trial => 3 * 24 * 3600,
            UserTier::Premium | UserTier::Admin => 7 * 24 * 3600,
        }
    }
}

impl Display for UserTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UserTier::Free => write!(f, "free"),
            UserTier::Trial => write!(f, "trial"),
            UserTier::Premium => write!(f, "premium"),
            UserTier::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for UserTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(UserTier::Free),
            "trial" => Ok(UserTier::Trial),
            "premium" => Ok(UserTier::Premium),
            "admin" => Ok(UserTier::Admin),
            _ => Err(anyhow::anyhow!("Invalid user tier: {}", s)),
        }
    }
}

/// How a rendition is chosen among the candidates offered for one source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "level")]
pub enum QualityMode {
    /// Balance quality against size.
    #[default]
    Auto,
    /// Highest quality within the tier budget.
    Best,
    /// Smallest file within the tier budget.
    Worst,
    /// A specific level, matched exactly where possible.
    Explicit(QualityLevel),
}

/// Selection policy for one batch: tier limits plus the requested mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPolicy {
    pub tier: UserTier,
    pub mode: QualityMode,
    /// Request mobile-safe output (baseline profile, capped resolution).
    #[serde(default)]
    pub mobile: bool,
}

impl QualityPolicy {
    pub fn new(tier: UserTier, mode: QualityMode) -> Self {
        Self {
            tier,
            mode,
            mobile: false,
        }
    }
}
