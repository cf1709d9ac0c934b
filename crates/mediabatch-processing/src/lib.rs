//! Media processing for batch pipelines.
//!
//! Pure planning (rendition selection, transcode parameter synthesis) plus
//! the ffmpeg-backed operations that produce derivatives: source probing,
//! thumbnail extraction, and batch archive assembly. Nothing in this crate
//! talks to storage; it consumes and produces local staged files.

pub mod archive;
pub mod probe;
pub mod quality;
pub mod thumbnail;
pub mod transcode;
pub mod watermark;

pub use archive::{
    archive_file_name, ArchiveBuilder, ArchiveEntry, ArchiveError, ArchiveManifest, BuiltArchive,
    ManifestFile,
};
pub use probe::{SourceVideoMeta, VideoProbe};
pub use quality::{quality_score, select, Selection};
pub use thumbnail::{
    parse_sizes, GeneratedThumbnail, ThumbnailExtractor, ThumbnailFailure, ThumbnailSet,
    ThumbnailSize,
};
pub use transcode::{
    choose_profile, optimize, profile_for_level, EncodeSpec, RateControl, TranscodePlan,
    TranscodeProfile, PROFILES,
};
pub use watermark::{Watermark, WatermarkConfig, WatermarkPosition};
