//! Shared key generation for storage backends.
//!
//! Key format: `{tier}/{YYYY}/{MM}/{hash12}_{task_id}{ext}` where `hash12` is
//! the first 12 hex chars of SHA-256 over `filename:task_id`. All backends use
//! the same layout so objects stay addressable across failover.

use chrono::{DateTime, Datelike, Utc};
use mediabatch_core::models::UserTier;
use sha2::{Digest, Sha256};
use std::path::Path;
use uuid::Uuid;

const MAX_FILENAME_LEN: usize = 128;

/// Generate the storage key for a finished media file.
///
/// The key is tier-scoped and date-bucketed so retention policies can operate
/// on prefixes, and carries a content hash fragment so two tasks uploading the
/// same filename never collide.
pub fn generate_object_key(tier: UserTier, task_id: Uuid, filename: &str) -> String {
    let now = Utc::now();
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", filename, task_id).as_bytes());
    let digest = hex::encode(hasher.finalize());
    let ext = extension_of(filename);

    format!(
        "{}/{:04}/{:02}/{}_{}{}",
        tier,
        now.year(),
        now.month(),
        &digest[..12],
        task_id,
        ext
    )
}

/// Storage key for a batch archive.
pub fn archive_object_key(job_id: Uuid, created_at: DateTime<Utc>) -> String {
    format!(
        "archives/{:04}/{:02}/batch_{}_{}.zip",
        created_at.year(),
        created_at.month(),
        job_id,
        created_at.format("%Y%m%d_%H%M%S")
    )
}

/// Storage key for a thumbnail derived from the media object at `media_key`.
///
/// The thumbnail lives next to the media object, under the same date bucket.
pub fn thumbnail_object_key(media_key: &str, size_name: &str) -> String {
    let stem = media_key
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(media_key);
    format!("{}_thumb_{}.jpg", stem, size_name)
}

/// Reduce a filename to `[A-Za-z0-9._-]`, collapsing runs of replacements.
///
/// Never returns an empty string and caps the result at 128 chars.
pub fn sanitize_filename(filename: &str) -> String {
    let mut out = String::with_capacity(filename.len());
    let mut last_was_underscore = false;

    for ch in filename.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        return "file".to_string();
    }

    trimmed.chars().take(MAX_FILENAME_LEN).collect()
}

/// MIME type for a path, inferred from its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("mp3") => "audio/mpeg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Reject keys that could escape the storage root.
pub fn validate_key(key: &str) -> Result<(), crate::traits::StorageError> {
    if key.is_empty() || key.contains("..") || key.starts_with('/') {
        return Err(crate::traits::StorageError::InvalidKey(format!(
            "key {:?} is empty or contains traversal sequences",
            key
        )));
    }
    Ok(())
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_object_key_layout() {
        let task_id = Uuid::new_v4();
        let key = generate_object_key(UserTier::Free, task_id, "My Video.MP4");

        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "free");
        assert_eq!(parts[1].len(), 4);
        assert_eq!(parts[2].len(), 2);
        assert!(parts[3].ends_with(&format!("_{}.mp4", task_id)));

        let hash_fragment = parts[3].split('_').next().unwrap();
        assert_eq!(hash_fragment.len(), 12);
        assert!(hash_fragment.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_object_key_is_deterministic_per_task() {
        let task_id = Uuid::new_v4();
        let a = generate_object_key(UserTier::Premium, task_id, "clip.webm");
        let b = generate_object_key(UserTier::Premium, task_id, "clip.webm");
        assert_eq!(a, b);

        let other = generate_object_key(UserTier::Premium, Uuid::new_v4(), "clip.webm");
        assert_ne!(a, other);
    }

    #[test]
    fn test_archive_object_key_format() {
        let job_id = Uuid::new_v4();
        let created_at = Utc.with_ymd_and_hms(2026, 3, 7, 14, 30, 5).unwrap();
        let key = archive_object_key(job_id, created_at);
        assert_eq!(
            key,
            format!("archives/2026/03/batch_{}_20260307_143005.zip", job_id)
        );
    }

    #[test]
    fn test_thumbnail_object_key() {
        assert_eq!(
            thumbnail_object_key("free/2026/03/abc_id.mp4", "medium"),
            "free/2026/03/abc_id_thumb_medium.jpg"
        );
        assert_eq!(
            thumbnail_object_key("no-extension", "small"),
            "no-extension_thumb_small.jpg"
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Video (final).mp4"), "My_Video_final_.mp4");
        assert_eq!(sanitize_filename("видео.mp4"), "mp4");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("///"), "file");
        assert_eq!(sanitize_filename("a//b..mp4"), "a_b..mp4");

        let long = "x".repeat(300);
        assert_eq!(sanitize_filename(&long).len(), 128);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a/video.MP4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("thumb.jpeg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("bundle.zip")), "application/zip");
        assert_eq!(
            content_type_for(Path::new("unknown.bin")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("free/2026/01/abc.mp4").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("").is_err());
    }
}
