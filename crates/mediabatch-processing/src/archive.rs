//! Batch archive assembly.
//!
//! Media files land at the archive root, thumbnails under `thumbnails/`,
//! and a `metadata.json` manifest describes the contents. The aggregate
//! input size is checked before any byte is written so an oversized batch
//! can fall back to per-file delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive would be {total_bytes} bytes, over the {max_bytes} byte limit")]
    SizeExceeded { total_bytes: u64, max_bytes: u64 },
    #[error("Archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zip write failed: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Manifest encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Archive task failed: {0}")]
    TaskFailed(String),
}

/// One media file to pack, with its derivatives.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    /// Name the media file takes inside the archive.
    pub archive_name: String,
    pub original_url: String,
    pub duration_seconds: Option<f64>,
    /// (size name, staged path) pairs copied under `thumbnails/`.
    pub thumbnails: Vec<(String, PathBuf)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub original_url: String,
    pub duration_seconds: Option<f64>,
    pub file_size_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub files_count: usize,
    pub total_size_mb: f64,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub files_count: usize,
}

/// Readable per-entry name inside the archive: an ordinal prefix plus a
/// cleaned title, falling back to the staged file name.
pub fn archive_file_name(index: usize, title: Option<&str>, ext: &str, fallback_name: &str) -> String {
    match title {
        Some(t) if !t.trim().is_empty() => {
            let clean: String = t
                .chars()
                .map(|c| {
                    if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') {
                        '_'
                    } else {
                        c
                    }
                })
                .take(50)
                .collect();
            format!("{:02}_{}.{}", index + 1, clean, ext)
        }
        _ => fallback_name.to_string(),
    }
}

pub struct ArchiveBuilder {
    max_aggregate_bytes: u64,
    compression_level: i32,
}

impl ArchiveBuilder {
    pub fn new(max_aggregate_bytes: u64, compression_level: i32) -> Self {
        Self {
            max_aggregate_bytes,
            compression_level,
        }
    }

    /// Pack the entries into `batch_{job_id}_{timestamp}.zip` under `out_dir`.
    #[tracing::instrument(skip(self, entries))]
    pub async fn build(
        &self,
        job_id: Uuid,
        entries: &[ArchiveEntry],
        out_dir: &Path,
    ) -> Result<BuiltArchive, ArchiveError> {
        let mut sizes = Vec::with_capacity(entries.len());
        let mut total_bytes = 0u64;
        for entry in entries {
            let len = tokio::fs::metadata(&entry.path).await?.len();
            sizes.push(len);
            total_bytes += len;
        }

        if total_bytes > self.max_aggregate_bytes {
            tracing::warn!(
                job_id = %job_id,
                total_bytes,
                max_bytes = self.max_aggregate_bytes,
                "Refusing to build oversized archive"
            );
            return Err(ArchiveError::SizeExceeded {
                total_bytes,
                max_bytes: self.max_aggregate_bytes,
            });
        }

        let created_at = Utc::now();
        let archive_path = out_dir.join(format!(
            "batch_{}_{}.zip",
            job_id,
            created_at.format("%Y%m%d_%H%M%S")
        ));
        tokio::fs::create_dir_all(out_dir).await?;

        let manifest = ArchiveManifest {
            batch_id: job_id,
            created_at,
            files_count: entries.len(),
            total_size_mb: total_bytes as f64 / (1024.0 * 1024.0),
            files: entries
                .iter()
                .zip(&sizes)
                .map(|(e, &len)| ManifestFile {
                    name: e.archive_name.clone(),
                    original_url: e.original_url.clone(),
                    duration_seconds: e.duration_seconds,
                    file_size_mb: len as f64 / (1024.0 * 1024.0),
                })
                .collect(),
        };

        let files_count = entries.len();
        let entries = entries.to_vec();
        let path = archive_path.clone();
        let level = self.compression_level;
        let size_bytes =
            tokio::task::spawn_blocking(move || write_zip(&path, &entries, &manifest, level))
                .await
                .map_err(|e| ArchiveError::TaskFailed(e.to_string()))??;

        tracing::info!(
            job_id = %job_id,
            path = %archive_path.display(),
            size_bytes,
            files = files_count,
            "Archive created"
        );

        Ok(BuiltArchive {
            path: archive_path,
            size_bytes,
            files_count,
        })
    }
}

fn write_zip(
    archive_path: &Path,
    entries: &[ArchiveEntry],
    manifest: &ArchiveManifest,
    level: i32,
) -> Result<u64, ArchiveError> {
    let file = std::fs::File::create(archive_path)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level));

    for entry in entries {
        writer.start_file(entry.archive_name.clone(), options)?;
        let mut input = std::fs::File::open(&entry.path)?;
        std::io::copy(&mut input, &mut writer)?;
    }

    for entry in entries {
        let stem = Path::new(&entry.archive_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| entry.archive_name.clone());
        for (size_name, thumb_path) in &entry.thumbnails {
            if !thumb_path.exists() {
                continue;
            }
            writer.start_file(format!("thumbnails/{}_{}.jpg", stem, size_name), options)?;
            let mut input = std::fs::File::open(thumb_path)?;
            std::io::copy(&mut input, &mut writer)?;
        }
    }

    writer.start_file("metadata.json", options)?;
    writer.write_all(&serde_json::to_vec_pretty(manifest)?)?;
    writer.finish()?;

    Ok(std::fs::metadata(archive_path)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn write_file(path: &Path, bytes: &[u8]) {
        std::fs::write(path, bytes).unwrap();
    }

    fn entry(path: PathBuf, name: &str, thumbnails: Vec<(String, PathBuf)>) -> ArchiveEntry {
        ArchiveEntry {
            path,
            archive_name: name.to_string(),
            original_url: format!("https://example.com/watch/{}", name),
            duration_seconds: Some(42.0),
            thumbnails,
        }
    }

    #[tokio::test]
    async fn test_build_packs_files_thumbnails_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("staged_a.mp4");
        let thumb = dir.path().join("thumbnail_medium_21s.jpg");
        write_file(&media, &[0u8; 4096]);
        write_file(&thumb, &[1u8; 256]);

        let job_id = Uuid::new_v4();
        let entries = vec![entry(
            media,
            "01_first.mp4",
            vec![("medium".to_string(), thumb)],
        )];

        let builder = ArchiveBuilder::new(10 * 1024 * 1024, 6);
        let built = builder
            .build(job_id, &entries, &dir.path().join("out"))
            .await
            .unwrap();

        assert_eq!(built.files_count, 1);
        assert!(built.size_bytes > 0);
        let name = built.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("batch_{}_", job_id)));
        assert!(name.ends_with(".zip"));

        let mut zip = zip::ZipArchive::new(std::fs::File::open(&built.path).unwrap()).unwrap();
        assert!(zip.by_name("01_first.mp4").is_ok());
        assert!(zip.by_name("thumbnails/01_first_medium.jpg").is_ok());

        let mut raw = String::new();
        zip.by_name("metadata.json")
            .unwrap()
            .read_to_string(&mut raw)
            .unwrap();
        let manifest: ArchiveManifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(manifest.batch_id, job_id);
        assert_eq!(manifest.files_count, 1);
        assert_eq!(manifest.files[0].name, "01_first.mp4");
        assert_eq!(manifest.files[0].duration_seconds, Some(42.0));
        assert!((manifest.total_size_mb - 4096.0 / (1024.0 * 1024.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_build_refuses_oversized_input() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("big.mp4");
        write_file(&media, &[0u8; 2048]);

        let builder = ArchiveBuilder::new(1024, 6);
        let err = builder
            .build(Uuid::new_v4(), &[entry(media, "big.mp4", vec![])], dir.path())
            .await
            .unwrap_err();

        match err {
            ArchiveError::SizeExceeded {
                total_bytes,
                max_bytes,
            } => {
                assert_eq!(total_bytes, 2048);
                assert_eq!(max_bytes, 1024);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Nothing was written.
        assert!(std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .all(|e| !e.file_name().to_string_lossy().ends_with(".zip")));
    }

    #[tokio::test]
    async fn test_build_skips_missing_thumbnails() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("staged.mp4");
        write_file(&media, &[0u8; 512]);

        let entries = vec![entry(
            media,
            "01_clip.mp4",
            vec![("large".to_string(), dir.path().join("gone.jpg"))],
        )];
        let builder = ArchiveBuilder::new(1024 * 1024, 6);
        let built = builder
            .build(Uuid::new_v4(), &entries, dir.path())
            .await
            .unwrap();

        let mut zip = zip::ZipArchive::new(std::fs::File::open(&built.path).unwrap()).unwrap();
        assert!(zip.by_name("01_clip.mp4").is_ok());
        assert!(zip.by_name("thumbnails/01_clip_large.jpg").is_err());
    }

    #[test]
    fn test_archive_file_name_cleans_title() {
        assert_eq!(
            archive_file_name(0, Some("My: Video/Title"), "mp4", "fallback.mp4"),
            "01_My_ Video_Title.mp4"
        );
        assert_eq!(
            archive_file_name(11, Some("ok"), "webm", "fallback.mp4"),
            "12_ok.webm"
        );
        assert_eq!(
            archive_file_name(2, None, "mp4", "staged_3.mp4"),
            "staged_3.mp4"
        );
        assert_eq!(
            archive_file_name(2, Some("   "), "mp4", "staged_3.mp4"),
            "staged_3.mp4"
        );
    }

    #[test]
    fn test_archive_file_name_caps_length() {
        let long = "x".repeat(80);
        let name = archive_file_name(0, Some(&long), "mp4", "f.mp4");
        assert_eq!(name, format!("01_{}.mp4", "x".repeat(50)));
    }
}
