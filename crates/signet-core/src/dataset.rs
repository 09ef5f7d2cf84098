//! Dataset directory helpers: listing rules shared with pair synthesis, and
//! housekeeping scans over a signature dataset tree.

use image::ImageFormat;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extensions treated as signature images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Sorted, non-hidden entries of `dir` that satisfy `keep`.
fn sorted_entries(
    dir: &Path,
    keep: impl Fn(&Path) -> bool,
) -> Result<Vec<(String, PathBuf)>, std::io::Error> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if is_hidden(&name) || !keep(&path) {
            continue;
        }
        entries.push((name, path));
    }
    entries.sort();
    Ok(entries)
}

/// Immediate subdirectories of `root` as `(name, path)`, sorted by name.
pub fn list_subdirs(root: &Path) -> Result<Vec<(String, PathBuf)>, DatasetError> {
    sorted_entries(root, Path::is_dir).map_err(|source| DatasetError::ReadDir {
        path: root.to_path_buf(),
        source,
    })
}

/// Image files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let entries = sorted_entries(dir, |p| p.is_file() && is_image_path(p)).map_err(|source| {
        DatasetError::ReadDir {
            path: dir.to_path_buf(),
            source,
        }
    })?;
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

/// Every regular file under `root`, recursively, in sorted order.
fn walk_files(root: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let read = fs::read_dir(&dir).map_err(|source| DatasetError::ReadDir {
            path: dir.clone(),
            source,
        })?;
        for entry in read {
            let entry = entry.map_err(|source| DatasetError::ReadDir {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Number of files (recursive) inside each immediate subfolder of `root`.
pub fn count_images(root: &Path) -> Result<BTreeMap<String, usize>, DatasetError> {
    let mut counts = BTreeMap::new();
    for (name, path) in list_subdirs(root)? {
        counts.insert(name, walk_files(&path)?.len());
    }
    Ok(counts)
}

/// A file name that occurs in more than one place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateName {
    /// Lower-cased file name.
    pub name: String,
    pub paths: Vec<PathBuf>,
}

/// File names (case-insensitive) appearing more than once under `root`.
pub fn find_duplicate_names(root: &Path) -> Result<Vec<DuplicateName>, DatasetError> {
    let mut by_name: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for path in walk_files(root)? {
        if let Some(name) = path.file_name() {
            by_name
                .entry(name.to_string_lossy().to_lowercase())
                .or_default()
                .push(path);
        }
    }
    Ok(by_name
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|(name, paths)| DuplicateName { name, paths })
        .collect())
}

/// An image file that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptImage {
    pub path: PathBuf,
    pub message: String,
}

/// Decode every image file under `root`; report the ones that fail.
pub fn check_images(root: &Path) -> Result<Vec<CorruptImage>, DatasetError> {
    let mut corrupt = Vec::new();
    for path in walk_files(root)?.into_iter().filter(|p| is_image_path(p)) {
        if let Err(err) = image::open(&path) {
            tracing::debug!(path = %path.display(), error = %err, "corrupt image");
            corrupt.push(CorruptImage {
                path,
                message: err.to_string(),
            });
        }
    }
    Ok(corrupt)
}

/// Outcome of a TIFF → PNG conversion run.
#[derive(Debug, Default, Serialize)]
pub struct ConversionReport {
    pub converted: Vec<PathBuf>,
    pub failed: Vec<CorruptImage>,
}

/// Convert every `.tif`/`.tiff` under `input` to PNG under `output`,
/// mirroring the relative directory layout. Per-file failures are collected.
pub fn convert_tiff_to_png(input: &Path, output: &Path) -> Result<ConversionReport, DatasetError> {
    let mut report = ConversionReport::default();
    for path in walk_files(input)? {
        let is_tiff = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
            .unwrap_or(false);
        if !is_tiff {
            continue;
        }

        let relative = path.strip_prefix(input).unwrap_or(&path);
        let target = output.join(relative).with_extension("png");
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| DatasetError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        match image::open(&path).and_then(|img| img.save_with_format(&target, ImageFormat::Png)) {
            Ok(()) => {
                tracing::info!(from = %path.display(), to = %target.display(), "converted");
                report.converted.push(target);
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "conversion failed");
                report.failed.push(CorruptImage {
                    path,
                    message: err.to_string(),
                });
            }
        }
    }
    Ok(report)
}
