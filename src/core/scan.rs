//! Source tree enumeration and destination directory replication.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::manifest::{is_manifest_file, relative_path_string};
use crate::core::models::SkippedEntry;
use crate::error::{Error, Result};

/// Result of scanning a directory
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Regular files, sorted by relative path
    pub files: Vec<FileInfo>,
    /// Directories relative to the root, parents before children
    pub directories: Vec<PathBuf>,
    /// Total size of all files in bytes
    pub total_bytes: u64,
    /// Entries that cannot be offloaded, sorted by relative path
    pub skipped: Vec<SkippedEntry>,
}

/// Information about a file to copy or hash
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Absolute path to the file
    pub path: PathBuf,
    /// Path relative to the scan root, as found on disk
    pub relative_path: PathBuf,
    /// `relative_path` forward-slash separated, as recorded in manifests
    pub relative: String,
    /// File size in bytes
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Leave `*.mhl` files out of the result
    pub skip_manifests: bool,
}

/// Scan a directory recursively on the blocking pool.
pub async fn scan_directory(root: &Path, options: ScanOptions) -> Result<ScanResult> {
    let owned = root.to_path_buf();

    tokio::task::spawn_blocking(move || scan_directory_sync(&owned, options))
        .await
        .map_err(|e| Error::io("Scan task failed for", root, std::io::Error::other(e)))?
}

pub fn scan_directory_sync(root: &Path, options: ScanOptions) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    scan_directory_recursive(root, root, options, &mut result)?;

    result.files.sort_by(|a, b| a.relative.cmp(&b.relative));
    // Sorting keeps every parent ahead of its children
    result.directories.sort();
    result
        .skipped
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(result)
}

fn scan_directory_recursive(
    base: &Path,
    current: &Path,
    options: ScanOptions,
    result: &mut ScanResult,
) -> Result<()> {
    let entries =
        fs::read_dir(current).map_err(|e| Error::source_io("Failed to read directory", current, e))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| Error::source_io("Failed to read directory entry in", current, e))?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };

        // Use symlink_metadata to avoid following symlinks
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                let err = Error::source_io("Failed to stat", &path, e);
                // A single entry vanishing is not the card going away
                if err.is_device_removed() && !base.is_dir() {
                    return Err(err);
                }
                warn!(path = %path.display(), error = %err, "Skipping unreadable entry");
                skip(result, relative, err.to_string());
                continue;
            }
        };

        if metadata.is_dir() {
            result.directories.push(relative.to_path_buf());
            scan_directory_recursive(base, &path, options, result)?;
        } else if metadata.is_file() {
            if options.skip_manifests && is_manifest_file(&path) {
                continue;
            }
            // Manifests record paths as UTF-8 text
            if relative.to_str().is_none() {
                warn!(path = %path.display(), "Skipping file with a non UTF-8 name");
                skip(result, relative, "file name is not valid UTF-8".into());
                continue;
            }
            let size = metadata.len();
            result.total_bytes += size;
            result.files.push(FileInfo {
                relative: relative_path_string(relative),
                relative_path: relative.to_path_buf(),
                path,
                size,
            });
        } else {
            let reason = if metadata.is_symlink() {
                "symbolic links are not copied"
            } else {
                "not a regular file"
            };
            debug!(path = %path.display(), reason, "Skipping entry");
            skip(result, relative, reason.into());
        }
    }

    Ok(())
}

fn skip(result: &mut ScanResult, relative: &Path, reason: String) {
    result.skipped.push(SkippedEntry {
        relative_path: relative_path_string(relative),
        reason,
    });
}

/// Create every scanned directory under `destination`, including empty ones,
/// carrying over permissions where the filesystem allows it.
pub async fn replicate_directories(
    source: &Path,
    destination: &Path,
    directories: &[PathBuf],
) -> Result<()> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    let directories = directories.to_vec();
    let root = destination.clone();

    tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&destination)
            .map_err(|e| Error::io("Failed to create destination", &destination, e))?;

        for relative in &directories {
            let dest_dir = destination.join(relative);
            fs::create_dir_all(&dest_dir)
                .map_err(|e| Error::io("Failed to create directory", &dest_dir, e))?;

            if let Ok(metadata) = fs::metadata(source.join(relative)) {
                if let Err(e) = fs::set_permissions(&dest_dir, metadata.permissions()) {
                    debug!(
                        path = %dest_dir.display(),
                        error = %e,
                        "Failed to set directory permissions"
                    );
                }
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| Error::io("Directory task failed for", root, std::io::Error::other(e)))?
}
