use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::hasher::{ContentHasher, DEFAULT_BUFFER_SIZE};
use crate::error::{Error, Result};

/// Options for a single file copy
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    /// Chunk size for reads and writes
    pub buffer_size: usize,
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            sync_files: true,
        }
    }
}

/// Outcome of a successful copy
#[derive(Debug, Clone)]
pub struct CopiedFile {
    /// xxHash64 of the bytes read from the source during this copy
    pub hash: String,
    pub bytes_copied: u64,
    /// Source modification time, carried over to the destination
    pub modified: Option<DateTime<Utc>>,
}

/// A failed copy.
#[derive(Debug)]
pub struct CopyError {
    pub error: Error,
    /// The destination was created or truncated before the failure, so a
    /// partial file may be sitting there.
    pub partial: bool,
}

impl From<CopyError> for Error {
    fn from(e: CopyError) -> Self {
        e.error
    }
}

/// Copy one file while hashing the bytes as they are read, so the source is
/// read exactly once for this destination.
///
/// On failure or cancellation the partial destination file is left in place;
/// the caller decides whether to remove it.
pub fn copy_file(
    source: &Path,
    dest: &Path,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> std::result::Result<CopiedFile, CopyError> {
    let (source_metadata, mut reader) = open_source(source, options.buffer_size)
        .map_err(|error| CopyError {
            error,
            partial: false,
        })?;

    let dest_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dest)
        .map_err(|e| CopyError {
            error: Error::io("Failed to create destination", dest, e),
            partial: false,
        })?;
    let writer = BufWriter::with_capacity(options.buffer_size, dest_file);

    let (hash, bytes_written) = stream_and_hash(source, dest, &mut reader, writer, options, cancel)
        .map_err(|error| CopyError {
            error,
            partial: true,
        })?;

    if bytes_written != source_metadata.len() {
        warn!(
            source = %source.display(),
            expected = source_metadata.len(),
            copied = bytes_written,
            "Source size changed during copy"
        );
    }

    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    if let Err(e) = preserve_timestamps(&source_metadata, dest) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok(CopiedFile {
        hash,
        bytes_copied: bytes_written,
        modified: source_metadata.modified().ok().map(DateTime::<Utc>::from),
    })
}

fn open_source(source: &Path, buffer_size: usize) -> Result<(fs::Metadata, BufReader<File>)> {
    let source_file =
        File::open(source).map_err(|e| Error::source_io("Failed to open source", source, e))?;
    let metadata = source_file
        .metadata()
        .map_err(|e| Error::source_io("Failed to read metadata of", source, e))?;
    Ok((metadata, BufReader::with_capacity(buffer_size, source_file)))
}

fn stream_and_hash(
    source: &Path,
    dest: &Path,
    reader: &mut BufReader<File>,
    mut writer: BufWriter<File>,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<(String, u64)> {
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; options.buffer_size];
    let mut bytes_written: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| Error::source_io("Failed to read from", source, e))?;
        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| Error::io("Failed to write to", dest, e))?;

        bytes_written += bytes_read as u64;
    }

    writer
        .flush()
        .map_err(|e| Error::io("Failed to flush", dest, e))?;

    if options.sync_files {
        let inner = writer
            .into_inner()
            .map_err(|e| Error::io("Failed to flush", dest, e.into_error()))?;
        inner
            .sync_all()
            .map_err(|e| Error::io("Failed to sync", dest, e))?;
    }

    Ok((hasher.finish(), bytes_written))
}

/// Carry access and modification times over to the destination. Creation
/// time is left to the filesystem.
fn preserve_timestamps(source_metadata: &fs::Metadata, dest: &Path) -> std::io::Result<()> {
    let atime = filetime::FileTime::from_last_access_time(source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(source_metadata);
    filetime::set_file_times(dest, atime, mtime)
}

/// Delete a partially written destination file. Missing files are fine.
pub fn remove_partial(dest: &Path) {
    match fs::remove_file(dest) {
        Ok(()) => debug!(dest = %dest.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dest = %dest.display(), error = %e, "Failed to remove partial file"),
    }
}
