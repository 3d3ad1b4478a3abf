//! Streaming xxHash64 content hashing.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh64::Xxh64;

use crate::error::{Error, Result};

/// Default chunk size for hashing and copying. Smaller reads were observed to
/// stall on network shares.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

const SEED: u64 = 0;

/// Incremental hasher producing the 16-character lowercase hex digest used in
/// manifests.
pub struct ContentHasher {
    state: Xxh64,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            state: Xxh64::new(SEED),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    /// Consume the hasher and return the hex digest.
    ///
    /// The digest is rendered from the numeric value, so it is identical on
    /// big- and little-endian hosts.
    pub fn finish(self) -> String {
        format_hash(self.state.digest())
    }
}

pub fn format_hash(value: u64) -> String {
    format!("{:016x}", value)
}

/// Hash in-memory bytes. Mostly useful for tests and small payloads.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.finish()
}

/// Hash a file by streaming it in `buffer_size` chunks.
///
/// The cancellation token is polled between chunks; no partial digest is ever
/// returned.
pub fn hash_file(
    path: &Path,
    buffer_size: usize,
    cancel: Option<&CancellationToken>,
) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io("Failed to open", path, e))?;
    let mut reader = BufReader::with_capacity(buffer_size, file);
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; buffer_size];

    loop {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| Error::io("Failed to read", path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish())
}

/// Async wrapper running [`hash_file`] on the blocking pool.
pub async fn hash_file_async(
    path: &Path,
    buffer_size: usize,
    cancel: Option<CancellationToken>,
) -> Result<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&owned, buffer_size, cancel.as_ref()))
        .await
        .map_err(|e| Error::io("Hashing task failed for", path, std::io::Error::other(e)))?
}
