use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

/// Lifecycle of a single offload run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OffloadState {
    Idle,
    ScanningSource,
    ReplicatingDirectories,
    CopyingFiles,
    WritingManifests,
    Completed,
    Failed,
}

/// Terminal state of a run that got past validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Completed,
    Failed,
    /// Stopped by the caller's cancellation token. Not a failure.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct OffloadRequest {
    pub source: PathBuf,
    pub destination_a: PathBuf,
    /// Optional second copy. `None` skips every destination-B step.
    pub destination_b: Option<PathBuf>,
}

impl OffloadRequest {
    /// Build a request. An empty destination-B path is treated as absent.
    pub fn new(
        source: impl Into<PathBuf>,
        destination_a: impl Into<PathBuf>,
        destination_b: Option<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            destination_a: destination_a.into(),
            destination_b: destination_b.filter(|p| !p.as_os_str().is_empty()),
        }
    }

    /// Destination A, then B when it is set to a non-empty path.
    pub fn destinations(&self) -> Vec<Destination> {
        let mut destinations = vec![Destination {
            label: "A",
            root: self.destination_a.clone(),
        }];
        if let Some(b) = self.destination_b.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            destinations.push(Destination {
                label: "B",
                root: b.clone(),
            });
        }
        destinations
    }
}

#[derive(Debug, Clone)]
pub struct Destination {
    pub label: &'static str,
    pub root: PathBuf,
}

/// A file that did not make it to one destination.
#[derive(Debug, Clone, Serialize)]
pub struct CopyFailure {
    pub relative_path: String,
    pub destination: String,
    pub reason: String,
}

impl fmt::Display for CopyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.relative_path, self.destination, self.reason)
    }
}

/// A source entry the scan found but could not offload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub relative_path: String,
    pub reason: String,
}

impl fmt::Display for SkippedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} skipped: {}", self.relative_path, self.reason)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationReport {
    pub label: String,
    pub root: PathBuf,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub manifest_path: Option<PathBuf>,
    pub failures: Vec<CopyFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OffloadResult {
    pub success: bool,
    pub outcome: Outcome,
    /// Source entries found, including skipped ones
    pub total_files: u64,
    /// Source files that reached every configured destination
    pub files_processed: u64,
    /// Sum of sizes of `files_processed`
    pub bytes_copied: u64,
    pub duration: Duration,
    pub destinations: Vec<DestinationReport>,
    /// Source entries left behind on every destination
    pub skipped: Vec<SkippedEntry>,
    pub error_message: Option<String>,
}

impl OffloadResult {
    pub fn manifest_paths(&self) -> Vec<PathBuf> {
        self.destinations
            .iter()
            .filter_map(|d| d.manifest_path.clone())
            .collect()
    }

    pub fn manifest_path(&self, label: &str) -> Option<&Path> {
        self.destinations
            .iter()
            .find(|d| d.label == label)
            .and_then(|d| d.manifest_path.as_deref())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CopyFailure> {
        self.destinations.iter().flat_map(|d| d.failures.iter())
    }
}

/// Reason a file failed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MismatchReason {
    /// Listed in the manifest but absent on disk
    Missing,
    /// Content hash differs from the manifest
    HashMismatch,
    /// Present but could not be read back
    Unreadable(String),
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchReason::Missing => write!(f, "missing"),
            MismatchReason::HashMismatch => write!(f, "hash mismatch"),
            MismatchReason::Unreadable(e) => write!(f, "unreadable: {}", e),
        }
    }
}

/// Details of a file that failed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMismatch {
    pub relative_path: String,
    pub reason: MismatchReason,
}

impl fmt::Display for FileMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.relative_path, self.reason)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub success: bool,
    pub outcome: Outcome,
    pub target: PathBuf,
    pub manifest_path: PathBuf,
    /// Files whose hash matched the manifest
    pub files_verified: u64,
    pub bytes_verified: u64,
    pub mismatch_count: u64,
    /// Sorted by path
    pub mismatched_files: Vec<FileMismatch>,
    pub duration: Duration,
    pub error_message: Option<String>,
}
