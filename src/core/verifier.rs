use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::hasher::{DEFAULT_BUFFER_SIZE, hash_file};
use crate::core::manifest::{self, ManifestEntry, find_latest_manifest, read_manifest};
use crate::core::models::{FileMismatch, MismatchReason, Outcome, VerifyResult};
use crate::core::offload::DEFAULT_MAX_CONCURRENT;
use crate::core::progress::{OffloadProgress, ProgressTracker};
use crate::error::{Error, Result};

/// Maximum mismatches spelled out in an error message
const MAX_REPORTED_MISMATCHES: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    pub max_concurrent: usize,
    pub buffer_size: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Verify `target` against the most recent manifest inside it.
pub async fn verify(
    target: &Path,
    options: &VerifyOptions,
    tx: mpsc::Sender<OffloadProgress>,
    cancel: CancellationToken,
) -> Result<VerifyResult> {
    check_target(target)?;

    let manifest_path = find_latest_manifest(target)?.ok_or_else(|| Error::NotFound {
        what: "Manifest",
        path: target.to_path_buf(),
    })?;

    verify_with_manifest(target, &manifest_path, options, tx, cancel).await
}

/// Verify `target` against a specific manifest file.
///
/// Every entry is re-hashed from disk and compared with the recorded hash.
/// Only files that match count as verified.
pub async fn verify_with_manifest(
    target: &Path,
    manifest_path: &Path,
    options: &VerifyOptions,
    tx: mpsc::Sender<OffloadProgress>,
    cancel: CancellationToken,
) -> Result<VerifyResult> {
    check_target(target)?;
    if options.max_concurrent == 0 {
        return Err(Error::Configuration(
            "max_concurrent must be at least 1".into(),
        ));
    }
    if !manifest_path.is_file() {
        return Err(Error::NotFound {
            what: "Manifest",
            path: manifest_path.to_path_buf(),
        });
    }

    let span = info_span!(
        "verify",
        target = %target.display(),
        manifest = %manifest_path.display(),
    );

    run_verify(
        target.to_path_buf(),
        manifest_path.to_path_buf(),
        *options,
        tx,
        cancel,
    )
    .instrument(span)
    .await
}

fn check_target(target: &Path) -> Result<()> {
    if target.as_os_str().is_empty() {
        return Err(Error::Configuration("no target directory given".into()));
    }
    if !target.is_dir() {
        return Err(Error::NotFound {
            what: "Target directory",
            path: target.to_path_buf(),
        });
    }
    Ok(())
}

/// Outcome of checking a single manifest entry
enum Check {
    Passed,
    Failed(MismatchReason),
    Cancelled,
}

async fn run_verify(
    target: PathBuf,
    manifest_path: PathBuf,
    options: VerifyOptions,
    tx: mpsc::Sender<OffloadProgress>,
    cancel: CancellationToken,
) -> Result<VerifyResult> {
    let started = Instant::now();

    let owned = manifest_path.clone();
    let manifest = tokio::task::spawn_blocking(move || read_manifest(&owned))
        .await
        .map_err(|e| {
            Error::io(
                "Manifest task failed for",
                &manifest_path,
                std::io::Error::other(e),
            )
        })??;

    // A manifest cannot vouch for itself; every other listed file is checked
    let entries: Vec<ManifestEntry> = manifest
        .entries()
        .filter(|e| !lists_itself(&target, &manifest_path, &e.relative_path))
        .cloned()
        .collect();
    let total_bytes: u64 = entries.iter().map(|e| e.size).sum();

    info!(
        total_files = entries.len(),
        total_bytes,
        "Starting verification"
    );

    let tracker = Arc::new(ProgressTracker::new(entries.len() as u64, total_bytes));
    let semaphore = Arc::new(Semaphore::new(options.max_concurrent));
    let label = target.display().to_string();
    let mut jobs = JoinSet::new();

    for entry in entries {
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let tracker = tracker.clone();
        let tx = tx.clone();
        let path = manifest::resolve(&target, &entry.relative_path);
        let label = label.clone();

        jobs.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                return (entry, Check::Cancelled);
            };

            let expected = entry.hash.clone();
            let token = cancel.clone();
            let buffer_size = options.buffer_size;
            let check = tokio::task::spawn_blocking(move || {
                check_file(&path, &expected, buffer_size, &token)
            })
            .await
            .unwrap_or_else(|e| Check::Failed(MismatchReason::Unreadable(e.to_string())));
            drop(permit);

            let status = match &check {
                Check::Passed => Some(format!("Verified {}", entry.relative_path)),
                Check::Failed(reason) => {
                    warn!(file = %entry.relative_path, reason = %reason, "Verification mismatch");
                    Some(format!("Mismatch {} ({})", entry.relative_path, reason))
                }
                Check::Cancelled => None,
            };

            if let Some(status) = status {
                let counts = tracker.record(entry.size);
                let _ = tx
                    .send(tracker.snapshot(counts, &entry.relative_path, &label, status))
                    .await;
            }

            (entry, check)
        });
    }
    drop(tx);

    let mut files_verified = 0u64;
    let mut bytes_verified = 0u64;
    let mut mismatched_files = Vec::new();
    let mut lost_tasks = 0usize;

    while let Some(joined) = jobs.join_next().await {
        match joined {
            Ok((entry, Check::Passed)) => {
                debug!(file = %entry.relative_path, "Verified");
                files_verified += 1;
                bytes_verified += entry.size;
            }
            Ok((entry, Check::Failed(reason))) => mismatched_files.push(FileMismatch {
                relative_path: entry.relative_path,
                reason,
            }),
            Ok((_, Check::Cancelled)) => {}
            Err(e) => {
                error!(error = %e, "Verify task ended without reporting");
                lost_tasks += 1;
            }
        }
    }

    mismatched_files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    let mismatch_count = mismatched_files.len() as u64;

    let (outcome, error_message) = if cancel.is_cancelled() {
        (
            Outcome::Cancelled,
            Some(format!(
                "Verification cancelled after {} file(s)",
                files_verified + mismatch_count
            )),
        )
    } else if !mismatched_files.is_empty() || lost_tasks > 0 {
        (
            Outcome::Failed,
            Some(format_mismatch_error(&mismatched_files, lost_tasks)),
        )
    } else if files_verified == 0 {
        (
            Outcome::Failed,
            Some(format!(
                "No files verified: manifest {} lists no files",
                manifest_path.display()
            )),
        )
    } else {
        (Outcome::Completed, None)
    };

    let duration = started.elapsed();
    match outcome {
        Outcome::Completed => info!(
            files_verified,
            bytes_verified,
            duration_secs = duration.as_secs(),
            "Verification complete"
        ),
        Outcome::Failed => info!(
            files_verified,
            mismatches = mismatch_count,
            "Verification failed"
        ),
        Outcome::Cancelled => info!(files_verified, "Verification cancelled"),
    }

    Ok(VerifyResult {
        success: outcome == Outcome::Completed,
        outcome,
        target,
        manifest_path,
        files_verified,
        bytes_verified,
        mismatch_count,
        mismatched_files,
        duration,
        error_message,
    })
}

fn lists_itself(target: &Path, manifest_path: &Path, relative_path: &str) -> bool {
    let listed = manifest::resolve(target, relative_path);
    if !manifest::is_manifest_file(&listed) {
        return false;
    }
    listed == manifest_path
        || matches!(
            (listed.canonicalize(), manifest_path.canonicalize()),
            (Ok(a), Ok(b)) if a == b
        )
}

fn check_file(path: &Path, expected: &str, buffer_size: usize, cancel: &CancellationToken) -> Check {
    match path.symlink_metadata() {
        Ok(m) if m.is_file() => {}
        Ok(_) => return Check::Failed(MismatchReason::Unreadable("not a regular file".into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Check::Failed(MismatchReason::Missing);
        }
        Err(e) => return Check::Failed(MismatchReason::Unreadable(e.to_string())),
    }

    match hash_file(path, buffer_size, Some(cancel)) {
        Ok(actual) if actual.eq_ignore_ascii_case(expected) => Check::Passed,
        Ok(_) => Check::Failed(MismatchReason::HashMismatch),
        Err(Error::Cancelled) => Check::Cancelled,
        Err(e) => Check::Failed(MismatchReason::Unreadable(e.to_string())),
    }
}

/// Format mismatch errors into a human-readable message
fn format_mismatch_error(mismatches: &[FileMismatch], lost_tasks: usize) -> String {
    let mut msg = format!(
        "Verification failed: {} file(s) did not match",
        mismatches.len() + lost_tasks
    );

    for m in mismatches.iter().take(MAX_REPORTED_MISMATCHES) {
        msg.push_str(&format!("\n  - {}", m));
    }

    if mismatches.len() > MAX_REPORTED_MISMATCHES {
        msg.push_str(&format!(
            "\n  ... and {} more",
            mismatches.len() - MAX_REPORTED_MISMATCHES
        ));
    }
    if lost_tasks > 0 {
        msg.push_str(&format!(
            "\n  - {} file(s) could not be checked",
            lost_tasks
        ));
    }

    msg
}
