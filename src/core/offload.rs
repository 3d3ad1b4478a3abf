//! Offload orchestration: scan the card, replicate its directory tree to one
//! or two destinations, copy every file through a bounded worker pool while
//! hashing it, and seal each destination with a manifest.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::copy::{CopiedFile, CopyError, CopyOptions, copy_file, remove_partial};
use crate::core::hasher::hash_file_async;
use crate::core::manifest::{CreatorInfo, Manifest, ManifestEntry, write_manifest, write_manifest_to};
use crate::core::models::{
    CopyFailure, Destination, DestinationReport, OffloadRequest, OffloadResult, OffloadState,
    Outcome, SkippedEntry,
};
use crate::core::progress::{OffloadProgress, ProgressTracker, format_bytes};
use crate::core::scan::{ScanOptions, ScanResult, replicate_directories, scan_directory};
use crate::error::{Error, Result};

/// Default size of the copy worker pool. Higher values made rotational and
/// network destinations appear to freeze.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Maximum failures spelled out in an error message
const MAX_REPORTED_ERRORS: usize = 10;

#[derive(Debug, Clone)]
pub struct OffloadOptions {
    /// Copy jobs admitted at once, across all destinations
    pub max_concurrent: usize,
    pub copy: CopyOptions,
    /// File name prefix for generated manifests
    pub manifest_prefix: String,
    /// Delete partial destination files left by failed or cancelled copies
    pub remove_partial_files: bool,
}

impl Default for OffloadOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            copy: CopyOptions::default(),
            manifest_prefix: "tandem".to_string(),
            remove_partial_files: false,
        }
    }
}

/// Run an offload.
///
/// Configuration problems and a missing source are returned as `Err` before
/// anything is written. Once copying starts the run always yields a result,
/// with per-file failures, cancellation and source loss reported through
/// `outcome` and `error_message`.
///
/// One progress event is sent per finished file per destination. Send errors
/// (receiver dropped) are ignored.
pub async fn offload(
    req: &OffloadRequest,
    options: &OffloadOptions,
    tx: mpsc::Sender<OffloadProgress>,
    cancel: CancellationToken,
) -> Result<OffloadResult> {
    validate_request(req, options)?;

    let span = info_span!(
        "offload",
        source = %req.source.display(),
        destination_a = %req.destination_a.display(),
        destination_b = ?req.destination_b.as_ref().map(|p| p.display().to_string()),
    );

    OffloadRun {
        req: req.clone(),
        options: options.clone(),
        destinations: req.destinations(),
        cancel,
    }
    .run(tx)
    .instrument(span)
    .await
}

fn validate_request(req: &OffloadRequest, options: &OffloadOptions) -> Result<()> {
    if options.max_concurrent == 0 {
        return Err(Error::Configuration(
            "max_concurrent must be at least 1".into(),
        ));
    }
    if req.source.as_os_str().is_empty() {
        return Err(Error::Configuration("no source directory given".into()));
    }
    if req.destination_a.as_os_str().is_empty() {
        return Err(Error::Configuration("destination A is not set".into()));
    }
    if !req.source.is_dir() {
        return Err(Error::NotFound {
            what: "Source directory",
            path: req.source.clone(),
        });
    }

    let source = absolute(&req.source);
    let destinations: Vec<_> = req
        .destinations()
        .into_iter()
        .map(|d| (d.label, absolute(&d.root)))
        .collect();

    for (label, root) in &destinations {
        if root.starts_with(&source) {
            return Err(Error::Configuration(format!(
                "destination {} ({}) is inside the source {}",
                label,
                root.display(),
                source.display()
            )));
        }
    }

    if let [(_, a), (_, b)] = destinations.as_slice() {
        if a == b {
            return Err(Error::Configuration(
                "destination A and destination B are the same directory".into(),
            ));
        }
    }

    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

struct OffloadRun {
    req: OffloadRequest,
    options: OffloadOptions,
    destinations: Vec<Destination>,
    cancel: CancellationToken,
}

/// One file bound for one destination
struct CopyJob {
    dest_index: usize,
    label: &'static str,
    source: PathBuf,
    target: PathBuf,
    relative: String,
}

struct JobReport {
    job: CopyJob,
    result: std::result::Result<CopiedFile, CopyError>,
}

/// Everything learned from the copy phase, per destination
struct DestinationState {
    destination: Destination,
    manifest: Manifest,
    bytes_copied: u64,
    failures: Vec<CopyFailure>,
    manifest_path: Option<PathBuf>,
}

impl OffloadRun {
    async fn run(self, tx: mpsc::Sender<OffloadProgress>) -> Result<OffloadResult> {
        let started = Instant::now();
        let start_date = Utc::now();
        info!(destinations = self.destinations.len(), "Starting offload");

        self.enter(OffloadState::ScanningSource);
        let scan = scan_directory(&self.req.source, ScanOptions::default()).await?;
        info!(
            total_files = scan.files.len(),
            total_bytes = scan.total_bytes,
            total_dirs = scan.directories.len(),
            skipped = scan.skipped.len(),
            "Scan complete"
        );
        for skipped in &scan.skipped {
            warn!(file = %skipped.relative_path, reason = %skipped.reason, "Source entry will not be copied");
        }

        self.transfer(scan, started, start_date, tx).await
    }

    /// Everything after the scan: directories, copies, manifests, outcome.
    async fn transfer(
        &self,
        scan: ScanResult,
        started: Instant,
        start_date: DateTime<Utc>,
        tx: mpsc::Sender<OffloadProgress>,
    ) -> Result<OffloadResult> {
        self.enter(OffloadState::ReplicatingDirectories);
        for destination in &self.destinations {
            replicate_directories(&self.req.source, &destination.root, &scan.directories).await?;
        }

        self.enter(OffloadState::CopyingFiles);
        let run_token = self.cancel.child_token();
        let (reports, source_lost, lost_tasks) = self.copy_all(&scan, tx, &run_token).await;

        let mut states: Vec<DestinationState> = self
            .destinations
            .iter()
            .map(|d| DestinationState {
                destination: d.clone(),
                manifest: Manifest::new(CreatorInfo::current(start_date)),
                bytes_copied: 0,
                failures: Vec::new(),
                manifest_path: None,
            })
            .collect();

        let mut arrivals: HashMap<String, usize> = HashMap::new();
        for report in reports {
            self.absorb(report, &mut states, &mut arrivals);
        }

        let cancelled = self.cancel.is_cancelled();
        let mut manifest_errors = Vec::new();

        if cancelled {
            warn!("Offload cancelled, skipping manifests");
        } else {
            self.enter(OffloadState::WritingManifests);
            for state in &mut states {
                match self.seal(state).await {
                    Ok(path) => state.manifest_path = Some(path),
                    Err(e) => {
                        error!(
                            destination = state.destination.label,
                            error = %e,
                            "Failed to write manifest"
                        );
                        manifest_errors.push(format!(
                            "manifest for destination {}: {}",
                            state.destination.label, e
                        ));
                    }
                }
            }
        }

        // A source file counts once it reached every destination
        let needed = self.destinations.len();
        let complete: Vec<_> = scan
            .files
            .iter()
            .filter(|f| arrivals.get(&f.relative) == Some(&needed))
            .collect();
        let files_processed = complete.len() as u64;
        let bytes_copied: u64 = complete.iter().map(|f| f.size).sum();
        let total_files = (scan.files.len() + scan.skipped.len()) as u64;

        let failures: Vec<&CopyFailure> = states.iter().flat_map(|s| s.failures.iter()).collect();
        let mut problems = unaccounted_files(&scan, &arrivals, &failures, needed);
        problems.extend(manifest_errors);

        let (outcome, error_message) = if cancelled {
            (
                Outcome::Cancelled,
                Some(format!(
                    "Offload cancelled after {} of {} files",
                    files_processed, total_files
                )),
            )
        } else if let Some(reason) = source_lost {
            (
                Outcome::Failed,
                Some(format!("Source lost during offload: {}", reason)),
            )
        } else if !failures.is_empty()
            || !scan.skipped.is_empty()
            || lost_tasks > 0
            || !problems.is_empty()
        {
            (
                Outcome::Failed,
                Some(summarize_failures(
                    &failures,
                    &scan.skipped,
                    lost_tasks,
                    &problems,
                )),
            )
        } else {
            (Outcome::Completed, None)
        };

        let duration = started.elapsed();
        self.finish(outcome, files_processed, bytes_copied, duration);

        Ok(OffloadResult {
            success: outcome == Outcome::Completed,
            outcome,
            total_files,
            files_processed,
            bytes_copied,
            duration,
            destinations: states
                .into_iter()
                .map(|s| DestinationReport {
                    label: s.destination.label.to_string(),
                    root: s.destination.root,
                    files_copied: s.manifest.len() as u64,
                    bytes_copied: s.bytes_copied,
                    manifest_path: s.manifest_path,
                    failures: s.failures,
                })
                .collect(),
            skipped: scan.skipped,
            error_message,
        })
    }

    /// Fan copy jobs out over the worker pool and join every one of them.
    ///
    /// Returns the per-job reports, the reason the source disappeared (if it
    /// did), and the number of tasks that died without reporting.
    async fn copy_all(
        &self,
        scan: &ScanResult,
        tx: mpsc::Sender<OffloadProgress>,
        run_token: &CancellationToken,
    ) -> (Vec<JobReport>, Option<String>, usize) {
        let dest_count = self.destinations.len() as u64;
        let tracker = Arc::new(ProgressTracker::new(
            scan.files.len() as u64 * dest_count,
            scan.total_bytes * dest_count,
        ));
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent));
        let mut jobs = JoinSet::new();

        for file in &scan.files {
            for (dest_index, destination) in self.destinations.iter().enumerate() {
                let job = CopyJob {
                    dest_index,
                    label: destination.label,
                    source: file.path.clone(),
                    target: destination.root.join(&file.relative_path),
                    relative: file.relative.clone(),
                };
                jobs.spawn(run_copy_job(
                    job,
                    semaphore.clone(),
                    run_token.clone(),
                    tracker.clone(),
                    tx.clone(),
                    self.options.copy,
                ));
            }
        }
        drop(tx);

        let mut reports = Vec::with_capacity(jobs.len());
        let mut source_lost = None;
        let mut lost_tasks = 0;

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(mut report) => {
                    if let Err(e) = &mut report.result {
                        if e.error.is_device_removed() && source_lost.is_none() {
                            if source_root_present(&self.req.source).await {
                                // One bad or vanished file, the card itself is still there
                                e.error = std::mem::replace(&mut e.error, Error::Cancelled)
                                    .into_file_error();
                            } else {
                                error!(
                                    file = %report.job.relative,
                                    error = %e.error,
                                    "Source device lost, stopping remaining copies"
                                );
                                source_lost = Some(e.error.to_string());
                                run_token.cancel();
                            }
                        }
                    }
                    reports.push(report);
                }
                Err(e) => {
                    error!(error = %e, "Copy task ended without reporting");
                    lost_tasks += 1;
                }
            }
        }

        (reports, source_lost, lost_tasks)
    }

    /// Fold one job report into its destination's manifest or failure list.
    fn absorb(
        &self,
        report: JobReport,
        states: &mut [DestinationState],
        arrivals: &mut HashMap<String, usize>,
    ) {
        let JobReport { job, result } = report;
        let state = &mut states[job.dest_index];

        match result {
            Ok(copied) => {
                state.bytes_copied += copied.bytes_copied;
                *arrivals.entry(job.relative.clone()).or_default() += 1;
                state.manifest.insert(ManifestEntry {
                    relative_path: job.relative,
                    size: copied.bytes_copied,
                    last_modified: copied.modified,
                    hash: copied.hash,
                });
            }
            Err(e) => {
                if e.partial && self.options.remove_partial_files {
                    remove_partial(&job.target);
                }
                // Jobs stopped by the token are not failures of their own
                if !e.error.is_cancelled() {
                    state.failures.push(CopyFailure {
                        relative_path: job.relative,
                        destination: job.label.to_string(),
                        reason: e.error.to_string(),
                    });
                }
            }
        }
    }

    /// Write the destination's manifest. Only called after every copy job
    /// has been joined.
    async fn seal(&self, state: &mut DestinationState) -> Result<PathBuf> {
        state.manifest.creator.finish_date = Some(Utc::now());
        let manifest = state.manifest.clone();
        let root = state.destination.root.clone();
        let prefix = self.options.manifest_prefix.clone();

        let path = tokio::task::spawn_blocking(move || write_manifest(&manifest, &root, &prefix))
            .await
            .map_err(|e| {
                Error::io(
                    "Manifest task failed for",
                    &state.destination.root,
                    std::io::Error::other(e),
                )
            })??;

        info!(
            destination = state.destination.label,
            manifest = %path.display(),
            entries = state.manifest.len(),
            "Manifest written"
        );
        Ok(path)
    }

    fn enter(&self, state: OffloadState) {
        info!(state = ?state, "Offload state changed");
    }

    fn finish(&self, outcome: Outcome, files: u64, bytes: u64, duration: Duration) {
        let secs = duration.as_secs_f64();
        let speed_mbps = if secs > 0.0 {
            bytes as f64 / (1024.0 * 1024.0) / secs
        } else {
            0.0
        };

        match outcome {
            Outcome::Completed => {
                self.enter(OffloadState::Completed);
                info!(
                    files,
                    total_bytes = bytes,
                    duration_secs = duration.as_secs(),
                    speed_mbps = format!("{:.2}", speed_mbps),
                    "Offload complete"
                );
            }
            Outcome::Failed => {
                self.enter(OffloadState::Failed);
                warn!(files, total_bytes = bytes, "Offload finished with errors");
            }
            Outcome::Cancelled => {
                info!(files, total_bytes = %format_bytes(bytes), "Offload cancelled");
            }
        }
    }
}

async fn source_root_present(root: &Path) -> bool {
    match tokio::fs::metadata(root).await {
        Ok(metadata) => metadata.is_dir(),
        Err(_) => false,
    }
}

/// Source files whose arrival count does not match the destinations they
/// were sent to, without a recorded failure explaining why.
fn unaccounted_files(
    scan: &ScanResult,
    arrivals: &HashMap<String, usize>,
    failures: &[&CopyFailure],
    needed: usize,
) -> Vec<String> {
    let failed: HashSet<&str> = failures.iter().map(|f| f.relative_path.as_str()).collect();

    scan.files
        .iter()
        .filter_map(|file| {
            let arrived = arrivals.get(&file.relative).copied().unwrap_or(0);
            if arrived > needed {
                Some(format!(
                    "{} was written {} times for {} destination(s)",
                    file.relative, arrived, needed
                ))
            } else if arrived < needed && !failed.contains(file.relative.as_str()) {
                Some(format!("{} did not reach every destination", file.relative))
            } else {
                None
            }
        })
        .collect()
}

async fn run_copy_job(
    job: CopyJob,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: Arc<ProgressTracker>,
    tx: mpsc::Sender<OffloadProgress>,
    copy_options: CopyOptions,
) -> JobReport {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };

    let Some(permit) = permit else {
        return JobReport {
            job,
            result: Err(CopyError {
                error: Error::Cancelled,
                partial: false,
            }),
        };
    };

    debug!(file = %job.relative, destination = job.label, "Copying file");

    let (source, target, token) = (job.source.clone(), job.target.clone(), cancel.clone());
    let result = tokio::task::spawn_blocking(move || {
        copy_file(&source, &target, &copy_options, &token)
    })
    .await
    .unwrap_or_else(|e| {
        Err(CopyError {
            error: Error::io("Copy task failed for", &job.target, std::io::Error::other(e)),
            partial: true,
        })
    });
    drop(permit);

    match &result {
        Ok(copied) => {
            let counts = tracker.record(copied.bytes_copied);
            let status = format!(
                "Copied {} to {} ({}/{})",
                job.relative,
                job.label,
                counts.1,
                tracker.total_files()
            );
            let _ = tx
                .send(tracker.snapshot(counts, &job.relative, job.label, status))
                .await;
        }
        Err(e) if e.error.is_cancelled() => {}
        Err(e) => {
            error!(
                file = %job.relative,
                destination = job.label,
                error = %e.error,
                "Failed to copy file"
            );
            let counts = (tracker.bytes_done(), tracker.files_done());
            let status = format!("Failed {} to {}: {}", job.relative, job.label, e.error);
            let _ = tx
                .send(tracker.snapshot(counts, &job.relative, job.label, status))
                .await;
        }
    }

    JobReport { job, result }
}

fn summarize_failures(
    failures: &[&CopyFailure],
    skipped: &[SkippedEntry],
    lost_tasks: usize,
    problems: &[String],
) -> String {
    let total = failures.len() + skipped.len() + lost_tasks + problems.len();
    let mut msg = format!("Offload completed with {} error(s)", total);

    let listed: Vec<String> = skipped
        .iter()
        .map(ToString::to_string)
        .chain(failures.iter().map(ToString::to_string))
        .collect();
    for line in listed.iter().take(MAX_REPORTED_ERRORS) {
        msg.push_str(&format!("\n  - {}", line));
    }
    if listed.len() > MAX_REPORTED_ERRORS {
        msg.push_str(&format!(
            "\n  ... and {} more",
            listed.len() - MAX_REPORTED_ERRORS
        ));
    }
    if lost_tasks > 0 {
        msg.push_str(&format!(
            "\n  - {} copy task(s) ended without reporting",
            lost_tasks
        ));
    }
    for problem in problems {
        msg.push_str(&format!("\n  - {}", problem));
    }
    msg
}

/// Hash every file under `directory` and write a manifest for it.
///
/// The manifest goes to `output` when given, otherwise to a fresh
/// timestamped file inside `directory`. Existing `*.mhl` files are not
/// listed. Any unreadable file fails the whole call.
pub async fn generate_manifest(
    directory: &Path,
    output: Option<&Path>,
    options: &OffloadOptions,
    cancel: CancellationToken,
) -> Result<(PathBuf, Manifest)> {
    if !directory.is_dir() {
        return Err(Error::NotFound {
            what: "Directory",
            path: directory.to_path_buf(),
        });
    }
    if options.max_concurrent == 0 {
        return Err(Error::Configuration(
            "max_concurrent must be at least 1".into(),
        ));
    }

    let span = info_span!("generate_manifest", directory = %directory.display());
    async {
        let start_date = Utc::now();
        let scan = scan_directory(
            directory,
            ScanOptions {
                skip_manifests: true,
            },
        )
        .await?;
        info!(total_files = scan.files.len(), total_bytes = scan.total_bytes, "Hashing files");
        for skipped in &scan.skipped {
            warn!(file = %skipped.relative_path, reason = %skipped.reason, "Not listed in manifest");
        }

        let semaphore = Arc::new(Semaphore::new(options.max_concurrent));
        let buffer_size = options.copy.buffer_size;
        let mut jobs = JoinSet::new();

        for file in scan.files {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            jobs.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    permit = semaphore.acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
                };

                let modified = tokio::fs::metadata(&file.path)
                    .await
                    .and_then(|m| m.modified())
                    .ok()
                    .map(DateTime::<Utc>::from);
                let hash = hash_file_async(&file.path, buffer_size, Some(cancel)).await?;

                Ok::<_, Error>(ManifestEntry {
                    relative_path: file.relative,
                    size: file.size,
                    last_modified: modified,
                    hash,
                })
            });
        }

        let mut manifest = Manifest::new(CreatorInfo::current(start_date));
        while let Some(joined) = jobs.join_next().await {
            let entry = joined.map_err(|e| {
                Error::io("Hashing task failed in", directory, std::io::Error::other(e))
            })??;
            manifest.insert(entry);
        }
        manifest.creator.finish_date = Some(Utc::now());

        let owned_manifest = manifest.clone();
        let owned_output = output.map(Path::to_path_buf);
        let owned_dir = directory.to_path_buf();
        let prefix = options.manifest_prefix.clone();
        let path = tokio::task::spawn_blocking(move || match owned_output {
            Some(path) => write_manifest_to(&owned_manifest, &path).map(|_| path),
            None => write_manifest(&owned_manifest, &owned_dir, &prefix),
        })
        .await
        .map_err(|e| Error::io("Manifest task failed for", directory, std::io::Error::other(e)))??;

        info!(
            manifest = %path.display(),
            entries = manifest.len(),
            "Manifest generated"
        );
        Ok((path, manifest))
    }
    .instrument(span)
    .await
}
