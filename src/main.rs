use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tandem::core::progress::{format_bytes, format_duration};
use tandem::core::{OffloadProgress, OffloadRequest, OffloadResult, Orchestrator, VerifyResult};
use tandem::logging::{self, LogConfig, LogThrottle};
use tandem::{config, context};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Dual-destination card offload with checksum manifests", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a card to one or two destinations and write a manifest to each
    Offload {
        source: PathBuf,
        destination_a: PathBuf,
        #[arg(long = "dest-b")]
        destination_b: Option<PathBuf>,
    },
    /// Re-hash a destination against its most recent manifest
    Verify { target: PathBuf },
    /// Write a manifest for an existing directory
    Manifest {
        directory: PathBuf,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Show or clear the offload history
    History {
        #[arg(long)]
        clear: bool,
    },
    /// Print the effective configuration
    Config,
}

/// CLI flags layered over the config file and environment.
#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(rename = "json_logs", skip_serializing_if = "Option::is_none")]
    #[arg(long = "json", global = true, num_args = 0..=1, default_missing_value = "true")]
    json: Option<bool>,

    #[serde(rename = "max_concurrent_copies", skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verify_after_copy: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config =
        config::AppConfig::new(Some(&cli.overrides)).context("Failed to load configuration")?;
    logging::init(LogConfig::from(&config));

    let orchestrator = Orchestrator::new(context::AppContext::new(config));

    let ok = match cli.command {
        Commands::Offload {
            source,
            destination_a,
            destination_b,
        } => {
            let req = OffloadRequest::new(source, destination_a, destination_b);
            run_offload(&orchestrator, &req).await.context("Offload failed")?
        }
        Commands::Verify { target } => run_verify(&orchestrator, &target)
            .await
            .context("Verification failed")?,
        Commands::Manifest { directory, output } => {
            run_manifest(&orchestrator, &directory, output.as_deref())
                .await
                .context("Failed to generate manifest")?
        }
        Commands::History { clear } => run_history(&orchestrator, clear).await?,
        Commands::Config => {
            print!("{}", orchestrator.context().config.to_toml()?);
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    warn!("Interrupted, cancelling");
                    token.cancel();
                }
            }
        }
    })
}

/// Log progress events, at most a couple per second.
fn log_progress(mut rx: mpsc::Receiver<OffloadProgress>) -> JoinHandle<()> {
    let throttle = LogThrottle::new(Duration::from_millis(500));

    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            let done = progress.files_processed == progress.total_files;
            if done || throttle.should_log() {
                info!(
                    file = %progress.current_file,
                    destination = %progress.current_destination,
                    files = format!("{}/{}", progress.files_processed, progress.total_files),
                    percent = format!("{:.1}", progress.percentage()),
                    speed = format!("{}/s", format_bytes(progress.throughput_bytes_per_sec as u64)),
                    eta = %format_duration(progress.estimated_time_remaining),
                    "{}",
                    progress.status
                );
            }
        }
    })
}

async fn run_offload(orchestrator: &Orchestrator, req: &OffloadRequest) -> Result<bool> {
    let cancel = CancellationToken::new();
    let signal = cancel_on_ctrl_c(cancel.clone());
    let (tx, rx) = mpsc::channel(64);
    let logger = log_progress(rx);

    let result = orchestrator.offload(req, tx, cancel.clone()).await;
    cancel.cancel();
    let _ = tokio::join!(signal, logger);

    let result = result?;
    print_offload(&result);
    Ok(result.success)
}

fn print_offload(result: &OffloadResult) {
    println!(
        "{:?}: {}/{} files, {} in {}",
        result.outcome,
        result.files_processed,
        result.total_files,
        format_bytes(result.bytes_copied),
        format_duration(result.duration)
    );
    for destination in &result.destinations {
        println!(
            "  {} {} ({} files)",
            destination.label,
            destination.root.display(),
            destination.files_copied
        );
        if let Some(manifest) = &destination.manifest_path {
            println!("    manifest: {}", manifest.display());
        }
    }
    if let Some(message) = &result.error_message {
        println!("{}", message);
    }
}

async fn run_verify(orchestrator: &Orchestrator, target: &Path) -> Result<bool> {
    let cancel = CancellationToken::new();
    let signal = cancel_on_ctrl_c(cancel.clone());
    let (tx, rx) = mpsc::channel(64);
    let logger = log_progress(rx);

    let result = orchestrator.verify(target, tx, cancel.clone()).await;
    cancel.cancel();
    let _ = tokio::join!(signal, logger);

    let result = result?;
    print_verify(&result);
    Ok(result.success)
}

fn print_verify(result: &VerifyResult) {
    println!(
        "{:?}: {} verified, {} mismatched ({}) against {}",
        result.outcome,
        result.files_verified,
        result.mismatch_count,
        format_bytes(result.bytes_verified),
        result.manifest_path.display()
    );
    for mismatch in &result.mismatched_files {
        println!("  {}", mismatch);
    }
    if result.mismatched_files.is_empty() {
        if let Some(message) = &result.error_message {
            println!("{}", message);
        }
    }
}

async fn run_manifest(
    orchestrator: &Orchestrator,
    directory: &Path,
    output: Option<&Path>,
) -> Result<bool> {
    let cancel = CancellationToken::new();
    let signal = cancel_on_ctrl_c(cancel.clone());

    let result = orchestrator.generate_manifest(directory, output, cancel.clone()).await;
    cancel.cancel();
    let _ = signal.await;

    let (path, manifest) = result?;
    println!(
        "{} entries, {} -> {}",
        manifest.len(),
        format_bytes(manifest.total_bytes()),
        path.display()
    );
    Ok(true)
}

async fn run_history(orchestrator: &Orchestrator, clear: bool) -> Result<bool> {
    if clear {
        orchestrator
            .clear_history()
            .await
            .context("Failed to clear history")?;
        println!("History cleared");
        return Ok(true);
    }

    let entries = orchestrator.history().await;
    if entries.is_empty() {
        println!("No offloads recorded");
    }
    for entry in entries {
        let destinations: Vec<_> = entry
            .destination_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        println!(
            "{}  {}  {} -> {}  {} files, {}, {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            if entry.success { "ok    " } else { "FAILED" },
            entry.source_path.display(),
            destinations.join(", "),
            entry.files_count,
            format_bytes(entry.total_bytes),
            format_duration(Duration::from_millis(entry.duration_ms))
        );
        if let Some(message) = entry.error_message.as_deref().and_then(|m| m.lines().next()) {
            println!("    {}", message);
        }
    }
    Ok(true)
}
