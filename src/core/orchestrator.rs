use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::manifest::Manifest;
use crate::core::models::{OffloadRequest, OffloadResult, Outcome, VerifyResult};
use crate::core::offload;
use crate::core::progress::OffloadProgress;
use crate::core::verifier;
use crate::error::Result;
use crate::history::{HistoryEntry, HistoryStore};

/// Entry point for every operation the CLI or an embedding UI needs.
/// Wires the configured options into the offload and verify engines and
/// keeps the history log up to date.
pub struct Orchestrator {
    ctx: AppContext,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    fn history_store(&self) -> &HistoryStore {
        &self.ctx.history
    }

    /// Offload a card, optionally verify every destination against its new
    /// manifest, and record the run in history unless it was cancelled.
    pub async fn offload(
        &self,
        req: &OffloadRequest,
        tx: mpsc::Sender<OffloadProgress>,
        cancel: CancellationToken,
    ) -> Result<OffloadResult> {
        let config = &self.ctx.config;
        let mut result = offload::offload(
            req,
            &config.offload_options(),
            tx.clone(),
            cancel.clone(),
        )
        .await?;

        if config.verify_after_copy && result.outcome == Outcome::Completed {
            self.verify_destinations(&mut result, tx, cancel).await;
        }

        if result.outcome != Outcome::Cancelled {
            let entry = HistoryEntry::from_result(&req.source, &result);
            if let Err(e) = self.history_store().append(entry).await {
                warn!(error = %e, "Failed to record offload in history");
            }
        }

        Ok(result)
    }

    /// Re-read each destination against the manifest just written for it.
    async fn verify_destinations(
        &self,
        result: &mut OffloadResult,
        tx: mpsc::Sender<OffloadProgress>,
        cancel: CancellationToken,
    ) {
        let options = self.ctx.config.verify_options();
        let mut problems = Vec::new();
        let mut cancelled = false;

        for destination in &result.destinations {
            let Some(manifest_path) = &destination.manifest_path else {
                continue;
            };
            info!(destination = %destination.label, "Verifying copy");

            match verifier::verify_with_manifest(
                &destination.root,
                manifest_path,
                &options,
                tx.clone(),
                cancel.clone(),
            )
            .await
            {
                Ok(verified) if verified.outcome == Outcome::Cancelled => {
                    cancelled = true;
                    problems.push(format!(
                        "destination {}: verification cancelled",
                        destination.label
                    ));
                    break;
                }
                Ok(verified) if verified.success => {}
                Ok(verified) => problems.push(format!(
                    "destination {}: {}",
                    destination.label,
                    verified.error_message.unwrap_or_default()
                )),
                Err(e) => problems.push(format!("destination {}: {}", destination.label, e)),
            }
        }

        if problems.is_empty() {
            return;
        }

        result.outcome = if cancelled {
            Outcome::Cancelled
        } else {
            Outcome::Failed
        };
        result.success = false;
        result.error_message = Some(format!(
            "Post-copy verification failed\n  - {}",
            problems.join("\n  - ")
        ));
    }

    pub async fn verify(
        &self,
        target: &Path,
        tx: mpsc::Sender<OffloadProgress>,
        cancel: CancellationToken,
    ) -> Result<VerifyResult> {
        verifier::verify(target, &self.ctx.config.verify_options(), tx, cancel).await
    }

    pub async fn generate_manifest(
        &self,
        directory: &Path,
        output: Option<&Path>,
        cancel: CancellationToken,
    ) -> Result<(PathBuf, Manifest)> {
        offload::generate_manifest(directory, output, &self.ctx.config.offload_options(), cancel)
            .await
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history_store().list().await
    }

    pub async fn add_history_entry(&self, entry: HistoryEntry) -> Result<()> {
        self.history_store().append(entry).await
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.history_store().clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tempfile::tempdir;

    fn orchestrator(root: &Path, verify_after_copy: bool) -> Orchestrator {
        let config = AppConfig {
            history_path: root.join("state/history.json"),
            sync_files: false,
            verify_after_copy,
            ..Default::default()
        };
        Orchestrator::new(AppContext::new(config))
    }

    fn seed_card(root: &Path) -> PathBuf {
        let card = root.join("card");
        std::fs::create_dir_all(card.join("CLIPS")).unwrap();
        std::fs::write(card.join("CLIPS/A001.mov"), vec![1u8; 4096]).unwrap();
        std::fs::write(card.join("T01.wav"), vec![2u8; 1024]).unwrap();
        card
    }

    async fn drained_offload(orch: &Orchestrator, req: &OffloadRequest) -> OffloadResult {
        let (tx, mut rx) = mpsc::channel(8);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = orch.offload(req, tx, CancellationToken::new()).await.unwrap();
        drain.await.unwrap();
        result
    }

    #[tokio::test]
    async fn test_offload_records_history() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(temp.path(), false);
        let card = seed_card(temp.path());

        let req = OffloadRequest::new(&card, temp.path().join("raid"), None);
        let result = drained_offload(&orch, &req).await;
        assert!(result.success);

        let history = orch.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].files_count, 2);
        assert_eq!(history[0].total_bytes, 4096 + 1024);
        assert_eq!(history[0].manifest_paths, result.manifest_paths());
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn test_offload_with_verify_after_copy() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(temp.path(), true);
        let card = seed_card(temp.path());

        let req = OffloadRequest::new(
            &card,
            temp.path().join("raid"),
            Some(temp.path().join("shuttle")),
        );
        let result = drained_offload(&orch, &req).await;

        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.manifest_paths().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_offload_not_recorded() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(temp.path(), false);
        let card = seed_card(temp.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(8);
        let req = OffloadRequest::new(&card, temp.path().join("raid"), None);
        let result = orch.offload(&req, tx, cancel).await.unwrap();

        assert_eq!(result.outcome, Outcome::Cancelled);
        assert!(orch.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_history_operations() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(temp.path(), false);
        let card = seed_card(temp.path());

        let req = OffloadRequest::new(&card, temp.path().join("raid"), None);
        let result = drained_offload(&orch, &req).await;

        let mut entry = HistoryEntry::from_result(&card, &result);
        entry.files_count = 99;
        orch.add_history_entry(entry).await.unwrap();

        let history = orch.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].files_count, 99);

        orch.clear_history().await.unwrap();
        assert!(orch.history().await.is_empty());
    }
}
