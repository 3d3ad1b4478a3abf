use std::path::PathBuf;

use chrono::Utc;
use tandem::config::AppConfig;
use tandem::context::AppContext;
use tandem::core::{OffloadRequest, Orchestrator};
use tandem::history::{HistoryEntry, HistoryStore};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn entry(n: u64, success: bool) -> HistoryEntry {
    HistoryEntry {
        timestamp: Utc::now(),
        source_path: PathBuf::from("/media/card"),
        destination_paths: vec![PathBuf::from("/mnt/raid"), PathBuf::from("/mnt/shuttle")],
        files_count: n,
        total_bytes: n * 1000,
        duration_ms: 10,
        manifest_paths: Vec::new(),
        success,
        error_message: (!success).then(|| "disk full".to_string()),
    }
}

#[tokio::test]
async fn test_history_bound_keeps_most_recent() {
    let temp = tempdir().unwrap();
    let store = HistoryStore::new(temp.path().join("history.json"), 100);

    for i in 0..105 {
        store.append(entry(i, true)).await.unwrap();
    }

    let entries = store.list().await;
    assert_eq!(entries.len(), 100);
    assert_eq!(entries[0].files_count, 104);
    assert_eq!(entries[99].files_count, 5);
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("history.json");

    {
        let store = HistoryStore::new(&path, 100);
        store.append(entry(1, true)).await.unwrap();
        store.append(entry(2, false)).await.unwrap();
    }

    let store = HistoryStore::new(&path, 100);
    let entries = store.list().await;
    assert_eq!(entries.len(), 2);
    assert!(!entries[0].success);
    assert_eq!(entries[0].error_message.as_deref(), Some("disk full"));
    assert!(entries[1].error_message.is_none());
}

#[tokio::test]
async fn test_offload_through_orchestrator_is_recorded() {
    let temp = tempdir().unwrap();
    let card = temp.path().join("card");
    std::fs::create_dir_all(&card).unwrap();

    let config = AppConfig {
        history_path: temp.path().join("history.json"),
        sync_files: false,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(AppContext::new(config));

    // An empty card still completes, with an empty manifest
    let (tx, _rx) = mpsc::channel(4);
    let req = OffloadRequest::new(&card, temp.path().join("raid"), None);
    let result = orchestrator
        .offload(&req, tx, CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.total_files, 0);

    let history = orchestrator.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source_path, card);
    assert_eq!(history[0].manifest_paths.len(), 1);
}
