//! Audit log of past offloads, kept as one pretty-printed JSON array.
//!
//! The whole document is rewritten on every append. Reads never fail: a
//! missing or corrupt file is logged and treated as an empty history, so
//! history problems cannot block a copy or a verify.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::models::OffloadResult;
use crate::error::{Error, Result};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub source_path: PathBuf,
    pub destination_paths: Vec<PathBuf>,
    pub files_count: u64,
    pub total_bytes: u64,
    pub duration_ms: u64,
    pub manifest_paths: Vec<PathBuf>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl HistoryEntry {
    pub fn from_result(source: &Path, result: &OffloadResult) -> Self {
        Self {
            timestamp: Utc::now(),
            source_path: source.to_path_buf(),
            destination_paths: result.destinations.iter().map(|d| d.root.clone()).collect(),
            files_count: result.files_processed,
            total_bytes: result.bytes_copied,
            duration_ms: result.duration.as_millis() as u64,
            manifest_paths: result.manifest_paths(),
            success: result.success,
            error_message: result.error_message.clone(),
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries, most recent first.
    pub async fn list(&self) -> Vec<HistoryEntry> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Prepend `entry` and drop anything beyond the retention limit.
    ///
    /// A successful entry never carries an error message and a failed one
    /// always does; inconsistent entries are corrected before storing.
    pub async fn append(&self, mut entry: HistoryEntry) -> Result<()> {
        match (entry.success, entry.error_message.is_some()) {
            (true, true) => {
                warn!(error = ?entry.error_message, "Dropping error message from successful history entry");
                entry.error_message = None;
            }
            (false, false) => entry.error_message = Some("Offload failed".to_string()),
            _ => {}
        }

        let _guard = self.lock.lock().await;

        let mut entries = self.load().await;
        entries.insert(0, entry);
        entries.truncate(self.limit);

        self.store(&entries).await?;
        debug!(entries = entries.len(), path = %self.path.display(), "History updated");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.store(&[]).await?;
        info!(path = %self.path.display(), "History cleared");
        Ok(())
    }

    async fn load(&self) -> Vec<HistoryEntry> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read history, treating as empty");
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Vec<HistoryEntry>>(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "History file is corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    /// Write to a sibling temp file, then rename over the real one.
    async fn store(&self, entries: &[HistoryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io("Failed to create history directory", parent, e))?;
        }

        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| Error::io("Failed to serialize history for", &self.path, e.into()))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Error::io("Failed to write", &tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::io("Failed to replace", &self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn entry(files_count: u64) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now(),
            source_path: PathBuf::from("/media/card"),
            destination_paths: vec![PathBuf::from("/mnt/raid")],
            files_count,
            total_bytes: files_count * 1024,
            duration_ms: 1500,
            manifest_paths: vec![PathBuf::from("/mnt/raid/tandem_20240301_091500.mhl")],
            success: true,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::new(temp.path().join("history.json"), 100);
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_append_is_most_recent_first() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::new(temp.path().join("nested/history.json"), 100);

        store.append(entry(1)).await.unwrap();
        store.append(entry(2)).await.unwrap();

        let entries = store.list().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].files_count, 2);
        assert_eq!(entries[1].files_count, 1);
    }

    #[tokio::test]
    async fn test_retention_bound() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::new(temp.path().join("history.json"), 5);

        for i in 0..8 {
            store.append(entry(i)).await.unwrap();
        }

        let counts: Vec<_> = store.list().await.iter().map(|e| e.files_count).collect();
        assert_eq!(counts, [7, 6, 5, 4, 3]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_empty_and_recoverable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("history.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = HistoryStore::new(&path, 100);
        assert!(store.list().await.is_empty());

        store.append(entry(3)).await.unwrap();
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_append_keeps_message_consistent_with_success() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::new(temp.path().join("history.json"), 100);

        let mut ok_with_message = entry(1);
        ok_with_message.error_message = Some("stale".into());
        store.append(ok_with_message).await.unwrap();

        let mut failed_without_message = entry(2);
        failed_without_message.success = false;
        store.append(failed_without_message).await.unwrap();

        let entries = store.list().await;
        assert!(!entries[0].success);
        assert_eq!(entries[0].error_message.as_deref(), Some("Offload failed"));
        assert!(entries[1].success);
        assert!(entries[1].error_message.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let temp = tempdir().unwrap();
        let store = HistoryStore::new(temp.path().join("history.json"), 100);
        store.append(entry(1)).await.unwrap();

        store.clear().await.unwrap();
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_document_is_pretty_json_array() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("history.json");
        let store = HistoryStore::new(&path, 100);
        store.append(entry(1)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with('['));
        assert!(text.contains('\n'));
        assert!(!text.contains("error_message"));

        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0]["files_count"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_serialized() {
        let temp = tempdir().unwrap();
        let store = Arc::new(HistoryStore::new(temp.path().join("history.json"), 100));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.append(entry(i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.list().await.len(), 10);
    }
}
