//! Durable snapshot storage.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::snapshot::Snapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("snapshot version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("incompatible snapshot: {0}")]
    Incompatible(String),
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// Snapshot kept in a JSON file, replaced atomically on save.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => Snapshot::from_json(&json).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let json = snapshot.to_json()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, json.as_bytes()).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!(
            path = %self.path.display(),
            block = snapshot.latest_processed_block,
            "snapshot saved"
        );
        Ok(())
    }
}

/// In-memory store holding the serialized snapshot.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    json: Mutex<Option<String>>,
    saves: Mutex<u64>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contents(&self) -> Option<String> {
        self.json.lock().await.clone()
    }

    pub async fn save_count(&self) -> u64 {
        *self.saves.lock().await
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        match self.json.lock().await.as_deref() {
            Some(json) => Snapshot::from_json(json).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let json = snapshot.to_json()?;
        *self.json.lock().await = Some(json);
        *self.saves.lock().await += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SyncCursor;
    use zkrep_ledger::{LedgerState, ProtocolConfig};

    fn sample_snapshot(block: u64) -> Snapshot {
        let cursor = SyncCursor {
            start_block: Some(1),
            latest_processed_block: block,
            latest_known_block: Some(block),
        };
        Snapshot::capture(&cursor, &LedgerState::new(ProtocolConfig::default()))
    }

    #[tokio::test]
    async fn test_file_store_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("snapshot.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("nested/snapshot.json"));
        store.save(&sample_snapshot(5)).await.unwrap();
        store.save(&sample_snapshot(9)).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.latest_processed_block, 9);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileSnapshotStore::new(path);
        assert!(matches!(store.load().await, Err(StoreError::Codec(_))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&sample_snapshot(3)).await.unwrap();
        assert_eq!(store.save_count().await, 1);
        assert!(store.contents().await.unwrap().contains("latestProcessedBlock"));
        assert_eq!(store.load().await.unwrap().unwrap().latest_processed_block, 3);
    }
}
