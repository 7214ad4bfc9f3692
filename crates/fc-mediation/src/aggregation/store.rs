//! Durable stores backing the recoverable repository

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fc_common::Exchange;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// An aggregated exchange as persisted, with the key it was grouped under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredExchange {
    pub correlation_key: String,
    /// Set once the group was completed and is awaiting confirmation
    #[serde(default)]
    pub completed: bool,
    pub exchange: Exchange,
}

/// Exchange storage keyed by exchange id
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn put(&self, entry: &StoredExchange) -> Result<()>;

    async fn delete(&self, exchange_id: &str) -> Result<()>;

    /// Read and delete in one step
    async fn take(&self, exchange_id: &str) -> Result<Option<StoredExchange>>;

    async fn ids(&self) -> Result<HashSet<String>>;
}

/// Process-local store, mainly for tests
#[derive(Default)]
pub struct InMemoryDurableStore {
    entries: Mutex<HashMap<String, StoredExchange>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn put(&self, entry: &StoredExchange) -> Result<()> {
        self.entries
            .lock()
            .insert(entry.exchange.id().to_string(), entry.clone());
        Ok(())
    }

    async fn delete(&self, exchange_id: &str) -> Result<()> {
        self.entries.lock().remove(exchange_id);
        Ok(())
    }

    async fn take(&self, exchange_id: &str) -> Result<Option<StoredExchange>> {
        Ok(self.entries.lock().remove(exchange_id))
    }

    async fn ids(&self) -> Result<HashSet<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

/// One JSON file per exchange id in a directory
pub struct FileDurableStore {
    dir: PathBuf,
    take_lock: tokio::sync::Mutex<()>,
}

const EXTENSION: &str = "json";

impl FileDurableStore {
    /// Open (and create if needed) a store directory
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened aggregation store");
        Ok(Self {
            dir,
            take_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, exchange_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", exchange_id, EXTENSION))
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn put(&self, entry: &StoredExchange) -> Result<()> {
        let path = self.path_for(entry.exchange.id());
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec(entry)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, exchange_id: &str) -> Result<()> {
        remove_if_exists(&self.path_for(exchange_id)).await?;
        Ok(())
    }

    async fn take(&self, exchange_id: &str) -> Result<Option<StoredExchange>> {
        let _guard = self.take_lock.lock().await;
        let path = self.path_for(exchange_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: StoredExchange = serde_json::from_slice(&bytes)?;
        remove_if_exists(&path).await?;
        Ok(Some(entry))
    }

    async fn ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.insert(stem.to_string());
            }
        }
        Ok(ids)
    }
}
