use anyhow::{Context, Result};
use async_trait::async_trait;
use hoppmesh_protocol::Message;
use hoppmesh_routing::{MessageStore, PathStats, PerformanceLedger, RoutingError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Outbox of messages waiting for a route, one JSON file per message
pub struct FileMessageStore {
    dir: PathBuf,
}

impl FileMessageStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create outbox {}", dir.display()))?;
        info!("Outbox: {}", dir.display());
        Ok(Self { dir })
    }

    fn path_for(&self, message: &Message) -> PathBuf {
        self.dir.join(format!("{}.json", message.id.to_hex()))
    }

    /// Number of messages currently on disk
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.message_files().await?.len())
    }

    async fn message_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Move an unreadable entry out of the way, or delete it if it cannot
    /// be moved, so later releases do not trip over it again
    async fn quarantine(path: &Path) {
        let target = path.with_extension("corrupt");
        if let Err(e) = fs::rename(path, &target).await {
            warn!(
                "Failed to move {} to {}: {}, removing it",
                path.display(),
                target.display(),
                e
            );
            if let Err(e) = fs::remove_file(path).await {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    async fn read_message(path: &Path) -> Result<Message> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn store(&self, message: &Message) -> hoppmesh_routing::Result<()> {
        let bytes = serde_json::to_vec_pretty(message)
            .map_err(|e| RoutingError::Storage(e.to_string()))?;
        let path = self.path_for(message);
        fs::write(&path, bytes)
            .await
            .map_err(|e| RoutingError::Storage(format!("{}: {}", path.display(), e)))?;
        debug!("Stored message {} in outbox", message.id);
        Ok(())
    }

    async fn take_stored(&self) -> hoppmesh_routing::Result<Vec<Message>> {
        let files = self
            .message_files()
            .await
            .map_err(|e| RoutingError::Storage(format!("{}: {}", self.dir.display(), e)))?;

        let mut messages = Vec::with_capacity(files.len());
        for path in files {
            match Self::read_message(&path).await {
                Ok(message) => {
                    if let Err(e) = fs::remove_file(&path).await {
                        // left on disk it would be released twice
                        warn!("Keeping {} in outbox: {}", path.display(), e);
                        continue;
                    }
                    messages.push(message);
                }
                Err(e) => {
                    warn!("Unreadable outbox entry {}: {}", path.display(), e);
                    Self::quarantine(&path).await;
                }
            }
        }

        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }
}

/// Load learned path history, or an empty ledger if none was saved yet
pub async fn load_ledger(path: &Path, capacity: usize) -> Result<PerformanceLedger> {
    let mut ledger = PerformanceLedger::new(capacity);
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(ledger);
    }

    let bytes = fs::read(path)
        .await
        .with_context(|| format!("Failed to read ledger {}", path.display()))?;
    let entries: Vec<(String, PathStats)> =
        bincode::deserialize(&bytes).context("Failed to decode ledger")?;

    info!("Loaded {} learned paths from {}", entries.len(), path.display());
    ledger.import(entries);
    Ok(ledger)
}

/// Persist learned path history, replacing any earlier copy
pub async fn save_ledger(path: &Path, ledger: &PerformanceLedger) -> Result<()> {
    let bytes = bincode::serialize(&ledger.export()).context("Failed to encode ledger")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace ledger {}", path.display()))?;
    info!("Saved {} learned paths to {}", ledger.len(), path.display());
    Ok(())
}
