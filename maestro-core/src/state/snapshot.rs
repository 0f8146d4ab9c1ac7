//! Snapshot persistence
//!
//! Durability is best effort: the state manager works without a store, and a
//! missing or unreadable snapshot just means starting empty.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::StateManager;
use super::types::StateSnapshot;
use crate::config::StateConfig;
use crate::error::StateError;

/// Somewhere a [`StateSnapshot`] can be loaded from and saved to
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last saved snapshot, `None` if nothing was saved yet
    async fn load(&self) -> Result<Option<StateSnapshot>, StateError>;

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError>;
}

/// Keeps the last snapshot in memory; useful in tests
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<StateSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, StateError> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

/// Pretty-printed JSON file, replaced atomically on save
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, StateError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Snapshot saved");
        Ok(())
    }
}

impl StateManager {
    /// Build a manager seeded from `store`, or empty when there is nothing
    /// usable to load
    pub async fn load_or_default(config: StateConfig, store: &dyn SnapshotStore) -> Self {
        let manager = Self::new(config);
        match store.load().await {
            Ok(Some(snapshot)) => manager.restore(snapshot),
            Ok(None) => debug!("No snapshot to restore"),
            Err(e) => warn!(error = %e, "Failed to load snapshot, starting empty"),
        }
        manager
    }

    /// Export and save a snapshot now
    pub async fn save_to(&self, store: &dyn SnapshotStore) -> Result<(), StateError> {
        let snapshot = self.export_snapshot();
        store.save(&snapshot).await
    }
}

/// Persist a snapshot every `interval` until `shutdown` fires, then once more
pub fn spawn_autosave(
    manager: Arc<StateManager>,
    store: Arc<dyn SnapshotStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = manager.save_to(store.as_ref()).await {
                        warn!(error = %e, "Autosave failed");
                    }
                }
            }
        }
        if let Err(e) = manager.save_to(store.as_ref()).await {
            warn!(error = %e, "Final snapshot save failed");
        } else {
            info!("Final snapshot saved");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStatus, Task, TaskType};
    use tempfile::TempDir;

    fn populated() -> StateManager {
        let manager = StateManager::default();
        manager.register_agent("local", AgentStatus::new("a1"));
        manager
            .add_task(Task::builder(TaskType::General, "work").id("t1").build())
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().await.unwrap().is_none());

        populated().save_to(&store).await.unwrap();

        let restored = StateManager::load_or_default(StateConfig::default(), &store).await;
        assert!(restored.agent("a1").is_some());
        assert!(restored.task("t1").is_some());
    }

    #[tokio::test]
    async fn file_store_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileSnapshotStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = JsonFileSnapshotStore::new(&path);

        populated().save_to(&store).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let loaded = store.load().await.unwrap().unwrap();
        assert!(loaded.agents.contains_key("a1"));
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_empty_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonFileSnapshotStore::new(&path);

        assert!(matches!(
            store.load().await,
            Err(StateError::Serialization(_))
        ));
        let manager = StateManager::load_or_default(StateConfig::default(), &store).await;
        assert!(manager.agents().is_empty());
    }

    #[tokio::test]
    async fn autosave_writes_final_snapshot_on_shutdown() {
        let manager = Arc::new(populated());
        let store = Arc::new(MemorySnapshotStore::new());
        let token = CancellationToken::new();

        let handle = spawn_autosave(
            manager.clone(),
            store.clone(),
            Duration::from_secs(3600),
            token.clone(),
        );
        token.cancel();
        handle.await.unwrap();

        let saved = store.load().await.unwrap().unwrap();
        assert!(saved.tasks.contains_key("t1"));
    }
}
