use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::errors::ChatError;
use crate::store::{ChatStore, PersistedState};

/// Fixed key the snapshot is stored under.
pub const STORAGE_KEY: &str = "chat-store-v1";

/// JSON snapshot of the conversation collection on local disk.
#[derive(Debug, Clone)]
pub struct StateCache {
    path: PathBuf,
}

impl StateCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { path: dir.as_ref().join(format!("{STORAGE_KEY}.json")) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when there is nothing usable: no file yet, or a corrupt one.
    pub async fn load(&self) -> Result<Option<PersistedState>, ChatError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                error!("Failed to read state cache {}: {e}", self.path.display());
                return Err(e.into());
            }
        };

        match serde_json::from_slice::<PersistedState>(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("Ignoring corrupt state cache {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    /// Writes to a sibling temp file and renames it over the cache.
    pub async fn save(&self, state: &PersistedState) -> Result<(), ChatError> {
        let json = serde_json::to_vec(state)?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} bytes to state cache", json.len());
        Ok(())
    }
}

/// Writes a snapshot after every store change, off the caller's path.
///
/// A failed write is logged and retried on the next change; in-memory state
/// is never touched. The task ends once every store handle has been dropped.
pub fn spawn_persistence(store: &ChatStore, cache: StateCache) -> JoinHandle<()> {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = PersistedState::from(&*rx.borrow_and_update());
            if let Err(e) = cache.save(&snapshot).await {
                error!("Failed to persist chat state: {e}");
            }
        }
        debug!("Store dropped, persistence task exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conversation, NewMessage};

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::new(dir.path());
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::new(dir.path());
        tokio::fs::write(cache.path(), b"{not json").await.unwrap();
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::new(dir.path().join("nested"));
        let state = PersistedState {
            conversations: vec![Conversation::new("c1".into(), "Saved".into())],
            current_conversation_id: Some("c1".into()),
        };
        cache.save(&state).await.unwrap();
        assert_eq!(cache.load().await.unwrap(), Some(state));
        assert!(cache.path().ends_with("chat-store-v1.json"));
    }

    #[tokio::test]
    async fn persistence_task_follows_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::new(dir.path());
        let store = ChatStore::new();
        let handle = spawn_persistence(&store, cache.clone());

        let id = store.create_conversation("Persisted");
        store.append_message(&id, NewMessage::user("hello")).unwrap();
        drop(store);
        handle.await.unwrap();

        let saved = cache.load().await.unwrap().unwrap();
        assert_eq!(saved.current_conversation_id.as_deref(), Some(id.as_str()));
        assert_eq!(saved.conversations[0].messages[0].content, "hello");
    }
}
