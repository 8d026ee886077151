use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;

/// Minimal key-value contract used to persist checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Short name for logging.
    fn name(&self) -> &str;
}

#[async_trait]
impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Open a store from a URL.
///
/// - `memory://`: process-local map
/// - `sqlite::memory:`: in-memory SQLite
/// - `sqlite://<path>`: SQLite file, created if missing
pub fn open_store(url: &str) -> Result<Arc<dyn CheckpointStore>, StoreError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(StoreError::InvalidUrl("empty url".into()));
    }
    if url == "memory://" || url == "memory:" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url == "sqlite::memory:" {
        return Ok(Arc::new(SqliteStore::in_memory()?));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(StoreError::InvalidUrl(url.to_string()));
        }
        return Ok(Arc::new(SqliteStore::open(Path::new(path))?));
    }
    Err(StoreError::InvalidUrl(url.to_string()))
}
