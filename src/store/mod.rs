//! Persistent key-value stores shared by every instance of the application.

mod memory;
mod sqlite;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::constants::RECORDING_PREFIX;
use crate::error::StoreResult;

/// Keyed store with a single secondary index and an atomic compare-and-swap
///
/// Several processes may open the same store concurrently; the lease and the
/// flush marker rely on `compare_and_swap` being atomic against all of them.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write `value`, replacing any previous entry and its index value
    async fn put(&self, key: &str, value: &[u8], index: Option<&str>) -> StoreResult<()>;

    /// Remove `key`; a no-op when absent
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// All entries whose index equals `index`, in key order
    async fn query_by_index(&self, index: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Replace the entry only if it currently holds `expected`
    ///
    /// `expected = None` means "absent"; `new = None` deletes. Entries created
    /// here carry no index. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<bool>;
}

/// Cache of opened stores keyed by identifier
///
/// Each identifier maps to one store named `recording_<id>`: an SQLite file
/// under `base_dir`, or an in-memory store when no directory is configured.
pub struct StoreRegistry {
    base_dir: Option<PathBuf>,
    stores: DashMap<String, Arc<dyn KvStore>>,
}

impl StoreRegistry {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
            stores: DashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            base_dir: None,
            stores: DashMap::new(),
        }
    }

    pub fn store_name(id: &str) -> String {
        format!("{}{}", RECORDING_PREFIX, id)
    }

    /// Register an already opened store under `id`
    pub fn insert(&self, id: &str, store: Arc<dyn KvStore>) {
        self.stores.insert(id.to_string(), store);
    }

    /// Return the cached handle for `id`, opening the store on first use
    pub async fn open(&self, id: &str) -> StoreResult<Arc<dyn KvStore>> {
        if let Some(store) = self.stores.get(id) {
            return Ok(Arc::clone(store.value()));
        }

        let store: Arc<dyn KvStore> = match &self.base_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.sqlite", Self::store_name(id)));
                debug!("Opening store {}", path.display());
                Arc::new(SqliteKvStore::open(&path).await?)
            }
            None => Arc::new(MemoryKvStore::new()),
        };

        Ok(Arc::clone(
            self.stores.entry(id.to_string()).or_insert(store).value(),
        ))
    }
}
