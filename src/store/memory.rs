use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::KvStore;
use crate::error::StoreResult;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    index: Option<String>,
}

/// Process-local store; shared between queues by cloning the `Arc` around it
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &[u8], index: Option<&str>) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                index: index.map(str::to_owned),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn query_by_index(&self, index: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut matches: Vec<(String, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|e| e.value().index.as_deref() == Some(index))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<bool> {
        // The entry guard holds the shard lock for the whole comparison
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get().value.as_slice()) {
                    return Ok(false);
                }
                match new {
                    Some(value) => occupied.get_mut().value = value.to_vec(),
                    None => {
                        occupied.remove();
                    }
                }
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(value) = new {
                    vacant.insert(StoredValue {
                        value: value.to_vec(),
                        index: None,
                    });
                }
                Ok(true)
            }
        }
    }
}
