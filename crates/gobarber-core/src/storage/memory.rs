use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{KeyValueStore, StorageError};

/// In-process key-value store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>, StorageError> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|key| (key.to_string(), entries.get(*key).cloned()))
            .collect())
    }

    async fn multi_set(&self, pairs: &[(&str, &str)]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        for (key, value) in pairs {
            entries.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}
