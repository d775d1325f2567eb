//! Persistent key-value storage for device-local data.
//!
//! This module provides:
//! - `KeyValueStore`: batched async get/set/remove over string keys
//! - `FileStore`: a JSON file in the application data directory
//! - `MemoryStore`: an in-process map for tests and ephemeral runs
//! - `StorageKeys`: the namespaced keys the session is persisted under

pub mod file;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage file is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),
}

/// Async persistent key-value capability.
///
/// Each call is applied as one batch: a concurrent `multi_get` observes
/// either none or all of a `multi_set`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read `keys`, returning one `(key, value)` pair per key in the same order.
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>, StorageError>;

    async fn multi_set(&self, pairs: &[(&str, &str)]) -> Result<(), StorageError>;

    /// Remove `keys`. Keys that are not present are ignored.
    async fn multi_remove(&self, keys: &[&str]) -> Result<(), StorageError>;
}

/// Storage keys for the persisted session, namespaced under an application prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    token: String,
    user: String,
}

impl StorageKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            token: format!("{}:token", prefix),
            user: format!("{}:user", prefix),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn all(&self) -> [&str; 2] {
        [&self.token, &self.user]
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_STORAGE_PREFIX)
    }
}
