use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{KeyValueStore, StorageError};

/// Storage file name in the data directory
const STORAGE_FILE: &str = "storage.json";

type Entries = BTreeMap<String, String>;

/// Key-value store persisted as a single JSON object file.
///
/// Every batch reads the whole file, applies its changes and replaces the
/// file through a rename, so a crash never leaves a half-written batch.
/// Reads report an unparsable file as `StorageError::Corrupt`; the next
/// write replaces it, starting from an empty map.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles between batches.
    lock: Mutex<()>,
}

impl FileStore {
    /// Open (or lazily create) the store inside `data_dir`
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(STORAGE_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<Entries, StorageError> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Entries::new());
        }
        serde_json::from_str(&contents).map_err(StorageError::Corrupt)
    }

    /// Entries to apply a write batch to. A corrupt file is dropped, and the
    /// returned flag says the file must be rewritten even if nothing changes.
    fn entries_for_write(&self) -> Result<(Entries, bool), StorageError> {
        match self.read_entries() {
            Ok(entries) => Ok((entries, false)),
            Err(StorageError::Corrupt(e)) => {
                warn!(path = %self.path.display(), error = %e, "Replacing corrupt storage file");
                Ok((Entries::new(), true))
            }
            Err(e) => Err(e),
        }
    }

    fn write_entries(&self, entries: &Entries) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(entries).map_err(StorageError::Corrupt)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), keys = entries.len(), "Storage written");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>, StorageError> {
        let _guard = self.lock.lock().await;
        let entries = self.read_entries()?;
        Ok(keys
            .iter()
            .map(|key| (key.to_string(), entries.get(*key).cloned()))
            .collect())
    }

    async fn multi_set(&self, pairs: &[(&str, &str)]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let (mut entries, _) = self.entries_for_write()?;
        for (key, value) in pairs {
            entries.insert(key.to_string(), value.to_string());
        }
        self.write_entries(&entries)
    }

    async fn multi_remove(&self, keys: &[&str]) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let (mut entries, corrupt) = self.entries_for_write()?;
        let before = entries.len();
        for key in keys {
            entries.remove(*key);
        }
        if entries.len() == before && !corrupt {
            // Nothing to remove
            return Ok(());
        }
        self.write_entries(&entries)
    }
}
