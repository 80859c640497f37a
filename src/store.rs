//! Key-value persistence for pairings and settings
//!
//! Values are JSON strings under fixed keys. `MemoryStore` is volatile,
//! `FileStore` keeps one JSON object on disk and rewrites it on every change.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Storage keys shared with earlier wallet builds
pub mod keys {
    /// App name -> client pairing
    pub const CLIENT_RELAY_KEYS: &str = "ClientRelayKeys";
    pub const NWC_ENABLED: &str = "nwcEnabled";
    pub const NWC_RELAYS: &str = "nwcRelays";
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    Poisoned,
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

impl dyn KvStore {
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.set(key, &serde_json::to_string(value)?)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.read().map_err(|_| StoreError::Poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map.write().map_err(|_| StoreError::Poisoned)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.map.write().map_err(|_| StoreError::Poisoned)?.remove(key);
        Ok(())
    }
}

/// JSON file store. Writes go to a sibling temp file then rename over the original.
pub struct FileStore {
    path: PathBuf,
    map: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    pub const FILE_NAME: &'static str = "store.json";

    /// Open `<dir>/store.json`, creating `dir` if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let map = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), entries = map.len(), "Opened store");
        Ok(Self { path, map: RwLock::new(map) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.read().map_err(|_| StoreError::Poisoned)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.map.write().map_err(|_| StoreError::Poisoned)?;
        map.insert(key.to_string(), value.to_string());
        self.flush(&map)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut map = self.map.write().map_err(|_| StoreError::Poisoned)?;
        if map.remove(key).is_some() {
            self.flush(&map)?;
        }
        Ok(())
    }
}

/// Default data directory: `<platform data dir>/haze-nwc`
#[cfg(feature = "native")]
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("haze-nwc"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_store_json_helpers() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.set_json(keys::NWC_ENABLED, &true).unwrap();
        assert_eq!(store.get_json::<bool>(keys::NWC_ENABLED).unwrap(), Some(true));
        assert_eq!(store.get(keys::NWC_ENABLED).unwrap().as_deref(), Some("true"));

        store.remove(keys::NWC_ENABLED).unwrap();
        assert_eq!(store.get_json::<bool>(keys::NWC_ENABLED).unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set(keys::NWC_RELAYS, r#"["wss://a"]"#).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get(keys::NWC_RELAYS).unwrap().as_deref(), Some(r#"["wss://a"]"#));
        assert!(store.path().ends_with(FileStore::FILE_NAME));
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FileStore::FILE_NAME), "{not json").unwrap();
        assert!(matches!(FileStore::open(dir.path()), Err(StoreError::Serde(_))));
    }

    #[test]
    fn test_corrupt_value_is_serde_error() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.set(keys::NWC_ENABLED, "maybe").unwrap();
        assert!(store.get_json::<bool>(keys::NWC_ENABLED).is_err());
    }
}
