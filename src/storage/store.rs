use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Interchangeable string key/value backend forming one tier of the
/// persistence chain.
pub trait KeyValueStore: Send + Sync {
    fn name(&self) -> &str;
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-process map with an optional byte quota. Can be switched offline to
/// model a backend that stops answering.
pub struct MemoryStore {
    name: String,
    entries: RwLock<BTreeMap<String, String>>,
    quota_bytes: Option<usize>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
            quota_bytes: None,
            available: AtomicBool::new(true),
        }
    }

    /// Limit the summed byte length of keys and values.
    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a raw value, bypassing envelopes. Used to seed fixtures.
    pub fn insert_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(key.into(), value.into());
        }
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                store: self.name.clone(),
                reason: "store offline".to_string(),
            })
        }
    }

    fn poisoned(&self) -> StorageError {
        StorageError::Unavailable {
            store: self.name.clone(),
            reason: "lock poisoned".to_string(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.ensure_available()?;
        let guard = self.entries.read().map_err(|_| self.poisoned())?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut guard = self.entries.write().map_err(|_| self.poisoned())?;
        if let Some(limit) = self.quota_bytes {
            let used: usize = guard
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = used + key.len() + value.len();
            if needed > limit {
                return Err(StorageError::QuotaExceeded {
                    store: self.name.clone(),
                    key: key.to_string(),
                    needed,
                    limit,
                });
            }
        }
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut guard = self.entries.write().map_err(|_| self.poisoned())?;
        guard.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.ensure_available()?;
        let guard = self.entries.read().map_err(|_| self.poisoned())?;
        Ok(guard.keys().cloned().collect())
    }
}

#[derive(Serialize, Deserialize)]
struct FileRecord {
    key: String,
    value: String,
}

/// Directory-backed store: one `<blake3(key)>.json` file per key.
pub struct FileStore {
    name: String,
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        let name = "file".to_string();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            store: name.clone(),
            source,
        })?;
        Ok(Self { name, dir })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", blake3::hash(key.as_bytes()).to_hex()))
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            store: self.name.clone(),
            source,
        }
    }

    fn read_record(&self, path: &Path) -> Result<Option<FileRecord>, StorageError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_err(err)),
        }
    }
}

impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let record = self.read_record(&self.path_for(key))?;
        Ok(record.filter(|r| r.key == key).map(|r| r.value))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let record = FileRecord {
            key: key.to_string(),
            value: value.to_string(),
        };
        let text = serde_json::to_string(&record)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|err| self.io_err(err))?;
        fs::rename(&tmp, &path).map_err(|err| self.io_err(err))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_err(err)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|err| self.io_err(err))?;
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| self.io_err(err))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            // Unreadable records surface as corrupt on `get`; skip them here.
            if let Ok(Some(record)) = self.read_record(&path) {
                keys.push(record.key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
