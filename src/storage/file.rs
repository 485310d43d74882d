use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tracing::warn;

use super::Items;
use super::StorageBackend;
use crate::error::StorageError;

/// Storage medium backed by a single JSON document on disk.
///
/// The whole key space is held in memory and the document is rewritten on every mutation: the new content goes to a
/// sibling temporary file which then replaces the original, so a crash never leaves a half-written document behind.
#[derive(Debug)]
pub struct FileStorage {
    path:   PathBuf,
    items:  Mutex<Items>,
    writes: AtomicU64,
}

impl FileStorage {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_quota(path, None)
    }

    /// Opens the document at `path`, creating parent directories as needed. A document that cannot be parsed is
    /// logged and replaced by an empty key space on the next write.
    pub fn open_with_quota<P: Into<PathBuf>>(path: P, quota: Option<usize>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let map = Self::load(&path)?;
        Ok(Self {
            path,
            items: Mutex::new(Items::with_map(map, quota)),
            writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn used_bytes(&self) -> usize {
        self.items.lock().used()
    }

    /// How many times the document was rewritten since it was opened.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>, StorageError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };

        Ok(serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!("Storage document {} is corrupt, starting empty: {err}", path.display());
            BTreeMap::new()
        }))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn persist(&self, items: &Items) -> Result<(), StorageError> {
        let tmp = self.tmp_path();
        fs::write(&tmp, serde_json::to_vec(items.map())?)?;
        fs::rename(&tmp, &self.path)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock();
        let previous = items.set(key, value)?;
        if let Err(err) = self.persist(&items) {
            // Roll back so memory and disk agree. Putting the old value back cannot exceed the quota.
            match previous {
                Some(old) => {
                    items.set(key, &old).ok();
                }
                None => {
                    items.remove(key);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock();
        if let Some(old) = items.remove(key) {
            if let Err(err) = self.persist(&items) {
                // Restoring a removed value cannot exceed the quota.
                items.set(key, &old).ok();
                return Err(err);
            }
        }
        Ok(())
    }

    fn remove_items(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut items = self.items.lock();
        let removed = keys
            .iter()
            .filter_map(|key| items.remove(key).map(|old| (key, old)))
            .collect::<Vec<_>>();
        if removed.is_empty() {
            return Ok(());
        }

        if let Err(err) = self.persist(&items) {
            for (key, old) in removed {
                items.set(key, &old).ok();
            }
            return Err(err);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items.lock().keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let storage = FileStorage::open(&path).unwrap();
        storage.set_item("app_a", "1").unwrap();
        storage.set_item("app_b", "2").unwrap();
        storage.remove_item("app_a").unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.get_item("app_a").unwrap(), None);
        assert_eq!(reopened.get_item("app_b").unwrap().as_deref(), Some("2"));
        assert_eq!(reopened.keys().unwrap(), vec!["app_b".to_string()]);
    }

    #[test]
    fn corrupt_document_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "{not json").unwrap();

        let storage = FileStorage::open(&path).unwrap();
        assert!(storage.keys().unwrap().is_empty());
        storage.set_item("k", "v").unwrap();
        assert_eq!(FileStorage::open(&path).unwrap().get_item("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn batch_removal_rewrites_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let storage = FileStorage::open(&path).unwrap();
        for i in 0..10 {
            storage.set_item(&format!("app_{i}"), "v").unwrap();
        }
        assert_eq!(storage.writes(), 10);

        let doomed = (0..8).map(|i| format!("app_{i}")).chain(["missing".to_string()]).collect::<Vec<_>>();
        storage.remove_items(&doomed).unwrap();
        assert_eq!(storage.writes(), 11);
        // Nothing to remove, nothing to write.
        storage.remove_items(&doomed).unwrap();
        assert_eq!(storage.writes(), 11);

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["app_8".to_string(), "app_9".to_string()]);
    }

    #[test]
    fn failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let storage = FileStorage::open(nested.join("storage.json")).unwrap();
        storage.set_item("a", "1").unwrap();
        storage.set_item("b", "2").unwrap();
        let used = storage.used_bytes();

        // With the directory gone every rewrite fails.
        fs::remove_dir_all(&nested).unwrap();

        assert!(storage.set_item("a", "changed").is_err());
        assert!(storage.set_item("c", "3").is_err());
        assert!(storage.remove_item("a").is_err());
        assert!(storage.remove_items(&["a".to_string(), "b".to_string()]).is_err());

        assert_eq!(storage.get_item("a").unwrap().as_deref(), Some("1"));
        assert_eq!(storage.get_item("b").unwrap().as_deref(), Some("2"));
        assert_eq!(storage.get_item("c").unwrap(), None);
        assert_eq!(storage.used_bytes(), used);
    }

    #[test]
    fn quota_is_enforced_and_nothing_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");

        let storage = FileStorage::open_with_quota(&path, Some(10)).unwrap();
        storage.set_item("k", "v").unwrap();
        assert!(storage.set_item("big", "0123456789").unwrap_err().is_quota_exceeded());

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.get_item("big").unwrap(), None);
        assert_eq!(reopened.used_bytes(), 2);
    }
}
