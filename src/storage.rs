//! Durable key-value media for the persistent tier.
//!
//! The contract mirrors a browser's local storage: string keys, string values, a flat namespace that may be shared
//! with unrelated users of the same medium, and a finite quota.

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use crate::error::StorageError;

#[doc(inline)]
pub use file::FileStorage;
#[doc(inline)]
pub use memory::MemoryStorage;

pub trait StorageBackend: Send + Sync + 'static {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    /// Must leave the previous value in place when it fails.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    /// Removes several keys at once. Backends with expensive writes should override it to commit only once.
    fn remove_items(&self, keys: &[String]) -> Result<(), StorageError> {
        keys.iter().try_for_each(|key| self.remove_item(key))
    }
    /// Every key in the medium, regardless of who wrote it.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

// Key/value map with byte accounting shared by the bundled backends. Usage is the sum of key and value lengths.
#[derive(Clone, Debug, Default)]
pub(crate) struct Items {
    map:   BTreeMap<String, String>,
    quota: Option<usize>,
    used:  usize,
}

impl Items {
    pub(crate) fn new(quota: Option<usize>) -> Self {
        Self {
            map: BTreeMap::new(),
            quota,
            used: 0,
        }
    }

    pub(crate) fn with_map(map: BTreeMap<String, String>, quota: Option<usize>) -> Self {
        let used = map.iter().map(|(k, v)| k.len() + v.len()).sum();
        Self { map, quota, used }
    }

    pub(crate) fn map(&self) -> &BTreeMap<String, String> {
        &self.map
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn get(&self, key: &str) -> Option<&String> {
        self.map.get(key)
    }

    pub(crate) fn set(&mut self, key: &str, value: &str) -> Result<Option<String>, StorageError> {
        let freed = self.map.get(key).map_or(0, |old| key.len() + old.len());
        let needed = self.used - freed + key.len() + value.len();
        if let Some(quota) = self.quota {
            if needed > quota {
                return Err(StorageError::quota_exceeded(key));
            }
        }
        self.used = needed;
        Ok(self.map.insert(key.to_string(), value.to_string()))
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<String> {
        let old = self.map.remove(key)?;
        self.used -= key.len() + old.len();
        Some(old)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_accounts_for_replacement() {
        let mut items = Items::new(Some(10));
        items.set("ab", "cdef").unwrap();
        assert_eq!(items.used(), 6);

        // Replacing frees the old value first.
        items.set("ab", "12345678").unwrap();
        assert_eq!(items.used(), 10);

        let err = items.set("x", "y").unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(items.get("ab").map(String::as_str), Some("12345678"));

        items.remove("ab");
        assert_eq!(items.used(), 0);
        items.set("x", "y").unwrap();
    }
}
