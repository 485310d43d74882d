use parking_lot::Mutex;

use super::Items;
use super::StorageBackend;
use crate::error::StorageError;

/// Process-local storage medium. Does not survive restarts; useful where no disk is available and in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<Items>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total of key and value byte lengths.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            items: Mutex::new(Items::new(Some(quota))),
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.items.lock().used()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.lock().set(key, value)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items.lock().keys())
    }
}
