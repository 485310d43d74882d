use serde::de::DeserializeOwned;
use serde::de::IgnoredAny;
use serde::Serialize;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::clock::Clock;
use crate::entry::CacheEntry;
use crate::pattern::storage_regex;
use crate::storage::StorageBackend;

const PROBE_KEY: &str = "__storage_test__";

/// Result of a successful persistent tier lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageHit<T> {
    pub data:      T,
    pub timestamp: u64,
}

/// The durable tier.
///
/// Same contract as [`MemoryTier`](crate::memory::MemoryTier), but over a [`StorageBackend`] shared with other
/// consumers. Every key is namespaced with `prefix` and nothing outside the namespace is ever read, listed, or
/// removed. No operation of this tier returns an error: an unavailable medium turns it into a permanent miss/no-op,
/// undecodable records are misses, and failed writes are logged and dropped.
pub struct PersistentTier<S>
where
    S: StorageBackend,
{
    name:      String,
    prefix:    String,
    backend:   Arc<S>,
    clock:     Arc<dyn Clock>,
    available: OnceLock<bool>,
}

impl<S> PersistentTier<S>
where
    S: StorageBackend,
{
    pub fn new(name: &str, prefix: &str, backend: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            backend,
            clock,
            available: OnceLock::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backend(&self) -> &Arc<S> {
        &self.backend
    }

    #[inline]
    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Probes the medium with a write and a delete on first use; the answer sticks for the tier's lifetime.
    pub fn is_storage_available(&self) -> bool {
        *self.available.get_or_init(|| {
            let probe = self.storage_key(PROBE_KEY);
            let outcome = self
                .backend
                .set_item(&probe, PROBE_KEY)
                .and_then(|_| self.backend.remove_item(&probe));
            match outcome {
                Ok(()) => true,
                Err(err) => {
                    warn!("[{}] persistent storage is unavailable, tier disabled: {err}", self.name);
                    false
                }
            }
        })
    }

    // Reads and decodes a record. Expired records are deleted; anything else that goes wrong is a miss.
    fn read_entry<T>(&self, key: &str) -> Option<CacheEntry<T>>
    where
        T: DeserializeOwned,
    {
        if !self.is_storage_available() {
            return None;
        }

        let storage_key = self.storage_key(key);
        let raw = match self.backend.get_item(&storage_key) {
            Ok(raw) => raw?,
            Err(err) => {
                debug!("[{}] failed to read '{storage_key}': {err}", self.name);
                return None;
            }
        };

        let entry = match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!("[{}] undecodable record under '{storage_key}': {err}", self.name);
                return None;
            }
        };

        if entry.is_expired(self.clock.now()) {
            debug!("[{}] storage entry '{key}' expired", self.name);
            self.remove(&storage_key);
            return None;
        }

        Some(entry)
    }

    pub fn get<T>(&self, key: &str) -> Option<StorageHit<T>>
    where
        T: DeserializeOwned,
    {
        self.read_entry::<T>(key).map(|entry| StorageHit {
            data:      entry.data,
            timestamp: entry.timestamp,
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.read_entry::<IgnoredAny>(key).is_some()
    }

    pub fn get_timestamp(&self, key: &str) -> Option<u64> {
        self.read_entry::<IgnoredAny>(key).map(|e| e.timestamp)
    }

    /// Best-effort write.
    ///
    /// When the medium reports its quota exhausted, recovery goes in three steps: sweep expired records and retry,
    /// then wipe this tier's namespace and retry once more, then give up with a warning.
    pub fn set<T>(&self, key: &str, data: &T, ttl: Duration)
    where
        T: Serialize + ?Sized,
    {
        if !self.is_storage_available() {
            return;
        }

        let raw = match serde_json::to_string(&CacheEntry::new(data, self.clock.now(), ttl)) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("[{}] cannot serialize entry '{key}': {err}", self.name);
                return;
            }
        };
        let storage_key = self.storage_key(key);

        match self.backend.set_item(&storage_key, &raw) {
            Ok(()) => return,
            Err(err) if err.is_quota_exceeded() => {
                warn!("[{}] storage quota exceeded writing '{key}', sweeping expired entries", self.name);
            }
            Err(err) => {
                warn!("[{}] failed to write '{key}': {err}", self.name);
                return;
            }
        }

        self.clear_expired();

        match self.backend.set_item(&storage_key, &raw) {
            Ok(()) => return,
            Err(err) if err.is_quota_exceeded() => {
                warn!("[{}] storage quota still exceeded writing '{key}', clearing the cache", self.name);
            }
            Err(err) => {
                warn!("[{}] failed to write '{key}' after sweep: {err}", self.name);
                return;
            }
        }

        self.clear();

        if let Err(err) = self.backend.set_item(&storage_key, &raw) {
            warn!("[{}] giving up on writing '{key}': {err}", self.name);
        }
    }

    fn remove(&self, storage_key: &str) {
        if let Err(err) = self.backend.remove_item(storage_key) {
            warn!("[{}] failed to remove '{storage_key}': {err}", self.name);
        }
    }

    fn remove_all(&self, storage_keys: &[String]) -> bool {
        match self.backend.remove_items(storage_keys) {
            Ok(()) => true,
            Err(err) => {
                warn!("[{}] failed to remove {} storage entries: {err}", self.name, storage_keys.len());
                false
            }
        }
    }

    /// Full storage keys under this tier's prefix.
    pub fn keys(&self) -> Vec<String> {
        if !self.is_storage_available() {
            return Vec::new();
        }
        match self.backend.keys() {
            Ok(keys) => keys.into_iter().filter(|k| k.starts_with(&self.prefix)).collect(),
            Err(err) => {
                warn!("[{}] cannot enumerate storage keys: {err}", self.name);
                Vec::new()
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        if self.is_storage_available() {
            self.remove(&self.storage_key(key));
        }
    }

    pub fn invalidate_pattern(&self, pattern: &str) {
        if !self.is_storage_available() {
            return;
        }

        let re = match storage_regex(&self.prefix, pattern) {
            Ok(re) => re,
            Err(err) => {
                warn!("[{}] bad invalidation pattern '{pattern}': {err}", self.name);
                return;
            }
        };

        let doomed = self.keys().into_iter().filter(|k| re.is_match(k)).collect::<Vec<_>>();
        self.remove_all(&doomed);
    }

    /// Deletes every record in this tier's namespace and nothing else.
    pub fn clear(&self) {
        let keys = self.keys();
        info!("[{}] clearing {} storage entries", self.name, keys.len());
        self.remove_all(&keys);
    }

    /// Deletes expired records in this tier's namespace. Records that don't parse as an entry are deleted too; they
    /// can never produce a hit and only take up quota. Returns the number of records removed.
    pub fn clear_expired(&self) -> usize {
        let now = self.clock.now();
        let mut stale_keys = Vec::new();

        for storage_key in self.keys() {
            let stale = match self.backend.get_item(&storage_key) {
                Ok(Some(raw)) => serde_json::from_str::<CacheEntry<IgnoredAny>>(&raw)
                    .map(|entry| entry.is_expired(now))
                    .unwrap_or(true),
                Ok(None) => false,
                Err(err) => {
                    debug!("[{}] failed to read '{storage_key}' during sweep: {err}", self.name);
                    false
                }
            };

            if stale {
                stale_keys.push(storage_key);
            }
        }

        let removed = if self.remove_all(&stale_keys) { stale_keys.len() } else { 0 };
        debug!("[{}] swept {removed} expired storage entries", self.name);
        removed
    }
}

impl<S> std::fmt::Debug for PersistentTier<S>
where
    S: StorageBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTier")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("available", &self.available.get())
            .finish()
    }
}
