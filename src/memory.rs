use moka::sync::Cache;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::entry::CacheEntry;
use crate::pattern::KeyPattern;

type AnyValue = Arc<dyn Any + Send + Sync>;

/// Result of a successful memory tier lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryHit<T> {
    pub data:      T,
    pub timestamp: u64,
}

/// The volatile tier: a bounded in-process map with per-entry TTL.
///
/// Expiry is lazy; a stale entry is dropped when a read runs into it. Values of any type can share one tier, a typed
/// read of a key holding a different type is a miss.
pub struct MemoryTier {
    name:  String,
    cache: Cache<String, CacheEntry<AnyValue>>,
    clock: Arc<dyn Clock>,
}

impl MemoryTier {
    pub fn new(name: &str, max_capacity: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            cache: Cache::builder().max_capacity(max_capacity).name(name).build(),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // Returns the entry only if it is still fresh, evicting it otherwise.
    fn live_entry(&self, key: &str) -> Option<CacheEntry<AnyValue>> {
        let entry = self.cache.get(key)?;
        if entry.is_expired(self.clock.now()) {
            debug!("[{}] memory entry '{key}' expired", self.name);
            self.cache.invalidate(key);
            return None;
        }
        Some(entry)
    }

    pub fn get<T>(&self, key: &str) -> Option<MemoryHit<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.live_entry(key)?;
        let data = entry.data.downcast_ref::<T>()?.clone();
        Some(MemoryHit {
            data,
            timestamp: entry.timestamp,
        })
    }

    /// Stores `data` under `key`, replacing any previous value. At capacity the new entry may be refused by the
    /// admission policy, see [`CacheConfig::max_capacity`](crate::types::CacheConfig::max_capacity).
    pub fn set<T>(&self, key: &str, data: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        let value: AnyValue = Arc::new(data);
        self.cache
            .insert(key.to_string(), CacheEntry::new(value, self.clock.now(), ttl));
    }

    pub fn has(&self, key: &str) -> bool {
        self.live_entry(key).is_some()
    }

    pub fn get_timestamp(&self, key: &str) -> Option<u64> {
        self.live_entry(key).map(|e| e.timestamp)
    }

    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn invalidate_pattern(&self, pattern: &str) {
        match KeyPattern::parse(pattern) {
            KeyPattern::Exact(key) => self.invalidate(&key),
            pattern => {
                let doomed = self
                    .cache
                    .iter()
                    .filter(|(k, _)| pattern.matches(k))
                    .map(|(k, _)| k)
                    .collect::<Vec<_>>();
                debug!("[{}] invalidating {} memory entries by pattern", self.name, doomed.len());
                for key in doomed {
                    self.cache.invalidate(key.as_str());
                }
            }
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Drops every expired entry. Only the background janitor calls this; regular reads expire lazily.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let expired = self
            .cache
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        for key in &expired {
            self.cache.invalidate(key.as_str());
        }
        expired.len()
    }

    /// Approximate number of entries, including not yet evicted stale ones.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("name", &self.name)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
