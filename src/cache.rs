use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::dedupe::Deduplicator;
use crate::error::CacheError;
use crate::memory::MemoryTier;
use crate::pattern::strip_wildcard;
use crate::pattern::WILDCARD;
use crate::persistent::PersistentTier;
use crate::storage::StorageBackend;
use crate::types::CacheConfig;
use crate::types::CacheStatus;
use crate::types::FetchOptions;
use crate::types::Fetched;
use crate::types::Source;
use crate::types::TtlConfig;

type LastFetch = Arc<Mutex<HashMap<String, u64>>>;

/// This is where all the tiers meet.
///
/// ```ignore
/// let storage = Arc::new(FileStorage::open(data_dir.join("cache.json"))?);
/// let cache = TieredCache::new(&CacheConfig::builder().name("crm").build()?, storage);
///
/// let contacts = cache
///     .fetch(
///         "contacts",
///         || api.list_contacts(),
///         TtlConfig::from_millis(60_000, 300_000),
///         FetchOptions::default(),
///     )
///     .await?;
/// println!("{} contacts from {}", contacts.data.len(), contacts.source);
/// ```
///
/// Lookups go memory first, then storage (promoting a storage hit back into memory), then the fetcher. Fetches are
/// deduplicated per key; a successful one populates both tiers and records the fetch time. A failed fetch changes
/// nothing, whatever was cached before stays available.
///
/// A cache is meant to be built once by the application, shared by reference, and [cleared](Self::clear_all) when the
/// user session ends.
pub struct TieredCache<S>
where
    S: StorageBackend,
{
    name:       String,
    memory:     Arc<MemoryTier>,
    storage:    Arc<PersistentTier<S>>,
    dedupe:     Deduplicator,
    last_fetch: LastFetch,
    clock:      Arc<dyn Clock>,
    janitor:    Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<S> TieredCache<S>
where
    S: StorageBackend,
{
    pub fn new(config: &CacheConfig, backend: Arc<S>) -> Self {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, backend: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        let name = config.name().clone();
        Self {
            memory: Arc::new(MemoryTier::new(&name, config.max_capacity(), Arc::clone(&clock))),
            storage: Arc::new(PersistentTier::new(
                &name,
                config.storage_prefix(),
                backend,
                Arc::clone(&clock),
            )),
            dedupe: Deduplicator::new(),
            last_fetch: Arc::new(Mutex::new(HashMap::new())),
            janitor: Mutex::new(None),
            clock,
            name,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn storage(&self) -> &PersistentTier<S> {
        &self.storage
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedupe
    }

    /// Returns the value for `key`, from the fastest tier that has a fresh copy or from `fetcher` when none does.
    ///
    /// With [`FetchOptions::force_refresh`] both tiers are skipped, but the call still joins a fetch already in flight
    /// for the same key rather than starting a second one.
    #[instrument(level = "trace", skip(self, fetcher), fields(cache = %self.name))]
    pub async fn fetch<T, E, F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        ttl: TtlConfig,
        options: FetchOptions,
    ) -> Result<Fetched<T>, CacheError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Debug + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if !options.force_refresh {
            if let Some(hit) = self.memory.get::<T>(key) {
                debug!("[{}] memory hit for '{key}'", self.name);
                return Ok(Fetched::new(hit.data, Source::Memory));
            }

            if let Some(hit) = self.storage.get::<T>(key) {
                debug!("[{}] storage hit for '{key}', promoting to memory", self.name);
                self.memory.set(key, hit.data.clone(), ttl.memory_ttl);
                return Ok(Fetched::new(hit.data, Source::Storage));
            }

            debug!("[{}] miss for '{key}'", self.name);
        }
        else {
            debug!("[{}] forced refresh of '{key}'", self.name);
        }

        let memory = Arc::clone(&self.memory);
        let storage = Arc::clone(&self.storage);
        let last_fetch = Arc::clone(&self.last_fetch);
        let clock = Arc::clone(&self.clock);
        let owned_key = key.to_string();

        let data = self
            .dedupe
            .dedupe::<T, E, _, _>(key, move || {
                let work = fetcher();
                // Runs once per network fetch, before the in-flight registration is dropped.
                async move {
                    let data = work.await?;
                    memory.set(&owned_key, data.clone(), ttl.memory_ttl);
                    storage.set(&owned_key, &data, ttl.storage_ttl);
                    last_fetch.lock().insert(owned_key, clock.now());
                    Ok::<T, E>(data)
                }
            })
            .await?;

        Ok(Fetched::new(data, Source::Network))
    }

    pub fn invalidate(&self, key: &str) {
        debug!("[{}] invalidating '{key}'", self.name);
        self.memory.invalidate(key);
        self.storage.invalidate(key);
        self.last_fetch.lock().remove(key);
    }

    /// Invalidates by `pattern` in both tiers. A trailing `*` makes it a prefix match.
    ///
    /// Fetch timestamps are purged by prefix using the pattern without its wildcard; `"*"` purges them all.
    pub fn invalidate_pattern(&self, pattern: &str) {
        debug!("[{}] invalidating pattern '{pattern}'", self.name);
        self.memory.invalidate_pattern(pattern);
        self.storage.invalidate_pattern(pattern);

        let mut last_fetch = self.last_fetch.lock();
        if pattern == WILDCARD.to_string() {
            last_fetch.clear();
        }
        else {
            let prefix = strip_wildcard(pattern);
            last_fetch.retain(|k, _| !k.starts_with(prefix));
        }
    }

    /// Drops everything: both tiers, in-flight registrations, and fetch timestamps.
    pub fn clear_all(&self) {
        info!("[{}] clearing all cached data", self.name);
        self.memory.clear();
        self.storage.clear();
        self.dedupe.clear();
        self.last_fetch.lock().clear();
    }

    /// When `key` was last fetched from the network, epoch milliseconds.
    pub fn last_fetch_timestamp(&self, key: &str) -> Option<u64> {
        self.last_fetch.lock().get(key).copied()
    }

    /// How long ago `key` was last fetched from the network.
    pub fn last_fetch_age(&self, key: &str) -> Option<Duration> {
        self.last_fetch_timestamp(key)
            .map(|ts| Duration::from_millis(self.clock.now().saturating_sub(ts)))
    }

    pub fn cache_status(&self, key: &str) -> CacheStatus {
        CacheStatus {
            in_memory:  self.memory.has(key),
            in_storage: self.storage.has(key),
            pending:    self.dedupe.is_pending(key),
            last_fetch: self.last_fetch_timestamp(key),
        }
    }

    /// Starts a background task sweeping expired entries out of both tiers every `interval`.
    ///
    /// Not needed for correctness, reads expire entries lazily. A janitor already running is replaced. The task holds
    /// only weak references and ends by itself once the cache is dropped.
    pub fn start_janitor(&self, interval: Duration) {
        let memory = Arc::downgrade(&self.memory);
        let storage = Arc::downgrade(&self.storage);
        let name = self.name.clone();

        let task = tokio::spawn(async move {
            debug!("[{name}] starting janitor");
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !Self::sweep(&memory, &storage, &name) {
                    debug!("[{name}] cache is gone, stopping janitor");
                    break;
                }
            }
        });

        if let Some(previous) = self.janitor.lock().replace(task) {
            previous.abort();
        }
    }

    fn sweep(memory: &Weak<MemoryTier>, storage: &Weak<PersistentTier<S>>, name: &str) -> bool {
        let (Some(memory), Some(storage)) = (memory.upgrade(), storage.upgrade())
        else {
            return false;
        };
        let purged = memory.purge_expired();
        let swept = storage.clear_expired();
        debug!("[{name}] janitor removed {purged} memory and {swept} storage entries");
        true
    }

    pub fn janitor_running(&self) -> bool {
        self.janitor.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the janitor, if any. Cached data is left alone.
    pub async fn close(&self) {
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            janitor.abort();
            let _ = janitor.await;
        }
    }
}

impl<S> Debug for TieredCache<S>
where
    S: StorageBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.name)
            .field("memory", &self.memory)
            .field("storage", &self.storage)
            .field("dedupe", &self.dedupe)
            .finish()
    }
}

impl<S> Drop for TieredCache<S>
where
    S: StorageBackend,
{
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.get_mut().take() {
            janitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::ManualClock;
    use crate::storage::MemoryStorage;
    use crate::test::CountingFetcher;

    #[derive(Debug)]
    struct ApiDown;

    const TTL: TtlConfig = TtlConfig::from_millis(60_000, 300_000);
    const DELAY: Duration = Duration::from_millis(10);

    fn cache() -> (TieredCache<MemoryStorage>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let config = CacheConfig::builder().name("unit").build().unwrap();
        (
            TieredCache::with_clock(&config, Arc::new(MemoryStorage::new()), clock.clone()),
            clock,
        )
    }

    async fn warm(cache: &TieredCache<MemoryStorage>, key: &str, value: u32) {
        let fetcher = CountingFetcher::new();
        cache
            .fetch(key, fetcher.returning::<_, ApiDown>(value, DELAY), TTL, FetchOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn records_last_fetch_only_for_network() {
        let (cache, clock) = cache();
        warm(&cache, "dashboard", 1).await;
        let fetched_at = clock.now();
        assert_eq!(cache.last_fetch_timestamp("dashboard"), Some(fetched_at));

        clock.advance(Duration::from_secs(90));
        // Storage hit after memory expiry does not count as a fetch.
        warm(&cache, "dashboard", 2).await;
        assert_eq!(cache.last_fetch_timestamp("dashboard"), Some(fetched_at));
        assert_eq!(cache.last_fetch_age("dashboard"), Some(Duration::from_secs(90)));
        assert_eq!(cache.last_fetch_age("unknown"), None);
    }

    #[tokio::test]
    async fn status_reports_every_tier() {
        let (cache, clock) = cache();
        assert_eq!(cache.cache_status("k"), CacheStatus::default());

        warm(&cache, "k", 1).await;
        let status = cache.cache_status("k");
        assert!(status.in_memory && status.in_storage && !status.pending);
        assert_eq!(status.last_fetch, Some(clock.now()));

        clock.advance(Duration::from_secs(61));
        let status = cache.cache_status("k");
        assert!(!status.in_memory);
        assert!(status.in_storage);
    }

    #[tokio::test]
    async fn pattern_invalidation_purges_timestamps_by_prefix() {
        let (cache, _) = cache();
        for key in ["contact:1", "contact:10", "contact:2", "user:1"] {
            warm(&cache, key, 1).await;
        }

        cache.invalidate_pattern("contact:1");
        assert!(!cache.cache_status("contact:1").in_memory);
        assert!(cache.cache_status("contact:10").in_memory);
        // Timestamps go by prefix even without a wildcard.
        assert_eq!(cache.last_fetch_timestamp("contact:10"), None);
        assert!(cache.last_fetch_timestamp("contact:2").is_some());

        cache.invalidate_pattern("*");
        assert_eq!(cache.last_fetch_timestamp("user:1"), None);
        assert!(!cache.cache_status("user:1").in_storage);
    }

    #[tokio::test]
    async fn invalidate_resets_key() {
        let (cache, _) = cache();
        warm(&cache, "k", 1).await;
        warm(&cache, "other", 2).await;

        cache.invalidate("k");
        assert_eq!(cache.cache_status("k"), CacheStatus::default());
        assert!(cache.cache_status("other").in_memory);
    }

    #[tokio::test]
    async fn clear_all_forgets_everything() {
        let (cache, _) = cache();
        warm(&cache, "a", 1).await;
        warm(&cache, "b", 2).await;

        cache.clear_all();
        for key in ["a", "b"] {
            assert_eq!(cache.cache_status(key), CacheStatus::default());
        }
        assert!(cache.storage().keys().is_empty());
        assert_eq!(cache.deduplicator().pending_count(), 0);
    }

    #[tokio::test]
    async fn fetcher_may_query_the_cache() {
        let (cache, _) = cache();

        let fetched = cache
            .fetch(
                "dashboard",
                || {
                    let status = cache.cache_status("dashboard");
                    let debug = format!("{cache:?}");
                    async move { Ok::<_, ApiDown>((status.pending, debug.contains("dashboard"))) }
                },
                TTL,
                FetchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(fetched, Fetched::new((true, true), Source::Network));
        assert!(!cache.cache_status("dashboard").pending);
    }

    #[tokio::test]
    async fn janitor_sweeps_without_reads() {
        let (cache, clock) = cache();
        warm(&cache, "k", 1).await;
        assert_eq!(cache.storage().keys().len(), 1);

        clock.advance(Duration::from_secs(301));
        cache.start_janitor(Duration::from_millis(10));
        assert!(cache.janitor_running());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cache.storage().keys().is_empty());
        cache.close().await;
        assert!(!cache.janitor_running());
    }
}
