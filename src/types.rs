use fieldx::fxstruct;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;

pub const DEFAULT_NAME: &str = "rt-cache";
pub const DEFAULT_STORAGE_PREFIX: &str = "crm_cache_";
pub const DEFAULT_MAX_CAPACITY: u64 = 10_000;

/// Where a fetched value came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Memory,
    Storage,
    Network,
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Network => "network",
        })
    }
}

/// Data returned by [`TieredCache::fetch()`](crate::TieredCache::fetch) along with its provenance.
#[derive(Clone, Debug, PartialEq)]
pub struct Fetched<T> {
    pub data:   T,
    pub source: Source,
}

impl<T> Fetched<T> {
    pub fn new(data: T, source: Source) -> Self {
        Self { data, source }
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

/// Per-datatype lifetimes of the two tiers. Supplied by the caller on every fetch.
///
/// Nothing enforces `memory_ttl <= storage_ttl`; each tier just gets the value meant for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlConfig {
    #[serde(with = "millis")]
    pub memory_ttl:  Duration,
    #[serde(with = "millis")]
    pub storage_ttl: Duration,
}

impl TtlConfig {
    pub const fn new(memory_ttl: Duration, storage_ttl: Duration) -> Self {
        Self {
            memory_ttl,
            storage_ttl,
        }
    }

    pub const fn from_millis(memory_ttl: u64, storage_ttl: u64) -> Self {
        Self::new(Duration::from_millis(memory_ttl), Duration::from_millis(storage_ttl))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Skip both tier lookups and go to the fetcher. The call still joins an in-flight fetch for the same key.
    pub force_refresh: bool,
}

impl FetchOptions {
    pub fn force_refresh() -> Self {
        Self { force_refresh: true }
    }
}

/// Debug snapshot of what the cache knows about a key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub in_memory:  bool,
    pub in_storage: bool,
    pub pending:    bool,
    pub last_fetch: Option<u64>,
}

/// Construction-time settings of a [`TieredCache`](crate::TieredCache).
///
/// ```ignore
/// let config = CacheConfig::builder()
///     .name("crm")
///     .storage_prefix("crm_cache_")
///     .max_capacity(5_000)
///     .build()?;
/// ```
#[derive(Clone, Debug)]
#[fxstruct(sync, no_new, builder, get)]
pub struct CacheConfig {
    /// Cache name. Shows up in every log record and names the in-memory cache.
    #[fieldx(builder(into), default(String::from(DEFAULT_NAME)))]
    name: String,

    /// Namespace of the persistent tier. Only keys starting with it are ever read, listed, or removed.
    #[fieldx(builder(into), default(String::from(DEFAULT_STORAGE_PREFIX)))]
    storage_prefix: String,

    /// Upper bound on the number of memory tier entries.
    ///
    /// Once the bound is reached moka's TinyLFU admission policy decides what stays, and a freshly inserted key may
    /// be the one rejected. A memory tier `set` is then not guaranteed to be readable back, and lookups simply fall
    /// through to the persistent tier.
    #[fieldx(get(copy), default(DEFAULT_MAX_CAPACITY))]
    max_capacity: u64,
}

mod millis {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::entry::duration_to_ms(*d))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
