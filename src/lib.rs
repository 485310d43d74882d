//! # rt-cache
//!
//! Two-tier read-through cache for backends that are slow and hard to predict.
//!
//! Think of it as the layer between an application's UI state and a remote API that may take seconds to answer and
//! occasionally answers something else than expected.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Every piece of data is addressed by a string key, e.g. `"contacts"` or `"contact:42"`.
//! - Producing the data means calling a remote service, and it's the caller who knows how; the cache only gets an
//!   async function per request.
//! - The same data tends to be requested by several places at once.
//! - Data should survive process restarts, but the durable medium may be small, shared with others, or missing.
//!
//! The cache operates on the following principles:
//!
//! - Two tiers with independent lifetimes: a bounded in-memory tier over the [moka](https://crates.io/crates/moka)
//!   cache, and a persistent tier over any [`StorageBackend`](storage::StorageBackend).
//! - TTLs are given per call, one for each tier. Expiry is lazy: a stale entry is noticed and dropped when read.
//! - Concurrent requests for the same key collapse into one fetch, and every caller gets the same outcome.
//! - Only fetcher failures are errors. Storage trouble of any kind degrades to cache misses and skipped writes.
//! - Fully async, on tokio.
//!
//! # Lookup Order
//!
//! 1. Memory tier. A hit is returned as [`Source::Memory`](types::Source::Memory).
//! 2. Persistent tier. A hit is copied into the memory tier and returned as
//!    [`Source::Storage`](types::Source::Storage).
//! 3. The fetcher, through the deduplicator. The result is written into both tiers and returned as
//!    [`Source::Network`](types::Source::Network).
//!
//! A forced refresh starts at step 3.
//!
//! # Persistent Records
//!
//! Each key is stored as one JSON document under `<prefix><key>`:
//!
//! ```json
//! { "data": <value>, "timestamp": <ms since epoch>, "ttl": <ms> }
//! ```
//!
//! Records that fail to decode are treated as misses, so the format can grow without breaking older readers.
//!
//! When the medium runs out of space, the write is retried after sweeping expired records, and once more after
//! wiping the cache's own namespace. Records under other prefixes are never touched.

pub mod cache;
pub mod clock;
pub mod dedupe;
pub mod entry;
pub mod error;
pub mod memory;
pub mod pattern;
pub mod persistent;
pub mod storage;
pub mod test;
pub mod types;

#[doc(inline)]
pub use cache::TieredCache;
#[doc(inline)]
pub use error::CacheError;
#[doc(inline)]
pub use storage::StorageBackend;

pub mod prelude {
    pub use crate::cache::TieredCache;
    pub use crate::clock::Clock;
    pub use crate::clock::SystemClock;
    pub use crate::entry::CacheEntry;
    pub use crate::error::CacheError;
    pub use crate::error::StorageError;
    pub use crate::storage::FileStorage;
    pub use crate::storage::MemoryStorage;
    pub use crate::storage::StorageBackend;
    pub use crate::types::*;
}
