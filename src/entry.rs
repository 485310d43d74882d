use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// Returns `true` when an entry written at `timestamp` with the given `ttl` (both in milliseconds) is stale at `now`.
///
/// This is the only expiry predicate in the crate; both tiers go through it. An entry is still fresh at exactly
/// `timestamp + ttl`.
#[inline]
pub fn is_expired(now: u64, timestamp: u64, ttl: u64) -> bool {
    now.saturating_sub(timestamp) > ttl
}

#[inline]
pub(crate) fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// A cached value together with the time it was written and how long it stays fresh.
///
/// The serialized form is the persisted record: `{"data": ..., "timestamp": <ms>, "ttl": <ms>}`. Unknown fields are
/// ignored on read so that records written by newer versions still decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data:      T,
    /// Wall-clock write time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Time-to-live, milliseconds.
    pub ttl:       u64,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T, timestamp: u64, ttl: Duration) -> Self {
        Self {
            data,
            timestamp,
            ttl: duration_to_ms(ttl),
        }
    }

    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        is_expired(now, self.timestamp, self.ttl)
    }

    pub fn expires_at(&self) -> u64 {
        self.timestamp.saturating_add(self.ttl)
    }

    pub fn into_data(self) -> T {
        self.data
    }
}
