#![cfg(any(test, feature = "test"))]
//! Helpers for exercising the cache under controlled failures.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::entry::duration_to_ms;
use crate::error::StorageError;
use crate::storage::MemoryStorage;
use crate::storage::StorageBackend;

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_to_ms(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A storage call as seen by [`ScriptedStorage`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageOp {
    Get(String),
    Set(String),
    SetFailed(String),
    Remove(String),
    Keys,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Quota,
    Unavailable,
}

impl Fault {
    fn error(self, key: &str) -> StorageError {
        match self {
            Self::Quota => StorageError::quota_exceeded(key),
            Self::Unavailable => StorageError::Unavailable("scripted failure".into()),
        }
    }
}

/// [`MemoryStorage`] wrapper that fails writes on demand and records every call.
#[derive(Debug, Default)]
pub struct ScriptedStorage {
    inner:      MemoryStorage,
    set_faults: Mutex<VecDeque<Fault>>,
    every_set:  Mutex<Option<Fault>>,
    ops:        Mutex<Vec<StorageOp>>,
}

impl ScriptedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects every write, like a browser with storage disabled.
    pub fn broken() -> Self {
        let storage = Self::default();
        storage.fail_every_set(Fault::Unavailable);
        storage
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }

    /// The next `count` writes fail with `fault`; later ones go through.
    pub fn fail_next_sets(&self, fault: Fault, count: usize) {
        self.set_faults.lock().extend(std::iter::repeat_n(fault, count));
    }

    pub fn fail_every_set(&self, fault: Fault) {
        *self.every_set.lock() = Some(fault);
    }

    pub fn ops(&self) -> Vec<StorageOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    fn record(&self, op: StorageOp) {
        self.ops.lock().push(op);
    }
}

impl StorageBackend for ScriptedStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.record(StorageOp::Get(key.to_string()));
        self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let fault = self.set_faults.lock().pop_front().or(*self.every_set.lock());
        if let Some(fault) = fault {
            self.record(StorageOp::SetFailed(key.to_string()));
            return Err(fault.error(key));
        }
        self.record(StorageOp::Set(key.to_string()));
        self.inner.set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.record(StorageOp::Remove(key.to_string()));
        self.inner.remove_item(key)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.record(StorageOp::Keys);
        self.inner.keys()
    }
}

/// Produces fetchers that count how many times they were actually invoked.
#[derive(Clone, Debug, Default)]
pub struct CountingFetcher {
    calls: Arc<AtomicUsize>,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A fetcher resolving to `value` after `delay`.
    pub fn returning<T, E>(&self, value: T, delay: Duration) -> impl FnOnce() -> BoxFuture<'static, Result<T, E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            .boxed()
        }
    }

    /// A fetcher failing with `error` after `delay`.
    pub fn failing<T, E>(&self, error: E, delay: Duration) -> impl FnOnce() -> BoxFuture<'static, Result<T, E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                Err(error)
            }
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_on_request() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(Duration::from_millis(25));
        assert_eq!(clock.now(), 125);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }

    #[test]
    fn scripted_faults_run_out() {
        let storage = ScriptedStorage::new();
        storage.fail_next_sets(Fault::Quota, 1);
        assert!(storage.set_item("k", "v").unwrap_err().is_quota_exceeded());
        storage.set_item("k", "v").unwrap();
        assert_eq!(
            storage.ops(),
            vec![StorageOp::SetFailed("k".into()), StorageOp::Set("k".into())]
        );
    }
}
