use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::error::CacheError;

type SharedFetch<T, E> = Shared<BoxFuture<'static, Result<T, CacheError<E>>>>;
type FetchSender<T, E> = oneshot::Sender<Result<T, CacheError<E>>>;

struct Pending {
    id:     u64,
    // Always a `SharedFetch<T, E>` for the `T` and `E` of the call that registered it.
    future: Box<dyn Any + Send + Sync>,
}

type Registry = Arc<Mutex<HashMap<String, Pending>>>;

/// Collapses concurrent fetches of the same key into a single operation.
///
/// The first caller for a key registers the fetch, then calls the fetcher outside the registry lock and runs the
/// resulting future on the tokio runtime. Everybody arriving while it is outstanding awaits the same outcome. The
/// registry entry is dropped by the fetch task itself, before the outcome is handed out, so a call made right after
/// settlement starts over. A fetch keeps running to completion even if all its callers are gone; there is no
/// cancellation.
#[derive(Default)]
pub struct Deduplicator {
    pending: Registry,
    next_id: AtomicU64,
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("fetch panicked: {msg}")
    }
    else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("fetch panicked: {msg}")
    }
    else {
        "fetch panicked".to_string()
    }
}

fn forget(registry: &Registry, key: &str, id: u64) {
    let mut pending = registry.lock();
    if pending.get(key).is_some_and(|p| p.id == id) {
        pending.remove(key);
    }
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fetch` unless a fetch for `key` is already in flight, in which case its outcome is shared.
    ///
    /// A fetch error reaches every waiting caller as the same [`CacheError::Fetch`]. `fetch` is called with no lock
    /// held, so it may use the deduplicator (or the cache owning it) itself. Must be called within a tokio runtime.
    pub async fn dedupe<T, E, F, Fut>(&self, key: &str, fetch: F) -> Result<T, CacheError<E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Debug + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (shared, start) = {
            let mut pending = self.pending.lock();

            match pending.get(key) {
                Some(p) => match p.future.downcast_ref::<SharedFetch<T, E>>() {
                    Some(in_flight) => {
                        debug!("joining in-flight fetch for '{key}'");
                        (in_flight.clone(), None)
                    }
                    None => {
                        warn!("in-flight fetch for '{key}' produces a different type, fetching separately");
                        drop(pending);
                        return fetch().await.map_err(|err| CacheError::Fetch(Arc::new(err)));
                    }
                },
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = oneshot::channel();
                    let shared = Self::outcome(Arc::clone(&self.pending), key, id, rx);
                    pending.insert(
                        key.to_string(),
                        Pending {
                            id,
                            future: Box::new(shared.clone()),
                        },
                    );
                    (shared, Some((id, tx)))
                }
            }
        };

        if let Some((id, tx)) = start {
            let work = match panic::catch_unwind(AssertUnwindSafe(fetch)) {
                Ok(work) => work,
                Err(payload) => {
                    // Joined callers see the dropped sender as an interruption.
                    forget(&self.pending, key, id);
                    panic::resume_unwind(payload);
                }
            };
            Self::start(Arc::clone(&self.pending), key, id, work, tx);
        }

        shared.await
    }

    // What every caller awaits: the outcome sent by the fetch task.
    fn outcome<T, E>(
        registry: Registry,
        key: &str,
        id: u64,
        rx: oneshot::Receiver<Result<T, CacheError<E>>>,
    ) -> SharedFetch<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Debug + Send + Sync + 'static,
    {
        let key = key.to_string();
        async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    forget(&registry, &key, id);
                    Err(CacheError::Interrupted {
                        key,
                        reason: "fetch task was dropped".to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    fn start<T, E, Fut>(registry: Registry, key: &str, id: u64, work: Fut, tx: FetchSender<T, E>)
    where
        T: Clone + Send + Sync + 'static,
        E: Debug + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        debug!("starting fetch for '{key}'");

        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result.map_err(|err| CacheError::Fetch(Arc::new(err))),
                Err(payload) => Err(CacheError::Interrupted {
                    reason: panic_reason(payload.as_ref()),
                    key:    key.clone(),
                }),
            };
            forget(&registry, &key, id);
            // Nobody listening is fine, the fetch still did its work.
            tx.send(outcome).ok();
        });
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    /// Forgets all in-flight fetches without stopping them. Callers already waiting still get their outcome.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

impl Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("pending", &self.pending_keys())
            .finish()
    }
}
