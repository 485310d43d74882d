use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Failures reported by a [`StorageBackend`](crate::storage::StorageBackend).
///
/// These never leave the persistent tier: reads degrade to misses and writes are best-effort.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded while writing '{key}'")]
    QuotaExceeded { key: String },

    #[error("storage is unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl StorageError {
    pub fn quota_exceeded<S: Into<String>>(key: S) -> Self {
        Self::QuotaExceeded { key: key.into() }
    }

    #[inline]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// The only error a [`TieredCache`](crate::TieredCache) fetch can produce.
///
/// All callers that shared one deduplicated fetch receive clones of the same value, hence the `Arc` around the
/// fetcher's own error.
#[derive(Debug, Error)]
pub enum CacheError<E>
where
    E: Debug + Send + Sync + 'static,
{
    #[error("fetch failed: {0:?}")]
    Fetch(Arc<E>),

    #[error("fetch for key '{key}' was interrupted: {reason}")]
    Interrupted { key: String, reason: String },
}

impl<E> CacheError<E>
where
    E: Debug + Send + Sync + 'static,
{
    /// The fetcher's error, if that is what this is.
    pub fn fetch_error(&self) -> Option<&Arc<E>> {
        match self {
            Self::Fetch(err) => Some(err),
            Self::Interrupted { .. } => None,
        }
    }
}

// Manual impl: derive would demand `E: Clone`.
impl<E> Clone for CacheError<E>
where
    E: Debug + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        match self {
            Self::Fetch(err) => Self::Fetch(Arc::clone(err)),
            Self::Interrupted { key, reason } => Self::Interrupted {
                key:    key.clone(),
                reason: reason.clone(),
            },
        }
    }
}
