use thiserror::Error;

/// Errors surfaced by the store facade and the KV engines beneath it.
///
/// `Transient` never escapes the public store operations: the retry wrapper
/// consumes it. `Fatal` (the store is not there at all) always propagates —
/// a node without its coordination store cannot limp along.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store connection failed: {0}")]
    Fatal(String),

    #[error("forbidden while using a read only cache: {0}")]
    ForbiddenWhileCached(String),

    #[error("a read only cache is already active")]
    CacheAlreadyActive,

    #[error("attempt to cache a key without a UUID: {0}")]
    Uncacheable(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot acquire lock {path}, timed out after {waited:.2} seconds")]
    AcquireTimeout {
        path: String,
        waited: f64,
        holder: Option<(String, i64)>,
    },

    #[error("the lease on {0} has expired")]
    Expired(String),

    #[error("cannot release lock: {0}")]
    ReleaseFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
