//! Coordinated KV store facade.
//!
//! Every piece of cluster state — object payloads, attributes, locks, work
//! queues, spilled events — lives in one strongly-consistent KV store under
//! the `/sf/` namespace. This crate wraps the store with the behavior the
//! rest of the system relies on: retry-forever on transient trouble,
//! canonical JSON encoding, lease-backed locks, the per-handle read-only
//! snapshot cache, and the queue runtime.

pub mod backend;
pub mod cache;
pub mod error;
pub mod etcd;
pub mod lock;
pub mod memory;
pub mod queue;
pub mod tasks;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::backend::{KvEngine, SortOrder};
use crate::cache::SnapshotCache;
use crate::error::StoreError;

pub use crate::backend::{KvPair, LeaseId};
pub use crate::etcd::EtcdGateway;
pub use crate::lock::{LockHandle, LockOptions};
pub use crate::memory::MemoryEngine;
pub use crate::queue::QueueLength;
pub use crate::tasks::{Task, WorkItem};

pub const LOCK_PREFIX: &str = "/sflocks";
pub const EVENT_PREFIX: &str = "/sf/event/";

/// Log-and-continue helper for daemon loops. One malformed object or flaky
/// guest must not take a node daemon down with it.
pub fn ignore_exception(context: &str, error: &dyn std::fmt::Display) {
    error!(context, error = %error, "ignoring exception");
}

/// Seconds since the epoch as a float, the timestamp format used across the
/// key space.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Short random suffix used to break queue-entry timestamp ties.
pub fn random_id() -> String {
    format!("{:06x}", rand::random::<u32>() & 0xff_ffff)
}

/// The `/sf/` key layout. `name` without `subtype` addresses an object,
/// both address a sub-entry, and the `None` forms are prefixes.
pub fn object_path(object_type: &str, subtype: Option<&str>, name: Option<&str>) -> String {
    match (subtype, name) {
        (Some(subtype), Some(name)) => format!("/sf/{object_type}/{subtype}/{name}"),
        (None, Some(name)) => format!("/sf/{object_type}/{name}"),
        (Some(subtype), None) => format!("/sf/{object_type}/{subtype}/"),
        (None, None) => format!("/sf/{object_type}/"),
    }
}

/// Canonical value encoding: pretty-printed JSON with sorted keys, so that
/// compare-and-swap operations see byte-identical values.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Retry a KV operation forever on transient errors.
///
/// If the store cannot process a request the node cannot operate, so wait
/// for it to come back. Connection-refused is deliberately not caught here:
/// a missing store fails the daemon to bring attention to the deeper
/// problem. Retry state stays on the stack.
macro_rules! with_retry {
    ($operation:expr, $body:expr) => {{
        let operation = $operation;
        let mut count: u64 = 0;
        loop {
            match $body.await {
                Ok(value) => break Ok(value),
                Err($crate::error::StoreError::Transient(message)) => {
                    ::tracing::error!(operation, error = %message, "transient store error, retrying");
                }
                Err(other) => break Err(other),
            }
            ::tokio::time::sleep(::std::time::Duration::from_secs_f64(count as f64 / 10.0)).await;
            count += 1;
        }
    }};
}
pub(crate) use with_retry;

/// One node's handle on the coordinated store.
///
/// Handles are cheap to create and are expected to be task-local; the
/// snapshot cache slot and the read statistics belong to the handle, not
/// the cluster.
pub struct Store {
    engine: Box<dyn KvEngine>,
    node_name: String,
    pid: i64,
    slow_lock_threshold: u64,
    cache: Option<SnapshotCache>,
    statistics: HashMap<String, u64>,
}

impl Store {
    pub fn new(engine: Box<dyn KvEngine>, node_name: impl Into<String>) -> Self {
        Self {
            engine,
            node_name: node_name.into(),
            pid: std::process::id() as i64,
            slow_lock_threshold: 5,
            cache: None,
            statistics: HashMap::new(),
        }
    }

    pub fn with_slow_lock_threshold(mut self, seconds: u64) -> Self {
        self.slow_lock_threshold = seconds;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub(crate) fn pid(&self) -> i64 {
        self.pid
    }

    pub(crate) fn slow_lock_threshold(&self) -> u64 {
        self.slow_lock_threshold
    }

    pub(crate) fn engine(&mut self) -> &mut dyn KvEngine {
        self.engine.as_mut()
    }

    pub(crate) fn fork_engine(&self) -> Box<dyn KvEngine> {
        self.engine.fork()
    }

    pub(crate) fn cache_active(&self) -> bool {
        self.cache.is_some()
    }

    /// Fail unless `path` may be written right now. Event writes are the
    /// one mutation permitted while a read-only cache is active.
    pub(crate) fn ensure_mutable(&self, path: &str, what: &str) -> Result<(), StoreError> {
        if self.cache.is_some() && !path.starts_with(EVENT_PREFIX) {
            return Err(StoreError::ForbiddenWhileCached(what.to_owned()));
        }
        Ok(())
    }

    fn record_uncached_read(&mut self, path: &str) {
        *self.statistics.entry(path.to_owned()).or_insert(0) += 1;
    }

    /// Uncached read counts by path since the last reset.
    pub fn statistics(&self) -> &HashMap<String, u64> {
        &self.statistics
    }

    pub fn reset_statistics(&mut self) {
        self.statistics.clear();
    }

    // Read-only snapshot cache scope.

    pub fn begin_readonly(&mut self) -> Result<(), StoreError> {
        if self.cache.is_some() {
            return Err(StoreError::CacheAlreadyActive);
        }
        self.cache = Some(SnapshotCache::new());
        Ok(())
    }

    pub fn end_readonly(&mut self) {
        self.cache = None;
    }

    // Object-shaped operations.

    pub async fn get(
        &mut self,
        object_type: &str,
        subtype: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<Value>, StoreError> {
        let path = object_path(object_type, subtype, name);
        self.get_raw(&path).await
    }

    pub async fn get_raw(&mut self, path: &str) -> Result<Option<Value>, StoreError> {
        if let Some(cache) = self.cache.as_mut() {
            return cache.get(self.engine.as_mut(), path).await;
        }

        self.record_uncached_read(path);
        let raw = with_retry!("get", self.engine.get(path))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_all(
        &mut self,
        object_type: &str,
        subtype: Option<&str>,
        sort: SortOrder,
        limit: u64,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let path = object_path(object_type, subtype, None);
        self.get_prefix_raw(&path, sort, limit).await
    }

    pub async fn get_prefix_raw(
        &mut self,
        prefix: &str,
        sort: SortOrder,
        limit: u64,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        if let Some(cache) = self.cache.as_mut() {
            return cache.get_prefix(self.engine.as_mut(), prefix).await;
        }

        self.record_uncached_read(prefix);
        let pairs = with_retry!("get_prefix", self.engine.get_prefix(prefix, sort, limit))?;

        let mut decoded = Vec::with_capacity(pairs.len());
        for pair in pairs {
            decoded.push((pair.key, serde_json::from_str(&pair.value)?));
        }
        Ok(decoded)
    }

    pub async fn get_all_dict(
        &mut self,
        object_type: &str,
        subtype: Option<&str>,
    ) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self
            .get_all(object_type, subtype, SortOrder::None, 0)
            .await?
            .into_iter()
            .collect())
    }

    pub async fn put<T: Serialize>(
        &mut self,
        object_type: &str,
        subtype: Option<&str>,
        name: Option<&str>,
        data: &T,
    ) -> Result<(), StoreError> {
        let path = object_path(object_type, subtype, name);
        let encoded = encode_json(data)?;
        self.put_raw(&path, &encoded).await
    }

    pub async fn put_raw(&mut self, path: &str, encoded: &str) -> Result<(), StoreError> {
        self.ensure_mutable(path, "you cannot change data")?;
        with_retry!("put", self.engine.put(path, encoded, None))
    }

    pub async fn create<T: Serialize>(
        &mut self,
        object_type: &str,
        subtype: Option<&str>,
        name: Option<&str>,
        data: &T,
    ) -> Result<bool, StoreError> {
        if self.cache.is_some() {
            return Err(StoreError::ForbiddenWhileCached(
                "you cannot change data".to_owned(),
            ));
        }

        let path = object_path(object_type, subtype, name);
        let encoded = encode_json(data)?;
        with_retry!("create", self.engine.create(&path, &encoded, None))
    }

    pub async fn delete(
        &mut self,
        object_type: &str,
        subtype: Option<&str>,
        name: Option<&str>,
    ) -> Result<(), StoreError> {
        let path = object_path(object_type, subtype, name);
        self.delete_raw(&path).await
    }

    pub async fn delete_raw(&mut self, path: &str) -> Result<(), StoreError> {
        self.ensure_mutable(path, "you cannot change data")?;
        with_retry!("delete", async { self.engine.delete(path).await.map(|_| ()) })
    }

    pub async fn delete_all(
        &mut self,
        object_type: &str,
        subtype: Option<&str>,
    ) -> Result<(), StoreError> {
        let path = object_path(object_type, subtype, None);
        self.ensure_mutable(&path, "you cannot change data")?;
        with_retry!("delete_prefix", self.engine.delete_prefix(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_paths_follow_the_layout() {
        assert_eq!(
            object_path("instance", None, Some("uuid1")),
            "/sf/instance/uuid1"
        );
        assert_eq!(
            object_path("queue", Some("sf-1"), Some("job")),
            "/sf/queue/sf-1/job"
        );
        assert_eq!(object_path("queue", Some("sf-1"), None), "/sf/queue/sf-1/");
        assert_eq!(object_path("instance", None, None), "/sf/instance/");
    }

    #[test]
    fn canonical_encoding_sorts_keys() {
        let encoded = encode_json(&json!({"zebra": 1, "aardvark": 2})).expect("encode");
        let zebra = encoded.find("zebra").expect("zebra");
        let aardvark = encoded.find("aardvark").expect("aardvark");
        assert!(aardvark < zebra);
    }

    #[tokio::test]
    async fn mutations_fail_inside_a_readonly_scope() {
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        store.begin_readonly().expect("begin");

        assert!(matches!(
            store.put("node", None, Some("sf-1"), &json!({})).await,
            Err(StoreError::ForbiddenWhileCached(_))
        ));
        assert!(matches!(
            store.delete("node", None, Some("sf-1")).await,
            Err(StoreError::ForbiddenWhileCached(_))
        ));
        assert!(matches!(
            store.create("node", None, Some("sf-1"), &json!({})).await,
            Err(StoreError::ForbiddenWhileCached(_))
        ));
        assert!(matches!(
            store.begin_readonly(),
            Err(StoreError::CacheAlreadyActive)
        ));

        // Event writes are the exception: they spill to the dead letter
        // queue even during read-only analysis.
        store
            .put("event", Some("instance/i1"), Some("1700000000.0"), &json!({}))
            .await
            .expect("event put");

        store.end_readonly();
        store
            .put("node", None, Some("sf-1"), &json!({}))
            .await
            .expect("put after scope");
    }

    #[tokio::test]
    async fn uncached_reads_are_counted() {
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        store.get("node", None, Some("sf-1")).await.expect("get");
        store.get("node", None, Some("sf-1")).await.expect("get");
        assert_eq!(store.statistics().get("/sf/node/sf-1"), Some(&2));

        store.reset_statistics();
        assert!(store.statistics().is_empty());
    }
}
