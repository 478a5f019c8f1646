//! Read-only snapshot cache.
//!
//! Activated on a store handle for the duration of an expensive read-only
//! analysis pass; the first read under a covering prefix bulk-loads that
//! whole prefix with one range query, and everything after is served from
//! memory. While a cache is active the store refuses mutations and locks,
//! with the single exception of event writes.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::backend::{KvEngine, SortOrder};
use crate::error::StoreError;

/// Prefixes cached whole rather than per-object: these trees are small and
/// read together.
const SPECIAL_PREFIXES: &[&str] = &["namespace", "node", "metrics"];

#[derive(Debug, Default)]
pub struct SnapshotCache {
    prefixes: Vec<String>,
    entries: BTreeMap<String, Value>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn covered(&self, key: &str) -> bool {
        self.prefixes.iter().any(|prefix| key.starts_with(prefix))
    }

    /// The prefix a key is loaded under: the namespace/node/metrics trees
    /// (and their attribute mirrors) are special-cased, anything else is
    /// trimmed from the right until the dropped segment is a UUID.
    pub fn covering_prefix(key: &str) -> Result<String, StoreError> {
        for special in SPECIAL_PREFIXES {
            for candidate in [
                format!("/sf/{special}"),
                format!("/sf/attribute/{special}"),
            ] {
                if key.starts_with(&candidate) {
                    return Ok(candidate);
                }
            }
        }

        let mut segments: Vec<&str> = key.split('/').collect();
        while let Some(last) = segments.pop() {
            if looks_like_uuid(last) {
                return Ok(segments.join("/"));
            }
        }
        Err(StoreError::Uncacheable(key.to_owned()))
    }

    async fn load_prefix(
        &mut self,
        engine: &mut dyn KvEngine,
        prefix: &str,
    ) -> Result<(), StoreError> {
        let pairs = engine.get_prefix(prefix, SortOrder::None, 0).await?;
        let count = pairs.len();
        for pair in pairs {
            self.entries
                .insert(pair.key, serde_json::from_str(&pair.value)?);
        }
        debug!(prefix, count, "populated read only cache prefix");
        self.prefixes.push(prefix.to_owned());
        Ok(())
    }

    pub async fn get(
        &mut self,
        engine: &mut dyn KvEngine,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        if !self.covered(key) {
            let prefix = Self::covering_prefix(key)?;
            self.load_prefix(engine, &prefix).await?;
        }
        Ok(self.entries.get(key).cloned())
    }

    pub async fn get_prefix(
        &mut self,
        engine: &mut dyn KvEngine,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        if !self.covered(prefix) {
            self.load_prefix(engine, prefix).await?;
        }
        Ok(self
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

fn looks_like_uuid(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 36
        && [8, 13, 18, 23].iter().all(|&i| bytes[i] == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;

    const UUID: &str = "9b5f1437-0bb6-4821-a495-0d1236cdcf041"; // not a uuid: 37 chars
    const INSTANCE: &str = "9b5f1437-0bb6-4821-a495-0d1236cdcf04";

    #[test]
    fn special_trees_cache_whole() {
        assert_eq!(
            SnapshotCache::covering_prefix("/sf/node/sf-1").expect("prefix"),
            "/sf/node"
        );
        assert_eq!(
            SnapshotCache::covering_prefix("/sf/attribute/namespace/system/state")
                .expect("prefix"),
            "/sf/attribute/namespace"
        );
    }

    #[test]
    fn uuid_keys_cache_up_to_the_uuid() {
        let key = format!("/sf/instance/{INSTANCE}");
        assert_eq!(
            SnapshotCache::covering_prefix(&key).expect("prefix"),
            "/sf/instance"
        );

        let key = format!("/sf/attribute/instance/{INSTANCE}/state");
        assert_eq!(
            SnapshotCache::covering_prefix(&key).expect("prefix"),
            "/sf/attribute/instance"
        );
    }

    #[test]
    fn keys_without_uuids_are_uncacheable() {
        assert!(matches!(
            SnapshotCache::covering_prefix(&format!("/sf/instance/{UUID}")),
            Err(StoreError::Uncacheable(_))
        ));
    }

    #[tokio::test]
    async fn first_miss_bulk_loads_the_prefix() {
        let mut engine = MemoryEngine::new();
        let other = "11111111-2222-3333-4444-555555555555";
        for uuid in [INSTANCE, other] {
            engine
                .put(&format!("/sf/instance/{uuid}"), "{\"uuid\": 1}", None)
                .await
                .expect("put");
        }

        let mut cache = SnapshotCache::new();
        let hit = cache
            .get(&mut engine, &format!("/sf/instance/{INSTANCE}"))
            .await
            .expect("get");
        assert!(hit.is_some());

        // The sibling was loaded by the same range query; remove it from
        // the backing engine and it is still served.
        engine
            .delete(&format!("/sf/instance/{other}"))
            .await
            .expect("delete");
        let sibling = cache
            .get(&mut engine, &format!("/sf/instance/{other}"))
            .await
            .expect("get");
        assert!(sibling.is_some());
    }
}
