//! In-memory KV engine.
//!
//! Used by the test suites and by single-node dev mode. Shares its state
//! between forks so that lock traffic and store traffic observe the same
//! data, the way separate connections to one etcd would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::backend::{KvEngine, KvPair, LeaseId, SortOrder, prefix_range_end};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug, Clone)]
struct Lease {
    expires: Instant,
    ttl: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        purge_expired(&mut state);
        f(&mut state)
    }
}

fn purge_expired(state: &mut MemoryState) {
    let now = Instant::now();
    let MemoryState {
        entries, leases, ..
    } = state;
    leases.retain(|_, lease| lease.expires > now);
    entries.retain(|_, entry| match entry.lease {
        Some(id) => leases.contains_key(&id),
        None => true,
    });
}

#[async_trait]
impl KvEngine for MemoryEngine {
    async fn status(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_state(|state| state.entries.get(key).map(|entry| entry.value.clone())))
    }

    async fn get_prefix(
        &mut self,
        prefix: &str,
        sort: SortOrder,
        limit: u64,
    ) -> Result<Vec<KvPair>, StoreError> {
        let end = String::from_utf8_lossy(&prefix_range_end(prefix)).into_owned();
        let mut pairs: Vec<KvPair> = self.with_state(|state| {
            state
                .entries
                .range(prefix.to_owned()..end)
                .map(|(key, entry)| KvPair {
                    key: key.clone(),
                    value: entry.value.clone(),
                })
                .collect()
        });

        if sort == SortOrder::Descend {
            pairs.reverse();
        }
        if limit > 0 {
            pairs.truncate(limit as usize);
        }
        Ok(pairs)
    }

    async fn put(
        &mut self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.entries.insert(
                key.to_owned(),
                Entry {
                    value: value.to_owned(),
                    lease,
                },
            );
        });
        Ok(())
    }

    async fn create(
        &mut self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError> {
        Ok(self.with_state(|state| {
            if state.entries.contains_key(key) {
                return false;
            }
            state.entries.insert(
                key.to_owned(),
                Entry {
                    value: value.to_owned(),
                    lease,
                },
            );
            true
        }))
    }

    async fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|state| state.entries.remove(key).is_some()))
    }

    async fn delete_prefix(&mut self, prefix: &str) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.entries.retain(|key, _| !key.starts_with(prefix));
        });
        Ok(())
    }

    async fn delete_if_value(&mut self, key: &str, expected: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|state| match state.entries.get(key) {
            Some(entry) if entry.value == expected => {
                state.entries.remove(key);
                true
            }
            _ => false,
        }))
    }

    async fn lease_grant(&mut self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        let ttl = Duration::from_secs(ttl_seconds.max(0) as u64);
        Ok(self.with_state(|state| {
            state.next_lease += 1;
            let id = state.next_lease;
            state.leases.insert(
                id,
                Lease {
                    expires: Instant::now() + ttl,
                    ttl,
                },
            );
            id
        }))
    }

    async fn lease_refresh(&mut self, lease: LeaseId) -> Result<bool, StoreError> {
        Ok(self.with_state(|state| match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.expires = Instant::now() + entry.ttl;
                true
            }
            None => false,
        }))
    }

    async fn lease_revoke(&mut self, lease: LeaseId) -> Result<(), StoreError> {
        self.with_state(|state| {
            state.leases.remove(&lease);
            state.entries.retain(|_, entry| entry.lease != Some(lease));
        });
        Ok(())
    }

    fn fork(&self) -> Box<dyn KvEngine> {
        Box::new(self.clone())
    }
}
