//! Lease-backed distributed locks.
//!
//! A lock is a key under `/sflocks` holding the identity of its holder,
//! created compare-and-swap style with a lease so that a dead holder's lock
//! melts away when the lease does. Lock traffic uses its own engine
//! connection so it never interleaves with the owning store handle's reads.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backend::{KvEngine, LeaseId, SortOrder};
use crate::error::{LockError, StoreError};
use crate::{LOCK_PREFIX, Store, encode_json, object_path, with_retry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockHolder {
    node: String,
    operation: Option<String>,
    pid: i64,
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease TTL in seconds; the lock evaporates this long after its holder
    /// stops refreshing it.
    pub ttl: i64,
    /// How long to keep polling for acquisition before giving up.
    pub timeout: u64,
    /// Human-readable operation label, embedded in the holder identity.
    pub op: Option<String>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: 60,
            timeout: 10,
            op: None,
        }
    }
}

impl LockOptions {
    pub fn for_op(op: impl Into<String>) -> Self {
        Self {
            op: Some(op.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct LockHandle {
    engine: Box<dyn KvEngine>,
    key: String,
    path: String,
    holder: String,
    lease: LeaseId,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the lease. Fails when the lease has already expired, which
    /// means someone else may hold the lock now.
    pub async fn refresh(&mut self) -> Result<(), LockError> {
        if self.engine.lease_refresh(self.lease).await? {
            debug!(lock = %self.path, "refreshed lock");
            Ok(())
        } else {
            info!(lock = %self.path, "attempt to refresh an expired lock");
            Err(LockError::Expired(self.path.clone()))
        }
    }

    /// Delete the lock key, but only while we still own it.
    pub async fn release(mut self) -> Result<(), LockError> {
        if self.engine.delete_if_value(&self.key, &self.holder).await? {
            let _ = self.engine.lease_revoke(self.lease).await;
            debug!(lock = %self.path, "released lock");
            return Ok(());
        }

        let inventory = self
            .engine
            .get_prefix(&format!("{LOCK_PREFIX}/"), SortOrder::Ascend, 0)
            .await
            .unwrap_or_default();
        error!(
            lock = %self.path,
            locks = ?inventory,
            "cannot release lock"
        );
        Err(LockError::ReleaseFailed(self.path.clone()))
    }
}

async fn read_holder(
    engine: &mut dyn KvEngine,
    key: &str,
) -> Result<Option<(String, i64)>, StoreError> {
    let raw = with_retry!("lock holder", engine.get(key))?;
    let Some(raw) = raw else { return Ok(None) };
    let holder: LockHolder = serde_json::from_str(&raw)?;
    Ok(Some((holder.node, holder.pid)))
}

impl Store {
    /// Acquire a lock on `(object_type, subtype, name)`, polling once per
    /// second until `options.timeout` has elapsed.
    pub async fn lock(
        &mut self,
        object_type: &str,
        subtype: Option<&str>,
        name: Option<&str>,
        options: LockOptions,
    ) -> Result<LockHandle, LockError> {
        if self.cache_active() {
            return Err(StoreError::ForbiddenWhileCached(
                "you cannot lock".to_owned(),
            )
            .into());
        }

        let path = object_path(object_type, subtype, name);
        let key = format!("{LOCK_PREFIX}{path}");
        let holder = encode_json(&LockHolder {
            node: self.node_name().to_owned(),
            operation: options.op.clone(),
            pid: self.pid(),
        })?;

        let mut engine = self.fork_engine();
        let lease = engine.lease_grant(options.ttl).await?;

        let threshold = self.slow_lock_threshold();
        let start = Instant::now();
        let mut slow_warned = false;

        loop {
            if engine.create(&key, &holder, Some(lease)).await? {
                let waited = start.elapsed().as_secs_f64();
                if waited > threshold as f64 {
                    info!(lock = %path, duration = waited, "acquired lock, but it was slow");
                } else {
                    debug!(lock = %path, "acquired lock");
                }
                return Ok(LockHandle {
                    engine,
                    key,
                    path,
                    holder,
                    lease,
                });
            }

            let waited = start.elapsed().as_secs_f64();
            if waited >= options.timeout as f64 {
                let current = read_holder(engine.as_mut(), &key).await?;
                let (holder_node, holder_pid) = match &current {
                    Some((node, pid)) => (Some(node.as_str()), Some(*pid)),
                    None => (None, None),
                };
                info!(
                    lock = %path,
                    duration = waited,
                    holder_node, holder_pid,
                    requesting_op = options.op.as_deref(),
                    "failed to acquire lock"
                );
                let _ = engine.lease_revoke(lease).await;
                return Err(LockError::AcquireTimeout {
                    path,
                    waited,
                    holder: current,
                });
            }

            if waited > threshold as f64 && !slow_warned {
                let current = read_holder(engine.as_mut(), &key).await?;
                let (holder_node, holder_pid) = match &current {
                    Some((node, pid)) => (Some(node.as_str()), Some(*pid)),
                    None => (None, None),
                };
                info!(
                    lock = %path,
                    duration = waited,
                    threshold,
                    holder_node, holder_pid,
                    requesting_op = options.op.as_deref(),
                    "waiting to acquire lock"
                );
                slow_warned = true;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Every lock currently held anywhere in the cluster.
    pub async fn existing_locks(&mut self) -> Result<HashMap<String, Value>, StoreError> {
        let prefix = format!("{LOCK_PREFIX}/");
        let pairs = with_retry!("existing locks", self.engine().get_prefix(&prefix, SortOrder::None, 0))?;

        let mut locks = HashMap::new();
        for pair in pairs {
            locks.insert(pair.key, serde_json::from_str(&pair.value)?);
        }
        Ok(locks)
    }

    /// Remove locks held by former processes on this node. Required after an
    /// unclean restart, otherwise we wait for the leases to time out and
    /// that can take a long time.
    pub async fn clear_stale_locks(&mut self) -> Result<(), StoreError> {
        if self.cache_active() {
            return Err(StoreError::ForbiddenWhileCached(
                "you cannot clear locks".to_owned(),
            ));
        }

        let node_name = self.node_name().to_owned();
        let prefix = format!("{LOCK_PREFIX}/");
        let pairs = with_retry!("clear stale locks", self.engine().get_prefix(&prefix, SortOrder::Ascend, 0))?;

        for pair in pairs {
            let holder: LockHolder = match serde_json::from_str(&pair.value) {
                Ok(holder) => holder,
                Err(err) => {
                    warn!(lock = %pair.key, error = %err, "unparseable lock holder");
                    continue;
                }
            };

            if holder.node == node_name && !pid_running(holder.pid) {
                with_retry!("delete stale lock", async {
                    self.engine().delete(&pair.key).await.map(|_| ())
                })?;
                warn!(
                    lock = %pair.key,
                    old_pid = holder.pid,
                    old_node = %holder.node,
                    "removed stale lock"
                );
            }
        }
        Ok(())
    }
}

/// Whether a pid is a running process on this machine.
fn pid_running(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;

    fn shared_store(engine: &MemoryEngine, node: &str) -> Store {
        Store::new(Box::new(engine.clone()), node)
    }

    #[tokio::test]
    async fn second_acquire_times_out_and_reports_holder() {
        let engine = MemoryEngine::new();
        let mut first = shared_store(&engine, "sf-1");
        let mut second = shared_store(&engine, "sf-2");

        let held = first
            .lock(
                "instance",
                None,
                Some("i1"),
                LockOptions::for_op("test hold"),
            )
            .await
            .expect("first acquire");

        let denied = second
            .lock(
                "instance",
                None,
                Some("i1"),
                LockOptions::for_op("test contend").with_timeout(1),
            )
            .await;

        match denied {
            Err(LockError::AcquireTimeout { holder, .. }) => {
                let (node, pid) = holder.expect("holder identity");
                assert_eq!(node, "sf-1");
                assert_eq!(pid, std::process::id() as i64);
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        held.release().await.expect("release");
        second
            .lock(
                "instance",
                None,
                Some("i1"),
                LockOptions::for_op("test after release").with_timeout(1),
            )
            .await
            .expect("acquire after release");
    }

    #[tokio::test]
    async fn refresh_fails_after_lease_expiry() {
        let engine = MemoryEngine::new();
        let mut store = shared_store(&engine, "sf-1");

        let mut held = store
            .lock(
                "instance",
                None,
                Some("i1"),
                LockOptions {
                    ttl: 0,
                    ..LockOptions::default()
                },
            )
            .await
            .expect("acquire");

        // A zero TTL lease is expired by the time we refresh it.
        assert!(matches!(held.refresh().await, Err(LockError::Expired(_))));
    }

    #[tokio::test]
    async fn stale_locks_for_dead_pids_are_cleared() {
        let engine = MemoryEngine::new();
        let mut store = shared_store(&engine, "sf-1");

        // Plant a lock held by a pid that cannot exist.
        let holder = encode_json(&LockHolder {
            node: "sf-1".to_owned(),
            operation: Some("crashed".to_owned()),
            pid: i32::MAX as i64 - 1,
        })
        .expect("encode");
        let mut planted = engine.clone();
        planted
            .put("/sflocks/sf/instance/i-dead", &holder, None)
            .await
            .expect("plant");

        // And one held by this very process, which must survive.
        let live = store
            .lock("instance", None, Some("i-live"), LockOptions::default())
            .await
            .expect("acquire");

        store.clear_stale_locks().await.expect("clear");

        let locks = store.existing_locks().await.expect("inventory");
        assert!(!locks.contains_key("/sflocks/sf/instance/i-dead"));
        assert!(locks.contains_key("/sflocks/sf/instance/i-live"));

        live.release().await.expect("release");
    }

    #[tokio::test]
    async fn locks_are_forbidden_inside_a_readonly_scope() {
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        store.begin_readonly().expect("begin");
        assert!(matches!(
            store
                .lock("instance", None, Some("i1"), LockOptions::default())
                .await,
            Err(LockError::Store(StoreError::ForbiddenWhileCached(_)))
        ));
    }
}
