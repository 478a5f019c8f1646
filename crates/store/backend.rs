//! The seam between the store facade and whatever actually holds the data.
//!
//! Anything offering get / put / create-if-absent / delete / prefix ranges /
//! lease-backed ownership / a liveness probe can sit behind this trait. The
//! production engine speaks to etcd's JSON gateway; tests and dev mode use
//! the in-memory engine.

use async_trait::async_trait;

use crate::error::StoreError;

pub type LeaseId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    None,
    Ascend,
    Descend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

#[async_trait]
pub trait KvEngine: Send + Sync {
    /// Liveness probe; engines are expected to repair themselves when it
    /// fails, so callers only see persistent trouble.
    async fn status(&mut self) -> Result<(), StoreError>;

    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    async fn get_prefix(
        &mut self,
        prefix: &str,
        sort: SortOrder,
        limit: u64,
    ) -> Result<Vec<KvPair>, StoreError>;

    async fn put(
        &mut self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError>;

    /// Write the key only if it does not exist. Returns false when it does.
    async fn create(
        &mut self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError>;

    /// Returns true when a key was actually removed.
    async fn delete(&mut self, key: &str) -> Result<bool, StoreError>;

    async fn delete_prefix(&mut self, prefix: &str) -> Result<(), StoreError>;

    /// Compare-and-delete: remove the key only while it still holds
    /// `expected`. The lock release path depends on this.
    async fn delete_if_value(&mut self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn lease_grant(&mut self, ttl_seconds: i64) -> Result<LeaseId, StoreError>;

    /// Returns false when the lease no longer exists.
    async fn lease_refresh(&mut self, lease: LeaseId) -> Result<bool, StoreError>;

    async fn lease_revoke(&mut self, lease: LeaseId) -> Result<(), StoreError>;

    /// A second, independent connection to the same data. Locks hold one of
    /// these so their traffic never interleaves with the owning store's.
    fn fork(&self) -> Box<dyn KvEngine>;
}

/// The key one past every key sharing `prefix`, for range queries.
pub fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_end_increments_last_byte() {
        assert_eq!(prefix_range_end("/sf/queue/"), b"/sf/queue0".to_vec());
        assert_eq!(prefix_range_end("a"), b"b".to_vec());
    }

    #[test]
    fn range_end_carries_past_0xff() {
        let mut prefix = String::from("a");
        prefix.push('\u{ff}');
        // '\u{ff}' is two bytes in UTF-8, so the carry stops inside the
        // encoded character; we only care that the result is a valid
        // successor byte string.
        let end = prefix_range_end(&prefix);
        assert!(end.as_slice() > prefix.as_bytes());
    }
}
