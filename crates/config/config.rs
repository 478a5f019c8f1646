//! Node configuration, read once from `SF_*` environment variables.

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

/// Event types understood by the event log. The set is closed: the pruner
/// and the per-type metrics counters are both derived from it.
pub const EVENT_TYPE_AUDIT: &str = "audit";
pub const EVENT_TYPE_STATUS: &str = "status";
pub const EVENT_TYPE_HISTORIC: &str = "historic";

pub const EVENT_TYPES: &[&str] = &[EVENT_TYPE_AUDIT, EVENT_TYPE_STATUS, EVENT_TYPE_HISTORIC];

const DAY_SECONDS: i64 = 24 * 3600;

#[derive(Debug, Clone)]
pub struct Config {
    /// This node's name, used as its queue name and lock holder identity.
    pub node_name: String,
    /// Whether this node is the designated network node. The network node
    /// also recovers the shared `networknode` queue at startup.
    pub node_is_network_node: bool,

    pub etcd_host: String,
    pub etcd_port: u16,

    /// Root of all per-node on-disk state (events, blobs, instances).
    pub storage_path: PathBuf,

    /// Seconds after which a lock acquisition logs a "waiting" line.
    pub slow_lock_threshold: u64,

    pub eventlog_node_ip: String,
    pub eventlog_api_port: u16,
    pub eventlog_metrics_port: u16,

    /// Maximum ages in seconds per event type; -1 disables pruning.
    pub max_audit_event_age: i64,
    pub max_status_event_age: i64,
    pub max_historic_event_age: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid integer in env var {name}: {source}")]
    InvalidInteger { name: String, source: ParseIntError },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_name = env::var("SF_NODE_NAME")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| "localhost".to_owned());

        Ok(Self {
            node_name,
            node_is_network_node: read_bool("SF_NODE_IS_NETWORK_NODE"),
            etcd_host: env::var("SF_ETCD_HOST").unwrap_or_else(|_| "localhost".to_owned()),
            etcd_port: read_u16("SF_ETCD_PORT", 2379)?,
            storage_path: PathBuf::from(
                env::var("SF_STORAGE_PATH").unwrap_or_else(|_| "/srv/sunfish".to_owned()),
            ),
            slow_lock_threshold: read_u64("SF_SLOW_LOCK_THRESHOLD", 5)?,
            eventlog_node_ip: env::var("SF_EVENTLOG_NODE_IP")
                .unwrap_or_else(|_| "127.0.0.1".to_owned()),
            eventlog_api_port: read_u16("SF_EVENTLOG_API_PORT", 8001)?,
            eventlog_metrics_port: read_u16("SF_EVENTLOG_METRICS_PORT", 8002)?,
            max_audit_event_age: read_i64("SF_MAX_AUDIT_EVENT_AGE", -1)?,
            max_status_event_age: read_i64("SF_MAX_STATUS_EVENT_AGE", 30 * DAY_SECONDS)?,
            max_historic_event_age: read_i64("SF_MAX_HISTORIC_EVENT_AGE", 7 * DAY_SECONDS)?,
        })
    }

    /// The maximum age for one event type, or -1 when pruning is disabled
    /// for it.
    pub fn max_event_age(&self, event_type: &str) -> i64 {
        match event_type {
            EVENT_TYPE_AUDIT => self.max_audit_event_age,
            EVENT_TYPE_STATUS => self.max_status_event_age,
            EVENT_TYPE_HISTORIC => self.max_historic_event_age,
            _ => -1,
        }
    }

    pub fn etcd_url(&self) -> String {
        format!("http://{}:{}/v3beta", self.etcd_host, self.etcd_port)
    }

    pub fn eventlog_endpoint(&self) -> String {
        format!("http://{}:{}", self.eventlog_node_ip, self.eventlog_api_port)
    }

    pub fn blob_path(&self, blob_uuid: &str) -> PathBuf {
        self.storage_path.join("blobs").join(blob_uuid)
    }

    pub fn instance_path(&self, instance_uuid: &str) -> PathBuf {
        self.storage_path.join("instances").join(instance_uuid)
    }

    pub fn events_path(&self) -> PathBuf {
        self.storage_path.join("events")
    }
}

fn read_bool(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn read_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<u16>().map_err(|source| ConfigError::InvalidInteger {
            name: name.to_owned(),
            source,
        }),
        Err(_) => Ok(default),
    }
}

fn read_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<u64>().map_err(|source| ConfigError::InvalidInteger {
            name: name.to_owned(),
            source,
        }),
        Err(_) => Ok(default),
    }
}

fn read_i64(name: &str, default: i64) -> Result<i64, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<i64>().map_err(|source| ConfigError::InvalidInteger {
            name: name.to_owned(),
            source,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let config = match Config::from_env() {
            Ok(config) => config,
            Err(_) => return,
        };

        assert_eq!(config.etcd_port, 2379);
        assert_eq!(config.max_audit_event_age, -1);
        assert_eq!(config.max_historic_event_age, 7 * DAY_SECONDS);
    }

    #[test]
    fn event_age_lookup_covers_all_declared_types() {
        let config = match Config::from_env() {
            Ok(config) => config,
            Err(_) => return,
        };

        for event_type in EVENT_TYPES {
            // -1 is a legal answer (pruning disabled), zero ages are not.
            assert_ne!(config.max_event_age(event_type), 0);
        }
        assert_eq!(config.max_event_age("unknown"), -1);
    }
}
