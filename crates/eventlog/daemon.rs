//! The event-log daemon.
//!
//! One per cluster, on the event node. Serves the gRPC ingest endpoint,
//! drains events spilled into the KV store, and prunes old events by age.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sunfish_config::{Config, EVENT_TYPE_HISTORIC, EVENT_TYPES};
use sunfish_store::backend::SortOrder;
use sunfish_store::{Store, ignore_exception, unix_now};

use crate::EventError;
use crate::db::{EventLog, prune_targets};
use crate::metrics::{self, METRICS};
use crate::pb::event_service_server::EventServiceServer;
use crate::service::EventIngest;

/// How many spilled events to drain per loop.
const DRAIN_BATCH_LIMIT: u64 = 10_000;

/// Sweep all databases for prune targets at most this often.
const PRUNE_SWEEP_INTERVAL_SECONDS: f64 = 24.0 * 3600.0;

/// Budget per pruning slice; the remainder resumes next tick.
const PRUNE_SLICE_SECONDS: f64 = 10.0;

const IDLE_SLEEP: Duration = Duration::from_secs(10);

pub struct EventLogDaemon {
    config: Config,
    store: Store,
    prune_targets: Vec<(String, String)>,
    prune_sweep_started: f64,
}

impl EventLogDaemon {
    pub fn new(config: Config, store: Store) -> Self {
        Self {
            config,
            store,
            prune_targets: Vec::new(),
            prune_sweep_started: 0.0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), EventError> {
        info!("starting");

        // Force every node database open so any one-time format upgrade
        // runs now, at a predictable time, not mid-drain.
        self.open_all_node_databases().await?;

        let listen: SocketAddr = format!(
            "{}:{}",
            self.config.eventlog_node_ip, self.config.eventlog_api_port
        )
        .parse()
        .map_err(|_| {
            EventError::Address(format!(
                "{}:{}",
                self.config.eventlog_node_ip, self.config.eventlog_api_port
            ))
        })?;

        let ingest = EventIngest::new(self.config.events_path());
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            info!(%listen, "serving event ingest");
            if let Err(err) = tonic::transport::Server::builder()
                .add_service(EventServiceServer::new(ingest))
                .serve_with_shutdown(listen, shutdown.cancelled_owned())
                .await
            {
                error!(error = %err, "event ingest server failed");
            }
        });
        tokio::spawn(metrics::serve(
            self.config.eventlog_metrics_port,
            cancel.clone(),
        ));

        while !cancel.is_cancelled() {
            let did_work = match self.tick().await {
                Ok(did_work) => did_work,
                Err(err) => {
                    ignore_exception("eventlog daemon", &err);
                    false
                }
            };

            if !did_work {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                }
            }
        }

        info!("terminated");
        Ok(())
    }

    async fn open_all_node_databases(&mut self) -> Result<(), EventError> {
        let events_root = self.config.events_path();
        for (key, payload) in self
            .store
            .get_all("node", None, SortOrder::Ascend, 0)
            .await?
        {
            let node_uuid = payload
                .get("uuid")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| key.rsplit('/').next().unwrap_or_default().to_owned());
            if node_uuid.is_empty() {
                continue;
            }
            if let Err(err) = EventLog::open(&events_root, "node", &node_uuid) {
                ignore_exception(&format!("failed to open node event db {node_uuid}"), &err);
            }
        }
        Ok(())
    }

    async fn tick(&mut self) -> Result<bool, EventError> {
        // Spilled events first: this is how all events travelled in older
        // releases, and it is still the dead letter queue for times the
        // event node is not answering.
        if self.drain_spilled_events().await? {
            return Ok(true);
        }
        self.prune_slice()
    }

    async fn drain_spilled_events(&mut self) -> Result<bool, EventError> {
        let entries = self
            .store
            .get_all("event", None, SortOrder::None, DRAIN_BATCH_LIMIT)
            .await?;

        // Group by object so each database is opened exactly once.
        let mut grouped: HashMap<(String, String), Vec<(String, Value)>> = HashMap::new();
        for (key, record) in entries {
            let parts: Vec<&str> = key.split('/').collect();
            let [_, _, _, object_type, object_uuid, _] = parts.as_slice() else {
                ignore_exception(
                    &format!("failed to parse event key {key}"),
                    &"unexpected key shape",
                );
                continue;
            };
            grouped
                .entry(((*object_type).to_owned(), (*object_uuid).to_owned()))
                .or_default()
                .push((key.clone(), record));
        }

        let did_work = !grouped.is_empty();
        let events_root = self.config.events_path();

        for ((object_type, object_uuid), events) in grouped {
            let result = async {
                let log = EventLog::open(&events_root, &object_type, &object_uuid)?;
                for (key, record) in events {
                    let event_type = record
                        .get("event_type")
                        .and_then(Value::as_str)
                        .unwrap_or(EVENT_TYPE_HISTORIC)
                        .to_owned();
                    log.write_event(
                        &event_type,
                        record.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0),
                        record.get("fqdn").and_then(Value::as_str).unwrap_or(""),
                        record.get("duration").and_then(Value::as_f64).unwrap_or(0.0),
                        record.get("message").and_then(Value::as_str).unwrap_or(""),
                        record.get("extra").filter(|extra| !extra.is_null()),
                    )?;
                    METRICS.record_event(&event_type);
                    // Only remove the spilled copy once the local write
                    // stuck; a crash between the two duplicates nothing.
                    self.store.delete_raw(&key).await?;
                }
                Ok::<(), EventError>(())
            }
            .await;

            if let Err(err) = result {
                ignore_exception(
                    &format!("failed to write event for {object_type} {object_uuid}"),
                    &err,
                );
            }
        }

        Ok(did_work)
    }

    fn prune_slice(&mut self) -> Result<bool, EventError> {
        let now = unix_now();

        if self.prune_targets.is_empty() {
            if now - self.prune_sweep_started > PRUNE_SWEEP_INTERVAL_SECONDS {
                self.prune_targets = prune_targets(&self.config.events_path());
                self.prune_sweep_started = now;
                info!(targets = self.prune_targets.len(), "prune sweep started");
            }
            return Ok(false);
        }

        let slice_started = unix_now();
        let mut did_work = false;

        while unix_now() - slice_started < PRUNE_SLICE_SECONDS {
            let Some((object_type, object_uuid)) = self.prune_targets.pop() else {
                break;
            };

            let result = (|| {
                let log = EventLog::open(&self.config.events_path(), &object_type, &object_uuid)?;
                let mut count = 0;
                for event_type in EVENT_TYPES {
                    let max_age = self.config.max_event_age(event_type);
                    if max_age == -1 {
                        continue;
                    }
                    let pruned = log.prune_events(now - max_age as f64, event_type)?;
                    METRICS.pruned_events.inc_by(pruned);
                    count += pruned;
                }
                Ok::<u64, EventError>(count)
            })();

            match result {
                Ok(count) if count > 0 => {
                    info!(object_type, object_uuid, count, "pruned events");
                }
                Ok(_) => {}
                Err(err) => {
                    ignore_exception(
                        &format!("failed to prune {object_type} {object_uuid}"),
                        &err,
                    );
                }
            }
            METRICS.pruned_sweep.inc();
            did_work = true;
        }

        Ok(did_work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sunfish_store::MemoryEngine;
    use tempfile::TempDir;

    fn test_config(root: &TempDir) -> Config {
        let mut config = Config::from_env().expect("config");
        config.storage_path = root.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn spilled_events_drain_exactly_once() {
        let root = TempDir::new().expect("tempdir");
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");

        store
            .put(
                "event",
                Some("instance/i1"),
                Some("1700000000.5"),
                &json!({
                    "event_type": "audit",
                    "timestamp": 1700000000.5,
                    "fqdn": "sf-1",
                    "duration": 0.0,
                    "message": "spilled while event node was down",
                }),
            )
            .await
            .expect("spill");

        let mut daemon = EventLogDaemon::new(test_config(&root), store);
        assert!(daemon.drain_spilled_events().await.expect("drain"));

        // The KV copy is gone, so a second drain finds nothing: no
        // duplicates on the next loop.
        assert!(!daemon.drain_spilled_events().await.expect("drain again"));

        let log = EventLog::open(&daemon.config.events_path(), "instance", "i1").expect("open");
        assert_eq!(log.count_events().expect("count"), 1);
    }

    #[tokio::test]
    async fn malformed_event_keys_are_skipped() {
        let root = TempDir::new().expect("tempdir");
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        store
            .put_raw("/sf/event/not-enough-segments", "{}")
            .await
            .expect("plant");

        let mut daemon = EventLogDaemon::new(test_config(&root), store);
        // The malformed key groups to nothing but still counts as a seen
        // entry; the daemon must not error out over it.
        daemon.drain_spilled_events().await.expect("drain");
    }

    #[tokio::test]
    async fn prune_respects_disabled_ages() {
        let root = TempDir::new().expect("tempdir");
        let mut config = test_config(&root);
        config.max_audit_event_age = -1;
        config.max_status_event_age = 3600;

        {
            let log = EventLog::open(&config.events_path(), "instance", "i1").expect("open");
            log.write_event("audit", 10.0, "sf-1", 0.0, "ancient audit", None)
                .expect("write");
            log.write_event("status", 10.0, "sf-1", 0.0, "ancient status", None)
                .expect("write");
        }

        let store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        let mut daemon = EventLogDaemon::new(config, store);

        // First slice sweeps for targets, second prunes them.
        assert!(!daemon.prune_slice().expect("sweep"));
        assert!(daemon.prune_slice().expect("prune"));

        let log = EventLog::open(&daemon.config.events_path(), "instance", "i1").expect("open");
        let remaining = log.recent(10).expect("recent");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event_type, "audit");
    }
}
