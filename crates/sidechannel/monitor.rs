//! The per-VM monitor: one child process per running instance.
//!
//! The child waits for the guest to produce a console log, opens every
//! configured side-channel socket as it appears, and then loops: drain
//! inbound packets, dispatch them, rebuild missing channels, poll the live
//! ones. Connection trouble on a channel just drops that channel; the next
//! tick rebuilds it.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sunfish_config::Config;
use sunfish_eventlog::{EVENT_TYPE_AUDIT, EVENT_TYPE_STATUS, EventWriter};
use sunfish_objects::{DatabaseBackedObject, Instance, STATE_DELETED};
use sunfish_store::{Store, ignore_exception};

use crate::ChannelError;
use crate::agent::SocketAgent;

const TICK: Duration = Duration::from_secs(1);

pub struct InstanceMonitor {
    config: Config,
    store: Store,
    events: EventWriter,
    instance: Instance,
    channels: HashMap<String, SocketAgent>,
}

impl InstanceMonitor {
    /// Load the instance and refuse to monitor one that is deleted.
    pub async fn new(
        config: Config,
        mut store: Store,
        events: EventWriter,
        instance_uuid: &str,
    ) -> Result<Option<Self>, ChannelError> {
        let Some(instance) = Instance::from_db(&mut store, instance_uuid).await? else {
            warn!(instance = instance_uuid, "no such instance, not monitoring");
            return Ok(None);
        };

        let state = instance.state(&mut store).await?;
        if state.as_ref().map(|state| state.value.as_str()) == Some(STATE_DELETED) {
            info!(instance = instance_uuid, "instance is deleted, not monitoring");
            return Ok(None);
        }

        Ok(Some(Self {
            config,
            store,
            events,
            instance,
            channels: HashMap::new(),
        }))
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ChannelError> {
        let instance_path = self.instance.instance_path(&self.config.storage_path);

        // No console log yet means the VM has not really started; there is
        // nothing to talk to until it has.
        let console_path = instance_path.join("console.log");
        while !console_path.exists() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(TICK).await;
        }
        self.status_event("detected console log").await;

        self.build_side_channels(&instance_path).await;

        while !cancel.is_cancelled() {
            if let Err(err) = self.tick(&instance_path).await {
                ignore_exception("instance monitor", &err);
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(TICK) => {}
            }
        }

        info!(instance = %self.instance.uuid(), "instance monitor exiting");
        Ok(())
    }

    async fn tick(&mut self, instance_path: &Path) -> Result<(), ChannelError> {
        self.drain_channels().await;
        self.build_side_channels(instance_path).await;
        self.poll_channels().await;
        Ok(())
    }

    /// Read and dispatch every packet already buffered on every channel.
    async fn drain_channels(&mut self) {
        let names: Vec<String> = self.channels.keys().cloned().collect();

        for name in names {
            loop {
                let Some(agent) = self.channels.get_mut(&name) else {
                    break;
                };

                match agent.try_next_packet() {
                    Ok(None) => break,
                    Ok(Some(packet)) => {
                        if agent.announce_connected() {
                            self.audit_event(&format!("sidechannel {name} connected"))
                                .await;
                        }

                        let Some(agent) = self.channels.get_mut(&name) else {
                            break;
                        };
                        if let Err(err) =
                            agent.dispatch(&mut self.store, &mut self.events, packet).await
                        {
                            if err.drops_channel() {
                                debug!(channel = %name, error = %err, "dropping channel");
                                self.channels.remove(&name);
                            } else {
                                ignore_exception("packet dispatch", &err);
                            }
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(channel = %name, error = %err, "dropping channel");
                        self.channels.remove(&name);
                        break;
                    }
                }
            }
        }
    }

    /// Open any configured side channel whose socket now exists.
    async fn build_side_channels(&mut self, instance_path: &Path) {
        for name in self.instance.side_channels().to_vec() {
            if self.channels.contains_key(&name) {
                continue;
            }

            let socket_path = instance_path.join(format!("sc-{name}"));
            if !socket_path.exists() {
                continue;
            }

            match SocketAgent::connect(
                self.instance.clone(),
                &name,
                &socket_path,
                self.config.storage_path.clone(),
            )
            .await
            {
                Ok(mut agent) => {
                    if agent.send_ping().await.is_ok() {
                        self.channels.insert(name, agent);
                    }
                }
                Err(err) => {
                    debug!(channel = %name, error = %err, "cannot open side channel yet");
                }
            }
        }
    }

    async fn poll_channels(&mut self) {
        let names: Vec<String> = self.channels.keys().cloned().collect();

        for name in names {
            let Some(agent) = self.channels.get_mut(&name) else {
                continue;
            };
            if let Err(err) = agent.poll(&mut self.store, &mut self.events).await {
                if err.drops_channel() {
                    debug!(channel = %name, error = %err, "dropping channel");
                    self.channels.remove(&name);
                } else {
                    ignore_exception("channel poll", &err);
                }
            }
        }
    }

    async fn audit_event(&mut self, message: &str) {
        if let Err(err) = self
            .events
            .record_event(
                &mut self.store,
                Instance::OBJECT_TYPE,
                self.instance.uuid(),
                EVENT_TYPE_AUDIT,
                message,
                0.0,
                None,
            )
            .await
        {
            ignore_exception("audit event", &err);
        }
    }

    async fn status_event(&mut self, message: &str) {
        if let Err(err) = self
            .events
            .record_event(
                &mut self.store,
                Instance::OBJECT_TYPE,
                self.instance.uuid(),
                EVENT_TYPE_STATUS,
                message,
                0.0,
                None,
            )
            .await
        {
            ignore_exception("status event", &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use sunfish_store::MemoryEngine;
    use sunfish_store::backend::SortOrder;
    use tempfile::TempDir;

    async fn setup(side_channels: Vec<String>) -> (Config, Store, Instance, TempDir) {
        let storage = TempDir::new().expect("tempdir");
        let mut config = Config::from_env().expect("config");
        config.storage_path = storage.path().to_path_buf();

        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        let instance = Instance::new(&mut store, "i1", "system", side_channels)
            .await
            .expect("instance");
        instance
            .set_state(&mut store, sunfish_objects::STATE_CREATED)
            .await
            .expect("created");

        (config, store, instance, storage)
    }

    #[tokio::test]
    async fn deleted_instances_are_refused() {
        let (config, mut store, instance, _storage) = setup(vec![]).await;
        instance
            .set_state(&mut store, STATE_DELETED)
            .await
            .expect("deleted");

        let events = EventWriter::new("http://127.0.0.1:1", "sf-1");
        let monitor = InstanceMonitor::new(config, store, events, "i1")
            .await
            .expect("construct");
        assert!(monitor.is_none());
    }

    #[tokio::test]
    async fn missing_instances_are_refused() {
        let (config, store, _instance, _storage) = setup(vec![]).await;
        let events = EventWriter::new("http://127.0.0.1:1", "sf-1");
        let monitor = InstanceMonitor::new(config, store, events, "ghost")
            .await
            .expect("construct");
        assert!(monitor.is_none());
    }

    #[tokio::test]
    async fn channels_connect_when_their_sockets_appear() {
        let (config, store, instance, storage) = setup(vec!["agent".to_owned()]).await;
        let events = EventWriter::new("http://127.0.0.1:1", "sf-1");

        let mut monitor = InstanceMonitor::new(config, store, events, "i1")
            .await
            .expect("construct")
            .expect("monitor");

        let instance_path = instance.instance_path(storage.path());
        std::fs::create_dir_all(&instance_path).expect("instance dir");

        // No socket yet: nothing connects.
        monitor.build_side_channels(&instance_path).await;
        assert!(monitor.channels.is_empty());

        // A guest agent starts listening; the next tick picks it up.
        let listener = tokio::net::UnixListener::bind(instance_path.join("sc-agent"))
            .expect("listener");
        let accept = tokio::spawn(async move { listener.accept().await });

        monitor.build_side_channels(&instance_path).await;
        assert!(monitor.channels.contains_key("agent"));
        accept.await.expect("join").expect("accept");
    }

    #[tokio::test]
    async fn first_packet_audits_connected_once_per_channel() {
        use crate::protocol::{Packet, PacketCodec};
        use futures::SinkExt;
        use tokio_util::codec::Framed;

        let (config, store, _instance, storage) =
            setup(vec!["foo".to_owned(), "bar".to_owned()]).await;
        let events = EventWriter::new("http://127.0.0.1:1", "sf-1");

        let mut monitor = InstanceMonitor::new(config, store, events, "i1")
            .await
            .expect("construct")
            .expect("monitor");

        let instance_path = monitor.instance.instance_path(storage.path());
        std::fs::create_dir_all(&instance_path).expect("instance dir");

        for name in ["foo", "bar"] {
            let listener =
                tokio::net::UnixListener::bind(instance_path.join(format!("sc-{name}")))
                    .expect("listener");
            let accept = tokio::spawn(async move { listener.accept().await });
            monitor.build_side_channels(&instance_path).await;
            let (guest, _) = accept.await.expect("join").expect("accept");

            if name == "foo" {
                // Only sc-foo ever says anything.
                let mut guest = Framed::new(guest, PacketCodec);
                guest
                    .send(Packet::new("agent-start").with("system_boot_time", Value::from(100)))
                    .await
                    .expect("send");
                guest.flush().await.expect("flush");
                // Keep the socket open past the drain below.
                std::mem::forget(guest);
            } else {
                std::mem::forget(guest);
            }
        }
        assert_eq!(monitor.channels.len(), 2);

        // Give the kernel a moment to move the bytes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.drain_channels().await;
        monitor.drain_channels().await;

        let audits: Vec<String> = monitor
            .store
            .get_prefix_raw("/sf/event/instance/i1/", SortOrder::Ascend, 0)
            .await
            .expect("events")
            .into_iter()
            .filter_map(|(_, record)| {
                record
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .collect();

        assert_eq!(
            audits
                .iter()
                .filter(|message| *message == "sidechannel foo connected")
                .count(),
            1
        );
        assert!(
            !audits
                .iter()
                .any(|message| *message == "sidechannel bar connected")
        );

        // sc-foo heard the agent start; sc-bar was untouched.
        assert_eq!(
            monitor.channels["foo"].readiness().to_string(),
            "not ready (agent startup)"
        );
        assert_eq!(
            monitor.channels["bar"].readiness().to_string(),
            "not ready (no contact)"
        );
    }
}
