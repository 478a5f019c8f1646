//! Per-channel agent state machine.
//!
//! One `SocketAgent` wraps one framed Unix-socket connection to the agent
//! inside a guest. It tracks how ready that agent is, polls it while it is
//! quiet, executes dequeued agent operations once it is ready, and tears
//! itself down when the guest goes silent.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tempfile::NamedTempFile;
use tokio::net::UnixStream;
use tokio::time::{Duration, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use sunfish_eventlog::{EVENT_TYPE_AUDIT, EVENT_TYPE_STATUS, EventWriter};
use sunfish_objects::agentop::{STATE_COMPLETE, STATE_EXECUTING};
use sunfish_objects::{Blob, DatabaseBackedObject, Instance};
use sunfish_store::{Store, unix_now};

use crate::ChannelError;
use crate::protocol::{AgentCommand, FILE_CHUNK_SIZE, Packet, PacketCodec};

/// Only look for new agent operations once the channel has been quiet this
/// long; a busy channel means the agent is already mid-something.
pub const DISPATCH_QUIET_SECONDS: f64 = 5.0;

/// A channel silent this long is dead. Tear it down and let the reconciler
/// build a new one.
pub const IDLE_TIMEOUT_SECONDS: f64 = 15.0;

/// How often the base poll tasks (readiness probes) go out.
const POLL_TASK_INTERVAL: Duration = Duration::from_secs(5);

/// How ready the in-guest agent is. The display strings are what lands in
/// the instance's `agent_state` attribute, where users see them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    NeverTalked,
    StoppedTalking,
    AgentStarted,
    AgentStopped,
    Ready,
    ReadyDegraded,
    NotReady(String),
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Readiness::NeverTalked => write!(f, "not ready (no contact)"),
            Readiness::StoppedTalking => write!(f, "not ready (unresponsive)"),
            Readiness::AgentStarted => write!(f, "not ready (agent startup)"),
            Readiness::AgentStopped => write!(f, "not ready (agent stopped)"),
            Readiness::Ready => write!(f, "ready"),
            Readiness::ReadyDegraded => write!(f, "ready (degraded)"),
            Readiness::NotReady(message) => write!(f, "not ready ({message})"),
        }
    }
}

/// The base polling tasks. A small ordered set: `is-system-running` is in
/// it until the agent reports ready, and returns whenever the agent
/// restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTask {
    IsSystemRunning,
}

/// Handed to the completion callback of a file GET; the receiver owns the
/// staging file.
pub struct FileGetResult {
    pub source_path: String,
    pub stat: Map<String, Value>,
    pub file: NamedTempFile,
}

pub type FileGetCallback = Box<dyn FnOnce(FileGetResult) + Send>;

struct FileGetInFlight {
    file: NamedTempFile,
    source_path: String,
    stat: Map<String, Value>,
    callback: FileGetCallback,
}

pub struct SocketAgent {
    framed: Framed<UnixStream, PacketCodec>,
    instance: Instance,
    channel_name: String,
    storage_path: PathBuf,

    readiness: Readiness,
    system_boot_time: f64,
    last_data: Instant,
    last_poll_sent: Option<Instant>,
    poll_tasks: Vec<PollTask>,
    file_get: Option<FileGetInFlight>,
    announced: bool,
}

impl SocketAgent {
    pub async fn connect(
        instance: Instance,
        channel_name: &str,
        socket_path: &Path,
        storage_path: PathBuf,
    ) -> Result<Self, ChannelError> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self::from_stream(instance, channel_name, stream, storage_path))
    }

    /// Wrap an already-connected stream; `connect` is this plus the dial.
    pub fn from_stream(
        instance: Instance,
        channel_name: &str,
        stream: UnixStream,
        storage_path: PathBuf,
    ) -> Self {
        Self {
            framed: Framed::new(stream, PacketCodec),
            instance,
            channel_name: channel_name.to_owned(),
            storage_path,
            readiness: Readiness::NeverTalked,
            system_boot_time: 0.0,
            last_data: Instant::now(),
            last_poll_sent: None,
            poll_tasks: vec![PollTask::IsSystemRunning],
            file_get: None,
            announced: false,
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// True exactly once, on the first call: the monitor audits
    /// "sidechannel connected" when the first packet arrives.
    pub fn announce_connected(&mut self) -> bool {
        !std::mem::replace(&mut self.announced, true)
    }

    /// Non-blocking read of the next buffered packet.
    pub fn try_next_packet(&mut self) -> Result<Option<Packet>, ChannelError> {
        match self.framed.next().now_or_never() {
            None => Ok(None),
            Some(None) => Err(ChannelError::Closed),
            Some(Some(Ok(packet))) => {
                self.last_data = Instant::now();
                Ok(Some(packet))
            }
            Some(Some(Err(err))) => Err(err),
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ChannelError> {
        self.framed.send(packet).await
    }

    pub async fn send_ping(&mut self) -> Result<(), ChannelError> {
        self.send(Packet::new("ping")).await
    }

    async fn is_system_running(&mut self) -> Result<(), ChannelError> {
        self.send(Packet::new("is-system-running")).await
    }

    async fn gather_facts(&mut self) -> Result<(), ChannelError> {
        self.send(Packet::new("gather-facts")).await
    }

    pub async fn chmod(&mut self, path: &str, mode: &Value) -> Result<(), ChannelError> {
        self.send(
            Packet::new("chmod")
                .with("path", json!(path))
                .with("mode", mode.clone()),
        )
        .await
    }

    /// Ask the agent for a file; `callback` fires once when the final
    /// `chunk: null` arrives.
    pub async fn get_file(
        &mut self,
        path: &str,
        callback: FileGetCallback,
    ) -> Result<(), ChannelError> {
        let file = NamedTempFile::new()?;
        self.file_get = Some(FileGetInFlight {
            file,
            source_path: path.to_owned(),
            stat: Map::new(),
            callback,
        });
        self.send(Packet::new("get-file").with("path", json!(path)))
            .await
    }

    /// Stream a local file to the guest in bounded base64 chunks.
    pub async fn put_file(
        &mut self,
        source: &Path,
        destination: &str,
    ) -> Result<(), ChannelError> {
        let content = tokio::fs::read(source).await.map_err(|err| {
            ChannelError::Put(format!("source path {} unreadable: {err}", source.display()))
        })?;

        self.send(
            Packet::new("put-file")
                .with("path", json!(destination))
                .with("stat_result", json!({"size": content.len()})),
        )
        .await?;
        for chunk in content.chunks(FILE_CHUNK_SIZE) {
            self.send(
                Packet::new("put-file")
                    .with("path", json!(destination))
                    .with("chunk", json!(B64.encode(chunk))),
            )
            .await?;
        }
        self.send(
            Packet::new("put-file")
                .with("path", json!(destination))
                .with("chunk", Value::Null),
        )
        .await
    }

    async fn set_readiness(
        &mut self,
        store: &mut Store,
        readiness: Readiness,
    ) -> Result<(), ChannelError> {
        self.instance
            .set_agent_state(store, &readiness.to_string())
            .await?;
        self.readiness = readiness;
        Ok(())
    }

    async fn audit(
        &self,
        store: &mut Store,
        events: &mut EventWriter,
        message: &str,
        extra: Option<Value>,
    ) -> Result<(), ChannelError> {
        events
            .record_event(
                store,
                Instance::OBJECT_TYPE,
                self.instance.uuid(),
                EVENT_TYPE_AUDIT,
                message,
                0.0,
                extra,
            )
            .await?;
        Ok(())
    }

    /// Drive the channel forward. Call once per monitor tick, after any
    /// inbound packets were dispatched.
    pub async fn poll(
        &mut self,
        store: &mut Store,
        events: &mut EventWriter,
    ) -> Result<(), ChannelError> {
        let silent = self.last_data.elapsed().as_secs_f64();

        if silent > IDLE_TIMEOUT_SECONDS {
            if self.readiness != Readiness::NeverTalked {
                self.set_readiness(store, Readiness::StoppedTalking).await?;
            }
            debug!(
                instance = %self.instance.uuid(),
                channel = %self.channel_name,
                "not receiving traffic, aborting"
            );
            if self.system_boot_time != 0.0 {
                events
                    .record_event(
                        store,
                        Instance::OBJECT_TYPE,
                        self.instance.uuid(),
                        EVENT_TYPE_STATUS,
                        "agent has gone silent, restarting channel",
                        0.0,
                        None,
                    )
                    .await?;
            }
            // The OS might already consider the socket closed.
            let _ = self.framed.close().await;
            return Err(ChannelError::Idle);
        }

        // Only dispatch new work while the channel is quiet but not yet
        // considered dead.
        if silent > DISPATCH_QUIET_SECONDS
            && self.readiness == Readiness::Ready
            && self.file_get.is_none()
        {
            return self.dispatch_agent_operation(store, events).await;
        }

        self.run_poll_tasks().await
    }

    async fn run_poll_tasks(&mut self) -> Result<(), ChannelError> {
        let due = match self.last_poll_sent {
            Some(sent) => sent.elapsed() >= POLL_TASK_INTERVAL,
            None => true,
        };
        if !due {
            return Ok(());
        }

        for task in self.poll_tasks.clone() {
            match task {
                PollTask::IsSystemRunning => self.is_system_running().await?,
            }
        }
        self.last_poll_sent = Some(Instant::now());
        Ok(())
    }

    async fn dispatch_agent_operation(
        &mut self,
        store: &mut Store,
        events: &mut EventWriter,
    ) -> Result<(), ChannelError> {
        let Some(operation) = self.instance.agent_operation_dequeue(store).await? else {
            return Ok(());
        };

        self.audit(
            store,
            events,
            "dequeued agent operation",
            Some(json!({"agentoperation": operation.uuid()})),
        )
        .await?;
        operation.set_state(store, STATE_EXECUTING).await?;

        let commands = operation.commands().to_vec();
        for (index, command) in commands.iter().enumerate() {
            let name = command
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();

            match name {
                "put-blob" => {
                    let blob_uuid = command
                        .get("blob_uuid")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let blob = Blob::from_db(store, blob_uuid).await?;
                    let blob_path = Blob::filepath(&self.storage_path, blob_uuid);
                    if blob.is_none() || !blob_path.exists() {
                        operation
                            .set_error(store, &format!("blob missing: {blob_uuid}"))
                            .await?;
                        break;
                    }

                    let destination = command
                        .get("path")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if let Err(err) = self.put_file(&blob_path, destination).await {
                        operation
                            .add_result(store, index, json!({"error": err.to_string()}))
                            .await?;
                        break;
                    }
                }

                "chmod" => {
                    let path = command
                        .get("path")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let mode = command.get("mode").cloned().unwrap_or(Value::Null);
                    if let Err(err) = self.chmod(path, &mode).await {
                        operation
                            .add_result(store, index, json!({"error": err.to_string()}))
                            .await?;
                        break;
                    }
                }

                _ => {
                    self.audit(
                        store,
                        events,
                        "unknown agent operation command, aborting operation",
                        Some(json!({
                            "agentoperation": operation.uuid(),
                            "command": command.get("command"),
                        })),
                    )
                    .await?;
                    break;
                }
            }
        }

        // Complete even when a command failed to send: failures surface as
        // per-command results and the error attribute, not as state.
        operation.set_state(store, STATE_COMPLETE).await?;
        Ok(())
    }

    /// Route one inbound packet to its handler.
    pub async fn dispatch(
        &mut self,
        store: &mut Store,
        events: &mut EventWriter,
        packet: Packet,
    ) -> Result<(), ChannelError> {
        match packet.command() {
            AgentCommand::AgentStart => self.on_agent_start(store, events, &packet).await,
            AgentCommand::AgentStop => self.on_agent_stop(store).await,
            AgentCommand::IsSystemRunningResponse => {
                self.on_is_system_running_response(store, events, &packet)
                    .await
            }
            AgentCommand::GatherFactsResponse => {
                self.on_gather_facts_response(store, events, &packet).await
            }
            AgentCommand::GetFileResponse => self.on_get_file_response(&packet),
            AgentCommand::WatchFileResponse => {
                info!(path = packet.get_str("path"), "received watch content");
                Ok(())
            }
            AgentCommand::ExecuteResponse => {
                info!("received execute response");
                Ok(())
            }
            AgentCommand::ChmodResponse => {
                info!("received chmod response");
                Ok(())
            }
            AgentCommand::ChownResponse => {
                info!("received chown response");
                Ok(())
            }
            AgentCommand::Ping => self.send(Packet::new("pong")).await,
            AgentCommand::Pong => {
                debug!(channel = %self.channel_name, "pong");
                Ok(())
            }
            AgentCommand::Unknown(command) => {
                warn!(command, "unknown packet command");
                Ok(())
            }
        }
    }

    async fn on_agent_start(
        &mut self,
        store: &mut Store,
        events: &mut EventWriter,
        packet: &Packet,
    ) -> Result<(), ChannelError> {
        self.set_readiness(store, Readiness::AgentStarted).await?;
        self.instance.set_agent_start_time(store, unix_now()).await?;
        self.record_system_boot_time(store, events, packet.get_f64("system_boot_time"))
            .await?;

        if !self.poll_tasks.contains(&PollTask::IsSystemRunning) {
            self.poll_tasks.push(PollTask::IsSystemRunning);
        }
        Ok(())
    }

    async fn on_agent_stop(&mut self, store: &mut Store) -> Result<(), ChannelError> {
        self.set_readiness(store, Readiness::AgentStopped).await
    }

    async fn record_system_boot_time(
        &mut self,
        store: &mut Store,
        events: &mut EventWriter,
        boot_time: f64,
    ) -> Result<(), ChannelError> {
        if boot_time != self.system_boot_time {
            if self.system_boot_time != 0.0 {
                self.audit(store, events, "reboot detected", None).await?;
            }
            self.system_boot_time = boot_time;
            self.instance
                .set_agent_system_boot_time(store, boot_time)
                .await?;
        }
        Ok(())
    }

    async fn on_is_system_running_response(
        &mut self,
        store: &mut Store,
        events: &mut EventWriter,
        packet: &Packet,
    ) -> Result<(), ChannelError> {
        let ready = packet
            .get("result")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.record_system_boot_time(store, events, packet.get_f64("system_boot_time"))
            .await?;

        let new_state = if ready {
            if let Some(position) = self
                .poll_tasks
                .iter()
                .position(|task| *task == PollTask::IsSystemRunning)
            {
                self.poll_tasks.remove(position);
            }
            Readiness::Ready
        } else {
            // Degraded is special: the system is as ready as it is ever
            // going to be, just not entirely happy.
            match packet.get_str("message").unwrap_or("none") {
                "degraded" => Readiness::ReadyDegraded,
                message => Readiness::NotReady(message.to_owned()),
            }
        };

        debug!(
            old = %self.readiness,
            new = %new_state,
            "agent state"
        );

        // The readiness is cached to keep database load down; facts are
        // gathered on the transition into ready.
        if self.readiness != new_state {
            let becoming_ready = new_state == Readiness::Ready;
            self.set_readiness(store, new_state).await?;
            if becoming_ready {
                self.gather_facts().await?;
            }
        }
        Ok(())
    }

    async fn on_gather_facts_response(
        &mut self,
        store: &mut Store,
        events: &mut EventWriter,
        packet: &Packet,
    ) -> Result<(), ChannelError> {
        self.audit(store, events, "received system facts", None).await?;
        self.instance
            .set_agent_facts(store, packet.get("result").unwrap_or(&Value::Null))
            .await?;
        Ok(())
    }

    fn on_get_file_response(&mut self, packet: &Packet) -> Result<(), ChannelError> {
        if self.file_get.is_none() {
            warn!(command = packet.command_name(), "unexpected file response");
            return Ok(());
        }
        if packet.get("result").and_then(Value::as_bool) == Some(false) {
            warn!("file get failed");
            return Ok(());
        }

        if !packet.contains("chunk") {
            // A metadata packet.
            if let Some(in_flight) = self.file_get.as_mut() {
                if let Some(stat) = packet.get("stat_result").and_then(Value::as_object) {
                    in_flight.stat.extend(stat.clone());
                }
            }
            return Ok(());
        }

        match packet.get("chunk") {
            Some(Value::Null) => {
                if let Some(mut done) = self.file_get.take() {
                    done.file.flush()?;
                    info!(path = %done.source_path, "file get complete");
                    (done.callback)(FileGetResult {
                        source_path: done.source_path,
                        stat: done.stat,
                        file: done.file,
                    });
                }
                Ok(())
            }
            Some(Value::String(encoded)) => {
                let bytes = B64
                    .decode(encoded)
                    .map_err(|err| ChannelError::BadPacket(format!("chunk not base64: {err}")))?;
                if let Some(in_flight) = self.file_get.as_mut() {
                    in_flight.file.write_all(&bytes)?;
                }
                Ok(())
            }
            _ => {
                warn!("malformed file chunk");
                Ok(())
            }
        }
    }
}
