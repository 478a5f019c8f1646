//! The side-channel supervisor: the per-node parent daemon.
//!
//! Each tick it asks the hypervisor which of our domains are running and
//! reconciles its set of monitor children against that: spawn one child
//! per newly running VM, terminate the child of any VM that stopped, reap
//! whatever exited on its own. Children are real OS processes so that a
//! hostile or broken guest can only take down its own monitor.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sunfish_config::Config;
use sunfish_eventlog::{EVENT_TYPE_AUDIT, EventWriter};
use sunfish_store::{Store, ignore_exception};

use crate::ChannelError;
use crate::hypervisor::{Hypervisor, INACTIVE_POWER_STATES, instance_uuid_from_domain};

const TICK: Duration = Duration::from_secs(1);

/// How long children get to honor SIGTERM before we ask them to dump state.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct SideChannelSupervisor {
    config: Config,
    store: Store,
    events: EventWriter,
    hypervisor: Box<dyn Hypervisor>,
    monitors: HashMap<String, Child>,
    shutdown_commenced: Option<Instant>,
    sigusr1_sent: bool,
}

impl SideChannelSupervisor {
    pub fn new(
        config: Config,
        store: Store,
        events: EventWriter,
        hypervisor: Box<dyn Hypervisor>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            hypervisor,
            monitors: HashMap::new(),
            shutdown_commenced: None,
            sigusr1_sent: false,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ChannelError> {
        info!("starting");

        // Crash recovery first: locks held by our dead predecessors, and
        // workitems they were mid-dispatch on.
        self.store.clear_stale_locks().await?;
        self.store
            .restart_queues(self.config.node_is_network_node)
            .await?;

        loop {
            if let Err(err) = self.reap_monitors().await {
                ignore_exception("sidechannel monitor", &err);
            }

            if !cancel.is_cancelled() {
                if let Err(err) = self.reconcile().await {
                    ignore_exception("sidechannel monitor", &err);
                }
            } else if !self.monitors.is_empty() {
                self.shutdown_tick();
            } else {
                break;
            }

            tokio::time::sleep(TICK).await;
        }

        info!("terminated");
        Ok(())
    }

    /// Remove children that exited on their own.
    async fn reap_monitors(&mut self) -> Result<(), ChannelError> {
        let mut ended = Vec::new();
        for (instance_uuid, child) in self.monitors.iter_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                info!(
                    instance = %instance_uuid,
                    %status,
                    "reaped dead sidechannel monitor"
                );
                ended.push(instance_uuid.clone());
            }
        }

        for instance_uuid in ended {
            self.monitors.remove(&instance_uuid);
            self.audit(&instance_uuid, "sidechannel monitor ended").await;
        }
        Ok(())
    }

    /// Make the monitor set match what the hypervisor says is running.
    async fn reconcile(&mut self) -> Result<(), ChannelError> {
        let mut running = Vec::new();
        for domain in self.hypervisor.domains().await? {
            // A domain that is not running should not have a monitor.
            if INACTIVE_POWER_STATES.contains(&domain.power_state.as_str()) {
                continue;
            }
            if let Some(instance_uuid) = instance_uuid_from_domain(&domain.name) {
                running.push(instance_uuid.to_owned());
            }
        }

        let extra: Vec<String> = self
            .monitors
            .keys()
            .filter(|uuid| !running.contains(uuid))
            .cloned()
            .collect();
        let missing: Vec<String> = running
            .into_iter()
            .filter(|uuid| !self.monitors.contains_key(uuid))
            .collect();

        for instance_uuid in missing {
            match spawn_monitor(&instance_uuid) {
                Ok(child) => {
                    self.monitors.insert(instance_uuid.clone(), child);
                    self.audit(&instance_uuid, "sidechannel monitor started").await;
                }
                Err(err) => {
                    ignore_exception(
                        &format!("spawn sidechannel monitor for {instance_uuid}"),
                        &err,
                    );
                }
            }
        }

        for instance_uuid in extra {
            if let Some(mut child) = self.monitors.remove(&instance_uuid) {
                signal_child(&child, libc::SIGTERM);
                let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
            }
            self.audit(&instance_uuid, "sidechannel monitor finished").await;
        }
        Ok(())
    }

    fn shutdown_tick(&mut self) {
        let commenced = match self.shutdown_commenced {
            Some(commenced) => commenced,
            None => {
                let now = Instant::now();
                self.shutdown_commenced = Some(now);
                for (instance_uuid, child) in &self.monitors {
                    info!(
                        instance = %instance_uuid,
                        pid = child.id(),
                        "sent SIGTERM to sidechannel monitor"
                    );
                    signal_child(child, libc::SIGTERM);
                }
                now
            }
        };

        if commenced.elapsed() > SHUTDOWN_GRACE && !self.sigusr1_sent {
            warn!("we have taken more than ten seconds to shut down");
            warn!("dumping thread traces");
            for (instance_uuid, child) in &self.monitors {
                warn!(
                    instance = %instance_uuid,
                    pid = child.id(),
                    "sidechannel monitor still running"
                );
                signal_child(child, libc::SIGUSR1);
            }
            self.sigusr1_sent = true;
        }
    }

    async fn audit(&mut self, instance_uuid: &str, message: &str) {
        if let Err(err) = self
            .events
            .record_event(
                &mut self.store,
                "instance",
                instance_uuid,
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

    #[cfg(test)]
    fn monitored_instances(&self) -> Vec<String> {
        self.monitors.keys().cloned().collect()
    }
}

/// Start one monitor child: this binary re-executed with the monitor
/// subcommand, with argv[0] overridden so ps shows which instance it is.
fn spawn_monitor(instance_uuid: &str) -> Result<Child, std::io::Error> {
    let exe = std::env::current_exe()?;

    let mut command = std::process::Command::new(exe);
    {
        use std::os::unix::process::CommandExt;
        command.arg0(format!("sf-sidechannel-{instance_uuid}"));
    }
    command.args(["sc-monitor", instance_uuid]);

    let mut command = Command::from(command);
    command.kill_on_drop(true);
    command.spawn()
}

fn signal_child(child: &Child, signal: i32) {
    let Some(pid) = child.id() else {
        return;
    };
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, signal, error = %err, "failed to signal sidechannel monitor");
        }
    }
}
