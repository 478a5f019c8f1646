mod cli;
mod initializers;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use sunfish_config::Config;
use sunfish_eventlog::EventWriter;
use sunfish_eventlog::daemon::EventLogDaemon;
use sunfish_sidechannel::hypervisor::LibvirtCli;
use sunfish_sidechannel::monitor::InstanceMonitor;
use sunfish_sidechannel::supervisor::SideChannelSupervisor;
use sunfish_store::{EtcdGateway, Store};

use crate::cli::{Cli, Subcommand};

const LIBVIRT_URI: &str = "qemu:///system";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    initializers::init_tracing(&cli.opts);

    if let Err(error) = run(cli).await {
        error!(error = %error, "daemon failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = Config::from_env().map_err(|error| error.to_string())?;

    let cancel = CancellationToken::new();
    initializers::cancel_on_shutdown_signals(cancel.clone());

    let store = Store::new(
        Box::new(EtcdGateway::new(config.etcd_url())),
        &config.node_name,
    )
    .with_slow_lock_threshold(config.slow_lock_threshold);

    match cli.command {
        Subcommand::Eventlog => EventLogDaemon::new(config, store)
            .run(cancel)
            .await
            .map_err(|error| error.to_string()),

        Subcommand::Sidechannel => {
            let events = EventWriter::new(config.eventlog_endpoint(), &config.node_name);
            let hypervisor = Box::new(LibvirtCli::new(LIBVIRT_URI));
            SideChannelSupervisor::new(config, store, events, hypervisor)
                .run(cancel)
                .await
                .map_err(|error| error.to_string())
        }

        Subcommand::ScMonitor { instance_uuid } => {
            initializers::dump_state_on_sigusr1();
            let events = EventWriter::new(config.eventlog_endpoint(), &config.node_name);
            match InstanceMonitor::new(config, store, events, &instance_uuid)
                .await
                .map_err(|error| error.to_string())?
            {
                Some(monitor) => monitor
                    .run(cancel)
                    .await
                    .map_err(|error| error.to_string()),
                None => Ok(()),
            }
        }
    }
}
