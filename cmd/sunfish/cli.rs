use clap::{Parser, Subcommand as ClapSubcommand};
use tracing::Level;

#[derive(Parser)]
#[command(
    name = "sunfish",
    author = "Sunfish Developers",
    version,
    about = "sunfish cluster hypervisor control plane"
)]
pub struct Cli {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(Parser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Node options",
        env = "SF_LOG_LEVEL"
    )]
    pub log_level: Level,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(about = "Run the event log daemon on the event node.")]
    Eventlog,

    #[command(about = "Run the side channel supervisor on this node.")]
    Sidechannel,

    /// Internal: the per-instance monitor child spawned by the supervisor.
    #[command(hide = true, name = "sc-monitor")]
    ScMonitor {
        #[arg(value_name = "INSTANCE_UUID")]
        instance_uuid: String,
    },
}
