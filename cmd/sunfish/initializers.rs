use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    fmt().with_env_filter(log_filter).init();
}

/// Shutdown is cooperative: SIGTERM or ctrl-c cancels the token and every
/// daemon loop notices at its next tick.
pub fn cancel_on_shutdown_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("received interrupt, shutting down");
                }
            }
        }
        cancel.cancel();
    });
}

/// The supervisor prods slow children with SIGUSR1 when shutdown drags on;
/// a monitor answers by dumping what it is doing instead of dying.
pub fn dump_state_on_sigusr1() {
    tokio::spawn(async move {
        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(sigusr1) => sigusr1,
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGUSR1");
                return;
            }
        };

        while sigusr1.recv().await.is_some() {
            warn!("SIGUSR1 received, dumping state");
            warn!(
                tasks = tokio::runtime::Handle::current().metrics().num_alive_tasks(),
                "monitor is still running"
            );
        }
    });
}
