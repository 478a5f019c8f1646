//! Prometheus counters for the event-log daemon, served as text by axum.

use std::collections::HashMap;
use std::sync::LazyLock;

use axum::Router;
use axum::routing::get;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sunfish_config::EVENT_TYPES;

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

pub struct Metrics {
    registry: Registry,
    pub pruned_events: IntCounter,
    pub pruned_sweep: IntCounter,
    event_counters: HashMap<&'static str, IntCounter>,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let pruned_events =
            IntCounter::new("pruned_events", "Number of pruned events").unwrap();
        let pruned_sweep = IntCounter::new(
            "pruned_sweep",
            "Number of databases checked for pruning",
        )
        .unwrap();
        registry.register(Box::new(pruned_events.clone())).unwrap();
        registry.register(Box::new(pruned_sweep.clone())).unwrap();

        let mut event_counters = HashMap::new();
        for event_type in EVENT_TYPES {
            let counter = IntCounter::new(
                format!("{event_type}_events"),
                format!("Number of {event_type} events seen"),
            )
            .unwrap();
            registry.register(Box::new(counter.clone())).unwrap();
            event_counters.insert(*event_type, counter);
        }

        Self {
            registry,
            pruned_events,
            pruned_sweep,
            event_counters,
        }
    }

    pub fn record_event(&self, event_type: &str) {
        if let Some(counter) = self.event_counters.get(event_type) {
            counter.inc();
        }
    }

    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Serve `/metrics` until cancelled.
pub async fn serve(port: u16, cancel: CancellationToken) {
    let app = Router::new().route("/metrics", get(|| async { METRICS.render() }));

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(port, error = %err, "cannot bind metrics listener");
            return;
        }
    };

    info!(port, "serving eventlog metrics");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        error!(error = %err, "metrics server failed");
    }
}
