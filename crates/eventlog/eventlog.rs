//! Cluster event logging.
//!
//! Events about objects (audit trail, status changes, history) are appended
//! to per-object sqlite databases on the event-log node. Writers reach that
//! node over gRPC; when it is unreachable they spill events into the KV
//! store under `/sf/event/`, which the daemon drains as a dead letter
//! queue. Event writes are deliberately the one mutation permitted while a
//! read-only snapshot cache is active.

pub mod daemon;
pub mod db;
pub mod metrics;
pub mod pb;
pub mod service;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use sunfish_store::error::StoreError;
use sunfish_store::{Store, unix_now};

use crate::pb::EventRequest;
use crate::pb::event_service_client::EventServiceClient;

pub use sunfish_config::{EVENT_TYPE_AUDIT, EVENT_TYPE_HISTORIC, EVENT_TYPE_STATUS, EVENT_TYPES};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event transport error: {0}")]
    Transport(String),

    #[error("invalid listen address: {0}")]
    Address(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A handle for emitting events from anywhere in a node daemon.
///
/// Connects lazily, reconnects after failures, and falls back to the KV
/// dead letter queue when the event node does not take the write.
pub struct EventWriter {
    endpoint: String,
    fqdn: String,
    client: Option<EventServiceClient<tonic::transport::Channel>>,
}

impl EventWriter {
    pub fn new(endpoint: impl Into<String>, fqdn: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            fqdn: fqdn.into(),
            client: None,
        }
    }

    pub async fn record_event(
        &mut self,
        store: &mut Store,
        object_type: &str,
        object_uuid: &str,
        event_type: &str,
        message: &str,
        duration: f64,
        extra: Option<Value>,
    ) -> Result<(), EventError> {
        let timestamp = unix_now();
        let request = EventRequest {
            object_type: object_type.to_owned(),
            object_uuid: object_uuid.to_owned(),
            event_type: event_type.to_owned(),
            timestamp,
            fqdn: self.fqdn.clone(),
            duration,
            message: message.to_owned(),
            extra: match &extra {
                Some(extra) => serde_json::to_string(extra)?,
                None => String::new(),
            },
        };

        match self.send(request).await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                warn!(object_type, object_uuid, "event node declined event, spilling");
            }
            Err(err) => {
                info!(
                    object_type, object_uuid, error = %err,
                    "event node unavailable, spilling event to store"
                );
            }
        }

        // The dead letter queue; the eventlog daemon drains this prefix.
        let subtype = format!("{object_type}/{object_uuid}");
        let record = json!({
            "event_type": event_type,
            "timestamp": timestamp,
            "fqdn": self.fqdn,
            "duration": duration,
            "message": message,
            "extra": extra,
        });
        store
            .put("event", Some(&subtype), Some(&format!("{timestamp}")), &record)
            .await?;
        Ok(())
    }

    async fn send(&mut self, request: EventRequest) -> Result<bool, EventError> {
        if self.client.is_none() {
            let client = EventServiceClient::connect(self.endpoint.clone())
                .await
                .map_err(|err| EventError::Transport(err.to_string()))?;
            self.client = Some(client);
        }

        let Some(client) = self.client.as_mut() else {
            return Err(EventError::Transport("no client".to_owned()));
        };
        match client.record_event(request).await {
            Ok(reply) => Ok(reply.into_inner().ack),
            Err(status) => {
                self.client = None;
                Err(EventError::Transport(status.to_string()))
            }
        }
    }
}
