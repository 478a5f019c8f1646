//! The gRPC ingest endpoint.

use std::path::PathBuf;

use serde_json::Value;
use tonic::{Request, Response, Status};

use sunfish_store::ignore_exception;

use crate::EventError;
use crate::db::EventLog;
use crate::metrics::METRICS;
use crate::pb::event_service_server::EventService;
use crate::pb::{EventReply, EventRequest};

pub struct EventIngest {
    events_root: PathBuf,
}

impl EventIngest {
    pub fn new(events_root: PathBuf) -> Self {
        Self { events_root }
    }

    fn write(&self, request: &EventRequest) -> Result<(), EventError> {
        let extra: Option<Value> = if request.extra.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&request.extra)?)
        };

        let log = EventLog::open(&self.events_root, &request.object_type, &request.object_uuid)?;
        log.write_event(
            &request.event_type,
            request.timestamp,
            &request.fqdn,
            request.duration,
            &request.message,
            extra.as_ref(),
        )?;
        METRICS.record_event(&request.event_type);
        Ok(())
    }
}

#[tonic::async_trait]
impl EventService for EventIngest {
    /// Append one event to its object's log. A failed write acks false and
    /// is logged, nothing more: the caller holds the event and decides
    /// whether to spill it to the dead letter queue.
    async fn record_event(
        &self,
        request: Request<EventRequest>,
    ) -> Result<Response<EventReply>, Status> {
        let request = request.into_inner();
        let ack = match self.write(&request) {
            Ok(()) => true,
            Err(err) => {
                ignore_exception(
                    &format!(
                        "failed to write event for {} {}",
                        request.object_type, request.object_uuid
                    ),
                    &err,
                );
                false
            }
        };
        Ok(Response::new(EventReply { ack }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(extra: &str) -> EventRequest {
        EventRequest {
            object_type: "instance".to_owned(),
            object_uuid: "i1".to_owned(),
            event_type: "audit".to_owned(),
            timestamp: 1700000000.0,
            fqdn: "sf-1".to_owned(),
            duration: 0.0,
            message: "sidechannel monitor started".to_owned(),
            extra: extra.to_owned(),
        }
    }

    #[tokio::test]
    async fn record_event_appends_and_acks() {
        let root = TempDir::new().expect("tempdir");
        let ingest = EventIngest::new(root.path().to_path_buf());

        let reply = ingest
            .record_event(Request::new(request("{\"pid\": 42}")))
            .await
            .expect("rpc");
        assert!(reply.into_inner().ack);

        let log = EventLog::open(root.path(), "instance", "i1").expect("open");
        let events = log.recent(1).expect("recent");
        assert_eq!(events[0].message, "sidechannel monitor started");
        assert_eq!(
            events[0].extra,
            Some(serde_json::json!({"pid": 42}))
        );
    }

    #[tokio::test]
    async fn malformed_extra_acks_false() {
        let root = TempDir::new().expect("tempdir");
        let ingest = EventIngest::new(root.path().to_path_buf());

        let reply = ingest
            .record_event(Request::new(request("{not json")))
            .await
            .expect("rpc");
        assert!(!reply.into_inner().ack);
    }
}
