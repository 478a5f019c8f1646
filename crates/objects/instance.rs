//! The instance object, as far as the control plane core needs it.
//!
//! Scheduling, networking and lifecycle live elsewhere; this model carries
//! what the side-channel monitor needs: the configured side channels, the
//! on-disk instance path, the agent-observability attributes, and the
//! per-instance queue of agent operations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::warn;

use sunfish_store::Store;

use crate::agentop::{AgentOperation, STATE_QUEUED};
use crate::base::{DatabaseBackedObject, StateTargets};
use crate::{ObjectError, STATE_CREATED, STATE_DELETED, STATE_ERROR, STATE_INITIAL, State};

const STATE_TARGETS: StateTargets = &[
    (None, &[STATE_INITIAL, STATE_ERROR]),
    (Some(STATE_INITIAL), &[STATE_CREATED, STATE_DELETED, STATE_ERROR]),
    (Some(STATE_CREATED), &[STATE_DELETED, STATE_ERROR]),
    (Some(STATE_ERROR), &[STATE_DELETED]),
    (Some(STATE_DELETED), &[]),
];

#[derive(Debug, Clone)]
pub struct Instance {
    uuid: String,
    namespace: String,
    side_channels: Vec<String>,
}

#[async_trait]
impl DatabaseBackedObject for Instance {
    const OBJECT_TYPE: &'static str = "instance";
    const CURRENT_VERSION: u32 = 1;

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn state_targets() -> StateTargets {
        STATE_TARGETS
    }

    fn from_payload(payload: &Map<String, Value>) -> Result<Self, ObjectError> {
        let uuid = payload
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| ObjectError::BadPayload("instance missing uuid".to_owned()))?;

        Ok(Self {
            uuid: uuid.to_owned(),
            namespace: payload
                .get("namespace")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            side_channels: payload
                .get("side_channels")
                .and_then(Value::as_array)
                .map(|channels| {
                    channels
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

impl Instance {
    pub async fn new(
        store: &mut Store,
        uuid: &str,
        namespace: &str,
        side_channels: Vec<String>,
    ) -> Result<Self, ObjectError> {
        if let Some(existing) = Self::from_db(store, uuid).await? {
            return Ok(existing);
        }

        let payload = json!({
            "uuid": uuid,
            "namespace": namespace,
            "side_channels": side_channels,
            "version": Self::CURRENT_VERSION,
        });
        Self::db_create(store, uuid, &payload).await?;

        let instance = Self::from_db(store, uuid)
            .await?
            .ok_or_else(|| ObjectError::Missing(uuid.to_owned()))?;
        instance.set_state(store, STATE_INITIAL).await?;
        Ok(instance)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn side_channels(&self) -> &[String] {
        &self.side_channels
    }

    /// Where this instance's on-disk artifacts (console log, side-channel
    /// sockets) live on its node.
    pub fn instance_path(&self, storage_path: &Path) -> PathBuf {
        storage_path.join("instances").join(&self.uuid)
    }

    // Attributes mirrored by the side-channel monitor.

    pub async fn agent_state(&self, store: &mut Store) -> Result<Option<State>, ObjectError> {
        match self.attribute(store, "agent_state").await? {
            Some(value) => Ok(serde_json::from_value(value).ok()),
            None => Ok(None),
        }
    }

    pub async fn set_agent_state(
        &self,
        store: &mut Store,
        readiness: &str,
    ) -> Result<(), ObjectError> {
        let state = State::new(readiness);
        let encoded =
            serde_json::to_value(&state).map_err(|err| ObjectError::Store(err.into()))?;
        self.set_attribute(store, "agent_state", &encoded).await
    }

    pub async fn agent_system_boot_time(&self, store: &mut Store) -> Result<f64, ObjectError> {
        Ok(self
            .attribute(store, "agent_system_boot_time")
            .await?
            .and_then(|attr| attr.get("value").and_then(Value::as_f64))
            .unwrap_or(0.0))
    }

    pub async fn set_agent_system_boot_time(
        &self,
        store: &mut Store,
        boot_time: f64,
    ) -> Result<(), ObjectError> {
        self.set_attribute(store, "agent_system_boot_time", &json!({"value": boot_time}))
            .await
    }

    pub async fn set_agent_start_time(
        &self,
        store: &mut Store,
        start_time: f64,
    ) -> Result<(), ObjectError> {
        self.set_attribute(store, "agent_start_time", &json!({"value": start_time}))
            .await
    }

    pub async fn set_agent_facts(&self, store: &mut Store, facts: &Value) -> Result<(), ObjectError> {
        self.set_attribute(store, "agent_facts", facts).await
    }

    // The per-instance agent-operation queue. Operations are dispatched one
    // at a time by this instance's single monitor child.

    pub async fn agent_operation_enqueue(
        &self,
        store: &mut Store,
        operation_uuid: &str,
    ) -> Result<(), ObjectError> {
        let lock = self
            .lock_attr(store, "agent_operations", "agent operation enqueue")
            .await?;

        let append = async {
            let mut queued = self.queued_operations(store).await?;
            queued.push(operation_uuid.to_owned());
            self.set_attribute(store, "agent_operations", &json!({"queued": queued}))
                .await
        }
        .await;

        match append {
            Ok(()) => {
                lock.release().await?;
                Ok(())
            }
            Err(err) => {
                let _ = lock.release().await;
                Err(err)
            }
        }
    }

    /// Pop the first operation that is actually in `queued` state.
    /// Operations that have reached a terminal state fall off the list;
    /// ones still being prepared stay put.
    pub async fn agent_operation_dequeue(
        &self,
        store: &mut Store,
    ) -> Result<Option<AgentOperation>, ObjectError> {
        let lock = self
            .lock_attr(store, "agent_operations", "agent operation dequeue")
            .await?;

        let pop = self.agent_operation_dequeue_locked(store).await;
        match pop {
            Ok(found) => {
                lock.release().await?;
                Ok(found)
            }
            Err(err) => {
                let _ = lock.release().await;
                Err(err)
            }
        }
    }

    async fn agent_operation_dequeue_locked(
        &self,
        store: &mut Store,
    ) -> Result<Option<AgentOperation>, ObjectError> {
        let queued = self.queued_operations(store).await?;
        let mut remaining = Vec::with_capacity(queued.len());
        let mut found = None;

        for operation_uuid in queued {
            if found.is_some() {
                remaining.push(operation_uuid);
                continue;
            }

            let Some(operation) = AgentOperation::from_db(store, &operation_uuid).await? else {
                warn!(
                    instance = %self.uuid,
                    agentoperation = %operation_uuid,
                    "queued agent operation has vanished"
                );
                continue;
            };

            match operation.state(store).await?.map(|state| state.value) {
                Some(state) if state == STATE_QUEUED => found = Some(operation),
                Some(state) if state == STATE_DELETED || state == STATE_ERROR => {
                    // Terminal; drop it from the queue.
                }
                _ => remaining.push(operation_uuid),
            }
        }

        if found.is_some() {
            self.set_attribute(store, "agent_operations", &json!({"queued": remaining}))
                .await?;
        }
        Ok(found)
    }

    async fn queued_operations(&self, store: &mut Store) -> Result<Vec<String>, ObjectError> {
        Ok(self
            .attribute(store, "agent_operations")
            .await?
            .and_then(|attr| {
                attr.get("queued").and_then(Value::as_array).map(|queued| {
                    queued
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunfish_store::MemoryEngine;

    async fn created_instance(store: &mut Store) -> Instance {
        let instance = Instance::new(store, "i1", "system", vec!["agent".to_owned()])
            .await
            .expect("create");
        instance
            .set_state(store, STATE_CREATED)
            .await
            .expect("created");
        instance
    }

    #[tokio::test]
    async fn instance_path_is_under_storage() {
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        let instance = created_instance(&mut store).await;
        assert_eq!(
            instance.instance_path(Path::new("/srv/sunfish")),
            PathBuf::from("/srv/sunfish/instances/i1")
        );
        assert_eq!(instance.side_channels(), ["agent".to_owned()]);
    }

    #[tokio::test]
    async fn agent_operations_dequeue_in_order() {
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        let instance = created_instance(&mut store).await;

        for uuid in ["op1", "op2"] {
            let op = AgentOperation::new(&mut store, uuid, "system", "i1", vec![])
                .await
                .expect("create op");
            op.set_state(&mut store, STATE_QUEUED).await.expect("queue");
            instance
                .agent_operation_enqueue(&mut store, uuid)
                .await
                .expect("enqueue");
        }

        let first = instance
            .agent_operation_dequeue(&mut store)
            .await
            .expect("dequeue")
            .expect("op present");
        assert_eq!(first.uuid(), "op1");

        let second = instance
            .agent_operation_dequeue(&mut store)
            .await
            .expect("dequeue")
            .expect("op present");
        assert_eq!(second.uuid(), "op2");

        assert!(
            instance
                .agent_operation_dequeue(&mut store)
                .await
                .expect("dequeue")
                .is_none()
        );
    }

    #[tokio::test]
    async fn operations_not_yet_queued_stay_in_the_list() {
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        let instance = created_instance(&mut store).await;

        let pending = AgentOperation::new(&mut store, "op1", "system", "i1", vec![])
            .await
            .expect("create op");
        instance
            .agent_operation_enqueue(&mut store, "op1")
            .await
            .expect("enqueue");

        // Still in initial: not dispatchable yet.
        assert!(
            instance
                .agent_operation_dequeue(&mut store)
                .await
                .expect("dequeue")
                .is_none()
        );

        pending
            .set_state(&mut store, STATE_QUEUED)
            .await
            .expect("queue");
        assert!(
            instance
                .agent_operation_dequeue(&mut store)
                .await
                .expect("dequeue")
                .is_some()
        );
    }

    #[tokio::test]
    async fn agent_state_round_trips() {
        let mut store = Store::new(Box::new(MemoryEngine::new()), "sf-1");
        let instance = created_instance(&mut store).await;

        instance
            .set_agent_state(&mut store, "ready")
            .await
            .expect("set");
        let state = instance
            .agent_state(&mut store)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(state.value, "ready");

        instance
            .set_agent_system_boot_time(&mut store, 100.0)
            .await
            .expect("set boot time");
        assert_eq!(
            instance
                .agent_system_boot_time(&mut store)
                .await
                .expect("get boot time"),
            100.0
        );
    }
}
