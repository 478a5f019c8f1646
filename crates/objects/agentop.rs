//! Agent operations: long-running command sequences executed inside one
//! guest by its in-guest agent.
//!
//! The dispatcher path is `initial -> queued -> executing -> complete`
//! (or `-> error`); `preflight` exists for operations that need validation
//! before they may be queued.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use sunfish_store::Store;
use sunfish_store::backend::SortOrder;

use crate::base::{DatabaseBackedObject, StateTargets};
use crate::{ObjectError, STATE_CREATED, STATE_DELETED, STATE_ERROR, STATE_INITIAL};

pub const STATE_PREFLIGHT: &str = "preflight";
pub const STATE_QUEUED: &str = "queued";
pub const STATE_EXECUTING: &str = "executing";
pub const STATE_COMPLETE: &str = "complete";

/// States an operation is considered live in when filtering listings.
pub const ACTIVE_STATES: &[&str] =
    &[STATE_CREATED, STATE_QUEUED, STATE_EXECUTING, STATE_COMPLETE];

const STATE_TARGETS: StateTargets = &[
    (None, &[STATE_INITIAL, STATE_ERROR]),
    (
        Some(STATE_INITIAL),
        &[STATE_PREFLIGHT, STATE_QUEUED, STATE_DELETED, STATE_ERROR],
    ),
    (
        Some(STATE_PREFLIGHT),
        &[STATE_QUEUED, STATE_DELETED, STATE_ERROR],
    ),
    (
        Some(STATE_QUEUED),
        &[STATE_EXECUTING, STATE_DELETED, STATE_ERROR],
    ),
    (
        Some(STATE_EXECUTING),
        &[STATE_COMPLETE, STATE_DELETED, STATE_ERROR],
    ),
    (Some(STATE_COMPLETE), &[STATE_DELETED]),
    (Some(STATE_ERROR), &[STATE_DELETED]),
    (Some(STATE_DELETED), &[]),
];

#[derive(Debug, Clone)]
pub struct AgentOperation {
    uuid: String,
    namespace: String,
    instance_uuid: String,
    commands: Vec<Value>,
}

#[async_trait]
impl DatabaseBackedObject for AgentOperation {
    const OBJECT_TYPE: &'static str = "agentoperation";
    const CURRENT_VERSION: u32 = 1;

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn state_targets() -> StateTargets {
        STATE_TARGETS
    }

    fn from_payload(payload: &Map<String, Value>) -> Result<Self, ObjectError> {
        let field = |name: &str| -> Result<String, ObjectError> {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| ObjectError::BadPayload(format!("agentoperation missing {name}")))
        };

        Ok(Self {
            uuid: field("uuid")?,
            namespace: field("namespace")?,
            instance_uuid: field("instance_uuid")?,
            commands: payload
                .get("commands")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

impl AgentOperation {
    /// Idempotent create: an existing operation with this UUID is returned
    /// as-is, a fresh one transitions into `initial`.
    pub async fn new(
        store: &mut Store,
        uuid: &str,
        namespace: &str,
        instance_uuid: &str,
        commands: Vec<Value>,
    ) -> Result<Self, ObjectError> {
        if let Some(existing) = Self::from_db(store, uuid).await? {
            return Ok(existing);
        }

        let payload = json!({
            "uuid": uuid,
            "namespace": namespace,
            "instance_uuid": instance_uuid,
            "commands": commands,
            "version": Self::CURRENT_VERSION,
        });
        Self::db_create(store, uuid, &payload).await?;

        let operation = Self::from_db(store, uuid)
            .await?
            .ok_or_else(|| ObjectError::Missing(uuid.to_owned()))?;
        operation.set_state(store, STATE_INITIAL).await?;
        Ok(operation)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn instance_uuid(&self) -> &str {
        &self.instance_uuid
    }

    pub fn commands(&self) -> &[Value] {
        &self.commands
    }

    /// Results keyed by command index (as decimal strings, since they
    /// travel as JSON object keys).
    pub async fn results(&self, store: &mut Store) -> Result<HashMap<String, Value>, ObjectError> {
        match self.attribute(store, "results").await? {
            Some(attr) => Ok(attr
                .get("results")
                .and_then(Value::as_object)
                .map(|results| results.clone().into_iter().collect())
                .unwrap_or_default()),
            None => Ok(HashMap::new()),
        }
    }

    /// Read-merge-write one command's result under the results attribute
    /// lock.
    pub async fn add_result(
        &self,
        store: &mut Store,
        index: usize,
        value: Value,
    ) -> Result<(), ObjectError> {
        let lock = self.lock_attr(store, "results", "add result").await?;

        let merge = async {
            let mut results = self.results(store).await?;
            results.insert(index.to_string(), value);
            self.set_attribute(store, "results", &json!({"results": results}))
                .await
        }
        .await;

        match merge {
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

    /// A human-readable failure note. This is an attribute, not a state:
    /// the operation still completes.
    pub async fn set_error(&self, store: &mut Store, message: &str) -> Result<(), ObjectError> {
        self.set_attribute(store, "error", &json!({"error": message}))
            .await
    }

    pub async fn error(&self, store: &mut Store) -> Result<Option<String>, ObjectError> {
        Ok(self
            .attribute(store, "error")
            .await?
            .and_then(|attr| attr.get("error").and_then(Value::as_str).map(str::to_owned)))
    }

    pub async fn delete(&self, store: &mut Store) -> Result<(), ObjectError> {
        self.set_state(store, STATE_DELETED).await
    }

    /// The dict users see: static fields mixed back with current results.
    pub async fn external_view(&self, store: &mut Store) -> Result<Value, ObjectError> {
        let mut view = self.external_view_base(store).await?;
        view.insert("namespace".to_owned(), Value::from(self.namespace.clone()));
        view.insert(
            "instance_uuid".to_owned(),
            Value::from(self.instance_uuid.clone()),
        );
        view.insert("commands".to_owned(), Value::from(self.commands.clone()));
        view.insert(
            "results".to_owned(),
            serde_json::to_value(self.results(store).await?)
                .map_err(|err| ObjectError::Store(err.into()))?,
        );
        Ok(Value::Object(view))
    }

    /// All operations, optionally filtered to a set of states.
    pub async fn all(
        store: &mut Store,
        states: Option<&[&str]>,
    ) -> Result<Vec<AgentOperation>, ObjectError> {
        let mut operations = Vec::new();
        for (_, payload) in store
            .get_all(Self::OBJECT_TYPE, None, SortOrder::Ascend, 0)
            .await?
        {
            let Some(uuid) = payload.get("uuid").and_then(Value::as_str) else {
                continue;
            };
            let Some(operation) = Self::from_db(store, &uuid.to_owned()).await? else {
                continue;
            };

            if let Some(states) = states {
                let current = operation.state(store).await?;
                if !crate::base::state_filter(states, current.as_ref()) {
                    continue;
                }
            }
            operations.push(operation);
        }
        Ok(operations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunfish_store::MemoryEngine;

    fn store() -> Store {
        Store::new(Box::new(MemoryEngine::new()), "sf-1")
    }

    fn commands() -> Vec<Value> {
        vec![
            json!({"command": "put-blob", "blob_uuid": "b1", "path": "/tmp/target"}),
            json!({"command": "chmod", "path": "/tmp/target", "mode": 0o755}),
        ]
    }

    #[tokio::test]
    async fn new_operations_start_in_initial() {
        let mut store = store();
        let op = AgentOperation::new(&mut store, "op1", "system", "i1", commands())
            .await
            .expect("create");

        let state = op.state(&mut store).await.expect("state").expect("present");
        assert_eq!(state.value, STATE_INITIAL);
        assert_eq!(op.commands().len(), 2);
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let mut store = store();
        let first = AgentOperation::new(&mut store, "op1", "system", "i1", commands())
            .await
            .expect("create");
        first
            .set_state(&mut store, STATE_QUEUED)
            .await
            .expect("queue");

        // A second create with the same UUID returns the existing object
        // without resetting its state.
        let second = AgentOperation::new(&mut store, "op1", "system", "i1", vec![])
            .await
            .expect("recreate");
        let state = second
            .state(&mut store)
            .await
            .expect("state")
            .expect("present");
        assert_eq!(state.value, STATE_QUEUED);
        assert_eq!(second.commands().len(), 2);
    }

    #[tokio::test]
    async fn dispatcher_path_walks_the_table() {
        let mut store = store();
        let op = AgentOperation::new(&mut store, "op1", "system", "i1", commands())
            .await
            .expect("create");

        for state in [STATE_QUEUED, STATE_EXECUTING, STATE_COMPLETE, STATE_DELETED] {
            op.set_state(&mut store, state).await.expect(state);
        }
    }

    #[tokio::test]
    async fn illegal_transitions_fail_loud() {
        let mut store = store();
        let op = AgentOperation::new(&mut store, "op1", "system", "i1", commands())
            .await
            .expect("create");

        // initial -> complete skips the whole dispatcher path.
        let denied = op.set_state(&mut store, STATE_COMPLETE).await;
        assert!(matches!(
            denied,
            Err(ObjectError::IllegalStateTransition { .. })
        ));

        // deleted is terminal.
        op.set_state(&mut store, STATE_DELETED).await.expect("delete");
        assert!(matches!(
            op.set_state(&mut store, STATE_QUEUED).await,
            Err(ObjectError::IllegalStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn results_merge_by_command_index() {
        let mut store = store();
        let op = AgentOperation::new(&mut store, "op1", "system", "i1", commands())
            .await
            .expect("create");

        op.add_result(&mut store, 0, json!({"path": "/tmp/target"}))
            .await
            .expect("result 0");
        op.add_result(&mut store, 1, json!({"mode": "0755"}))
            .await
            .expect("result 1");

        let results = op.results(&mut store).await.expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results["0"], json!({"path": "/tmp/target"}));

        let view = op.external_view(&mut store).await.expect("view");
        assert_eq!(view["results"]["1"], json!({"mode": "0755"}));
        assert_eq!(view["namespace"], json!("system"));
    }

    #[tokio::test]
    async fn error_attribute_does_not_change_state() {
        let mut store = store();
        let op = AgentOperation::new(&mut store, "op1", "system", "i1", commands())
            .await
            .expect("create");
        op.set_state(&mut store, STATE_QUEUED).await.expect("queue");

        op.set_error(&mut store, "blob missing: b1")
            .await
            .expect("error attr");
        assert_eq!(
            op.error(&mut store).await.expect("read"),
            Some("blob missing: b1".to_owned())
        );

        let state = op.state(&mut store).await.expect("state").expect("present");
        assert_eq!(state.value, STATE_QUEUED);
    }

    #[tokio::test]
    async fn listings_filter_by_active_states() {
        let mut store = store();
        let queued = AgentOperation::new(&mut store, "op1", "system", "i1", vec![])
            .await
            .expect("create");
        queued
            .set_state(&mut store, STATE_QUEUED)
            .await
            .expect("queue");

        let deleted = AgentOperation::new(&mut store, "op2", "system", "i1", vec![])
            .await
            .expect("create");
        deleted
            .set_state(&mut store, STATE_DELETED)
            .await
            .expect("delete");

        let active = AgentOperation::all(&mut store, Some(ACTIVE_STATES))
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].uuid(), "op1");
    }
}
