//! The persistence pattern shared by all object types.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use sunfish_store::Store;
use sunfish_store::lock::{LockHandle, LockOptions};

use crate::{ObjectError, State};

/// A transition table: for each current state (`None` meaning "object just
/// created, no state yet"), the set of legal successor states.
pub type StateTargets = &'static [(Option<&'static str>, &'static [&'static str])];

fn transition_allowed(targets: StateTargets, from: Option<&str>, to: &str) -> bool {
    targets
        .iter()
        .find(|(current, _)| *current == from)
        .is_some_and(|(_, successors)| successors.contains(&to))
}

#[async_trait]
pub trait DatabaseBackedObject: Sized + Send + Sync {
    const OBJECT_TYPE: &'static str;
    const CURRENT_VERSION: u32;
    const INITIAL_VERSION: u32 = 1;

    fn uuid(&self) -> &str;

    /// Build an instance from an (already upgraded) static payload.
    fn from_payload(payload: &Map<String, Value>) -> Result<Self, ObjectError>;

    fn state_targets() -> StateTargets;

    /// Migrate an older payload in place. Returns true when anything
    /// changed; `version` is bumped by the caller.
    fn upgrade(_payload: &mut Map<String, Value>) -> bool {
        false
    }

    /// Create the static payload if it does not exist yet. Returns false
    /// when the object was already there; callers treat that as success
    /// and load the existing one.
    async fn db_create(
        store: &mut Store,
        uuid: &str,
        payload: &Value,
    ) -> Result<bool, ObjectError> {
        Ok(store
            .create(Self::OBJECT_TYPE, None, Some(uuid), payload)
            .await?)
    }

    /// Load from the store, running the payload upgrade hook when the
    /// stored version is older than the code. The migrated payload is
    /// written back so the upgrade runs once.
    async fn from_db(store: &mut Store, uuid: &str) -> Result<Option<Self>, ObjectError> {
        let Some(value) = store.get(Self::OBJECT_TYPE, None, Some(uuid)).await? else {
            return Ok(None);
        };
        let Value::Object(mut payload) = value else {
            return Err(ObjectError::BadPayload(uuid.to_owned()));
        };

        let version = payload
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(Self::INITIAL_VERSION as u64) as u32;
        if version < Self::CURRENT_VERSION {
            Self::upgrade(&mut payload);
            payload.insert("version".to_owned(), Value::from(Self::CURRENT_VERSION));
            store
                .put(Self::OBJECT_TYPE, None, Some(uuid), &payload)
                .await?;
            debug!(
                object_type = Self::OBJECT_TYPE,
                uuid,
                from_version = version,
                to_version = Self::CURRENT_VERSION,
                "upgraded object payload"
            );
        }

        Self::from_payload(&payload).map(Some)
    }

    async fn attribute(
        &self,
        store: &mut Store,
        attribute: &str,
    ) -> Result<Option<Value>, ObjectError> {
        let subtype = format!("{}/{}", Self::OBJECT_TYPE, self.uuid());
        Ok(store
            .get("attribute", Some(&subtype), Some(attribute))
            .await?)
    }

    async fn set_attribute(
        &self,
        store: &mut Store,
        attribute: &str,
        value: &Value,
    ) -> Result<(), ObjectError> {
        let subtype = format!("{}/{}", Self::OBJECT_TYPE, self.uuid());
        Ok(store
            .put("attribute", Some(&subtype), Some(attribute), value)
            .await?)
    }

    /// A distributed lock scoped to one attribute of this object.
    async fn lock_attr(
        &self,
        store: &mut Store,
        attribute: &str,
        op: &str,
    ) -> Result<LockHandle, ObjectError> {
        Ok(store
            .lock(
                Self::OBJECT_TYPE,
                Some(self.uuid()),
                Some(attribute),
                LockOptions::for_op(op),
            )
            .await?)
    }

    async fn state(&self, store: &mut Store) -> Result<Option<State>, ObjectError> {
        match self.attribute(store, "state").await? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|_| {
                ObjectError::BadPayload(format!("{}/{} state", Self::OBJECT_TYPE, self.uuid()))
            })?)),
            None => Ok(None),
        }
    }

    /// Write the state attribute, validating the transition against the
    /// type's table. Illegal transitions are programmer errors and fail
    /// loud; nothing downstream swallows them.
    async fn set_state(&self, store: &mut Store, new_value: &str) -> Result<(), ObjectError> {
        let lock = self.lock_attr(store, "state", "state update").await?;

        let result = self.set_state_locked(store, new_value).await;
        match result {
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

    async fn set_state_locked(
        &self,
        store: &mut Store,
        new_value: &str,
    ) -> Result<(), ObjectError> {
        let current = self.state(store).await?;
        let from = current.as_ref().map(|state| state.value.as_str());

        if !transition_allowed(Self::state_targets(), from, new_value) {
            return Err(ObjectError::IllegalStateTransition {
                object: format!("{}/{}", Self::OBJECT_TYPE, self.uuid()),
                from: from.map(str::to_owned),
                to: new_value.to_owned(),
            });
        }

        let state = State::new(new_value);
        let encoded = serde_json::to_value(&state)
            .map_err(|err| ObjectError::Store(err.into()))?;
        self.set_attribute(store, "state", &encoded).await?;
        debug!(
            object_type = Self::OBJECT_TYPE,
            uuid = self.uuid(),
            from = ?from,
            to = new_value,
            "object state transition"
        );
        Ok(())
    }

    /// The base external view: static identity plus the current state.
    async fn external_view_base(&self, store: &mut Store) -> Result<Map<String, Value>, ObjectError> {
        let mut view = Map::new();
        view.insert("uuid".to_owned(), Value::from(self.uuid()));
        if let Some(state) = self.state(store).await? {
            view.insert("state".to_owned(), Value::from(state.value));
        }
        Ok(view)
    }
}

/// Keep objects whose state is in `states`; used to filter listings.
pub fn state_filter(states: &[&str], state: Option<&State>) -> bool {
    state.is_some_and(|state| states.contains(&state.value.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGETS: StateTargets = &[
        (None, &["initial", "error"]),
        (Some("initial"), &["created", "deleted", "error"]),
        (Some("created"), &["deleted", "error"]),
        (Some("error"), &["deleted"]),
        (Some("deleted"), &[]),
    ];

    #[test]
    fn declared_transitions_are_allowed() {
        assert!(transition_allowed(TARGETS, None, "initial"));
        assert!(transition_allowed(TARGETS, Some("initial"), "created"));
        assert!(transition_allowed(TARGETS, Some("created"), "deleted"));
    }

    #[test]
    fn undeclared_transitions_are_rejected() {
        assert!(!transition_allowed(TARGETS, Some("deleted"), "created"));
        assert!(!transition_allowed(TARGETS, Some("created"), "initial"));
        assert!(!transition_allowed(TARGETS, None, "created"));
        assert!(!transition_allowed(TARGETS, Some("nonsense"), "deleted"));
    }
}
