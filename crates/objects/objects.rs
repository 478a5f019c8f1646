//! Database-backed objects.
//!
//! Everything the cluster tracks — instances, blobs, agent operations — is
//! an object: a versioned static payload at `/sf/<type>/<uuid>`, a family
//! of independently mutable attributes at `/sf/attribute/<type>/<uuid>/*`,
//! and a `state` attribute whose writes are validated against a transition
//! table owned by the object type.

pub mod agentop;
pub mod base;
pub mod blob;
pub mod instance;

use serde::{Deserialize, Serialize};
use sunfish_store::error::{LockError, StoreError};
use thiserror::Error;

pub use crate::agentop::AgentOperation;
pub use crate::base::DatabaseBackedObject;
pub use crate::blob::Blob;
pub use crate::instance::Instance;

// States shared by every object type. Individual types add their own.
pub const STATE_INITIAL: &str = "initial";
pub const STATE_CREATED: &str = "created";
pub const STATE_ERROR: &str = "error";
pub const STATE_DELETED: &str = "deleted";

/// The serialized form of the `state` attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub value: String,
    pub update_time: f64,
}

impl State {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            update_time: sunfish_store::unix_now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("illegal state transition on {object}: {from:?} -> {to}")]
    IllegalStateTransition {
        object: String,
        from: Option<String>,
        to: String,
    },

    #[error("object missing: {0}")]
    Missing(String),

    #[error("malformed object payload: {0}")]
    BadPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}
