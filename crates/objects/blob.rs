//! Blobs, at their boundary only: agent operations reference blobs by UUID
//! and resolve them to local files. Fetching, replication and transcoding
//! are someone else's problem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::base::{DatabaseBackedObject, StateTargets};
use crate::{ObjectError, STATE_CREATED, STATE_DELETED, STATE_ERROR, STATE_INITIAL};

const STATE_TARGETS: StateTargets = &[
    (None, &[STATE_INITIAL, STATE_ERROR]),
    (Some(STATE_INITIAL), &[STATE_CREATED, STATE_DELETED, STATE_ERROR]),
    (Some(STATE_CREATED), &[STATE_DELETED, STATE_ERROR]),
    (Some(STATE_ERROR), &[STATE_DELETED]),
    (Some(STATE_DELETED), &[]),
];

#[derive(Debug, Clone)]
pub struct Blob {
    uuid: String,
}

#[async_trait]
impl DatabaseBackedObject for Blob {
    const OBJECT_TYPE: &'static str = "blob";
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
            .ok_or_else(|| ObjectError::BadPayload("blob missing uuid".to_owned()))?;
        Ok(Self {
            uuid: uuid.to_owned(),
        })
    }
}

impl Blob {
    /// Where a blob's content lives on any node holding a replica.
    pub fn filepath(storage_path: &Path, blob_uuid: &str) -> PathBuf {
        storage_path.join("blobs").join(blob_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filepath_is_content_addressed() {
        assert_eq!(
            Blob::filepath(Path::new("/srv/sunfish"), "b1"),
            PathBuf::from("/srv/sunfish/blobs/b1")
        );
    }
}
