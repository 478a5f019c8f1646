//! Queue task registry.
//!
//! Workitems travel as `{"tasks": [{"task": "<name>", "version": <n>, ...}]}`.
//! The `task` tag resolves to a concrete variant here; tags nobody declared
//! round-trip as raw JSON so they can be re-enqueued or inspected without
//! loss.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchBlobTask {
    pub blob_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartInstanceTask {
    pub instance_uuid: String,
    #[serde(default)]
    pub network: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteInstanceTask {
    pub instance_uuid: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    FetchBlob(FetchBlobTask),
    StartInstance(StartInstanceTask),
    DeleteInstance(DeleteInstanceTask),
    Unknown(Value),
}

impl Task {
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Task::FetchBlob(_) => Some("fetch_blob"),
            Task::StartInstance(_) => Some("instance_start"),
            Task::DeleteInstance(_) => Some("instance_delete"),
            Task::Unknown(_) => None,
        }
    }

    pub fn version(&self) -> Option<u32> {
        match self {
            Task::Unknown(_) => None,
            _ => Some(1),
        }
    }

    fn from_value(value: Value) -> Task {
        let Some(object) = value.as_object() else {
            return Task::Unknown(value);
        };
        let Some(name) = object.get("task").and_then(Value::as_str) else {
            return Task::Unknown(value);
        };

        // New task versions get handled here when they appear.
        let mut fields = object.clone();
        fields.remove("task");
        fields.remove("version");
        let fields = Value::Object(fields);

        let decoded = match name {
            "fetch_blob" => serde_json::from_value(fields).map(Task::FetchBlob),
            "instance_start" => serde_json::from_value(fields).map(Task::StartInstance),
            "instance_delete" => serde_json::from_value(fields).map(Task::DeleteInstance),
            _ => return Task::Unknown(value),
        };
        match decoded {
            Ok(task) => task,
            Err(_) => Task::Unknown(value),
        }
    }

    fn to_value(&self) -> Value {
        let (name, version, fields) = match self {
            Task::FetchBlob(task) => ("fetch_blob", 1, json!(task)),
            Task::StartInstance(task) => ("instance_start", 1, json!(task)),
            Task::DeleteInstance(task) => ("instance_delete", 1, json!(task)),
            Task::Unknown(raw) => return raw.clone(),
        };

        let mut object = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        object.insert("task".to_owned(), json!(name));
        object.insert("version".to_owned(), json!(version));
        Value::Object(object)
    }
}

impl Serialize for Task {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Task {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Task::from_value(Value::deserialize(deserializer)?))
    }
}

/// An ordered list of tasks placed on a named queue as one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkItem {
    pub tasks: Vec<Task>,
}

impl WorkItem {
    pub fn single(task: Task) -> Self {
        Self { tasks: vec![task] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_decode_to_variants() {
        let raw = json!({"tasks": [
            {"task": "fetch_blob", "version": 1, "blob_uuid": "b1"},
            {"task": "instance_start", "version": 1, "instance_uuid": "i1", "network": []},
        ]});
        let item: WorkItem = serde_json::from_value(raw).expect("decode");

        assert_eq!(
            item.tasks[0],
            Task::FetchBlob(FetchBlobTask {
                blob_uuid: "b1".to_owned()
            })
        );
        assert!(matches!(item.tasks[1], Task::StartInstance(_)));
    }

    #[test]
    fn unknown_tags_round_trip_losslessly() {
        let raw = json!({"task": "defragment_moon", "version": 3, "hemisphere": "far"});
        let task: Task = serde_json::from_value(raw.clone()).expect("decode");
        assert!(matches!(task, Task::Unknown(_)));

        let encoded = serde_json::to_value(&task).expect("encode");
        assert_eq!(encoded, raw);
    }

    #[test]
    fn known_tasks_re_emit_tag_and_version() {
        let task = Task::FetchBlob(FetchBlobTask {
            blob_uuid: "b1".to_owned(),
        });
        let encoded = serde_json::to_value(&task).expect("encode");
        assert_eq!(
            encoded,
            json!({"task": "fetch_blob", "version": 1, "blob_uuid": "b1"})
        );
    }
}
