//! Per-object on-disk event logs.
//!
//! Each object gets its own sqlite database under
//! `<storage>/events/<type>/<shard>/<uuid>/`, with an `events.lock` marker
//! beside it. The marker is what the pruner globs for when it sweeps the
//! tree, so it must exist for every database ever opened.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use serde_json::Value;

use crate::EventError;

/// Bumped when the schema changes; `open` migrates older databases in
/// place, which is why the daemon opens every known database at startup.
const DB_FORMAT_VERSION: i64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub event_type: String,
    pub timestamp: f64,
    pub fqdn: String,
    pub duration: f64,
    pub message: String,
    pub extra: Option<Value>,
}

#[derive(Debug)]
pub struct EventLog {
    connection: Connection,
}

fn object_dir(events_root: &Path, object_type: &str, object_uuid: &str) -> PathBuf {
    let shard = &object_uuid[..object_uuid.len().min(2)];
    events_root.join(object_type).join(shard).join(object_uuid)
}

impl EventLog {
    pub fn open(
        events_root: &Path,
        object_type: &str,
        object_uuid: &str,
    ) -> Result<Self, EventError> {
        let dir = object_dir(events_root, object_type, object_uuid);
        fs::create_dir_all(&dir)?;

        // The pruner discovers databases by these markers.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.lock"))?;

        let connection = Connection::open(dir.join("events.sqlite"))?;
        let log = Self { connection };
        log.upgrade()?;
        Ok(log)
    }

    fn upgrade(&self) -> Result<(), EventError> {
        let version: i64 =
            self.connection
                .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < 1 {
            self.connection.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS events (
                    event_type TEXT NOT NULL,
                    timestamp REAL NOT NULL,
                    fqdn TEXT NOT NULL,
                    duration REAL,
                    message TEXT NOT NULL,
                    extra TEXT
                );
                ",
            )?;
        }
        if version < 2 {
            // v2 added the prune index; old databases pick it up on first
            // open after the upgrade, which the daemon forces at startup.
            self.connection.execute_batch(
                "
                CREATE INDEX IF NOT EXISTS events_by_type_and_time
                    ON events (event_type, timestamp);
                ",
            )?;
        }

        if version != DB_FORMAT_VERSION {
            self.connection
                .execute_batch(&format!("PRAGMA user_version = {DB_FORMAT_VERSION};"))?;
        }
        Ok(())
    }

    pub fn write_event(
        &self,
        event_type: &str,
        timestamp: f64,
        fqdn: &str,
        duration: f64,
        message: &str,
        extra: Option<&Value>,
    ) -> Result<(), EventError> {
        let extra_json = match extra {
            Some(extra) => Some(serde_json::to_string(extra)?),
            None => None,
        };
        self.connection.execute(
            "
            INSERT INTO events (event_type, timestamp, fqdn, duration, message, extra)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![event_type, timestamp, fqdn, duration, message, extra_json],
        )?;
        Ok(())
    }

    /// Delete events of one type older than `before`. Returns how many went.
    pub fn prune_events(&self, before: f64, event_type: &str) -> Result<u64, EventError> {
        let deleted = self.connection.execute(
            "DELETE FROM events WHERE event_type = ?1 AND timestamp < ?2",
            params![event_type, before],
        )?;
        Ok(deleted as u64)
    }

    pub fn count_events(&self) -> Result<u64, EventError> {
        let count: i64 =
            self.connection
                .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<EventRow>, EventError> {
        let mut statement = self.connection.prepare(
            "
            SELECT event_type, timestamp, fqdn, duration, message, extra
            FROM events
            ORDER BY timestamp DESC
            LIMIT ?1
            ",
        )?;

        let rows = statement.query_map([limit as i64], |row| {
            let extra_raw: Option<String> = row.get(5)?;
            Ok(EventRow {
                event_type: row.get(0)?,
                timestamp: row.get(1)?,
                fqdn: row.get(2)?,
                duration: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                message: row.get(4)?,
                extra: extra_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

/// Walk the events tree for `events.lock` markers and return the
/// `(object_type, object_uuid)` pairs they belong to.
pub fn prune_targets(events_root: &Path) -> Vec<(String, String)> {
    let mut markers = Vec::new();
    collect_markers(events_root, &mut markers);

    let mut targets = Vec::new();
    for marker in markers {
        let Ok(relative) = marker.strip_prefix(events_root) else {
            continue;
        };
        let components: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();
        // <type>/<shard>/<uuid>/events.lock
        if let [object_type, _, object_uuid, _] = components.as_slice() {
            targets.push((object_type.clone(), object_uuid.clone()));
        }
    }
    targets
}

fn collect_markers(dir: &Path, markers: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_markers(&path, markers);
        } else if path.file_name().is_some_and(|name| name == "events.lock") {
            markers.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn events_round_trip_with_extra_payload() {
        let root = TempDir::new().expect("tempdir");
        let log = EventLog::open(root.path(), "instance", "i1").expect("open");

        log.write_event(
            "audit",
            1700000000.0,
            "sf-1",
            0.5,
            "sidechannel agent connected",
            Some(&json!({"channel": "agent"})),
        )
        .expect("write");

        let events = log.recent(10).expect("recent");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "audit");
        assert_eq!(events[0].extra, Some(json!({"channel": "agent"})));
    }

    #[test]
    fn pruning_is_per_type_and_age() {
        let root = TempDir::new().expect("tempdir");
        let log = EventLog::open(root.path(), "instance", "i1").expect("open");

        log.write_event("audit", 100.0, "sf-1", 0.0, "old audit", None)
            .expect("write");
        log.write_event("status", 100.0, "sf-1", 0.0, "old status", None)
            .expect("write");
        log.write_event("status", 5000.0, "sf-1", 0.0, "new status", None)
            .expect("write");

        let pruned = log.prune_events(1000.0, "status").expect("prune");
        assert_eq!(pruned, 1);
        // Audit events of the same age were untouched.
        assert_eq!(log.count_events().expect("count"), 2);
    }

    #[test]
    fn reopening_keeps_the_format_current() {
        let root = TempDir::new().expect("tempdir");
        drop(EventLog::open(root.path(), "node", "sf-1").expect("open"));
        // A second open runs the upgrade path against an existing file.
        let log = EventLog::open(root.path(), "node", "sf-1").expect("reopen");
        assert_eq!(log.count_events().expect("count"), 0);
    }

    #[test]
    fn lock_markers_identify_prune_targets() {
        let root = TempDir::new().expect("tempdir");
        drop(EventLog::open(root.path(), "instance", "i1").expect("open"));
        drop(EventLog::open(root.path(), "node", "sf-1").expect("open"));

        let mut targets = prune_targets(root.path());
        targets.sort();
        assert_eq!(
            targets,
            vec![
                ("instance".to_owned(), "i1".to_owned()),
                ("node".to_owned(), "sf-1".to_owned()),
            ]
        );
    }
}
