//! Work queue runtime on top of the KV store.
//!
//! A queue is a key range `/sf/queue/<name>/`; each entry's key carries its
//! scheduled timestamp so a key-ascending range walk is dispatch order.
//! Dequeued items move to `/sf/processing/<name>/` until resolved, which is
//! what makes crash recovery possible: anything still in processing when a
//! node restarts just goes back on the queue.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::backend::SortOrder;
use crate::error::StoreError;
use crate::tasks::{Task, WorkItem};
use crate::{Store, encode_json, object_path, random_id, unix_now, with_retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueLength {
    pub processing: u64,
    pub ready: u64,
    pub deferred: u64,
}

fn jobname_for(entry_time: f64) -> String {
    format!("{entry_time:.6}-{}", random_id())
}

/// The scheduled timestamp encoded in a jobname.
fn jobname_time(jobname: &str) -> Option<f64> {
    jobname.split('-').next()?.parse::<f64>().ok()
}

fn jobname_of_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

impl Store {
    /// Place a workitem on a queue, optionally `delay` seconds in the
    /// future. Future-dated entries are not dispatched before their time.
    pub async fn enqueue(
        &mut self,
        queue: &str,
        workitem: &WorkItem,
        delay: f64,
    ) -> Result<String, StoreError> {
        let jobname = jobname_for(unix_now() + delay);
        let path = object_path("queue", Some(queue), Some(&jobname));
        self.ensure_mutable(&path, "you cannot enqueue")?;

        let encoded = encode_json(workitem)?;
        self.put_raw(&path, &encoded).await?;
        info!(jobname, queuename = queue, "enqueued workitem");
        Ok(jobname)
    }

    /// Pop the oldest dispatchable workitem, moving it to processing.
    /// Returns None when the queue is empty or its head is future-dated.
    pub async fn dequeue(
        &mut self,
        queue: &str,
    ) -> Result<Option<(String, WorkItem)>, StoreError> {
        if self.cache_active() {
            return Err(StoreError::ForbiddenWhileCached(
                "you cannot consume queue work items".to_owned(),
            ));
        }

        let queue_path = object_path("queue", Some(queue), None);
        let head = with_retry!("dequeue", self.engine().get_prefix(&queue_path, SortOrder::Ascend, 1))?;
        let Some(pair) = head.into_iter().next() else {
            return Ok(None);
        };

        let jobname = jobname_of_key(&pair.key).to_owned();
        let Some(entry_time) = jobname_time(&jobname) else {
            warn!(jobname, queuename = queue, "unparseable jobname, skipping");
            return Ok(None);
        };
        if entry_time > unix_now() {
            return Ok(None);
        }

        let workitem: WorkItem = serde_json::from_str(&pair.value)?;
        let processing_path = object_path("processing", Some(queue), Some(&jobname));
        let encoded = encode_json(&workitem)?;
        self.put_raw(&processing_path, &encoded).await?;
        with_retry!("dequeue delete", async { self.engine().delete(&pair.key).await.map(|_| ()) })?;

        info!(
            jobname,
            queuename = queue,
            "moved workitem from queue to processing"
        );
        Ok(Some((jobname, workitem)))
    }

    /// Mark a dequeued workitem finished.
    pub async fn resolve(&mut self, queue: &str, jobname: &str) -> Result<(), StoreError> {
        if self.cache_active() {
            return Err(StoreError::ForbiddenWhileCached(
                "you cannot resolve queue work items".to_owned(),
            ));
        }

        self.delete("processing", Some(queue), Some(jobname)).await?;
        info!(jobname, queuename = queue, "resolved workitem");
        Ok(())
    }

    pub async fn queue_length(&mut self, queue: &str) -> Result<QueueLength, StoreError> {
        let mut length = QueueLength::default();
        let now = unix_now();

        for (key, _) in self
            .get_all("queue", Some(queue), SortOrder::None, 0)
            .await?
        {
            match jobname_time(jobname_of_key(&key)) {
                Some(entry_time) if entry_time > now => length.deferred += 1,
                _ => length.ready += 1,
            }
        }

        length.processing = self
            .get_all("processing", Some(queue), SortOrder::None, 0)
            .await?
            .len() as u64;
        Ok(length)
    }

    /// Move everything this node was processing back onto its queue. Run at
    /// daemon boot: the entries were mid-dispatch when the old process died.
    pub async fn restart_queues(&mut self, network_node: bool) -> Result<(), StoreError> {
        if network_node {
            self.restart_queue("networknode").await?;
        }
        let node_name = self.node_name().to_owned();
        self.restart_queue(&node_name).await
    }

    async fn restart_queue(&mut self, queue: &str) -> Result<(), StoreError> {
        let processing_path = object_path("processing", Some(queue), None);

        // A dedicated connection: this iterates a whole range while other
        // writes go through the shared handle.
        let mut engine = self.fork_engine();
        let pairs = with_retry!(
            "restart queue",
            engine.get_prefix(&processing_path, SortOrder::Ascend, 0)
        )?;

        for pair in pairs {
            let jobname = jobname_of_key(&pair.key).to_owned();
            let queue_key = object_path("queue", Some(queue), Some(&jobname));
            self.put_raw(&queue_key, &pair.value).await?;
            self.delete("processing", Some(queue), Some(&jobname)).await?;
            warn!(jobname, queuename = queue, "reset workitem");
        }
        Ok(())
    }

    /// Every queued and processing workitem in the cluster, decoded.
    pub async fn outstanding_jobs(&mut self) -> Result<Vec<(String, WorkItem)>, StoreError> {
        let mut engine = self.fork_engine();
        let mut jobs = Vec::new();

        for prefix in ["/sf/processing/", "/sf/queue/"] {
            let pairs = with_retry!("outstanding jobs", engine.get_prefix(prefix, SortOrder::None, 0))?;
            for pair in pairs {
                match serde_json::from_str::<WorkItem>(&pair.value) {
                    Ok(workitem) => jobs.push((pair.key, workitem)),
                    Err(err) => {
                        warn!(key = %pair.key, error = %err, "unparseable workitem");
                    }
                }
            }
        }
        Ok(jobs)
    }

    /// Blob fetches currently queued or in flight, grouped by blob UUID.
    /// Fetches assigned to absent nodes are ignored so the replication
    /// logic does not count on them.
    pub async fn current_blob_transfers(
        &mut self,
        absent_nodes: &[String],
    ) -> Result<HashMap<String, Vec<String>>, StoreError> {
        let mut current_fetches: HashMap<String, Vec<String>> = HashMap::new();

        for (workname, workitem) in self.outstanding_jobs().await? {
            // A workname looks like /sf/queue/sf-3/<jobname>.
            let parts: Vec<&str> = workname.split('/').collect();
            let [_, _, phase, node, _] = parts.as_slice() else {
                continue;
            };
            if *node == "networknode" {
                continue;
            }

            for task in &workitem.tasks {
                let Task::FetchBlob(fetch) = task else {
                    continue;
                };
                if absent_nodes.iter().any(|absent| absent == node) {
                    warn!(
                        blob = %fetch.blob_uuid,
                        node, phase,
                        "node is absent, ignoring fetch"
                    );
                } else {
                    info!(
                        blob = %fetch.blob_uuid,
                        node, phase,
                        "node is fetching blob"
                    );
                    current_fetches
                        .entry(fetch.blob_uuid.clone())
                        .or_default()
                        .push((*node).to_owned());
                }
            }
        }
        Ok(current_fetches)
    }
}
