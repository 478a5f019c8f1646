//! Production KV engine: etcd's v3 JSON grpc-gateway over HTTP.
//!
//! Keys and values travel base64-encoded; compare-and-swap operations are
//! expressed as single-compare transactions. Long-lived connections get
//! dropped by etcd from time to time, so a failed request rebuilds the HTTP
//! client and is retried once before an error is reported.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::{Value, json};
use tracing::info;

use crate::backend::{KvEngine, KvPair, LeaseId, SortOrder, prefix_range_end};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct EtcdGateway {
    base_url: String,
    client: reqwest::Client,
}

impl EtcdGateway {
    /// `base_url` includes the API path, e.g. `http://localhost:2379/v3beta`.
    pub fn new(base_url: impl Into<String>) -> Self {
        info!("building new etcd connection");
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn rebuild(&mut self) {
        info!("building new etcd connection");
        self.client = reqwest::Client::new();
    }

    async fn post(&mut self, path: &str, body: Value) -> Result<Value, StoreError> {
        let url = format!("{}/{}", self.base_url, path);

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => {
                // The connection may simply have been dropped under us.
                info!(error = %err, "retrying after etcd error");
                self.rebuild();
                match self.client.post(&url).json(&body).send().await {
                    Ok(response) => response,
                    Err(err) if err.is_connect() => {
                        return Err(StoreError::Fatal(err.to_string()));
                    }
                    Err(err) => return Err(StoreError::Transient(err.to_string())),
                }
            }
        };

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Transient(format!(
                "etcd internal server error: {status}: {body}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Fatal(format!(
                "etcd request failed: {status}: {body}"
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| StoreError::Transient(err.to_string()))
    }

    /// Probe the connection the way every borrowed handle is probed; a
    /// failing probe rebuilds the client and lets the next request decide
    /// whether the trouble is real.
    async fn probe(&mut self) {
        if let Err(err) = self.post("maintenance/status", json!({})).await {
            info!(error = %err, "rebuilding etcd connection due to error on status check");
            self.rebuild();
        }
    }
}

fn decode_field(kv: &Value, field: &str) -> Result<String, StoreError> {
    let raw = kv
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Transient(format!("etcd kv missing {field}")))?;
    let bytes = B64
        .decode(raw)
        .map_err(|err| StoreError::Transient(format!("etcd {field} not base64: {err}")))?;
    String::from_utf8(bytes)
        .map_err(|err| StoreError::Transient(format!("etcd {field} not utf-8: {err}")))
}

/// The gateway renders int64 fields as JSON strings.
fn json_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
}

#[async_trait]
impl KvEngine for EtcdGateway {
    async fn status(&mut self) -> Result<(), StoreError> {
        self.post("maintenance/status", json!({})).await.map(|_| ())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.probe().await;
        let response = self
            .post("kv/range", json!({"key": B64.encode(key)}))
            .await?;
        match response.get("kvs").and_then(Value::as_array) {
            Some(kvs) if !kvs.is_empty() => Ok(Some(decode_field(&kvs[0], "value")?)),
            _ => Ok(None),
        }
    }

    async fn get_prefix(
        &mut self,
        prefix: &str,
        sort: SortOrder,
        limit: u64,
    ) -> Result<Vec<KvPair>, StoreError> {
        self.probe().await;
        let mut body = json!({
            "key": B64.encode(prefix),
            "range_end": B64.encode(prefix_range_end(prefix)),
        });
        match sort {
            SortOrder::None => {}
            SortOrder::Ascend => {
                body["sort_order"] = json!("ASCEND");
                body["sort_target"] = json!("KEY");
            }
            SortOrder::Descend => {
                body["sort_order"] = json!("DESCEND");
                body["sort_target"] = json!("KEY");
            }
        }
        if limit > 0 {
            body["limit"] = json!(limit.to_string());
        }

        let response = self.post("kv/range", body).await?;
        let mut pairs = Vec::new();
        if let Some(kvs) = response.get("kvs").and_then(Value::as_array) {
            for kv in kvs {
                pairs.push(KvPair {
                    key: decode_field(kv, "key")?,
                    value: decode_field(kv, "value")?,
                });
            }
        }
        Ok(pairs)
    }

    async fn put(
        &mut self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        self.probe().await;
        let mut body = json!({
            "key": B64.encode(key),
            "value": B64.encode(value),
        });
        if let Some(lease) = lease {
            body["lease"] = json!(lease.to_string());
        }
        self.post("kv/put", body).await.map(|_| ())
    }

    async fn create(
        &mut self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
    ) -> Result<bool, StoreError> {
        self.probe().await;
        let encoded_key = B64.encode(key);
        let mut request_put = json!({
            "key": encoded_key,
            "value": B64.encode(value),
        });
        if let Some(lease) = lease {
            request_put["lease"] = json!(lease.to_string());
        }
        let body = json!({
            "compare": [{"key": encoded_key, "target": "VERSION", "version": "0"}],
            "success": [{"request_put": request_put}],
            "failure": [],
        });

        let response = self.post("kv/txn", body).await?;
        Ok(response
            .get("succeeded")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        self.probe().await;
        let response = self
            .post("kv/deleterange", json!({"key": B64.encode(key)}))
            .await?;
        Ok(json_i64(response.get("deleted")).unwrap_or(0) > 0)
    }

    async fn delete_prefix(&mut self, prefix: &str) -> Result<(), StoreError> {
        self.probe().await;
        self.post(
            "kv/deleterange",
            json!({
                "key": B64.encode(prefix),
                "range_end": B64.encode(prefix_range_end(prefix)),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_if_value(&mut self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.probe().await;
        let encoded_key = B64.encode(key);
        let body = json!({
            "compare": [{"key": encoded_key, "target": "VALUE", "value": B64.encode(expected)}],
            "success": [{"request_delete_range": {"key": encoded_key}}],
            "failure": [],
        });

        let response = self.post("kv/txn", body).await?;
        Ok(response
            .get("succeeded")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn lease_grant(&mut self, ttl_seconds: i64) -> Result<LeaseId, StoreError> {
        let response = self
            .post("lease/grant", json!({"TTL": ttl_seconds.to_string(), "ID": "0"}))
            .await?;
        json_i64(response.get("ID"))
            .ok_or_else(|| StoreError::Transient("lease grant returned no ID".to_owned()))
    }

    async fn lease_refresh(&mut self, lease: LeaseId) -> Result<bool, StoreError> {
        let response = self
            .post("lease/keepalive", json!({"ID": lease.to_string()}))
            .await?;
        let ttl = json_i64(response.get("result").and_then(|r| r.get("TTL"))).unwrap_or(0);
        Ok(ttl > 0)
    }

    async fn lease_revoke(&mut self, lease: LeaseId) -> Result<(), StoreError> {
        self.post("kv/lease/revoke", json!({"ID": lease.to_string()}))
            .await
            .map(|_| ())
    }

    fn fork(&self) -> Box<dyn KvEngine> {
        Box::new(Self::new(self.base_url.clone()))
    }
}
