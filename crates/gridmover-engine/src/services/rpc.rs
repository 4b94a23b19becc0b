// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote calls through the RPC gateway.
//!
//! A call is an [`RpcStub`] posted as JSON to `{gateway}/rpc`. The gateway
//! answers `{"OK": true, "Value": ...}` or `{"OK": false, "Message": "..."}`.
//! [`RpcCatalog`] and [`RpcJobNotifier`] implement the catalog and
//! origin-job seams on top of it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridmover_core::model::RpcStub;
use gridmover_core::notify::{JobNotifier, NotifyError};
use gridmover_core::RequestStatus;
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use super::catalog::{Catalog, CatalogError, CatalogResult, FileMetadata, PerLfn, ReplicaEntry};

/// Remote call failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// The gateway could not be reached or failed server-side.
    #[error("RPC transport error: {0}")]
    Transport(String),

    /// The remote service answered with an error.
    #[error("{service}.{method} failed: {message}")]
    Remote {
        service: String,
        method: String,
        message: String,
    },

    /// The answer could not be decoded.
    #[error("RPC decode error: {0}")]
    Decode(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Performs one remote call.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, stub: &RpcStub) -> Result<Value, RpcError>;
}

#[derive(Debug, Deserialize)]
struct GatewayReply {
    #[serde(rename = "OK")]
    ok: bool,
    #[serde(rename = "Value", default)]
    value: Value,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

/// [`RpcClient`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRpcClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpRpcClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn call(&self, stub: &RpcStub) -> Result<Value, RpcError> {
        debug!(service = %stub.service, method = %stub.method, "Forwarding RPC");
        let response = self
            .http
            .post(format!("{}/rpc", self.base_url))
            .json(stub)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RpcError::Transport(format!("gateway returned {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(RpcError::Remote {
                service: stub.service.clone(),
                method: stub.method.clone(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let reply: GatewayReply =
            serde_json::from_str(&body).map_err(|e| RpcError::Decode(e.to_string()))?;
        if reply.ok {
            Ok(reply.value)
        } else {
            Err(RpcError::Remote {
                service: stub.service.clone(),
                method: stub.method.clone(),
                message: reply.message.unwrap_or_else(|| "unspecified error".to_string()),
            })
        }
    }
}

/// Records calls and answers from a table, for tests.
#[derive(Debug, Clone, Default)]
pub struct MockRpcClient {
    calls: Arc<Mutex<Vec<RpcStub>>>,
    replies: Arc<Mutex<BTreeMap<(String, String), Result<Value, RpcError>>>>,
}

impl MockRpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `service.method` with `reply`. Unknown calls answer `null`.
    pub async fn reply(&self, service: &str, method: &str, reply: Result<Value, RpcError>) {
        self.replies
            .lock()
            .await
            .insert((service.to_string(), method.to_string()), reply);
    }

    pub async fn calls(&self) -> Vec<RpcStub> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl RpcClient for MockRpcClient {
    async fn call(&self, stub: &RpcStub) -> Result<Value, RpcError> {
        self.calls.lock().await.push(stub.clone());
        self.replies
            .lock()
            .await
            .get(&(stub.service.clone(), stub.method.clone()))
            .cloned()
            .unwrap_or(Ok(Value::Null))
    }
}

/// Catalog reached through the RPC gateway.
pub struct RpcCatalog {
    name: String,
    service: String,
    rpc: Arc<dyn RpcClient>,
}

impl RpcCatalog {
    /// Catalog `name`, served by the `DataManagement/<name>` service.
    pub fn new(name: impl Into<String>, rpc: Arc<dyn RpcClient>) -> Self {
        let name = name.into();
        Self {
            service: format!("DataManagement/{name}"),
            name,
            rpc,
        }
    }

    async fn bulk<T: DeserializeOwned>(&self, method: &str, args: Value) -> CatalogResult<PerLfn<T>> {
        let stub = RpcStub::new(self.service.clone(), method, args);
        let value = self.rpc.call(&stub).await.map_err(|e| match e {
            RpcError::Transport(reason) => CatalogError::Unavailable {
                catalog: self.name.clone(),
                reason,
            },
            other => CatalogError::Protocol(other.to_string()),
        })?;
        decode_per_lfn(value)
    }
}

/// Decode `{"Successful": {lfn: value}, "Failed": {lfn: message}}`.
fn decode_per_lfn<T: DeserializeOwned>(value: Value) -> CatalogResult<PerLfn<T>> {
    #[derive(Deserialize)]
    struct BulkReply {
        #[serde(rename = "Successful", default)]
        successful: BTreeMap<String, Value>,
        #[serde(rename = "Failed", default)]
        failed: BTreeMap<String, String>,
    }

    let reply: BulkReply =
        serde_json::from_value(value).map_err(|e| CatalogError::Protocol(e.to_string()))?;
    let mut out = PerLfn::new();
    for (lfn, value) in reply.successful {
        let decoded = serde_json::from_value(value).map_err(|e| e.to_string());
        out.insert(lfn, decoded);
    }
    for (lfn, message) in reply.failed {
        out.insert(lfn, Err(message));
    }
    Ok(out)
}

/// Successful catalog writes answer with arbitrary values.
fn ignore_values(map: PerLfn<IgnoredAny>) -> PerLfn<()> {
    map.into_iter().map(|(lfn, r)| (lfn, r.map(|_| ()))).collect()
}

#[async_trait]
impl Catalog for RpcCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn register_file(&self, entries: &[ReplicaEntry]) -> CatalogResult<PerLfn<()>> {
        self.bulk("addFile", json!([entries])).await.map(ignore_values)
    }

    async fn register_replica(&self, entries: &[ReplicaEntry]) -> CatalogResult<PerLfn<()>> {
        self.bulk("addReplica", json!([entries])).await.map(ignore_values)
    }

    async fn remove_file(&self, lfns: &[String]) -> CatalogResult<PerLfn<()>> {
        self.bulk("removeFile", json!([lfns])).await.map(ignore_values)
    }

    async fn remove_replica(&self, se: &str, lfns: &[String]) -> CatalogResult<PerLfn<()>> {
        self.bulk("removeReplica", json!([se, lfns])).await.map(ignore_values)
    }

    async fn set_replica_status(
        &self,
        se: &str,
        lfns: &[String],
        status: &str,
    ) -> CatalogResult<PerLfn<()>> {
        self.bulk("setReplicaStatus", json!([se, lfns, status]))
            .await
            .map(ignore_values)
    }

    async fn exists(&self, lfns: &[String]) -> CatalogResult<PerLfn<bool>> {
        self.bulk("exists", json!([lfns])).await
    }

    async fn get_file_metadata(&self, lfns: &[String]) -> CatalogResult<PerLfn<FileMetadata>> {
        self.bulk("getFileMetadata", json!([lfns])).await
    }

    async fn get_replicas(
        &self,
        lfns: &[String],
    ) -> CatalogResult<PerLfn<BTreeMap<String, String>>> {
        self.bulk("getReplicas", json!([lfns])).await
    }
}

/// Origin-job notification through the RPC gateway.
pub struct RpcJobNotifier {
    rpc: Arc<dyn RpcClient>,
}

impl RpcJobNotifier {
    pub const SERVICE: &'static str = "WorkloadManagement/JobStateUpdate";

    pub fn new(rpc: Arc<dyn RpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl JobNotifier for RpcJobNotifier {
    async fn notify_terminal(
        &self,
        job_id: i64,
        request_name: &str,
        status: RequestStatus,
    ) -> Result<(), NotifyError> {
        let (job_status, minor) = match status {
            RequestStatus::Done => ("Done", "Requests done"),
            RequestStatus::Cancelled => ("Failed", "Requests cancelled"),
            _ => ("Failed", "Requests failed"),
        };
        let stub = RpcStub::new(
            Self::SERVICE,
            "setJobStatus",
            json!([job_id, job_status, minor, "gridmover", request_name]),
        );
        self.rpc
            .call(&stub)
            .await
            .map(|_| ())
            .map_err(|e| NotifyError(e.to_string()))
    }
}
