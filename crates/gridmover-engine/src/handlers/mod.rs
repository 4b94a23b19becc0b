// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation handlers.
//!
//! A handler processes the Waiting operation of a leased request. It classifies
//! every file it touches as Done, Retry (stays Waiting with an error) or Failed,
//! and may return follow-up operations that the executor inserts right after
//! the current one. A handler returns `Err` only for a fatal condition; the
//! executor then abandons the request without committing anything.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use gridmover_core::model::types;
use gridmover_core::validation::Validator;
use gridmover_core::{File, FileStatus, Operation, OperationStatus, Request, RequestId};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::scheduler::Scheduler;
use crate::services::{CatalogSet, ReplicaEntry, RpcClient, StorageRegistry};

mod forward_rpc;
mod fts_schedule;
mod put_and_register;
mod register_file;
mod remove_file;
mod remove_replica;
mod replicate_and_register;

pub use forward_rpc::ForwardRpcHandler;
pub use fts_schedule::{FtsPlanner, FtsScheduleHandler};
pub use put_and_register::PutAndRegisterHandler;
pub use register_file::RegisterFileHandler;
pub use remove_file::RemoveFileHandler;
pub use remove_replica::RemoveReplicaHandler;
pub use replicate_and_register::ReplicateAndRegisterHandler;

/// Handler settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Scheduling attempts per file before an FTS-scheduled file fails (default: 10).
    pub schedule_max_attempts: u32,
    /// Replicate through FTS instead of copying directly (default: true).
    pub replicate_via_fts: bool,
    /// Staging area for direct copies.
    pub scratch_dir: PathBuf,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            schedule_max_attempts: 10,
            replicate_via_fts: true,
            scratch_dir: std::env::temp_dir().join("gridmover"),
        }
    }
}

/// What a handler knows about the request it works for.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    pub request_id: Option<RequestId>,
    pub request_name: String,
    pub owner_dn: Option<String>,
    pub owner_group: Option<String>,
    pub job_id: i64,
}

impl HandlerContext {
    pub fn from_request(request: &Request) -> Self {
        Self {
            request_id: request.request_id,
            request_name: request.request_name.clone(),
            owner_dn: request.owner_dn.clone(),
            owner_group: request.owner_group.clone(),
            job_id: request.job_id,
        }
    }
}

/// Fatal handler failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandlerError {
    /// Processing cannot continue; the request is reset untouched.
    #[error("Fatal handler error: {0}")]
    Fatal(String),

    #[error("Handler I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classified result for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Done,
    /// Retryable: the file stays Waiting with the error recorded.
    Retry(String),
    /// Permanent failure.
    Failed(String),
}

impl FileOutcome {
    pub fn apply(self, file: &mut File) {
        match self {
            Self::Done => file.mark_done(),
            Self::Retry(error) => file.mark_retry(error),
            Self::Failed(error) => file.mark_failed(error),
        }
    }
}

/// Apply one outcome to every Waiting file of an operation.
pub(crate) fn apply_to_waiting(op: &mut Operation, outcome: FileOutcome) {
    for file in op.files.iter_mut().filter(|f| f.status == FileStatus::Waiting) {
        outcome.clone().apply(file);
    }
}

/// Build the `registerFile` operation that retries failed registrations.
pub(crate) fn register_follow_up(
    target_se: &str,
    catalogs: &[String],
    entries: &[ReplicaEntry],
) -> Option<Operation> {
    if entries.is_empty() {
        return None;
    }
    let mut op = Operation::new(types::REGISTER_FILE).with_target_se(target_se);
    if !catalogs.is_empty() {
        op = op.with_catalog(catalogs.join(","));
    }
    for entry in entries {
        let mut file = File::new(&entry.lfn)
            .with_size(entry.size)
            .with_pfn(&entry.pfn);
        if let Some(checksum) = &entry.checksum {
            file = file.with_checksum(checksum, entry.checksum_type);
        }
        if let Some(guid) = &entry.guid {
            file = file.with_guid(guid);
        }
        op = op.with_file(file);
    }
    Some(op)
}

/// Collaborators shared by the standard handlers.
#[derive(Clone)]
pub struct Services {
    pub catalogs: CatalogSet,
    pub storage: StorageRegistry,
    pub scheduler: Arc<Scheduler>,
    /// Without an RPC client `forwardRPC` is not registered.
    pub rpc: Option<Arc<dyn RpcClient>>,
}

/// One operation type's processing.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Operation type key this handler serves.
    fn op_type(&self) -> &'static str;

    /// Process the Waiting operation in place; returns follow-up operations.
    async fn execute(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError>;
}

/// Per-handler counters.
#[derive(Debug, Default)]
pub struct HandlerCounters {
    pub attempted: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl HandlerCounters {
    pub fn snapshot(&self) -> HandlerStats {
        HandlerStats {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Count the files a run settled. File-less operations count once.
    fn record(&self, before: &[FileStatus], op: &Operation) {
        if op.files.is_empty() {
            self.attempted.fetch_add(1, Ordering::Relaxed);
            match op.status {
                OperationStatus::Done => self.succeeded.fetch_add(1, Ordering::Relaxed),
                OperationStatus::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
                _ => 0,
            };
            return;
        }
        for (file, was) in op.files.iter().zip(before) {
            if !was.is_terminal() {
                self.attempted.fetch_add(1, Ordering::Relaxed);
                match file.status {
                    FileStatus::Done => self.succeeded.fetch_add(1, Ordering::Relaxed),
                    FileStatus::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
                    _ => 0,
                };
            }
        }
    }
}

/// Per-handler counters keyed by operation type.
#[derive(Debug, Clone, Default)]
pub struct HandlerMetrics {
    counters: BTreeMap<&'static str, Arc<HandlerCounters>>,
}

impl HandlerMetrics {
    pub fn counters(&self, op_type: &str) -> Option<&Arc<HandlerCounters>> {
        self.counters.get(op_type)
    }

    pub fn snapshot(&self) -> BTreeMap<String, HandlerStats> {
        self.counters
            .iter()
            .map(|(op_type, counters)| (op_type.to_string(), counters.snapshot()))
            .collect()
    }
}

/// Handlers keyed by operation type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn OperationHandler>>,
    metrics: HandlerMetrics,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every standard handler.
    pub fn standard(services: Services, config: HandlerConfig) -> Self {
        let planner = Arc::new(FtsPlanner::new(
            services.catalogs.clone(),
            services.storage.clone(),
            services.scheduler.clone(),
            config.schedule_max_attempts,
        ));

        let mut registry = Self::new();
        registry
            .register(Arc::new(PutAndRegisterHandler::new(
                services.catalogs.clone(),
                services.storage.clone(),
            )))
            .register(Arc::new(ReplicateAndRegisterHandler::new(
                services.catalogs.clone(),
                services.storage.clone(),
                planner.clone(),
                config.clone(),
            )))
            .register(Arc::new(RegisterFileHandler::new(services.catalogs.clone())))
            .register(Arc::new(RemoveFileHandler::new(
                services.catalogs.clone(),
                services.storage.clone(),
            )))
            .register(Arc::new(RemoveReplicaHandler::new(
                services.catalogs.clone(),
                services.storage.clone(),
            )))
            .register(Arc::new(FtsScheduleHandler::new(planner)));
        if let Some(rpc) = services.rpc {
            registry.register(Arc::new(ForwardRpcHandler::new(rpc)));
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) -> &mut Self {
        let op_type = handler.op_type();
        self.metrics
            .counters
            .entry(op_type)
            .or_insert_with(|| Arc::new(HandlerCounters::default()));
        self.handlers.insert(op_type, handler);
        self
    }

    pub fn get(&self, op_type: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(op_type).cloned()
    }

    /// Registered operation types.
    pub fn op_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }

    /// Put-time validator accepting exactly the registered types.
    pub fn validator(&self) -> Validator {
        Validator::default().restricted_to(self.op_types())
    }

    /// Run the handler for `op` and update its counters.
    ///
    /// Unknown types fail the operation without touching any service.
    pub async fn dispatch(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        let Some(handler) = self.get(&op.op_type) else {
            let error = format!("no handler for operation type '{}'", op.op_type);
            if op.files.is_empty() {
                op.set_status(OperationStatus::Failed, Some(error));
            } else {
                apply_to_waiting(op, FileOutcome::Failed(error));
            }
            return Ok(Vec::new());
        };

        let before: Vec<FileStatus> = op.files.iter().map(|f| f.status).collect();
        let follow_ups = handler.execute(ctx, op).await?;
        if let Some(counters) = self.metrics.counters(handler.op_type()) {
            counters.record(&before, op);
        }
        debug!(
            request_name = %ctx.request_name,
            op_type = %op.op_type,
            follow_ups = follow_ups.len(),
            "Handler finished"
        );
        Ok(follow_ups)
    }
}
