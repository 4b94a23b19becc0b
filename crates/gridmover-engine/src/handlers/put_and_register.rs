// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `putAndRegister`: upload local files to one SE and register them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use gridmover_core::model::types;
use gridmover_core::{File, FileStatus, Operation};
use tracing::{debug, warn};

use super::{
    FileOutcome, HandlerContext, HandlerError, OperationHandler, apply_to_waiting,
    register_follow_up,
};
use crate::checksum;
use crate::services::{Catalog, CatalogSet, ReplicaEntry, StorageElement, StorageRegistry};

pub struct PutAndRegisterHandler {
    catalogs: CatalogSet,
    storage: StorageRegistry,
}

impl PutAndRegisterHandler {
    pub fn new(catalogs: CatalogSet, storage: StorageRegistry) -> Self {
        Self { catalogs, storage }
    }

    /// Upload one file. Returns the catalog entry on success.
    async fn upload(&self, se: &dyn StorageElement, file: &mut File) -> Result<ReplicaEntry, FileOutcome> {
        let Some(pfn) = file.pfn.as_deref() else {
            return Err(FileOutcome::Failed("no local PFN to upload".to_string()));
        };
        let path = local_path(pfn);

        if file.checksum.is_none() {
            match checksum::compute_file(&path, file.checksum_type).await {
                Ok((size, sum)) => {
                    if file.size == 0 {
                        file.size = size;
                    }
                    file.checksum = sum;
                }
                Err(e) => {
                    return Err(FileOutcome::Failed(format!(
                        "cannot read local file {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        if file.guid.is_none() {
            file.guid = Some(uuid::Uuid::new_v4().to_string());
        }

        let stored = match se.put(&file.lfn, &path).await {
            Ok(stored) => stored,
            Err(e) if e.is_retryable() => return Err(FileOutcome::Retry(e.to_string())),
            Err(e) => return Err(FileOutcome::Failed(format!("put failed: {e}"))),
        };

        if file.size == 0 {
            file.size = stored.size;
        }
        let mismatch = if stored.size != file.size {
            Some(format!("size mismatch: expected {}, stored {}", file.size, stored.size))
        } else {
            match (&file.checksum, &stored.checksum) {
                (Some(expected), Some(actual))
                    if stored.checksum_type == file.checksum_type
                        && !checksum::matches(expected, actual, file.checksum_type) =>
                {
                    Some(format!("checksum mismatch: expected {expected}, stored {actual}"))
                }
                _ => None,
            }
        };
        if let Some(reason) = mismatch {
            if let Err(e) = se.delete(&file.lfn).await {
                warn!(lfn = %file.lfn, error = %e, "Failed to remove corrupt upload");
            }
            return Err(FileOutcome::Failed(reason));
        }

        Ok(ReplicaEntry {
            lfn: file.lfn.clone(),
            pfn: se.url(&file.lfn),
            se: se.name().to_string(),
            size: file.size,
            checksum: file.checksum.clone(),
            checksum_type: file.checksum_type,
            guid: file.guid.clone(),
        })
    }
}

/// Local path of a `file://` URL or plain path.
fn local_path(pfn: &str) -> PathBuf {
    PathBuf::from(pfn.strip_prefix("file://").unwrap_or(pfn))
}

/// Register `entries` in every catalog. Returns the failed LFNs with the
/// rejecting catalogs and the first error each one reported.
pub(super) async fn register_everywhere(
    catalogs: &[std::sync::Arc<dyn Catalog>],
    entries: &[ReplicaEntry],
) -> BTreeMap<String, (Vec<String>, String)> {
    let mut failures: BTreeMap<String, (Vec<String>, String)> = BTreeMap::new();
    if entries.is_empty() {
        return failures;
    }
    for catalog in catalogs {
        match catalog.register_file(entries).await {
            Ok(results) => {
                for entry in entries {
                    let error = match results.get(&entry.lfn) {
                        Some(Ok(())) => continue,
                        Some(Err(message)) => message.clone(),
                        None => "missing from catalog reply".to_string(),
                    };
                    let failure = failures
                        .entry(entry.lfn.clone())
                        .or_insert_with(|| (Vec::new(), error));
                    failure.0.push(catalog.name().to_string());
                }
            }
            Err(e) => {
                for entry in entries {
                    let failure = failures
                        .entry(entry.lfn.clone())
                        .or_insert_with(|| (Vec::new(), e.to_string()));
                    failure.0.push(catalog.name().to_string());
                }
            }
        }
    }
    failures
}

#[async_trait]
impl OperationHandler for PutAndRegisterHandler {
    fn op_type(&self) -> &'static str {
        types::PUT_AND_REGISTER
    }

    async fn execute(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        let Some(target) = op.single_target_se() else {
            apply_to_waiting(
                op,
                FileOutcome::Failed("putAndRegister needs exactly one TargetSE".to_string()),
            );
            return Ok(Vec::new());
        };
        let se = match self.storage.get(&target) {
            Ok(se) => se,
            Err(e) => {
                apply_to_waiting(op, FileOutcome::Failed(e.to_string()));
                return Ok(Vec::new());
            }
        };
        let catalogs = match self.catalogs.for_operation(op) {
            Ok(catalogs) => catalogs,
            Err(e) => {
                apply_to_waiting(op, FileOutcome::Failed(e.to_string()));
                return Ok(Vec::new());
            }
        };

        let mut uploaded = Vec::new();
        for file in op.files.iter_mut().filter(|f| f.status == FileStatus::Waiting) {
            match self.upload(se.as_ref(), file).await {
                Ok(entry) => uploaded.push(entry),
                Err(outcome) => {
                    debug!(request_name = %ctx.request_name, lfn = %file.lfn, outcome = ?outcome, "Upload not completed");
                    outcome.apply(file);
                }
            }
        }

        let failures = register_everywhere(&catalogs, &uploaded).await;
        let mut to_retry = Vec::new();
        let mut failed_catalogs: Vec<String> = Vec::new();
        for entry in uploaded {
            let Some(file) = op.file_mut(&entry.lfn) else {
                continue;
            };
            match failures.get(&entry.lfn) {
                None => file.mark_done(),
                Some((rejecting, error)) => {
                    warn!(
                        request_name = %ctx.request_name,
                        lfn = %entry.lfn,
                        error = %error,
                        "Registration failed after upload, scheduling registerFile"
                    );
                    file.mark_failed(format!("registration failed: {error}"));
                    for name in rejecting {
                        if !failed_catalogs.contains(name) {
                            failed_catalogs.push(name.clone());
                        }
                    }
                    if entry.checksum.is_some() {
                        to_retry.push(entry);
                    }
                }
            }
        }

        Ok(register_follow_up(&target, &failed_catalogs, &to_retry)
            .into_iter()
            .collect())
    }
}
