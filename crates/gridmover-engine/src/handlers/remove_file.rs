// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `removeFile`: delete every physical replica, then the catalog entry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gridmover_core::model::types;
use gridmover_core::{FileStatus, Operation};
use tracing::{debug, warn};

use super::{FileOutcome, HandlerContext, HandlerError, OperationHandler, apply_to_waiting};
use crate::services::catalog::is_no_such_file;
use crate::services::{CatalogSet, StorageRegistry};

pub struct RemoveFileHandler {
    catalogs: CatalogSet,
    storage: StorageRegistry,
}

impl RemoveFileHandler {
    pub fn new(catalogs: CatalogSet, storage: StorageRegistry) -> Self {
        Self { catalogs, storage }
    }

    /// Delete the physical copies. Returns the failure for files that kept one.
    async fn delete_replicas(&self, replicas: &BTreeMap<String, String>, lfn: &str) -> Option<FileOutcome> {
        let mut outcome = None;
        for se in replicas.keys() {
            let element = match self.storage.get(se) {
                Ok(element) => element,
                Err(e) => {
                    outcome.get_or_insert(FileOutcome::Failed(e.to_string()));
                    continue;
                }
            };
            match element.delete(lfn).await {
                Ok(()) => debug!(lfn = %lfn, se = %se, "Physical replica removed"),
                Err(e) if e.is_missing() => {}
                Err(e) if e.is_retryable() => {
                    outcome.get_or_insert(FileOutcome::Retry(format!("{se}: {e}")));
                }
                Err(e) => {
                    outcome.get_or_insert(FileOutcome::Failed(format!("{se}: {e}")));
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl OperationHandler for RemoveFileHandler {
    fn op_type(&self) -> &'static str {
        types::REMOVE_FILE
    }

    async fn execute(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        let catalogs = match self.catalogs.for_operation(op) {
            Ok(catalogs) => catalogs,
            Err(e) => {
                apply_to_waiting(op, FileOutcome::Failed(e.to_string()));
                return Ok(Vec::new());
            }
        };
        let lfns: Vec<String> = op
            .files
            .iter()
            .filter(|f| f.status == FileStatus::Waiting)
            .map(|f| f.lfn.clone())
            .collect();
        if lfns.is_empty() {
            return Ok(Vec::new());
        }

        let mut outcomes: BTreeMap<String, FileOutcome> = BTreeMap::new();
        let replicas = match self.catalogs.primary() {
            Ok(primary) => primary.get_replicas(&lfns).await,
            Err(e) => Err(e),
        };
        match replicas {
            Ok(replicas) => {
                for (lfn, result) in replicas {
                    match result {
                        Ok(replicas) => {
                            if let Some(outcome) = self.delete_replicas(&replicas, &lfn).await {
                                outcomes.insert(lfn, outcome);
                            }
                        }
                        Err(message) if is_no_such_file(&message) => {}
                        Err(message) => {
                            outcomes.insert(lfn, FileOutcome::Failed(message));
                        }
                    }
                }
            }
            Err(e) => {
                apply_to_waiting(op, FileOutcome::Retry(e.to_string()));
                return Ok(Vec::new());
            }
        }

        // Catalog entries go only once no physical copy is left.
        let removable: Vec<String> = lfns
            .iter()
            .filter(|lfn| !outcomes.contains_key(*lfn))
            .cloned()
            .collect();
        if !removable.is_empty() {
            for catalog in &catalogs {
                match catalog.remove_file(&removable).await {
                    Ok(results) => {
                        for (lfn, result) in results {
                            if let Err(message) = result
                                && !is_no_such_file(&message)
                            {
                                outcomes.entry(lfn).or_insert(FileOutcome::Failed(message));
                            }
                        }
                    }
                    Err(e) => {
                        let outcome = if e.is_retryable() {
                            FileOutcome::Retry(e.to_string())
                        } else {
                            FileOutcome::Failed(e.to_string())
                        };
                        for lfn in &removable {
                            outcomes.entry(lfn.clone()).or_insert(outcome.clone());
                        }
                    }
                }
            }
        }

        for file in op.files.iter_mut().filter(|f| f.status == FileStatus::Waiting) {
            let outcome = outcomes.remove(&file.lfn).unwrap_or(FileOutcome::Done);
            if outcome != FileOutcome::Done {
                warn!(request_name = %ctx.request_name, lfn = %file.lfn, outcome = ?outcome, "Removal not completed");
            }
            outcome.apply(file);
        }
        Ok(Vec::new())
    }
}
