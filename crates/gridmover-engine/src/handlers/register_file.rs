// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `registerFile`: add existing replicas to the catalogs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gridmover_core::model::types;
use gridmover_core::{FileStatus, Operation};
use tracing::warn;

use super::{FileOutcome, HandlerContext, HandlerError, OperationHandler, apply_to_waiting};
use crate::services::{CatalogSet, ReplicaEntry};

pub struct RegisterFileHandler {
    catalogs: CatalogSet,
}

impl RegisterFileHandler {
    pub fn new(catalogs: CatalogSet) -> Self {
        Self { catalogs }
    }
}

#[async_trait]
impl OperationHandler for RegisterFileHandler {
    fn op_type(&self) -> &'static str {
        types::REGISTER_FILE
    }

    async fn execute(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        let targets = op.target_ses();
        if targets.is_empty() {
            apply_to_waiting(op, FileOutcome::Failed("no TargetSE given".to_string()));
            return Ok(Vec::new());
        }
        let catalogs = match self.catalogs.for_operation(op) {
            Ok(catalogs) => catalogs,
            Err(e) => {
                apply_to_waiting(op, FileOutcome::Failed(e.to_string()));
                return Ok(Vec::new());
            }
        };

        let mut entries = Vec::new();
        for file in op.files.iter().filter(|f| f.status == FileStatus::Waiting) {
            for target in &targets {
                entries.push(ReplicaEntry {
                    lfn: file.lfn.clone(),
                    pfn: file.pfn.clone().unwrap_or_default(),
                    se: target.clone(),
                    size: file.size,
                    checksum: file.checksum.clone(),
                    checksum_type: file.checksum_type,
                    guid: file.guid.clone(),
                });
            }
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut outcomes: BTreeMap<String, FileOutcome> = BTreeMap::new();
        for catalog in &catalogs {
            match catalog.register_file(&entries).await {
                Ok(results) => {
                    for (lfn, result) in results {
                        if let Err(message) = result {
                            outcomes
                                .entry(lfn)
                                .or_insert(FileOutcome::Failed(format!("{}: {message}", catalog.name())));
                        }
                    }
                }
                Err(e) => {
                    let outcome = if e.is_retryable() {
                        FileOutcome::Retry(e.to_string())
                    } else {
                        FileOutcome::Failed(e.to_string())
                    };
                    for entry in &entries {
                        outcomes.entry(entry.lfn.clone()).or_insert(outcome.clone());
                    }
                }
            }
        }

        for file in op.files.iter_mut().filter(|f| f.status == FileStatus::Waiting) {
            let outcome = outcomes.remove(&file.lfn).unwrap_or(FileOutcome::Done);
            if outcome != FileOutcome::Done {
                warn!(request_name = %ctx.request_name, lfn = %file.lfn, outcome = ?outcome, "Registration not completed");
            }
            outcome.apply(file);
        }
        Ok(Vec::new())
    }
}
