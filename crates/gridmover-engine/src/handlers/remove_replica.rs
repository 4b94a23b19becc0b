// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `removeReplica`: drop the copies held at one storage element.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gridmover_core::model::types;
use gridmover_core::{FileStatus, Operation};
use tracing::warn;

use super::{FileOutcome, HandlerContext, HandlerError, OperationHandler, apply_to_waiting};
use crate::services::catalog::is_no_such_file;
use crate::services::{CatalogSet, StorageRegistry};

pub struct RemoveReplicaHandler {
    catalogs: CatalogSet,
    storage: StorageRegistry,
}

impl RemoveReplicaHandler {
    pub fn new(catalogs: CatalogSet, storage: StorageRegistry) -> Self {
        Self { catalogs, storage }
    }
}

#[async_trait]
impl OperationHandler for RemoveReplicaHandler {
    fn op_type(&self) -> &'static str {
        types::REMOVE_REPLICA
    }

    async fn execute(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        let Some(target) = op.single_target_se() else {
            apply_to_waiting(
                op,
                FileOutcome::Failed("removeReplica needs exactly one TargetSE".to_string()),
            );
            return Ok(Vec::new());
        };
        let (element, catalogs) = match (self.storage.get(&target), self.catalogs.for_operation(op)) {
            (Ok(element), Ok(catalogs)) => (element, catalogs),
            (Err(e), _) => {
                apply_to_waiting(op, FileOutcome::Failed(e.to_string()));
                return Ok(Vec::new());
            }
            (_, Err(e)) => {
                apply_to_waiting(op, FileOutcome::Failed(e.to_string()));
                return Ok(Vec::new());
            }
        };

        let mut outcomes: BTreeMap<String, FileOutcome> = BTreeMap::new();
        let mut unregister = Vec::new();
        for file in op.files.iter().filter(|f| f.status == FileStatus::Waiting) {
            match element.delete(&file.lfn).await {
                Ok(()) => unregister.push(file.lfn.clone()),
                Err(e) if e.is_missing() => unregister.push(file.lfn.clone()),
                Err(e) if e.is_retryable() => {
                    outcomes.insert(file.lfn.clone(), FileOutcome::Retry(e.to_string()));
                }
                Err(e) => {
                    outcomes.insert(file.lfn.clone(), FileOutcome::Failed(e.to_string()));
                }
            }
        }

        if !unregister.is_empty() {
            for catalog in &catalogs {
                match catalog.remove_replica(&target, &unregister).await {
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
                        for lfn in &unregister {
                            outcomes.entry(lfn.clone()).or_insert(outcome.clone());
                        }
                    }
                }
            }
        }

        for file in op.files.iter_mut().filter(|f| f.status == FileStatus::Waiting) {
            let outcome = outcomes.remove(&file.lfn).unwrap_or(FileOutcome::Done);
            if outcome != FileOutcome::Done {
                warn!(request_name = %ctx.request_name, lfn = %file.lfn, se = %target, outcome = ?outcome, "Replica removal not completed");
            }
            outcome.apply(file);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{ctx, fixture};
    use crate::services::ReplicaEntry;
    use gridmover_core::File;

    #[tokio::test]
    async fn test_removes_one_replica() {
        let fx = fixture();
        for se in ["CERN-DISK", "RAL-DISK"] {
            fx.catalog
                .add_file(ReplicaEntry {
                    lfn: "/vo/a".into(),
                    pfn: format!("mem://{se}/vo/a"),
                    se: se.into(),
                    ..Default::default()
                })
                .await;
        }
        fx.ral.insert("/vo/a", b"abc".to_vec()).await;

        let handler = RemoveReplicaHandler::new(fx.services.catalogs, fx.services.storage);
        let mut op = Operation::new(types::REMOVE_REPLICA)
            .with_target_se("RAL-DISK")
            .with_file(File::new("/vo/a"));
        handler.execute(&ctx(), &mut op).await.unwrap();

        assert_eq!(op.files[0].status, FileStatus::Done);
        assert!(!fx.ral.contains("/vo/a").await);
        assert_eq!(fx.catalog.replica_ses("/vo/a").await, vec!["CERN-DISK".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_replica_is_success() {
        let fx = fixture();
        let handler = RemoveReplicaHandler::new(fx.services.catalogs, fx.services.storage);
        let mut op = Operation::new(types::REMOVE_REPLICA)
            .with_target_se("RAL-DISK")
            .with_file(File::new("/vo/a"));
        handler.execute(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Done);
    }

    #[tokio::test]
    async fn test_needs_single_target() {
        let fx = fixture();
        let handler = RemoveReplicaHandler::new(fx.services.catalogs, fx.services.storage);
        let mut op = Operation::new(types::REMOVE_REPLICA)
            .with_target_se("RAL-DISK,CERN-DISK")
            .with_file(File::new("/vo/a"));
        handler.execute(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Failed);
    }
}
