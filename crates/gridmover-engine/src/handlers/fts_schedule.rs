// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FTS scheduling.
//!
//! [`FtsPlanner`] turns Waiting files into FTS files planned by the
//! [`Scheduler`] and, on later passes, reconciles the Scheduled ones with the
//! transfer outcomes written back by the job manager. A file is Done once
//! every planned transfer finished and the new replicas are registered.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use gridmover_core::model::types;
use gridmover_core::{File, FileStatus, FtsFile, FtsFileStatus, Operation};
use tracing::{debug, info, warn};

use super::{FileOutcome, HandlerContext, HandlerError, OperationHandler, register_follow_up};
use crate::scheduler::{ReplicationTree, Scheduler};
use crate::services::{CatalogSet, ReplicaEntry, StorageRegistry};

/// Plans and reconciles FTS transfers for replication operations.
pub struct FtsPlanner {
    catalogs: CatalogSet,
    storage: StorageRegistry,
    scheduler: Arc<Scheduler>,
    max_attempts: u32,
}

/// Where a Scheduled file stands.
enum Progress {
    InFlight,
    Finished(Vec<FtsFile>),
    Failed(String),
}

impl FtsPlanner {
    pub fn new(
        catalogs: CatalogSet,
        storage: StorageRegistry,
        scheduler: Arc<Scheduler>,
        max_attempts: u32,
    ) -> Self {
        Self {
            catalogs,
            storage,
            scheduler,
            max_attempts,
        }
    }

    /// Process every pending file of `op`. Returns follow-up operations.
    pub async fn process(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        let follow_ups = self.reconcile(ctx, op).await;

        let waiting: Vec<String> = op
            .files
            .iter()
            .filter(|f| f.status == FileStatus::Waiting)
            .map(|f| f.lfn.clone())
            .collect();
        if waiting.is_empty() {
            return Ok(follow_ups);
        }

        let replicas = match self.lookup_replicas(&waiting).await {
            Ok(replicas) => replicas,
            Err(outcome) => {
                for lfn in &waiting {
                    if let Some(file) = op.file_mut(lfn) {
                        outcome.clone().apply(file);
                    }
                }
                return Ok(follow_ups);
            }
        };

        let explicit_sources = op.source_ses();
        let targets = op.target_ses();
        for lfn in waiting {
            let known = replicas.get(&lfn).cloned().unwrap_or_default();
            let planned: BTreeSet<String> = op
                .fts_files
                .iter()
                .filter(|f| f.lfn == lfn)
                .map(|f| f.target_se.clone())
                .collect();
            let Some(file) = op.files.iter_mut().find(|f| f.lfn == lfn) else {
                continue;
            };

            let sources: Vec<String> = if explicit_sources.is_empty() {
                known.keys().cloned().collect()
            } else {
                explicit_sources.clone()
            };
            if sources.is_empty() {
                file.mark_failed("no replica to replicate from");
                continue;
            }

            let remaining: Vec<String> = targets
                .iter()
                .filter(|t| !planned.contains(*t) && !known.contains_key(*t))
                .cloned()
                .collect();
            if remaining.is_empty() {
                if planned.is_empty() {
                    file.mark_done();
                } else {
                    file.status = FileStatus::Scheduled;
                    file.error = None;
                }
                continue;
            }

            let taken: Vec<&FtsFile> = op.fts_files.iter().filter(|f| f.lfn == lfn).collect();
            let (tree, errors) = self.plan_file(&sources, &remaining, file.size, &taken).await;
            let new_files = self.fts_files_for(ctx, op.operation_id, file, &tree);
            let covered: BTreeSet<&str> = new_files.iter().map(|f| f.target_se.as_str()).collect();
            let uncovered = remaining.iter().filter(|t| !covered.contains(t.as_str())).count();

            if uncovered == 0 {
                file.status = FileStatus::Scheduled;
                file.error = None;
                debug!(request_name = %ctx.request_name, lfn = %file.lfn, transfers = new_files.len(), "File scheduled");
            } else {
                file.attempt += 1;
                let error = errors.join("; ");
                if file.attempt >= self.max_attempts {
                    warn!(
                        request_name = %ctx.request_name,
                        lfn = %file.lfn,
                        attempts = file.attempt,
                        error = %error,
                        "Giving up scheduling file"
                    );
                    file.mark_failed(format!("{error} (giving up after {} attempts)", file.attempt));
                } else {
                    FileOutcome::Retry(error).apply(file);
                }
            }
            op.fts_files.extend(new_files);
        }

        Ok(follow_ups)
    }

    /// Settle Scheduled files whose transfers are over.
    async fn reconcile(&self, ctx: &HandlerContext, op: &mut Operation) -> Vec<Operation> {
        let mut finished: Vec<(String, Vec<FtsFile>)> = Vec::new();
        for file in op.files.iter_mut().filter(|f| f.status == FileStatus::Scheduled) {
            match progress(&op.fts_files, file) {
                Progress::InFlight => {}
                Progress::Failed(error) => file.mark_failed(error),
                Progress::Finished(transfers) => finished.push((file.lfn.clone(), transfers)),
            }
        }
        if finished.is_empty() {
            return Vec::new();
        }

        let catalogs = match self.catalogs.for_operation(op) {
            Ok(catalogs) => catalogs,
            Err(e) => {
                for (lfn, _) in &finished {
                    if let Some(file) = op.file_mut(lfn) {
                        file.mark_failed(e.to_string());
                    }
                }
                return Vec::new();
            }
        };

        // Entries grouped per target SE so that follow-ups stay single-target.
        let mut entries: BTreeMap<String, Vec<ReplicaEntry>> = BTreeMap::new();
        for (lfn, transfers) in &finished {
            let Some(file) = op.files.iter().find(|f| &f.lfn == lfn) else {
                continue;
            };
            for transfer in transfers {
                entries
                    .entry(transfer.target_se.clone())
                    .or_default()
                    .push(replica_entry(file, transfer));
            }
        }

        let mut retry: BTreeMap<String, String> = BTreeMap::new();
        let mut rejected: BTreeMap<String, String> = BTreeMap::new();
        let mut follow_ups = Vec::new();
        for (target, batch) in entries {
            let mut failed_entries = Vec::new();
            let mut failed_catalogs = Vec::new();
            for catalog in &catalogs {
                match catalog.register_replica(&batch).await {
                    Ok(results) => {
                        for entry in &batch {
                            if let Some(Err(message)) = results.get(&entry.lfn) {
                                rejected.entry(entry.lfn.clone()).or_insert_with(|| message.clone());
                                if !failed_entries.contains(entry) {
                                    failed_entries.push(entry.clone());
                                }
                                if !failed_catalogs.contains(&catalog.name().to_string()) {
                                    failed_catalogs.push(catalog.name().to_string());
                                }
                            }
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        for entry in &batch {
                            retry.entry(entry.lfn.clone()).or_insert_with(|| e.to_string());
                        }
                    }
                    Err(e) => {
                        for entry in &batch {
                            rejected.entry(entry.lfn.clone()).or_insert_with(|| e.to_string());
                        }
                    }
                }
            }
            failed_entries.retain(|e: &ReplicaEntry| e.checksum.is_some());
            follow_ups.extend(register_follow_up(&target, &failed_catalogs, &failed_entries));
        }

        for (lfn, _) in finished {
            let Some(file) = op.file_mut(&lfn) else {
                continue;
            };
            if let Some(error) = rejected.get(&lfn) {
                warn!(request_name = %ctx.request_name, lfn = %lfn, error = %error, "Replica registration failed");
                file.mark_failed(format!("replica registration failed: {error}"));
            } else if let Some(error) = retry.get(&lfn) {
                // Stays Scheduled; reconciled again on the next pass.
                file.error = Some(error.clone());
            } else {
                info!(request_name = %ctx.request_name, lfn = %lfn, "Replication completed");
                file.mark_done();
            }
        }
        follow_ups
    }

    /// Replicas per LFN from the primary catalog. Unknown LFNs map to nothing.
    async fn lookup_replicas(
        &self,
        lfns: &[String],
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, FileOutcome> {
        let catalog = self
            .catalogs
            .primary()
            .map_err(|e| FileOutcome::Failed(e.to_string()))?;
        let results = catalog.get_replicas(lfns).await.map_err(|e| {
            if e.is_retryable() {
                FileOutcome::Retry(e.to_string())
            } else {
                FileOutcome::Failed(e.to_string())
            }
        })?;
        Ok(results
            .into_iter()
            .filter_map(|(lfn, result)| result.ok().map(|replicas| (lfn, replicas)))
            .collect())
    }

    /// Plan all targets at once, falling back to one target at a time.
    async fn plan_file(
        &self,
        sources: &[String],
        targets: &[String],
        size: u64,
        taken: &[&FtsFile],
    ) -> (ReplicationTree, Vec<String>) {
        let trees = match self.scheduler.replication_tree(sources, targets, size, None).await {
            Ok(tree) => vec![tree],
            Err(e) if targets.len() == 1 => return (ReplicationTree::new(), vec![e.to_string()]),
            Err(e) => {
                debug!(error = %e, "Joint plan failed, planning targets separately");
                let mut trees = Vec::new();
                let mut errors = Vec::new();
                for target in targets {
                    match self
                        .scheduler
                        .replication_tree(sources, std::slice::from_ref(target), size, None)
                        .await
                    {
                        Ok(tree) => trees.push(tree),
                        Err(e) => errors.push(e.to_string()),
                    }
                }
                let (merged, mut conflicts) = merge_trees(taken, trees);
                errors.append(&mut conflicts);
                return (merged, errors);
            }
        };
        merge_trees(taken, trees)
    }

    fn fts_files_for(
        &self,
        ctx: &HandlerContext,
        operation_id: Option<i64>,
        file: &File,
        tree: &ReplicationTree,
    ) -> Vec<FtsFile> {
        tree.iter()
            .map(|(route, node)| FtsFile {
                request_id: ctx.request_id,
                operation_id,
                file_id: file.file_id,
                lfn: file.lfn.clone(),
                size: file.size,
                checksum: file.checksum.clone(),
                checksum_type: file.checksum_type,
                source_se: node.source_se.clone(),
                source_surl: self.surl(&node.source_se, &file.lfn),
                target_se: node.target_se.clone(),
                target_surl: self.surl(&node.target_se, &file.lfn),
                route: route.clone(),
                ancestor: node.ancestor.clone(),
                status: FtsFileStatus::Waiting,
                ..Default::default()
            })
            .collect()
    }

    fn surl(&self, se: &str, lfn: &str) -> Option<String> {
        self.storage.get(se).ok().map(|element| element.url(lfn))
    }
}

/// Fold trees into one that uses each route at most once per file.
///
/// A route already carrying the identical hop (same source, target and
/// ancestor) is shared. A tree needing a taken route for another hop is
/// dropped whole.
fn merge_trees(taken: &[&FtsFile], trees: Vec<ReplicationTree>) -> (ReplicationTree, Vec<String>) {
    let mut merged = ReplicationTree::new();
    let mut errors = Vec::new();
    'trees: for tree in trees {
        let mut fresh = Vec::new();
        for (route, node) in tree {
            let existing = taken
                .iter()
                .find(|f| f.route == route)
                .map(|f| (f.source_se.as_str(), f.target_se.as_str(), f.ancestor.as_deref()))
                .or_else(|| {
                    merged.get(&route).map(|n| {
                        (n.source_se.as_str(), n.target_se.as_str(), n.ancestor.as_deref())
                    })
                });
            match existing {
                None => fresh.push((route, node)),
                Some(hop)
                    if hop
                        == (
                            node.source_se.as_str(),
                            node.target_se.as_str(),
                            node.ancestor.as_deref(),
                        ) => {}
                Some(_) => {
                    errors.push(format!(
                        "route {route} is already used by another transfer towards {}",
                        node.target_se
                    ));
                    continue 'trees;
                }
            }
        }
        merged.extend(fresh);
    }
    (merged, errors)
}

fn progress(fts_files: &[FtsFile], file: &File) -> Progress {
    let transfers: Vec<&FtsFile> = fts_files.iter().filter(|f| f.lfn == file.lfn).collect();
    if transfers.is_empty() {
        return Progress::Failed("scheduled file has no FTS transfers".to_string());
    }
    if let Some(failed) = transfers
        .iter()
        .find(|f| matches!(f.status, FtsFileStatus::Failed | FtsFileStatus::Canceled))
    {
        let reason = failed.error.as_deref().unwrap_or("no reason given");
        return Progress::Failed(format!(
            "transfer to {} {}: {reason}",
            failed.target_se,
            failed.status.as_ref().to_ascii_lowercase()
        ));
    }
    if transfers.iter().all(|f| f.status == FtsFileStatus::Finished) {
        return Progress::Finished(transfers.into_iter().cloned().collect());
    }
    Progress::InFlight
}

fn replica_entry(file: &File, transfer: &FtsFile) -> ReplicaEntry {
    ReplicaEntry {
        lfn: file.lfn.clone(),
        pfn: transfer.target_surl.clone().unwrap_or_default(),
        se: transfer.target_se.clone(),
        size: file.size,
        checksum: file.checksum.clone(),
        checksum_type: file.checksum_type,
        guid: file.guid.clone(),
    }
}

/// Handler for explicit `ftsSchedule` operations.
pub struct FtsScheduleHandler {
    planner: Arc<FtsPlanner>,
}

impl FtsScheduleHandler {
    pub fn new(planner: Arc<FtsPlanner>) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl OperationHandler for FtsScheduleHandler {
    fn op_type(&self) -> &'static str {
        types::FTS_SCHEDULE
    }

    async fn execute(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        self.planner.process(ctx, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{Fixture, ctx, fixture};

    async fn seeded() -> Fixture {
        let fx = fixture();
        fx.cern.insert("/vo/a", vec![0u8; 100]).await;
        fx.catalog
            .add_file(ReplicaEntry {
                lfn: "/vo/a".into(),
                pfn: "mem://CERN-DISK/vo/a".into(),
                se: "CERN-DISK".into(),
                size: 100,
                checksum: Some("abc".into()),
                guid: Some("6f1a3c2e-0b7d-4d0e-9b1c-2b8f6b1f7e2a".into()),
                ..Default::default()
            })
            .await;
        fx
    }

    fn planner(fx: &Fixture, max_attempts: u32) -> FtsPlanner {
        FtsPlanner::new(
            fx.services.catalogs.clone(),
            fx.services.storage.clone(),
            fx.services.scheduler.clone(),
            max_attempts,
        )
    }

    fn replicate(targets: &str) -> Operation {
        Operation::new(types::REPLICATE_AND_REGISTER)
            .with_target_se(targets)
            .with_file(File::new("/vo/a").with_size(100))
    }

    #[tokio::test]
    async fn test_schedules_reachable_target() {
        let fx = seeded().await;
        let planner = planner(&fx, 10);
        let mut op = replicate("RAL-DISK");

        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Scheduled);
        assert_eq!(op.fts_files.len(), 1);
        let fts = &op.fts_files[0];
        assert_eq!(fts.source_se, "CERN-DISK");
        assert_eq!(fts.target_se, "RAL-DISK");
        assert_eq!(fts.route, "CERN#RAL");
        assert_eq!(fts.target_surl.as_deref(), Some("mem://RAL-DISK/vo/a"));
        assert_eq!(fts.status, FtsFileStatus::Waiting);
    }

    #[tokio::test]
    async fn test_partial_plan_keeps_file_waiting() {
        let fx = seeded().await;
        let planner = planner(&fx, 10);
        let mut op = replicate("RAL-DISK,PIC-DISK");

        planner.process(&ctx(), &mut op).await.unwrap();
        let file = &op.files[0];
        assert_eq!(file.status, FileStatus::Waiting);
        assert_eq!(file.attempt, 1);
        assert!(file.error.as_deref().unwrap().contains("PIC-DISK"));
        assert_eq!(op.fts_files.len(), 1);
        assert_eq!(op.fts_files[0].target_se, "RAL-DISK");

        // The second pass only retries the missing target.
        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.fts_files.len(), 1);
        assert_eq!(op.files[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let fx = seeded().await;
        let planner = planner(&fx, 1);
        let mut op = replicate("PIC-DISK");
        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Failed);
        assert!(op.files[0].error.as_deref().unwrap().contains("giving up"));
    }

    #[tokio::test]
    async fn test_existing_replica_is_done() {
        let fx = seeded().await;
        let planner = planner(&fx, 10);
        let mut op = replicate("CERN-DISK");
        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Done);
        assert!(op.fts_files.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_lfn_fails() {
        let fx = fixture();
        let planner = planner(&fx, 10);
        let mut op = replicate("RAL-DISK");
        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Failed);
    }

    #[tokio::test]
    async fn test_finished_transfer_registers_replica() {
        let fx = seeded().await;
        let planner = planner(&fx, 10);
        let mut op = replicate("RAL-DISK");
        planner.process(&ctx(), &mut op).await.unwrap();

        op.fts_files[0].status = FtsFileStatus::Active;
        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Scheduled);

        op.fts_files[0].status = FtsFileStatus::Finished;
        let follow_ups = planner.process(&ctx(), &mut op).await.unwrap();
        assert!(follow_ups.is_empty());
        assert_eq!(op.files[0].status, FileStatus::Done);
        assert_eq!(
            fx.catalog.replica_ses("/vo/a").await,
            vec!["CERN-DISK".to_string(), "RAL-DISK".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_transfer_fails_file() {
        let fx = seeded().await;
        let planner = planner(&fx, 10);
        let mut op = replicate("RAL-DISK");
        planner.process(&ctx(), &mut op).await.unwrap();

        op.fts_files[0].status = FtsFileStatus::Failed;
        op.fts_files[0].error = Some("source file does not exist".into());
        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Failed);
        assert!(op.files[0].error.as_deref().unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_unavailable_catalog_keeps_file_scheduled() {
        let fx = seeded().await;
        let planner = planner(&fx, 10);
        let mut op = replicate("RAL-DISK");
        planner.process(&ctx(), &mut op).await.unwrap();

        op.fts_files[0].status = FtsFileStatus::Finished;
        fx.catalog.set_unavailable(true);
        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Scheduled);
        assert!(op.files[0].error.is_some());

        fx.catalog.set_unavailable(false);
        planner.process(&ctx(), &mut op).await.unwrap();
        assert_eq!(op.files[0].status, FileStatus::Done);
    }

    fn hop(source: &str, target: &str, ancestor: Option<&str>) -> crate::scheduler::TreeNode {
        crate::scheduler::TreeNode {
            ancestor: ancestor.map(str::to_string),
            source_se: source.into(),
            target_se: target.into(),
            strategy: crate::scheduler::Strategy::Simple,
        }
    }

    #[test]
    fn test_merge_shares_identical_hops() {
        let to_ral = ReplicationTree::from([(
            "CERN#RAL".to_string(),
            hop("CERN-DISK", "RAL-DISK", None),
        )]);
        let via_ral = ReplicationTree::from([
            ("CERN#RAL".to_string(), hop("CERN-DISK", "RAL-DISK", None)),
            ("RAL#PIC".to_string(), hop("RAL-DISK", "PIC-DISK", Some("CERN#RAL"))),
        ]);

        let (merged, errors) = merge_trees(&[], vec![to_ral, via_ral]);
        assert!(errors.is_empty());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["CERN#RAL"].target_se, "RAL-DISK");
        assert_eq!(merged["RAL#PIC"].ancestor.as_deref(), Some("CERN#RAL"));
    }

    #[test]
    fn test_merge_drops_tree_reusing_a_route() {
        let disk = ReplicationTree::from([(
            "CERN#RAL".to_string(),
            hop("CERN-DISK", "RAL-DISK", None),
        )]);
        let tape = ReplicationTree::from([(
            "CERN#RAL".to_string(),
            hop("CERN-DISK", "RAL-TAPE", None),
        )]);

        let (merged, errors) = merge_trees(&[], vec![disk, tape.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["CERN#RAL"].target_se, "RAL-DISK");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("RAL-TAPE"));

        // Routes planned on an earlier pass count as taken too.
        let earlier = FtsFile {
            lfn: "/vo/a".into(),
            source_se: "CERN-DISK".into(),
            target_se: "RAL-DISK".into(),
            route: "CERN#RAL".into(),
            ..Default::default()
        };
        let (merged, errors) = merge_trees(&[&earlier], vec![tape]);
        assert!(merged.is_empty());
        assert_eq!(errors.len(), 1);
    }
}
