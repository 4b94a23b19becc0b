// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `replicateAndRegister`: create new replicas and register them.
//!
//! Replication goes through FTS when `replicate_via_fts` is set. Otherwise the
//! handler copies each file itself through the scratch directory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use gridmover_core::model::types;
use gridmover_core::{File, FileStatus, Operation};
use tracing::{debug, warn};

use super::fts_schedule::FtsPlanner;
use super::{
    FileOutcome, HandlerConfig, HandlerContext, HandlerError, OperationHandler, apply_to_waiting,
    register_follow_up,
};
use crate::checksum;
use crate::services::{CatalogSet, ReplicaEntry, StorageRegistry};

pub struct ReplicateAndRegisterHandler {
    catalogs: CatalogSet,
    storage: StorageRegistry,
    planner: Arc<FtsPlanner>,
    config: HandlerConfig,
}

impl ReplicateAndRegisterHandler {
    pub fn new(
        catalogs: CatalogSet,
        storage: StorageRegistry,
        planner: Arc<FtsPlanner>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            catalogs,
            storage,
            planner,
            config,
        }
    }

    async fn copy_directly(
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

        let lfns: Vec<String> = op
            .files
            .iter()
            .filter(|f| f.status == FileStatus::Waiting)
            .map(|f| f.lfn.clone())
            .collect();
        let replicas = match self.catalogs.primary() {
            Ok(primary) => match primary.get_replicas(&lfns).await {
                Ok(replicas) => replicas,
                Err(e) if e.is_retryable() => {
                    apply_to_waiting(op, FileOutcome::Retry(e.to_string()));
                    return Ok(Vec::new());
                }
                Err(e) => {
                    apply_to_waiting(op, FileOutcome::Failed(e.to_string()));
                    return Ok(Vec::new());
                }
            },
            Err(e) => {
                apply_to_waiting(op, FileOutcome::Failed(e.to_string()));
                return Ok(Vec::new());
            }
        };

        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        let explicit_sources = op.source_ses();

        // New replicas per target SE, registered in one bulk call each.
        let mut created: BTreeMap<String, Vec<ReplicaEntry>> = BTreeMap::new();
        let mut copied = BTreeSet::new();
        for file in op.files.iter_mut().filter(|f| f.status == FileStatus::Waiting) {
            let known = match replicas.get(&file.lfn) {
                Some(Ok(known)) => known.clone(),
                Some(Err(message)) => {
                    file.mark_failed(message.clone());
                    continue;
                }
                None => BTreeMap::new(),
            };
            let sources: Vec<String> = if explicit_sources.is_empty() {
                known.keys().cloned().collect()
            } else {
                explicit_sources.clone()
            };

            match self.copy_file(ctx, file, &sources, &targets, &known).await {
                Ok(entries) => {
                    copied.insert(file.lfn.clone());
                    for entry in entries {
                        created.entry(entry.se.clone()).or_default().push(entry);
                    }
                }
                Err(outcome) => outcome.apply(file),
            }
        }

        let mut follow_ups = Vec::new();
        let mut rejected: BTreeMap<String, String> = BTreeMap::new();
        for (target, entries) in created {
            let mut failed = Vec::new();
            let mut failed_catalogs = Vec::new();
            for catalog in &catalogs {
                let results = match catalog.register_replica(&entries).await {
                    Ok(results) => results,
                    Err(e) => entries
                        .iter()
                        .map(|entry| (entry.lfn.clone(), Err(e.to_string())))
                        .collect(),
                };
                for entry in &entries {
                    if let Some(Err(message)) = results.get(&entry.lfn) {
                        rejected.entry(entry.lfn.clone()).or_insert_with(|| message.clone());
                        if !failed.contains(entry) {
                            failed.push(entry.clone());
                        }
                        if !failed_catalogs.iter().any(|n: &String| n == catalog.name()) {
                            failed_catalogs.push(catalog.name().to_string());
                        }
                    }
                }
            }
            failed.retain(|entry| entry.checksum.is_some());
            follow_ups.extend(register_follow_up(&target, &failed_catalogs, &failed));
        }

        for file in op.files.iter_mut().filter(|f| copied.contains(&f.lfn)) {
            match rejected.get(&file.lfn) {
                Some(error) => {
                    warn!(request_name = %ctx.request_name, lfn = %file.lfn, error = %error, "Replica registration failed");
                    file.mark_failed(format!("replica registration failed: {error}"));
                }
                None => file.mark_done(),
            }
        }
        Ok(follow_ups)
    }

    /// Copy one file to every target it is missing from.
    async fn copy_file(
        &self,
        ctx: &HandlerContext,
        file: &mut File,
        sources: &[String],
        targets: &[String],
        known: &BTreeMap<String, String>,
    ) -> Result<Vec<ReplicaEntry>, FileOutcome> {
        let missing: Vec<&String> = targets.iter().filter(|t| !known.contains_key(*t)).collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        if sources.is_empty() {
            return Err(FileOutcome::Failed("no replica to replicate from".to_string()));
        }

        let scratch = self.scratch_path();
        let result = self.copy_via(ctx, file, sources, &missing, &scratch).await;
        if let Err(e) = tokio::fs::remove_file(&scratch).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %scratch.display(), error = %e, "Failed to remove scratch file");
        }
        result
    }

    async fn copy_via(
        &self,
        ctx: &HandlerContext,
        file: &mut File,
        sources: &[String],
        missing: &[&String],
        scratch: &Path,
    ) -> Result<Vec<ReplicaEntry>, FileOutcome> {
        let mut last_error = String::new();
        let mut downloaded = None;
        for source in sources {
            let Ok(element) = self.storage.get(source) else {
                last_error = format!("unknown source SE {source}");
                continue;
            };
            match element.get(&file.lfn, scratch).await {
                Ok(stored) => {
                    downloaded = Some(stored);
                    break;
                }
                Err(e) => last_error = e.to_string(),
            }
        }
        let Some(downloaded) = downloaded else {
            return Err(FileOutcome::Retry(format!("download failed: {last_error}")));
        };

        if file.size == 0 {
            file.size = downloaded.size;
        }
        if file.checksum.is_none() {
            let (_, sum) = checksum::compute_file(scratch, file.checksum_type)
                .await
                .map_err(|e| FileOutcome::Retry(e.to_string()))?;
            file.checksum = sum;
        }

        let mut entries = Vec::new();
        for target in missing {
            let element = self
                .storage
                .get(target)
                .map_err(|e| FileOutcome::Failed(e.to_string()))?;
            match element.put(&file.lfn, scratch).await {
                Ok(stored) => {
                    if stored.size != file.size {
                        return Err(FileOutcome::Failed(format!(
                            "size mismatch at {target}: expected {}, stored {}",
                            file.size, stored.size
                        )));
                    }
                    debug!(request_name = %ctx.request_name, lfn = %file.lfn, target = %target, "Replica copied");
                    entries.push(ReplicaEntry {
                        lfn: file.lfn.clone(),
                        pfn: element.url(&file.lfn),
                        se: target.to_string(),
                        size: file.size,
                        checksum: file.checksum.clone(),
                        checksum_type: file.checksum_type,
                        guid: file.guid.clone(),
                    });
                }
                Err(e) if e.is_retryable() => return Err(FileOutcome::Retry(e.to_string())),
                Err(e) => return Err(FileOutcome::Failed(format!("put to {target} failed: {e}"))),
            }
        }
        Ok(entries)
    }

    fn scratch_path(&self) -> PathBuf {
        self.config
            .scratch_dir
            .join(format!("replica-{}", uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl OperationHandler for ReplicateAndRegisterHandler {
    fn op_type(&self) -> &'static str {
        types::REPLICATE_AND_REGISTER
    }

    async fn execute(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        if self.config.replicate_via_fts {
            self.planner.process(ctx, op).await
        } else {
            self.copy_directly(ctx, op).await
        }
    }
}
