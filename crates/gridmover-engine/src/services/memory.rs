// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process storage element and catalog.
//!
//! Useful for tests and for running the engine without external services.
//! Both support failure injection.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use gridmover_core::{ChecksumType, SeAccess};
use tokio::sync::Mutex;

use super::catalog::{Catalog, CatalogError, CatalogResult, FileMetadata, PerLfn, ReplicaEntry};
use super::storage::{StorageElement, StorageError, StorageResult, StoredFile};
use crate::checksum;

/// Decrement an injection counter; true if a failure should be injected.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Storage element holding file contents in memory.
#[derive(Debug, Clone)]
pub struct InMemoryStorageElement {
    name: String,
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    access: Arc<Mutex<SeAccess>>,
    fail_puts: Arc<AtomicU32>,
    /// If true, stored files report an Adler32 checksum.
    pub report_checksums: bool,
}

impl InMemoryStorageElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Arc::new(Mutex::new(BTreeMap::new())),
            access: Arc::new(Mutex::new(SeAccess::default())),
            fail_puts: Arc::new(AtomicU32::new(0)),
            report_checksums: false,
        }
    }

    /// Create an element that reports Adler32 checksums.
    pub fn with_checksums(name: impl Into<String>) -> Self {
        Self {
            report_checksums: true,
            ..Self::new(name)
        }
    }

    /// Store contents directly.
    pub async fn insert(&self, lfn: &str, data: impl Into<Vec<u8>>) {
        self.files.lock().await.insert(lfn.to_string(), data.into());
    }

    pub async fn contains(&self, lfn: &str) -> bool {
        self.files.lock().await.contains_key(lfn)
    }

    pub async fn contents(&self, lfn: &str) -> Option<Vec<u8>> {
        self.files.lock().await.get(lfn).cloned()
    }

    /// Make the next `n` puts fail as unavailable.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    pub async fn set_access(&self, access: SeAccess) {
        *self.access.lock().await = access;
    }

    fn describe(&self, data: &[u8]) -> StoredFile {
        StoredFile {
            size: data.len() as u64,
            checksum: if self.report_checksums {
                checksum::compute(data, ChecksumType::Adler32)
            } else {
                None
            },
            checksum_type: ChecksumType::Adler32,
        }
    }
}

#[async_trait]
impl StorageElement for InMemoryStorageElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, lfn: &str) -> String {
        format!("mem://{}{}", self.name, lfn)
    }

    async fn get(&self, lfn: &str, dest: &Path) -> StorageResult<StoredFile> {
        let data = self
            .contents(lfn)
            .await
            .ok_or_else(|| StorageError::NoSuchFile(lfn.to_string()))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &data).await?;
        Ok(self.describe(&data))
    }

    async fn put(&self, lfn: &str, source: &Path) -> StorageResult<StoredFile> {
        if take_failure(&self.fail_puts) {
            return Err(StorageError::Unavailable {
                se: self.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        if !self.access.lock().await.write {
            return Err(StorageError::PermissionDenied(format!(
                "{} is not writable",
                self.name
            )));
        }
        let data = tokio::fs::read(source).await?;
        let stored = self.describe(&data);
        self.insert(lfn, data).await;
        Ok(stored)
    }

    async fn delete(&self, lfn: &str) -> StorageResult<()> {
        self.files
            .lock()
            .await
            .remove(lfn)
            .map(|_| ())
            .ok_or_else(|| StorageError::NoSuchFile(lfn.to_string()))
    }

    async fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let files = self.files.lock().await;
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|lfn| lfn.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        names.dedup();
        Ok(names)
    }

    async fn stat(&self, lfn: &str) -> StorageResult<StoredFile> {
        let files = self.files.lock().await;
        files
            .get(lfn)
            .map(|data| self.describe(data))
            .ok_or_else(|| StorageError::NoSuchFile(lfn.to_string()))
    }

    async fn get_turl(&self, lfn: &str, _protocol: &str) -> StorageResult<String> {
        self.stat(lfn).await?;
        Ok(self.url(lfn))
    }

    async fn access(&self) -> StorageResult<SeAccess> {
        Ok(*self.access.lock().await)
    }
}

#[derive(Debug, Clone, Default)]
struct CatalogRecord {
    metadata: FileMetadata,
    /// SE name to (PFN, status).
    replicas: BTreeMap<String, (String, String)>,
}

/// Catalog kept in memory.
#[derive(Debug, Clone)]
pub struct InMemoryCatalog {
    name: String,
    records: Arc<Mutex<BTreeMap<String, CatalogRecord>>>,
    fail_registrations: Arc<AtomicU32>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCatalog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(Mutex::new(BTreeMap::new())),
            fail_registrations: Arc::new(AtomicU32::new(0)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reject the next `n` LFN registrations.
    pub fn fail_next_registrations(&self, n: u32) {
        self.fail_registrations.store(n, Ordering::SeqCst);
    }

    /// Make every call fail as unavailable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Seed an LFN with one replica.
    pub async fn add_file(&self, entry: ReplicaEntry) {
        let mut records = self.records.lock().await;
        insert_replica(&mut records, &entry);
    }

    pub async fn contains(&self, lfn: &str) -> bool {
        self.records.lock().await.contains_key(lfn)
    }

    /// SEs holding a replica of `lfn`.
    pub async fn replica_ses(&self, lfn: &str) -> Vec<String> {
        self.records
            .lock()
            .await
            .get(lfn)
            .map(|r| r.replicas.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn replica_status(&self, lfn: &str, se: &str) -> Option<String> {
        self.records
            .lock()
            .await
            .get(lfn)
            .and_then(|r| r.replicas.get(se))
            .map(|(_, status)| status.clone())
    }

    fn check_available(&self) -> CatalogResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable {
                catalog: self.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

fn insert_replica(records: &mut BTreeMap<String, CatalogRecord>, entry: &ReplicaEntry) {
    let record = records.entry(entry.lfn.clone()).or_default();
    if record.replicas.is_empty() {
        record.metadata = FileMetadata {
            size: entry.size,
            checksum: entry.checksum.clone(),
            checksum_type: entry.checksum_type,
            guid: entry.guid.clone(),
        };
    }
    record
        .replicas
        .insert(entry.se.clone(), (entry.pfn.clone(), "AprioriGood".to_string()));
}

const NO_SUCH_FILE: &str = "No such file or directory";

#[async_trait]
impl Catalog for InMemoryCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn register_file(&self, entries: &[ReplicaEntry]) -> CatalogResult<PerLfn<()>> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let mut out = PerLfn::new();
        for entry in entries {
            let result = if take_failure(&self.fail_registrations) {
                Err("registration rejected (injected failure)".to_string())
            } else if let Some(existing) = records.get(&entry.lfn)
                && existing.metadata.guid.is_some()
                && entry.guid.is_some()
                && existing.metadata.guid != entry.guid
            {
                Err("LFN already registered with another GUID".to_string())
            } else {
                insert_replica(&mut records, entry);
                Ok(())
            };
            out.insert(entry.lfn.clone(), result);
        }
        Ok(out)
    }

    async fn register_replica(&self, entries: &[ReplicaEntry]) -> CatalogResult<PerLfn<()>> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        let mut out = PerLfn::new();
        for entry in entries {
            let result = if take_failure(&self.fail_registrations) {
                Err("registration rejected (injected failure)".to_string())
            } else if !records.contains_key(&entry.lfn) {
                Err(NO_SUCH_FILE.to_string())
            } else {
                insert_replica(&mut records, entry);
                Ok(())
            };
            out.insert(entry.lfn.clone(), result);
        }
        Ok(out)
    }

    async fn remove_file(&self, lfns: &[String]) -> CatalogResult<PerLfn<()>> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        Ok(lfns
            .iter()
            .map(|lfn| {
                let result = records
                    .remove(lfn)
                    .map(|_| ())
                    .ok_or_else(|| NO_SUCH_FILE.to_string());
                (lfn.clone(), result)
            })
            .collect())
    }

    async fn remove_replica(&self, se: &str, lfns: &[String]) -> CatalogResult<PerLfn<()>> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        Ok(lfns
            .iter()
            .map(|lfn| {
                let result = match records.get_mut(lfn) {
                    None => Err(NO_SUCH_FILE.to_string()),
                    Some(record) => record
                        .replicas
                        .remove(se)
                        .map(|_| ())
                        .ok_or_else(|| format!("No such replica at {se}")),
                };
                (lfn.clone(), result)
            })
            .collect())
    }

    async fn set_replica_status(
        &self,
        se: &str,
        lfns: &[String],
        status: &str,
    ) -> CatalogResult<PerLfn<()>> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        Ok(lfns
            .iter()
            .map(|lfn| {
                let result = match records.get_mut(lfn).and_then(|r| r.replicas.get_mut(se)) {
                    Some((_, current)) => {
                        *current = status.to_string();
                        Ok(())
                    }
                    None => Err(format!("No such replica at {se}")),
                };
                (lfn.clone(), result)
            })
            .collect())
    }

    async fn exists(&self, lfns: &[String]) -> CatalogResult<PerLfn<bool>> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(lfns
            .iter()
            .map(|lfn| (lfn.clone(), Ok(records.contains_key(lfn))))
            .collect())
    }

    async fn get_file_metadata(&self, lfns: &[String]) -> CatalogResult<PerLfn<FileMetadata>> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(lfns
            .iter()
            .map(|lfn| {
                let result = records
                    .get(lfn)
                    .map(|r| r.metadata.clone())
                    .ok_or_else(|| NO_SUCH_FILE.to_string());
                (lfn.clone(), result)
            })
            .collect())
    }

    async fn get_replicas(
        &self,
        lfns: &[String],
    ) -> CatalogResult<PerLfn<BTreeMap<String, String>>> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(lfns
            .iter()
            .map(|lfn| {
                let result = records
                    .get(lfn)
                    .map(|r| {
                        r.replicas
                            .iter()
                            .map(|(se, (pfn, _))| (se.clone(), pfn.clone()))
                            .collect()
                    })
                    .ok_or_else(|| NO_SUCH_FILE.to_string());
                (lfn.clone(), result)
            })
            .collect())
    }
}
