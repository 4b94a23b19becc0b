// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! File catalog seam.
//!
//! Every verb is bulk and answers with a per-LFN map: a catalog call can fail
//! as a whole ([`CatalogError`]) or succeed with some LFNs rejected.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use gridmover_core::{ChecksumType, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whole-call catalog failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// The catalog could not be reached; retry later.
    #[error("Catalog {catalog} unavailable: {reason}")]
    Unavailable { catalog: String, reason: String },

    /// The operation names a catalog this engine does not know.
    #[error("Unknown catalog: {0}")]
    UnknownCatalog(String),

    #[error("Catalog protocol error: {0}")]
    Protocol(String),
}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Per-LFN outcome of a bulk call: the value, or the rejection message.
pub type PerLfn<T> = BTreeMap<String, std::result::Result<T, String>>;

/// Whether a per-LFN rejection means the entry was already gone.
pub fn is_no_such_file(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no such file") || lower.contains("no such replica")
}

/// One replica to register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaEntry {
    pub lfn: String,
    /// Physical (storage) URL of the replica.
    pub pfn: String,
    pub se: String,
    pub size: u64,
    pub checksum: Option<String>,
    pub checksum_type: ChecksumType,
    pub guid: Option<String>,
}

/// Catalog view of one LFN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub checksum: Option<String>,
    pub checksum_type: ChecksumType,
    pub guid: Option<String>,
}

/// One file catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    fn name(&self) -> &str;

    /// Register new LFNs together with their first replica.
    async fn register_file(&self, entries: &[ReplicaEntry]) -> CatalogResult<PerLfn<()>>;

    /// Add replicas of existing LFNs.
    async fn register_replica(&self, entries: &[ReplicaEntry]) -> CatalogResult<PerLfn<()>>;

    /// Remove LFNs with all their replicas.
    async fn remove_file(&self, lfns: &[String]) -> CatalogResult<PerLfn<()>>;

    /// Remove the replicas held at `se`.
    async fn remove_replica(&self, se: &str, lfns: &[String]) -> CatalogResult<PerLfn<()>>;

    async fn set_replica_status(
        &self,
        se: &str,
        lfns: &[String],
        status: &str,
    ) -> CatalogResult<PerLfn<()>>;

    async fn exists(&self, lfns: &[String]) -> CatalogResult<PerLfn<bool>>;

    async fn get_file_metadata(&self, lfns: &[String]) -> CatalogResult<PerLfn<FileMetadata>>;

    /// Replica PFNs keyed by storage element.
    async fn get_replicas(
        &self,
        lfns: &[String],
    ) -> CatalogResult<PerLfn<BTreeMap<String, String>>>;
}

/// The catalogs configured for this engine.
#[derive(Clone, Default)]
pub struct CatalogSet {
    catalogs: BTreeMap<String, Arc<dyn Catalog>>,
}

impl CatalogSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalogs.insert(catalog.name().to_string(), catalog);
        self
    }

    pub fn get(&self, name: &str) -> CatalogResult<Arc<dyn Catalog>> {
        self.catalogs
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownCatalog(name.to_string()))
    }

    /// Catalogs an operation writes to: the ones it names, or all of them.
    pub fn for_operation(&self, op: &Operation) -> CatalogResult<Vec<Arc<dyn Catalog>>> {
        let names = op.catalogs();
        if names.is_empty() {
            return Ok(self.catalogs.values().cloned().collect());
        }
        names.iter().map(|name| self.get(name)).collect()
    }

    /// The catalog consulted for lookups.
    pub fn primary(&self) -> CatalogResult<Arc<dyn Catalog>> {
        self.catalogs
            .values()
            .next()
            .cloned()
            .ok_or_else(|| CatalogError::UnknownCatalog("<none configured>".to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }
}
