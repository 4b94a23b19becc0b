// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage element driver seam.
//!
//! Handlers treat a storage element as opaque: every call either succeeds,
//! possibly returning a size and checksum, or fails with a [`StorageError`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gridmover_core::{ChecksumType, SeAccess};
use thiserror::Error;

/// Storage element failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The file does not exist at this endpoint.
    #[error("No such file: {0}")]
    NoSuchFile(String),

    /// The endpoint is temporarily unreachable or overloaded.
    #[error("Storage element {se} unavailable: {reason}")]
    Unavailable { se: String, reason: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No driver is configured for this endpoint.
    #[error("Unknown storage element: {0}")]
    UnknownSe(String),

    #[error("Storage I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Whether the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Io(_))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::NoSuchFile(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NoSuchFile(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// What a storage element reports about a stored file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredFile {
    pub size: u64,
    /// Present only when the endpoint computes checksums.
    pub checksum: Option<String>,
    pub checksum_type: ChecksumType,
}

/// Driver for one storage element.
#[async_trait]
pub trait StorageElement: Send + Sync {
    /// Storage element name.
    fn name(&self) -> &str;

    /// Storage URL of an LFN at this endpoint.
    fn url(&self, lfn: &str) -> String;

    /// Download `lfn` into the local file `dest`.
    async fn get(&self, lfn: &str, dest: &Path) -> StorageResult<StoredFile>;

    /// Upload the local file `source` as `lfn`.
    async fn put(&self, lfn: &str, source: &Path) -> StorageResult<StoredFile>;

    async fn delete(&self, lfn: &str) -> StorageResult<()>;

    /// Names directly under a directory LFN.
    async fn list(&self, dir: &str) -> StorageResult<Vec<String>>;

    async fn stat(&self, lfn: &str) -> StorageResult<StoredFile>;

    /// Transport URL for `protocol`.
    async fn get_turl(&self, lfn: &str, protocol: &str) -> StorageResult<String>;

    /// Bring a file online. Disk endpoints succeed immediately.
    async fn prestage(&self, lfn: &str) -> StorageResult<()> {
        self.stat(lfn).await.map(|_| ())
    }

    async fn pin(&self, lfn: &str, _lifetime: Duration) -> StorageResult<()> {
        self.stat(lfn).await.map(|_| ())
    }

    async fn release(&self, _lfn: &str) -> StorageResult<()> {
        Ok(())
    }

    /// Current read/write enablement.
    async fn access(&self) -> StorageResult<SeAccess> {
        Ok(SeAccess::default())
    }
}

/// Storage element drivers keyed by name.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    elements: BTreeMap<String, Arc<dyn StorageElement>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StorageRegistry::register`].
    pub fn with(mut self, element: Arc<dyn StorageElement>) -> Self {
        self.register(element);
        self
    }

    pub fn register(&mut self, element: Arc<dyn StorageElement>) {
        self.elements.insert(element.name().to_string(), element);
    }

    pub fn get(&self, name: &str) -> StorageResult<Arc<dyn StorageElement>> {
        self.elements
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownSe(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
