// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem-backed storage element.
//!
//! Each LFN maps to `root/<lfn without leading slash>`. Uploads are written to
//! a temporary sibling and renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gridmover_core::ChecksumType;
use tracing::debug;

use super::storage::{StorageElement, StorageError, StorageResult, StoredFile};
use crate::checksum;

/// Storage element rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorageElement {
    name: String,
    root: PathBuf,
    checksum_type: ChecksumType,
}

impl LocalStorageElement {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            checksum_type: ChecksumType::Adler32,
        }
    }

    /// Algorithm used for the checksums this element reports.
    pub fn with_checksum_type(mut self, kind: ChecksumType) -> Self {
        self.checksum_type = kind;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, lfn: &str) -> StorageResult<PathBuf> {
        let relative = lfn.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|part| part == "..") {
            return Err(StorageError::PermissionDenied(format!(
                "'{lfn}' is outside the storage root"
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn describe(&self, path: &Path) -> StorageResult<StoredFile> {
        let (size, checksum) = checksum::compute_file(path, self.checksum_type).await?;
        Ok(StoredFile {
            size,
            checksum,
            checksum_type: self.checksum_type,
        })
    }
}

#[async_trait]
impl StorageElement for LocalStorageElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, lfn: &str) -> String {
        format!("file://{}{}", self.root.display(), normalise(lfn))
    }

    async fn get(&self, lfn: &str, dest: &Path) -> StorageResult<StoredFile> {
        let path = self.path_of(lfn)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&path, dest).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NoSuchFile(lfn.to_string()),
            _ => e.into(),
        })?;
        self.describe(dest).await
    }

    async fn put(&self, lfn: &str, source: &Path) -> StorageResult<StoredFile> {
        let path = self.path_of(lfn)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = path.with_extension(format!("part-{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::copy(source, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        tokio::fs::rename(&partial, &path).await?;
        debug!(se = %self.name, lfn = %lfn, "File stored");
        self.describe(&path).await
    }

    async fn delete(&self, lfn: &str) -> StorageResult<()> {
        let path = self.path_of(lfn)?;
        tokio::fs::remove_file(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NoSuchFile(lfn.to_string()),
            _ => e.into(),
        })
    }

    async fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        let path = self.path_of(dir)?;
        let mut entries = tokio::fs::read_dir(&path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn stat(&self, lfn: &str) -> StorageResult<StoredFile> {
        let path = self.path_of(lfn)?;
        self.describe(&path).await.map_err(|e| match e {
            StorageError::NoSuchFile(_) => StorageError::NoSuchFile(lfn.to_string()),
            other => other,
        })
    }

    async fn get_turl(&self, lfn: &str, protocol: &str) -> StorageResult<String> {
        if protocol != "file" {
            return Err(StorageError::Unavailable {
                se: self.name.clone(),
                reason: format!("protocol '{protocol}' not supported"),
            });
        }
        let path = self.path_of(lfn)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::NoSuchFile(lfn.to_string()));
        }
        Ok(self.url(lfn))
    }

    async fn access(&self) -> StorageResult<gridmover_core::SeAccess> {
        let readable = tokio::fs::try_exists(&self.root).await.unwrap_or(false);
        let writable = match tokio::fs::metadata(&self.root).await {
            Ok(meta) => !meta.permissions().readonly(),
            Err(_) => false,
        };
        Ok(gridmover_core::SeAccess {
            read: readable,
            write: writable,
        })
    }
}

fn normalise(lfn: &str) -> String {
    if lfn.starts_with('/') {
        lfn.to_string()
    } else {
        format!("/{lfn}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, LocalStorageElement, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let se = LocalStorageElement::new("CERN-DISK", dir.path().join("se"));
        let local = dir.path().join("upload.dat");
        tokio::fs::write(&local, b"Wikipedia").await.unwrap();
        (dir, se, local)
    }

    #[tokio::test]
    async fn test_put_reports_size_and_checksum() {
        let (_dir, se, local) = setup().await;
        let stored = se.put("/vo/data/file.dat", &local).await.unwrap();
        assert_eq!(stored.size, 9);
        assert_eq!(stored.checksum.as_deref(), Some("11e60398"));

        let stat = se.stat("/vo/data/file.dat").await.unwrap();
        assert_eq!(stat, stored);
        assert_eq!(se.list("/vo/data").await.unwrap(), vec!["file.dat".to_string()]);
    }

    #[tokio::test]
    async fn test_get_and_delete() {
        let (dir, se, local) = setup().await;
        se.put("/vo/f", &local).await.unwrap();

        let copy = dir.path().join("download").join("f");
        let stored = se.get("/vo/f", &copy).await.unwrap();
        assert_eq!(stored.size, 9);
        assert_eq!(tokio::fs::read(&copy).await.unwrap(), b"Wikipedia");

        se.delete("/vo/f").await.unwrap();
        let err = se.delete("/vo/f").await.unwrap_err();
        assert!(err.is_missing());
        assert!(se.stat("/vo/f").await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_paths_stay_under_root() {
        let (_dir, se, local) = setup().await;
        let err = se.put("/vo/../../etc/passwd", &local).await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_turl_and_access() {
        let (_dir, se, local) = setup().await;
        se.put("/vo/t", &local).await.unwrap();
        let turl = se.get_turl("/vo/t", "file").await.unwrap();
        assert!(turl.starts_with("file://"));
        assert!(turl.ends_with("/vo/t"));
        assert!(se.get_turl("/vo/t", "gsiftp").await.is_err());
        assert!(se.prestage("/vo/t").await.is_ok());
        assert!(se.access().await.unwrap().read);
    }
}
