// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation files.

use serde::{Deserialize, Serialize};

use super::status::{ChecksumType, FileStatus};

/// A logical file attached to one operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct File {
    /// Store-assigned ID, `None` until the first successful put.
    pub file_id: Option<i64>,
    /// Logical file name (absolute path).
    pub lfn: String,
    /// Optional source URI.
    pub pfn: Option<String>,
    /// Size in bytes.
    pub size: u64,
    pub checksum: Option<String>,
    pub checksum_type: ChecksumType,
    /// Canonical GUID string.
    pub guid: Option<String>,
    pub status: FileStatus,
    pub error: Option<String>,
    /// Number of scheduling attempts made for this file.
    pub attempt: u32,
}

impl File {
    /// Create a Waiting file for the given LFN.
    pub fn new(lfn: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            ..Default::default()
        }
    }

    /// Set the size in bytes.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Set checksum value and algorithm.
    pub fn with_checksum(mut self, checksum: impl Into<String>, kind: ChecksumType) -> Self {
        self.checksum = Some(checksum.into());
        self.checksum_type = kind;
        self
    }

    /// Set the source URI.
    pub fn with_pfn(mut self, pfn: impl Into<String>) -> Self {
        self.pfn = Some(pfn.into());
        self
    }

    /// Set the GUID.
    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    /// Mark the file Done and clear its error.
    pub fn mark_done(&mut self) {
        self.status = FileStatus::Done;
        self.error = None;
    }

    /// Mark the file permanently Failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = FileStatus::Failed;
        self.error = Some(error.into());
    }

    /// Leave the file Waiting with a retryable error.
    pub fn mark_retry(&mut self, error: impl Into<String>) {
        self.status = FileStatus::Waiting;
        self.error = Some(error.into());
    }

    /// Whether the file still needs work from its operation.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, FileStatus::Waiting | FileStatus::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_transitions() {
        let mut file = File::new("/a/b/c")
            .with_size(100)
            .with_checksum("abc", ChecksumType::Adler32);
        assert_eq!(file.status, FileStatus::Waiting);
        assert!(file.is_pending());

        file.mark_retry("SE busy");
        assert_eq!(file.status, FileStatus::Waiting);
        assert_eq!(file.error.as_deref(), Some("SE busy"));

        file.mark_done();
        assert_eq!(file.status, FileStatus::Done);
        assert!(file.error.is_none());
        assert!(!file.is_pending());
    }
}
