// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FTS bookkeeping: scheduled transfers, submitted jobs and the history view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{ChecksumType, FtsFileStatus, FtsJobStatus};

/// Build the route identifier `fromSite#toSite`.
pub fn route_id(from_site: &str, to_site: &str) -> String {
    format!("{from_site}#{to_site}")
}

/// One operation file placed on one route.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FtsFile {
    pub fts_file_id: Option<i64>,
    pub request_id: Option<i64>,
    pub operation_id: Option<i64>,
    pub file_id: Option<i64>,
    pub lfn: String,
    pub size: u64,
    pub checksum: Option<String>,
    pub checksum_type: ChecksumType,
    pub source_se: String,
    pub source_surl: Option<String>,
    pub target_se: String,
    pub target_surl: Option<String>,
    /// Route identifier this transfer was planned on.
    pub route: String,
    /// Route that must finish before this one may be submitted.
    pub ancestor: Option<String>,
    pub attempt: u32,
    /// GUID of the remote job this file was submitted with.
    pub fts_guid: Option<String>,
    pub fts_job_id: Option<i64>,
    pub status: FtsFileStatus,
    pub error: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl FtsFile {
    /// Whether this transfer must wait for another route of the same file.
    pub fn has_ancestor(&self) -> bool {
        self.ancestor.as_deref().is_some_and(|a| !a.is_empty())
    }

    /// Return the file to Waiting so it is picked up by the next submission.
    pub fn requeue(&mut self, error: Option<String>) {
        self.status = FtsFileStatus::Waiting;
        self.fts_guid = None;
        self.fts_job_id = None;
        self.attempt += 1;
        self.error = error;
    }
}

/// A job submitted to a remote FTS server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FtsJob {
    pub fts_job_id: Option<i64>,
    /// GUID assigned by the remote service on submission.
    pub fts_guid: Option<String>,
    pub fts_server: String,
    pub source_se: String,
    pub target_se: String,
    /// Aggregate size of all files in bytes.
    pub size: u64,
    pub files: u32,
    pub failed_files: u32,
    pub failed_size: u64,
    /// Completed fraction as reported by the last poll, 0.0..=1.0.
    pub completeness: f64,
    pub status: FtsJobStatus,
    pub error: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub submit_time: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

/// One aggregated row of the FTS history view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FtsHistory {
    pub source_se: String,
    pub target_se: String,
    pub status: FtsJobStatus,
    pub jobs: u64,
    pub files: u64,
    pub failed_files: u64,
    pub size: u64,
    pub failed_size: u64,
    /// Mean completeness of the jobs in this row.
    pub completeness: f64,
}

impl FtsHistory {
    pub fn successful_files(&self) -> u64 {
        self.files.saturating_sub(self.failed_files)
    }

    pub fn successful_size(&self) -> u64 {
        self.size.saturating_sub(self.failed_size)
    }
}
