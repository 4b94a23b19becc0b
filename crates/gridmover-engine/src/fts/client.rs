// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FTS service client seam.

use async_trait::async_trait;
use gridmover_core::{FtsFileStatus, FtsJobStatus};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

/// Which checksum the FTS server verifies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ChecksumMode {
    /// No verification.
    None,
    /// Verify Adler32 checksums end to end.
    #[default]
    Adler32,
    Md5,
    Sha1,
}

/// One source/target pair of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferPair {
    pub source_surl: String,
    pub target_surl: String,
    pub size: u64,
    /// `ALGORITHM:value`, present when the checksum mode verifies it.
    pub checksum: Option<String>,
}

/// A job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Client-side identifier of this submission.
    pub submission_id: Uuid,
    pub pairs: Vec<TransferPair>,
    pub checksum_mode: ChecksumMode,
}

/// Remote state of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileState {
    pub source_surl: String,
    pub target_surl: String,
    pub status: FtsFileStatus,
    pub reason: Option<String>,
}

/// Remote state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJobState {
    pub status: FtsJobStatus,
    /// Fraction of files in a final state.
    pub completeness: f64,
    pub files: Vec<RemoteFileState>,
}

impl RemoteJobState {
    /// Build a job state from its files, deriving completeness.
    pub fn from_files(status: FtsJobStatus, files: Vec<RemoteFileState>) -> Self {
        let done = files.iter().filter(|f| f.status.is_final()).count();
        let completeness = if files.is_empty() {
            if status.is_final() { 1.0 } else { 0.0 }
        } else {
            done as f64 / files.len() as f64
        };
        Self {
            status,
            completeness,
            files,
        }
    }

    /// Remote file state for a target SURL.
    pub fn file(&self, target_surl: &str) -> Option<&RemoteFileState> {
        self.files.iter().find(|f| f.target_surl == target_surl)
    }
}

/// FTS failures.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum FtsError {
    #[error("FTS transport error: {0}")]
    Transport(String),

    #[error("FTS authentication error: {0}")]
    Auth(String),

    /// The server does not know the job; it has expired.
    #[error("FTS job unknown: {0}")]
    UnknownJob(String),

    /// The server answered something we cannot interpret.
    #[error("FTS protocol error: {0}")]
    Protocol(String),
}

impl FtsError {
    pub fn is_unknown_job(&self) -> bool {
        matches!(self, Self::UnknownJob(_))
    }
}

/// Map a remote job state name to a job status.
///
/// A job that FAILED as a whole is reported as FinishedDirty: its files carry
/// the individual reasons.
pub fn map_job_state(remote: &str) -> Option<FtsJobStatus> {
    let status = match remote.to_ascii_uppercase().as_str() {
        "SUBMITTED" => FtsJobStatus::Submitted,
        "READY" | "ACTIVE" | "STAGING" | "DELETE" | "ARCHIVING" | "QOS_TRANSITION" => {
            FtsJobStatus::Executing
        }
        "FINISHED" => FtsJobStatus::Finished,
        "FINISHEDDIRTY" | "FAILED" => FtsJobStatus::FinishedDirty,
        "CANCELED" | "CANCELLED" => FtsJobStatus::Cancelled,
        _ => return None,
    };
    Some(status)
}

/// Map a remote file state name to a file status.
pub fn map_file_state(remote: &str) -> Option<FtsFileStatus> {
    let status = match remote.to_ascii_uppercase().as_str() {
        "SUBMITTED" | "ON_HOLD" | "ON_HOLD_STAGING" => FtsFileStatus::Submitted,
        "READY" => FtsFileStatus::Ready,
        "STAGING" | "STARTED" | "ARCHIVING" => FtsFileStatus::Staging,
        "ACTIVE" => FtsFileStatus::Active,
        "FINISHED" => FtsFileStatus::Finished,
        "FAILED" => FtsFileStatus::Failed,
        "CANCELED" | "CANCELLED" | "NOT_USED" => FtsFileStatus::Canceled,
        _ => return None,
    };
    Some(status)
}

/// Client of an FTS service.
#[async_trait]
pub trait FtsClient: Send + Sync {
    /// Submit a job; returns the job GUID assigned by the server.
    async fn submit(&self, server: &str, request: &SubmitRequest) -> Result<String, FtsError>;

    async fn status(&self, server: &str, guid: &str) -> Result<RemoteJobState, FtsError>;

    async fn cancel(&self, server: &str, guid: &str) -> Result<(), FtsError>;
}
