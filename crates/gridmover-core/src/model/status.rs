// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status enums for every persisted entity.
//!
//! All enums are stored as their `Display` form in the database and on the wire.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Request status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum RequestStatus {
    /// Ready to be leased by an executor.
    #[default]
    Waiting,
    /// Leased by an executor; transient, only set by `get_next`.
    Assigned,
    /// Every operation is Done.
    Done,
    /// At least one operation Failed and nothing is left to run.
    Failed,
    /// Explicitly cancelled. Sticky.
    Cancelled,
}

impl RequestStatus {
    /// Whether the request has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Operation status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum OperationStatus {
    /// Waiting for an earlier operation to finish.
    #[default]
    Queued,
    /// The current operation of its request.
    Waiting,
    /// Being processed.
    Assigned,
    /// Handed over to an external service.
    Scheduled,
    /// Finished successfully.
    Done,
    /// Finished with a permanent failure.
    Failed,
    /// Cancelled together with its request.
    Cancelled,
}

impl OperationStatus {
    /// Whether the operation has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Operation file status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum FileStatus {
    #[default]
    Waiting,
    Scheduled,
    Done,
    Failed,
    Cancelled,
}

impl FileStatus {
    /// Whether the file has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// FTS file status. Mirrors the remote service's file states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum FtsFileStatus {
    #[default]
    Waiting,
    Submitted,
    Ready,
    Staging,
    Active,
    Canceled,
    Failed,
    Finished,
}

impl FtsFileStatus {
    /// Whether the remote transfer of this file is over.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Canceled | Self::Failed | Self::Finished)
    }

    /// Whether the file is bound to a submitted job.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Ready | Self::Staging | Self::Active
        )
    }
}

/// FTS job status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum FtsJobStatus {
    #[default]
    Submitted,
    Executing,
    Finished,
    FinishedDirty,
    Cancelled,
    /// Expired or rejected by the remote service.
    Failed,
}

impl FtsJobStatus {
    /// Whether the job needs no further polling.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::FinishedDirty | Self::Cancelled | Self::Failed
        )
    }
}

/// Checksum algorithm attached to a file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum ChecksumType {
    #[strum(serialize = "ADLER32")]
    #[serde(rename = "ADLER32")]
    #[default]
    Adler32,
    #[strum(serialize = "MD5")]
    #[serde(rename = "MD5")]
    Md5,
    #[strum(serialize = "SHA1")]
    #[serde(rename = "SHA1")]
    Sha1,
    #[strum(serialize = "NONE")]
    #[serde(rename = "NONE")]
    None,
}
