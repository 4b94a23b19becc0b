// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request model.
//!
//! Ownership is strictly hierarchical: a [`Request`] owns its [`Operation`]s and
//! an operation owns its [`File`]s and the [`FtsFile`]s scheduled for them.
//! Children refer to parents only through store IDs.

mod file;
mod fts;
pub mod operation;
mod request;
mod rpc;
mod site;
pub mod state;
mod status;

pub use file::File;
pub use fts::{FtsFile, FtsHistory, FtsJob, route_id};
pub use operation::{Operation, split_list, types};
pub use request::{Request, RequestId};
pub use rpc::RpcStub;
pub use site::{FtsSite, SeAccess};
pub use status::{
    ChecksumType, FileStatus, FtsFileStatus, FtsJobStatus, OperationStatus, RequestStatus,
};
