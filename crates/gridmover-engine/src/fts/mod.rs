// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FTS agent: client seam, REST and mock clients, and the job manager.

pub mod classify;
pub mod client;
pub mod job_manager;
pub mod mock;
pub mod rest;

pub use classify::FailureClassifier;
pub use client::{
    ChecksumMode, FtsClient, FtsError, RemoteFileState, RemoteJobState, SubmitRequest,
    TransferPair,
};
pub use job_manager::{CycleReport, FtsJobManager, FtsJobManagerConfig};
pub use mock::MockFtsClient;
pub use rest::RestFtsClient;
