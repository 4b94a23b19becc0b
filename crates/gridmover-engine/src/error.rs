// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for gridmover-engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Request store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] gridmover_core::StoreError),

    /// FTS service call failed.
    #[error("FTS error: {0}")]
    Fts(#[from] crate::fts::FtsError),

    /// Route planning failed.
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),

    /// Forwarded RPC failed.
    #[error("RPC error: {0}")]
    Rpc(#[from] crate::services::rpc::RpcError),

    /// Storage element call failed.
    #[error("Storage error: {0}")]
    Storage(#[from] crate::services::storage::StorageError),

    /// Catalog call failed.
    #[error("Catalog error: {0}")]
    Catalog(#[from] crate::services::catalog::CatalogError),

    /// An operation handler hit a fatal condition.
    #[error("Handler error: {0}")]
    Handler(#[from] crate::handlers::HandlerError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using Engine Error.
pub type Result<T> = std::result::Result<T, Error>;
