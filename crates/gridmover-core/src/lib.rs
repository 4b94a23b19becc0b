// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gridmover Core - Request Model and Request Store
//!
//! This crate is the system of record for the gridmover transfer system. It defines
//! the request model (requests, operations, files, FTS files and FTS jobs), the
//! in-request state machine, validation, the wire serialisation and the durable
//! request store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Clients (job wrappers, CLI)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ putRequest / peekRequest / ...
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     RequestClient (This Crate)                           │
//! │          validation, finalisation, digest, job notification              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌───────────────────────┐        ┌─────────────────────────────────────────┐
//! │   RequestStore trait  │◄───────│   gridmover-engine (executor, FTS agent,│
//! │   SQLite backend      │        │   cleaner)                              │
//! └───────────────────────┘        └─────────────────────────────────────────┘
//! ```
//!
//! # Request Status State Machine
//!
//! ```text
//!            put                getNext               put (recomputed)
//!   ──────► WAITING ──────────► ASSIGNED ──────────► WAITING | DONE | FAILED
//!              ▲                    │
//!              │   reset / timeout  │
//!              └────────────────────┘
//!
//!   cancel: any non-terminal status ──► CANCELLED
//! ```
//!
//! Within one request, operations run strictly in declared order. Exactly one
//! operation is `Waiting` while the request is not terminal; earlier ones are
//! terminal and later ones are `Queued`.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GRIDMOVER_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `GRIDMOVER_DB_MAX_CONNECTIONS` | No | `5` | Connection pool size |
//!
//! # Modules
//!
//! - [`model`]: Requests, operations, files, FTS files, FTS jobs and sites
//! - [`validation`]: Put-time request validation
//! - [`serialization`]: Tag-attribute XML encoding of requests
//! - [`persistence`]: The `RequestStore` trait and its SQLite backend
//! - [`client`]: The request store RPC surface

/// Store configuration loaded from environment variables.
pub mod config;

/// Request-store RPC surface (put, get, peek, finalize, digest).
pub mod client;

/// Human-readable request digests.
pub mod digest;

/// Error types for store operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Request model and status computation.
pub mod model;

/// Origin-job notification seam used by finalisation.
pub mod notify;

/// Persistence trait and backends.
pub mod persistence;

/// Tag-attribute serialisation of requests.
pub mod serialization;

/// Put-time validation of requests.
pub mod validation;

pub use client::RequestClient;
pub use error::{Result, StoreError};
pub use model::{
    ChecksumType, File, FileStatus, FtsFile, FtsFileStatus, FtsJob, FtsJobStatus, FtsSite,
    Operation, OperationStatus, Request, RequestId, RequestStatus, SeAccess,
};
pub use persistence::{RequestStore, SqliteRequestStore};
