// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gridmover Engine - Request Execution and FTS Transfers
//!
//! This crate drives requests stored by `gridmover-core` to completion. It
//! leases Waiting requests, runs the current operation of each through the
//! handler for its type, schedules bulk transfers over the FTS topology and
//! follows submitted FTS jobs until every file settles.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        gridmover-engine (This Crate)                     │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Executor   │  │  FTS Job    │  │   Graph     │  │   Cleaner   │     │
//! │  │ + handlers  │  │  Manager    │  │  Refresher  │  │             │     │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘     │
//! │         │  Scheduler     │                │                │            │
//! │         └──────┬─────────┴──── FtsGraph ──┘                │            │
//! └────────────────┼──────────────────────────────────────────┼────────────┘
//!                  │ catalogs, storage elements, RPC           │
//!                  ▼                                           ▼
//! ┌──────────────────────────────┐        ┌─────────────────────────────────┐
//! │  Catalogs / SEs / FTS3 REST  │        │  RequestStore (gridmover-core)   │
//! └──────────────────────────────┘        └─────────────────────────────────┘
//! ```
//!
//! # Operation Types
//!
//! | Type | Handler |
//! |------|---------|
//! | `putAndRegister` | Upload a local file to one SE and register it |
//! | `replicateAndRegister` | Replicate to each target, through FTS or directly |
//! | `registerFile` | Add catalog entries for existing replicas |
//! | `removeFile` | Delete every replica and the catalog entry |
//! | `removeReplica` | Delete the replica at one SE |
//! | `ftsSchedule` | Plan FTS files over the topology |
//! | `forwardRPC` | Replay a stored remote call |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GRIDMOVER_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `GRIDMOVER_DB_MAX_CONNECTIONS` | No | `5` | Connection pool size |
//! | `GRIDMOVER_REQUESTS_PER_CYCLE` | No | `100` | Requests leased per executor cycle |
//! | `GRIDMOVER_MIN_PROCESS` | No | `2` | Lower bound of the executor pool |
//! | `GRIDMOVER_MAX_PROCESS` | No | `4` | Requests processed concurrently |
//! | `GRIDMOVER_PROCESS_POOL_QUEUE_SIZE` | No | `20` | Leases held beyond the running ones |
//! | `GRIDMOVER_PROCESS_POOL_TIMEOUT_SECS` | No | `900` | Wait for a cycle to drain |
//! | `GRIDMOVER_PROCESS_TASK_TIMEOUT_SECS` | No | `900` | Time allowed per request |
//! | `GRIDMOVER_PROCESS_POOL_SLEEP_SECS` | No | `5` | Pause while the pool is full |
//! | `GRIDMOVER_EXECUTOR_POLL_INTERVAL_SECS` | No | `10` | Pause between executor cycles |
//! | `GRIDMOVER_CLEANER_INTERVAL_SECS` | No | `3600` | Pause between cleaner passes |
//! | `GRIDMOVER_GRACE_REMOVAL_PERIOD_DAYS` | No | `7` | Age at which Done requests are deleted |
//! | `GRIDMOVER_ASSIGNED_RESET_DELAY_SECS` | No | `7200` | Age at which leases are handed back |
//! | `GRIDMOVER_CLEANER_BATCH_SIZE` | No | `100` | Requests deleted per batch |
//! | `GRIDMOVER_FTS_SUBMIT_INTERVAL_SECS` | No | `60` | Pause between submission cycles |
//! | `GRIDMOVER_FTS_MONITOR_INTERVAL_SECS` | No | `120` | Pause between monitoring cycles |
//! | `GRIDMOVER_FTS_MIN_WORKERS` | No | `1` | Lower bound of the FTS worker pool |
//! | `GRIDMOVER_FTS_MAX_WORKERS` | No | `10` | Concurrent FTS tasks |
//! | `GRIDMOVER_FTS_TASK_TIMEOUT_SECS` | No | `300` | Time allowed per FTS task |
//! | `GRIDMOVER_FTS_MAX_ATTEMPTS` | No | `4` | Submissions per FTS file |
//! | `GRIDMOVER_MAX_JOBS_PER_CHANNEL` | No | `10` | In-flight jobs per SE pair |
//! | `GRIDMOVER_FTS_CHECKSUM_MODE` | No | `adler32` | FTS checksum verification |
//! | `GRIDMOVER_FTS_HISTORY_WINDOW_SECS` | No | `3600` | History window and rebuild interval |
//! | `GRIDMOVER_RW_REFRESH_SECS` | No | `600` | SE access refresh interval |
//! | `GRIDMOVER_ACCEPTABLE_FAILURE_RATE` | No | `0.75` | Minimum route success rate |
//! | `GRIDMOVER_ACCEPTABLE_FAILED_FILES` | No | `5` | Failures before the rate applies |
//! | `GRIDMOVER_ACTIVE_STRATEGIES` | No | `MinimiseTotalWait` | Comma-separated strategies |
//! | `GRIDMOVER_HOP_SIGMA_SECS` | No | `5` | Penalty for relaying sources |
//! | `GRIDMOVER_SCHEDULING_TYPE` | No | `File` | `File` or `Throughput` |
//! | `GRIDMOVER_SCHEDULE_MAX_ATTEMPTS` | No | `10` | Scheduling attempts per file |
//! | `GRIDMOVER_REPLICATE_VIA_FTS` | No | `true` | Route replication through FTS |
//! | `GRIDMOVER_SCRATCH_DIR` | No | `$TMPDIR/gridmover` | Staging area for direct copies |
//! | `GRIDMOVER_CATALOGS` | No | `FileCatalog` | Comma-separated catalog names |
//! | `GRIDMOVER_STORAGE_ROOTS` | No | - | `SE=path,...` filesystem SEs |
//! | `GRIDMOVER_RPC_GATEWAY_URL` | No | - | Gateway for catalogs and job notification |
//!
//! # Modules
//!
//! - [`executor`]: Leases requests and runs their current operation
//! - [`handlers`]: One handler per operation type
//! - [`scheduler`]: Replication trees over the transfer graph
//! - [`fts`]: FTS client seam and the job manager
//! - [`graph`] / [`graph_refresher`]: The topology and its upkeep
//! - [`cleaner`]: Old request removal and lease recovery
//! - [`services`]: Catalog, storage element and RPC seams
//! - [`runtime`]: Embeddable runtime wiring all workers together

/// Checksums of local files and stored data.
pub mod checksum;

/// Request housekeeping worker.
pub mod cleaner;

/// Environment configuration.
pub mod config;

/// Error types.
pub mod error;

/// Request executor.
pub mod executor;

/// FTS agent.
pub mod fts;

/// Transfer topology.
pub mod graph;

/// Topology upkeep worker.
pub mod graph_refresher;

/// Operation handlers.
pub mod handlers;

/// Embeddable runtime.
pub mod runtime;

/// Replication tree planning.
pub mod scheduler;

/// External service seams.
pub mod services;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorConfig};
pub use handlers::{HandlerRegistry, OperationHandler, Services};
pub use runtime::EngineRuntime;
pub use scheduler::Scheduler;
