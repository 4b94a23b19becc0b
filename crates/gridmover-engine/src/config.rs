// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for gridmover-engine.
//!
//! Every worker carries its own `*Config` with defaults so it can be embedded
//! without touching the environment. [`EngineConfig::from_env`] assembles all
//! of them from `GRIDMOVER_*` variables.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use gridmover_core::config::StoreConfig;

use crate::cleaner::CleanerConfig;
use crate::executor::ExecutorConfig;
use crate::fts::{ChecksumMode, FtsJobManagerConfig};
use crate::graph::{GraphSettings, SchedulingType};
use crate::graph_refresher::GraphRefresherConfig;
use crate::handlers::HandlerConfig;
use crate::scheduler::{SchedulerConfig, Strategy};

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub executor: ExecutorConfig,
    pub cleaner: CleanerConfig,
    pub fts: FtsJobManagerConfig,
    pub scheduler: SchedulerConfig,
    pub graph: GraphSettings,
    pub refresher: GraphRefresherConfig,
    pub handlers: HandlerConfig,
    /// Base URL of the RPC gateway used for catalogs, job notification and forwarded calls.
    pub rpc_gateway_url: Option<String>,
    /// Catalog names known to this engine.
    pub catalogs: Vec<String>,
    /// Filesystem-backed storage elements as (SE name, root directory).
    pub storage_roots: Vec<(String, PathBuf)>,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `GRIDMOVER_DATABASE_URL`
    ///
    /// Everything else is optional; see the crate documentation for the full table.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = StoreConfig::from_env()?;

        let executor_defaults = ExecutorConfig::default();
        let executor = ExecutorConfig {
            requests_per_cycle: parse_var(
                "GRIDMOVER_REQUESTS_PER_CYCLE",
                executor_defaults.requests_per_cycle,
            )?,
            min_process: parse_var("GRIDMOVER_MIN_PROCESS", executor_defaults.min_process)?,
            max_process: parse_var("GRIDMOVER_MAX_PROCESS", executor_defaults.max_process)?,
            queue_size: parse_var(
                "GRIDMOVER_PROCESS_POOL_QUEUE_SIZE",
                executor_defaults.queue_size,
            )?,
            pool_timeout: secs_var(
                "GRIDMOVER_PROCESS_POOL_TIMEOUT_SECS",
                executor_defaults.pool_timeout,
            )?,
            task_timeout: secs_var(
                "GRIDMOVER_PROCESS_TASK_TIMEOUT_SECS",
                executor_defaults.task_timeout,
            )?,
            pool_sleep: secs_var(
                "GRIDMOVER_PROCESS_POOL_SLEEP_SECS",
                executor_defaults.pool_sleep,
            )?,
            poll_interval: secs_var(
                "GRIDMOVER_EXECUTOR_POLL_INTERVAL_SECS",
                executor_defaults.poll_interval,
            )?,
        };
        if executor.max_process == 0 || executor.min_process > executor.max_process {
            return Err(ConfigError::Invalid(
                "GRIDMOVER_MAX_PROCESS",
                "must be positive and not below GRIDMOVER_MIN_PROCESS".to_string(),
            ));
        }

        let cleaner_defaults = CleanerConfig::default();
        let grace_days: u64 = parse_var("GRIDMOVER_GRACE_REMOVAL_PERIOD_DAYS", 7)?;
        let cleaner = CleanerConfig {
            poll_interval: secs_var(
                "GRIDMOVER_CLEANER_INTERVAL_SECS",
                cleaner_defaults.poll_interval,
            )?,
            grace_removal_period: Duration::from_secs(grace_days * 24 * 3600),
            assigned_reset_delay: secs_var(
                "GRIDMOVER_ASSIGNED_RESET_DELAY_SECS",
                cleaner_defaults.assigned_reset_delay,
            )?,
            batch_size: parse_var("GRIDMOVER_CLEANER_BATCH_SIZE", cleaner_defaults.batch_size)?,
        };
        if cleaner.batch_size <= 0 {
            return Err(ConfigError::Invalid(
                "GRIDMOVER_CLEANER_BATCH_SIZE",
                "must be a positive integer".to_string(),
            ));
        }

        let fts_defaults = FtsJobManagerConfig::default();
        let fts = FtsJobManagerConfig {
            submit_interval: secs_var(
                "GRIDMOVER_FTS_SUBMIT_INTERVAL_SECS",
                fts_defaults.submit_interval,
            )?,
            monitor_interval: secs_var(
                "GRIDMOVER_FTS_MONITOR_INTERVAL_SECS",
                fts_defaults.monitor_interval,
            )?,
            min_workers: parse_var("GRIDMOVER_FTS_MIN_WORKERS", fts_defaults.min_workers)?,
            max_workers: parse_var("GRIDMOVER_FTS_MAX_WORKERS", fts_defaults.max_workers)?,
            task_timeout: secs_var("GRIDMOVER_FTS_TASK_TIMEOUT_SECS", fts_defaults.task_timeout)?,
            max_attempts: parse_var("GRIDMOVER_FTS_MAX_ATTEMPTS", fts_defaults.max_attempts)?,
            max_jobs_per_channel: parse_var(
                "GRIDMOVER_MAX_JOBS_PER_CHANNEL",
                fts_defaults.max_jobs_per_channel,
            )?,
            checksum_mode: parse_var::<ChecksumMode>(
                "GRIDMOVER_FTS_CHECKSUM_MODE",
                fts_defaults.checksum_mode,
            )?,
            ..fts_defaults
        };
        if fts.max_workers == 0 || fts.min_workers > fts.max_workers {
            return Err(ConfigError::Invalid(
                "GRIDMOVER_FTS_MAX_WORKERS",
                "must be positive and not below GRIDMOVER_FTS_MIN_WORKERS".to_string(),
            ));
        }

        let graph_defaults = GraphSettings::default();
        let graph = GraphSettings {
            history_window: secs_var(
                "GRIDMOVER_FTS_HISTORY_WINDOW_SECS",
                graph_defaults.history_window,
            )?,
            acceptable_failure_rate: parse_var(
                "GRIDMOVER_ACCEPTABLE_FAILURE_RATE",
                graph_defaults.acceptable_failure_rate,
            )?,
            acceptable_failed_files: parse_var(
                "GRIDMOVER_ACCEPTABLE_FAILED_FILES",
                graph_defaults.acceptable_failed_files,
            )?,
        };
        if !(0.0..=1.0).contains(&graph.acceptable_failure_rate) {
            return Err(ConfigError::Invalid(
                "GRIDMOVER_ACCEPTABLE_FAILURE_RATE",
                "must be between 0 and 1".to_string(),
            ));
        }

        let scheduler_defaults = SchedulerConfig::default();
        let active_strategies = match non_empty_var("GRIDMOVER_ACTIVE_STRATEGIES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Strategy::from_str(s).map_err(|_| {
                        ConfigError::Invalid(
                            "GRIDMOVER_ACTIVE_STRATEGIES",
                            format!("unknown strategy '{s}'"),
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => scheduler_defaults.active_strategies.clone(),
        };
        if active_strategies.is_empty() {
            return Err(ConfigError::Invalid(
                "GRIDMOVER_ACTIVE_STRATEGIES",
                "at least one strategy is required".to_string(),
            ));
        }
        let scheduler = SchedulerConfig {
            active_strategies,
            hop_sigma: parse_var("GRIDMOVER_HOP_SIGMA_SECS", scheduler_defaults.hop_sigma)?,
            scheduling_type: parse_var::<SchedulingType>(
                "GRIDMOVER_SCHEDULING_TYPE",
                scheduler_defaults.scheduling_type,
            )?,
        };

        let refresher = GraphRefresherConfig {
            rebuild_interval: graph.history_window,
            rw_refresh_interval: secs_var(
                "GRIDMOVER_RW_REFRESH_SECS",
                GraphRefresherConfig::default().rw_refresh_interval,
            )?,
            ..Default::default()
        };

        let handler_defaults = HandlerConfig::default();
        let handlers = HandlerConfig {
            schedule_max_attempts: parse_var(
                "GRIDMOVER_SCHEDULE_MAX_ATTEMPTS",
                handler_defaults.schedule_max_attempts,
            )?,
            replicate_via_fts: bool_var(
                "GRIDMOVER_REPLICATE_VIA_FTS",
                handler_defaults.replicate_via_fts,
            )?,
            scratch_dir: non_empty_var("GRIDMOVER_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(handler_defaults.scratch_dir),
        };

        let catalogs: Vec<String> = non_empty_var("GRIDMOVER_CATALOGS")
            .unwrap_or_else(|| "FileCatalog".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let storage_roots = match non_empty_var("GRIDMOVER_STORAGE_ROOTS") {
            Some(raw) => parse_storage_roots(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            store,
            executor,
            cleaner,
            fts,
            scheduler,
            graph,
            refresher,
            handlers,
            rpc_gateway_url: non_empty_var("GRIDMOVER_RPC_GATEWAY_URL"),
            catalogs,
            storage_roots,
        })
    }
}

/// Parse `SE=path,SE2=path2`.
fn parse_storage_roots(raw: &str) -> Result<Vec<(String, PathBuf)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((se, path)) if !se.trim().is_empty() && !path.trim().is_empty() => {
                Ok((se.trim().to_string(), PathBuf::from(path.trim())))
            }
            _ => Err(ConfigError::Invalid(
                "GRIDMOVER_STORAGE_ROOTS",
                format!("expected SE=path, got '{entry}'"),
            )),
        })
        .collect()
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match non_empty_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        None => Ok(default),
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}

fn bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match non_empty_var(name).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(ConfigError::Invalid(
            name,
            format!("expected true/false, got '{other}'"),
        )),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Store configuration failed.
    #[error(transparent)]
    Store(#[from] gridmover_core::config::ConfigError),

    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
