// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for request housekeeping.
//!
//! Each pass does two things:
//! - deletes Done requests older than the grace removal period, in batches
//! - hands back leases held longer than the assigned reset delay, which
//!   recovers requests stranded by a crashed executor

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gridmover_core::RequestStore;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Configuration for the cleaner.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// How often to run a pass.
    pub poll_interval: Duration,
    /// Age after which Done requests are deleted.
    pub grace_removal_period: Duration,
    /// Age after which an Assigned request is reset to Waiting.
    pub assigned_reset_delay: Duration,
    /// Requests deleted per batch.
    pub batch_size: i64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),             // 1 hour
            grace_removal_period: Duration::from_secs(7 * 86400), // 7 days
            assigned_reset_delay: Duration::from_secs(7200),      // 2 hours
            batch_size: 100,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: u64,
    pub reset: u64,
}

/// Background worker that deletes old requests and recovers stale leases.
pub struct Cleaner {
    store: Arc<dyn RequestStore>,
    config: CleanerConfig,
    shutdown: Arc<Notify>,
}

impl Cleaner {
    pub fn new(store: Arc<dyn RequestStore>, config: CleanerConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run passes until shutdown. The first pass runs immediately.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            grace_removal_days = self.config.grace_removal_period.as_secs() / 86400,
            assigned_reset_delay_secs = self.config.assigned_reset_delay.as_secs(),
            "Cleaner started"
        );

        let mut interval =
            tokio::time::interval(self.config.poll_interval.max(Duration::from_millis(100)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleaner received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.deleted > 0 || report.reset > 0 => {
                            info!(deleted = report.deleted, reset = report.reset, "Cleanup pass completed");
                        }
                        Ok(_) => debug!("Cleanup pass completed, nothing to do"),
                        Err(e) => error!(error = %e, "Cleanup pass failed"),
                    }
                }
            }
        }

        info!("Cleaner stopped");
    }

    /// One cleanup pass.
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.grace_removal_period)
            .map_err(|e| Error::Other(format!("grace removal period out of range: {e}")))?;
        let reset_delay = chrono::Duration::from_std(self.config.assigned_reset_delay)
            .map_err(|e| Error::Other(format!("assigned reset delay out of range: {e}")))?;

        let batch = self.config.batch_size.max(1);
        let mut deleted = 0;
        loop {
            let names = self
                .store
                .done_requests_older_than(now - grace, batch)
                .await?;
            if names.is_empty() {
                break;
            }
            let removed = self.store.delete_requests(&names).await?;
            debug!(batch = names.len(), removed = removed, "Deleted old Done requests");
            deleted += removed;
            if (names.len() as i64) < batch || removed == 0 {
                break;
            }
        }

        let reset = self.store.reset_stale_assigned(now - reset_delay).await?;
        Ok(CleanupReport { deleted, reset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmover_core::config::StoreConfig;
    use gridmover_core::model::types;
    use gridmover_core::{File, Operation, Request, RequestStatus, SqliteRequestStore};

    async fn test_store() -> Arc<SqliteRequestStore> {
        Arc::new(
            SqliteRequestStore::connect(&StoreConfig {
                database_url: "sqlite::memory:".to_string(),
                max_connections: 1,
            })
            .await
            .unwrap(),
        )
    }

    async fn done_request(store: &SqliteRequestStore, name: &str) {
        let mut request = Request::new(name)
            .with_operation(Operation::new(types::REMOVE_FILE).with_file(File::new("/vo/a")));
        request.operations[0].files[0].mark_done();
        request.recompute();
        store.put_request(&mut request).await.unwrap();
        assert_eq!(request.status, RequestStatus::Done);
    }

    #[test]
    fn test_config_default() {
        let config = CleanerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(3600));
        assert_eq!(config.grace_removal_period, Duration::from_secs(7 * 86400));
        assert_eq!(config.assigned_reset_delay, Duration::from_secs(7200));
    }

    #[tokio::test]
    async fn test_recent_requests_are_kept() {
        let store = test_store().await;
        done_request(&store, "done").await;
        let cleaner = Cleaner::new(store.clone(), CleanerConfig::default());

        assert_eq!(cleaner.run_once().await.unwrap(), CleanupReport::default());
        assert!(store.peek_by_name("done").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_old_done_requests_deleted_in_batches() {
        let store = test_store().await;
        for i in 0..5 {
            done_request(&store, &format!("done-{i}")).await;
        }
        let mut waiting = Request::new("waiting")
            .with_operation(Operation::new(types::REMOVE_FILE).with_file(File::new("/vo/b")));
        store.put_request(&mut waiting).await.unwrap();

        let cleaner = Cleaner::new(
            store.clone(),
            CleanerConfig {
                grace_removal_period: Duration::ZERO,
                batch_size: 2,
                ..Default::default()
            },
        );
        // Let the rows age past a zero grace period.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = cleaner.run_once().await.unwrap();
        assert_eq!(report.deleted, 5);
        assert!(store.peek_by_name("done-0").await.unwrap().is_none());
        assert!(store.peek_by_name("waiting").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_leases_are_reset() {
        let store = test_store().await;
        let mut request = Request::new("stuck")
            .with_operation(Operation::new(types::REMOVE_FILE).with_file(File::new("/vo/a")));
        store.put_request(&mut request).await.unwrap();
        store.get_next().await.unwrap().unwrap();

        let cleaner = Cleaner::new(
            store.clone(),
            CleanerConfig {
                assigned_reset_delay: Duration::ZERO,
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = cleaner.run_once().await.unwrap();
        assert_eq!(report.reset, 1);
        let request = store.peek_by_name("stuck").await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Waiting);
    }

    #[tokio::test]
    async fn test_shutdown_handle() {
        let cleaner = Cleaner::new(test_store().await, CleanerConfig::default());
        let handle = cleaner.shutdown_handle();
        handle.notify_one();
        tokio::time::timeout(Duration::from_secs(5), cleaner.run())
            .await
            .unwrap();
    }
}
