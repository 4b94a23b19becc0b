// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker keeping the transfer topology current.
//!
//! Two timers drive it:
//! - the rebuild timer reloads sites and the FTS history window from the
//!   store and replaces the shared graph
//! - the access timer asks every storage element for its read/write flags

use std::sync::Arc;
use std::time::Duration;

use gridmover_core::RequestStore;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::graph::{FtsGraph, GraphSettings, SharedGraph};
use crate::services::StorageRegistry;

/// Configuration for the graph refresher.
#[derive(Debug, Clone)]
pub struct GraphRefresherConfig {
    /// How often the graph is rebuilt from the store.
    pub rebuild_interval: Duration,
    /// How often storage element access flags are refreshed.
    pub rw_refresh_interval: Duration,
    /// Upper bound of unsubmitted FTS files folded into route queues.
    pub pending_limit: i64,
}

impl Default for GraphRefresherConfig {
    fn default() -> Self {
        Self {
            rebuild_interval: Duration::from_secs(3600),  // 1 hour
            rw_refresh_interval: Duration::from_secs(600), // 10 minutes
            pending_limit: 100_000,
        }
    }
}

/// Background worker that rebuilds the graph and refreshes endpoint access.
pub struct GraphRefresher {
    store: Arc<dyn RequestStore>,
    graph: SharedGraph,
    storage: StorageRegistry,
    settings: GraphSettings,
    config: GraphRefresherConfig,
    shutdown: Arc<Notify>,
}

impl GraphRefresher {
    pub fn new(
        store: Arc<dyn RequestStore>,
        graph: SharedGraph,
        storage: StorageRegistry,
        settings: GraphSettings,
        config: GraphRefresherConfig,
    ) -> Self {
        Self {
            store,
            graph,
            storage,
            settings,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run both timers until shutdown. Both fire immediately on start.
    pub async fn run(&self) {
        info!(
            rebuild_interval_secs = self.config.rebuild_interval.as_secs(),
            rw_refresh_interval_secs = self.config.rw_refresh_interval.as_secs(),
            "Graph refresher started"
        );

        let floor = Duration::from_millis(100);
        let mut rebuild = tokio::time::interval(self.config.rebuild_interval.max(floor));
        let mut access = tokio::time::interval(self.config.rw_refresh_interval.max(floor));
        rebuild.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        access.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Graph refresher received shutdown signal");
                    break;
                }

                _ = rebuild.tick() => {
                    match self.rebuild().await {
                        // A fresh graph starts from the stored flags.
                        Ok(()) => {
                            self.refresh_access().await;
                        }
                        Err(e) => error!(error = %e, "Graph rebuild failed, keeping previous graph"),
                    }
                }

                _ = access.tick() => {
                    let updated = self.refresh_access().await;
                    debug!(updated = updated, "Storage element access refreshed");
                }
            }
        }

        info!("Graph refresher stopped");
    }

    /// Reload sites and history and replace the shared graph.
    pub async fn rebuild(&self) -> Result<()> {
        let sites = self.store.fts_sites().await?;
        let history = self.store.fts_history(self.settings.history_window).await?;
        let pending = self.store.waiting_fts_files(self.config.pending_limit).await?;
        let mut fresh = FtsGraph::build(&sites, &history, &self.settings);
        let queued = fresh.add_pending(&pending);
        let routes = fresh.routes().count();
        *self.graph.write().await = fresh;
        info!(
            sites = sites.len(),
            routes = routes,
            pending = queued,
            "Transfer graph rebuilt"
        );
        Ok(())
    }

    /// Ask each endpoint in the graph for its access flags. Returns how many
    /// endpoints were updated.
    ///
    /// Endpoints without a driver, or whose driver errors, keep their flags.
    pub async fn refresh_access(&self) -> usize {
        let names = self.graph.read().await.storage_elements();
        let mut fetched = Vec::with_capacity(names.len());
        for se in names {
            let Ok(element) = self.storage.get(&se) else {
                continue;
            };
            match element.access().await {
                Ok(access) => fetched.push((se, access)),
                Err(e) => warn!(se = %se, error = %e, "Could not read storage element access"),
            }
        }

        let mut graph = self.graph.write().await;
        fetched
            .into_iter()
            .filter(|(se, access)| graph.set_se_access(se, *access))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::shared;
    use crate::services::InMemoryStorageElement;
    use gridmover_core::config::StoreConfig;
    use gridmover_core::model::types;
    use gridmover_core::{File, FtsFile, FtsSite, Operation, Request, SeAccess, SqliteRequestStore};

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

    async fn seeded_store() -> Arc<SqliteRequestStore> {
        let store = test_store().await;
        store
            .put_fts_site(&FtsSite::new("CERN", "https://fts.cern.ch:8446").with_endpoint("CERN-DISK"))
            .await
            .unwrap();
        store
            .put_fts_site(&FtsSite::new("RAL", "https://fts.ral.ac.uk:8446").with_endpoint("RAL-DISK"))
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_config_default() {
        let config = GraphRefresherConfig::default();
        assert_eq!(config.rebuild_interval, Duration::from_secs(3600));
        assert_eq!(config.rw_refresh_interval, Duration::from_secs(600));
        assert_eq!(config.pending_limit, 100_000);
    }

    #[tokio::test]
    async fn test_rebuild_loads_sites() {
        let store = seeded_store().await;
        let graph = shared(FtsGraph::default());
        let refresher = GraphRefresher::new(
            store,
            graph.clone(),
            StorageRegistry::new(),
            GraphSettings::default(),
            GraphRefresherConfig::default(),
        );

        refresher.rebuild().await.unwrap();
        let graph = graph.read().await;
        assert_eq!(graph.sites().count(), 2);
        // Full mesh including loopbacks.
        assert_eq!(graph.routes().count(), 4);
        assert!(graph.route_between("CERN-DISK", "RAL-DISK").is_some());
    }

    #[tokio::test]
    async fn test_refresh_access_updates_flags() {
        let store = seeded_store().await;
        let graph = shared(FtsGraph::default());
        let ral = InMemoryStorageElement::new("RAL-DISK");
        ral.set_access(SeAccess {
            read: true,
            write: false,
        })
        .await;
        let refresher = GraphRefresher::new(
            store,
            graph.clone(),
            StorageRegistry::new().with(Arc::new(ral)),
            GraphSettings::default(),
            GraphRefresherConfig::default(),
        );
        refresher.rebuild().await.unwrap();

        // CERN-DISK has no driver and keeps its flags.
        assert_eq!(refresher.refresh_access().await, 1);
        let graph = graph.read().await;
        assert_eq!(
            graph.se_access("RAL-DISK"),
            Some(SeAccess {
                read: true,
                write: false
            })
        );
        assert_eq!(graph.se_access("CERN-DISK"), Some(SeAccess::default()));
    }

    #[tokio::test]
    async fn test_rebuild_replaces_graph() {
        let store = seeded_store().await;
        let graph = shared(FtsGraph::default());
        let refresher = GraphRefresher::new(
            store.clone(),
            graph.clone(),
            StorageRegistry::new(),
            GraphSettings::default(),
            GraphRefresherConfig::default(),
        );
        refresher.rebuild().await.unwrap();
        store
            .put_fts_site(&FtsSite::new("PIC", "https://fts.pic.es:8446").with_endpoint("PIC-DISK"))
            .await
            .unwrap();

        refresher.rebuild().await.unwrap();
        let graph = graph.read().await;
        assert_eq!(graph.sites().count(), 3);
        assert_eq!(graph.routes().count(), 9);
    }

    #[tokio::test]
    async fn test_rebuild_counts_unsubmitted_transfers() {
        let store = seeded_store().await;
        let fts_file = |lfn: &str| FtsFile {
            lfn: lfn.to_string(),
            size: 250,
            source_se: "CERN-DISK".into(),
            target_se: "RAL-DISK".into(),
            route: "CERN#RAL".into(),
            ..Default::default()
        };
        let mut op = Operation::new(types::REPLICATE_AND_REGISTER)
            .with_target_se("RAL-DISK")
            .with_file(File::new("/vo/a").with_size(250))
            .with_file(File::new("/vo/b").with_size(250));
        op.fts_files = vec![fts_file("/vo/a"), fts_file("/vo/b")];
        let mut request = Request::new("planned").with_operation(op);
        store.put_request(&mut request).await.unwrap();

        let graph = shared(FtsGraph::default());
        let refresher = GraphRefresher::new(
            store,
            graph.clone(),
            StorageRegistry::new(),
            GraphSettings::default(),
            GraphRefresherConfig::default(),
        );
        refresher.rebuild().await.unwrap();

        let graph = graph.read().await;
        let route = graph.route("CERN#RAL").unwrap();
        assert_eq!(route.waiting_files, 2.0);
        assert_eq!(route.waiting_size, 500.0);
        assert_eq!(graph.route("RAL#CERN").unwrap().waiting_files, 0.0);
    }

    #[tokio::test]
    async fn test_shutdown_handle() {
        let refresher = GraphRefresher::new(
            test_store().await,
            shared(FtsGraph::default()),
            StorageRegistry::new(),
            GraphSettings::default(),
            GraphRefresherConfig::default(),
        );
        let handle = refresher.shutdown_handle();
        handle.notify_one();
        tokio::time::timeout(Duration::from_secs(5), refresher.run())
            .await
            .unwrap();
    }
}
