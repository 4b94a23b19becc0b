// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for gridmover-engine.
//!
//! [`EngineRuntime`] runs the background workers of one engine inside an
//! existing tokio application:
//! - the request executor
//! - the cleaner
//! - the FTS job manager (submission and monitoring)
//! - the graph refresher
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gridmover_core::RequestClient;
//! use gridmover_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = EngineRuntime::builder()
//!         .client(RequestClient::new(store))
//!         .handlers(Arc::new(registry))
//!         .fts_client(Arc::new(fts))
//!         .graph(graph)
//!         .storage(storage)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use gridmover_core::RequestClient;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cleaner::{Cleaner, CleanerConfig};
use crate::config::EngineConfig;
use crate::executor::{Executor, ExecutorConfig};
use crate::fts::{FailureClassifier, FtsClient, FtsJobManager, FtsJobManagerConfig};
use crate::graph::{GraphSettings, SharedGraph};
use crate::graph_refresher::{GraphRefresher, GraphRefresherConfig};
use crate::handlers::HandlerRegistry;
use crate::services::StorageRegistry;

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    client: Option<RequestClient>,
    handlers: Option<Arc<HandlerRegistry>>,
    fts_client: Option<Arc<dyn FtsClient>>,
    graph: Option<SharedGraph>,
    storage: StorageRegistry,
    classifier: Option<FailureClassifier>,
    executor_config: ExecutorConfig,
    cleaner_config: CleanerConfig,
    fts_config: FtsJobManagerConfig,
    refresher_config: GraphRefresherConfig,
    graph_settings: GraphSettings,
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request client (required). Its notifier is used on finalisation.
    pub fn client(mut self, client: RequestClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the handler registry (required).
    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Set the FTS client (required).
    pub fn fts_client(mut self, client: Arc<dyn FtsClient>) -> Self {
        self.fts_client = Some(client);
        self
    }

    /// Set the shared transfer graph (required). The scheduler inside the
    /// handlers must use the same graph.
    pub fn graph(mut self, graph: SharedGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Set the storage drivers queried for access flags.
    ///
    /// Default: empty, flags come from the store only.
    pub fn storage(mut self, storage: StorageRegistry) -> Self {
        self.storage = storage;
        self
    }

    /// Override the FTS failure classifier.
    pub fn classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn cleaner_config(mut self, config: CleanerConfig) -> Self {
        self.cleaner_config = config;
        self
    }

    pub fn fts_config(mut self, config: FtsJobManagerConfig) -> Self {
        self.fts_config = config;
        self
    }

    pub fn refresher_config(mut self, config: GraphRefresherConfig) -> Self {
        self.refresher_config = config;
        self
    }

    pub fn graph_settings(mut self, settings: GraphSettings) -> Self {
        self.graph_settings = settings;
        self
    }

    /// Take every worker configuration from an [`EngineConfig`].
    pub fn engine_config(self, config: &EngineConfig) -> Self {
        self.executor_config(config.executor.clone())
            .cleaner_config(config.cleaner.clone())
            .fts_config(config.fts.clone())
            .refresher_config(config.refresher.clone())
            .graph_settings(config.graph.clone())
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let client = self
            .client
            .ok_or_else(|| anyhow::anyhow!("client is required"))?;
        let handlers = self
            .handlers
            .ok_or_else(|| anyhow::anyhow!("handlers is required"))?;
        let fts_client = self
            .fts_client
            .ok_or_else(|| anyhow::anyhow!("fts_client is required"))?;
        let graph = self
            .graph
            .ok_or_else(|| anyhow::anyhow!("graph is required"))?;

        Ok(EngineRuntimeConfig {
            client,
            handlers,
            fts_client,
            graph,
            storage: self.storage,
            classifier: self.classifier,
            executor_config: self.executor_config,
            cleaner_config: self.cleaner_config,
            fts_config: self.fts_config,
            refresher_config: self.refresher_config,
            graph_settings: self.graph_settings,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    client: RequestClient,
    handlers: Arc<HandlerRegistry>,
    fts_client: Arc<dyn FtsClient>,
    graph: SharedGraph,
    storage: StorageRegistry,
    classifier: Option<FailureClassifier>,
    executor_config: ExecutorConfig,
    cleaner_config: CleanerConfig,
    fts_config: FtsJobManagerConfig,
    refresher_config: GraphRefresherConfig,
    graph_settings: GraphSettings,
}

impl EngineRuntimeConfig {
    /// Load the graph once, then spawn every worker.
    pub async fn start(self) -> Result<EngineRuntime> {
        let store = self.client.store().clone();

        let refresher = GraphRefresher::new(
            store.clone(),
            self.graph.clone(),
            self.storage,
            self.graph_settings,
            self.refresher_config,
        );
        // The executor may schedule right away; give it a topology first.
        if let Err(e) = refresher.rebuild().await {
            warn!(error = %e, "Initial graph build failed, starting with an empty graph");
        }
        let refresher_shutdown = refresher.shutdown_handle();
        let refresher_handle = tokio::spawn(async move {
            refresher.run().await;
        });

        let mut job_manager = FtsJobManager::new(
            store.clone(),
            self.fts_client,
            self.graph,
            self.fts_config,
        );
        if let Some(classifier) = self.classifier {
            job_manager = job_manager.with_classifier(classifier);
        }
        let fts_shutdown = job_manager.shutdown_handle();
        let fts_handle = tokio::spawn(async move {
            job_manager.run().await;
        });

        let cleaner = Cleaner::new(store, self.cleaner_config);
        let cleaner_shutdown = cleaner.shutdown_handle();
        let cleaner_handle = tokio::spawn(async move {
            cleaner.run().await;
        });

        let executor = Executor::new(self.client, self.handlers.clone(), self.executor_config);
        let executor_shutdown = executor.shutdown_handle();
        let executor_handle = tokio::spawn(async move {
            executor.run().await;
        });

        info!(
            op_types = ?self.handlers.op_types().collect::<Vec<_>>(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            handlers: self.handlers,
            executor_handle,
            cleaner_handle,
            fts_handle,
            refresher_handle,
            executor_shutdown,
            cleaner_shutdown,
            fts_shutdown,
            refresher_shutdown,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    handlers: Arc<HandlerRegistry>,
    executor_handle: JoinHandle<()>,
    cleaner_handle: JoinHandle<()>,
    fts_handle: JoinHandle<()>,
    refresher_handle: JoinHandle<()>,
    executor_shutdown: Arc<Notify>,
    cleaner_shutdown: Arc<Notify>,
    fts_shutdown: Arc<Notify>,
    refresher_shutdown: Arc<Notify>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Handler registry, for counters.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Check if every worker is still running.
    pub fn is_running(&self) -> bool {
        !self.executor_handle.is_finished()
            && !self.cleaner_handle.is_finished()
            && !self.fts_handle.is_finished()
            && !self.refresher_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// The executor finishes or hands back its in-flight requests before
    /// this returns.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.executor_shutdown.notify_one();
        self.cleaner_shutdown.notify_one();
        self.fts_shutdown.notify_one();
        self.refresher_shutdown.notify_one();

        if let Err(e) = self.executor_handle.await {
            error!("Executor task panicked: {}", e);
        }
        if let Err(e) = self.cleaner_handle.await {
            error!("Cleaner task panicked: {}", e);
        }
        if let Err(e) = self.fts_handle.await {
            error!("FTS job manager task panicked: {}", e);
        }
        if let Err(e) = self.refresher_handle.await {
            error!("Graph refresher task panicked: {}", e);
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fts::MockFtsClient;
    use crate::graph::{FtsGraph, shared};
    use gridmover_core::SqliteRequestStore;
    use gridmover_core::config::StoreConfig;
    use std::time::Duration;

    #[test]
    fn test_build_requires_client() {
        let err = EngineRuntime::builder()
            .handlers(Arc::new(HandlerRegistry::new()))
            .fts_client(Arc::new(MockFtsClient::new()))
            .graph(shared(FtsGraph::default()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("client is required"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(
            SqliteRequestStore::connect(&StoreConfig {
                database_url: "sqlite::memory:".to_string(),
                max_connections: 1,
            })
            .await
            .unwrap(),
        );
        let runtime = EngineRuntime::builder()
            .client(RequestClient::new(store))
            .handlers(Arc::new(HandlerRegistry::new()))
            .fts_client(Arc::new(MockFtsClient::new()))
            .graph(shared(FtsGraph::default()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        tokio::time::timeout(Duration::from_secs(10), runtime.shutdown())
            .await
            .unwrap()
            .unwrap();
    }
}
