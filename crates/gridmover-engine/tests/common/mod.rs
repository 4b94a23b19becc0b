// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for gridmover-engine integration tests.
//!
//! Provides [`TestContext`]: an in-memory request store, a two-site topology
//! (CERN, RAL) plus a PIC endpoint FTS does not know, in-memory catalog and
//! storage elements, and the standard handlers wired over them.

#![allow(dead_code)]

use std::sync::Arc;

use gridmover_core::config::StoreConfig;
use gridmover_core::notify::MockNotifier;
use gridmover_core::{FtsSite, Request, RequestClient, RequestStore, SqliteRequestStore};
use gridmover_engine::executor::{Executor, ExecutorConfig};
use gridmover_engine::fts::{FtsJobManager, FtsJobManagerConfig, MockFtsClient};
use gridmover_engine::graph::{FtsGraph, GraphSettings, SharedGraph, shared};
use gridmover_engine::handlers::{HandlerConfig, HandlerRegistry, Services};
use gridmover_engine::scheduler::{Scheduler, SchedulerConfig};
use gridmover_engine::services::{
    CatalogSet, InMemoryCatalog, InMemoryStorageElement, StorageRegistry,
};

/// Open a fresh in-memory store.
pub async fn memory_store() -> Arc<SqliteRequestStore> {
    let store = SqliteRequestStore::connect(&StoreConfig {
        database_url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .expect("Failed to open in-memory store");
    Arc::new(store)
}

pub fn topology() -> Vec<FtsSite> {
    vec![
        FtsSite::new("CERN", "https://fts.cern.ch:8446").with_endpoint("CERN-DISK"),
        FtsSite::new("RAL", "https://fts.ral.ac.uk:8446").with_endpoint("RAL-DISK"),
    ]
}

/// Everything one engine needs, backed by in-memory collaborators.
pub struct TestContext {
    pub store: Arc<SqliteRequestStore>,
    pub client: RequestClient,
    pub notifier: MockNotifier,
    pub catalog: InMemoryCatalog,
    pub cern: InMemoryStorageElement,
    pub ral: InMemoryStorageElement,
    pub pic: InMemoryStorageElement,
    pub graph: SharedGraph,
    pub registry: Arc<HandlerRegistry>,
    pub fts: MockFtsClient,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_handler_config(HandlerConfig::default()).await
    }

    pub async fn with_handler_config(config: HandlerConfig) -> Self {
        let catalog = InMemoryCatalog::new("FileCatalog");
        let cern = InMemoryStorageElement::new("CERN-DISK");
        let ral = InMemoryStorageElement::new("RAL-DISK");
        let pic = InMemoryStorageElement::new("PIC-DISK");
        let graph = shared(FtsGraph::build(&topology(), &[], &GraphSettings::default()));

        let services = Services {
            catalogs: CatalogSet::new().with(Arc::new(catalog.clone())),
            storage: StorageRegistry::new()
                .with(Arc::new(cern.clone()))
                .with(Arc::new(ral.clone()))
                .with(Arc::new(pic.clone())),
            scheduler: Arc::new(Scheduler::new(graph.clone(), SchedulerConfig::default())),
            rpc: None,
        };
        let registry = HandlerRegistry::standard(services, config);

        let store = memory_store().await;
        for site in topology() {
            store.put_fts_site(&site).await.expect("Failed to store site");
        }
        let notifier = MockNotifier::new();
        let client = RequestClient::new(store.clone()).with_notifier(Arc::new(notifier.clone()));

        Self {
            store,
            client,
            notifier,
            catalog,
            cern,
            ral,
            pic,
            graph,
            registry: Arc::new(registry),
            fts: MockFtsClient::new(),
        }
    }

    /// Executor over this context with a custom registry.
    pub fn executor_with(&self, registry: HandlerRegistry, config: ExecutorConfig) -> Executor {
        Executor::new(self.client.clone(), Arc::new(registry), config)
    }

    pub fn executor(&self) -> Executor {
        Executor::new(
            self.client.clone(),
            self.registry.clone(),
            ExecutorConfig::default(),
        )
    }

    pub fn job_manager(&self) -> FtsJobManager {
        FtsJobManager::new(
            self.store.clone(),
            Arc::new(self.fts.clone()),
            self.graph.clone(),
            FtsJobManagerConfig::default(),
        )
    }

    /// Store a request and return its identifier.
    pub async fn submit(&self, mut request: Request) -> i64 {
        self.client
            .put_request(&mut request)
            .await
            .expect("Failed to put request")
    }

    pub async fn peek(&self, name: &str) -> Request {
        self.client
            .peek_request(name)
            .await
            .expect("Failed to peek request")
            .expect("Request not found")
    }
}
