// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gridmover Engine - Request Executor and FTS Agent
//!
//! A long-running service responsible for:
//! - Executing Waiting requests operation by operation
//! - Scheduling and submitting FTS transfers
//! - Monitoring FTS jobs until their files settle
//! - Removing old requests and recovering stale leases

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use gridmover_core::model::types;
use gridmover_core::{RequestClient, SqliteRequestStore};
use gridmover_engine::config::EngineConfig;
use gridmover_engine::fts::RestFtsClient;
use gridmover_engine::graph::{FtsGraph, shared};
use gridmover_engine::handlers::{HandlerRegistry, Services};
use gridmover_engine::runtime::EngineRuntime;
use gridmover_engine::scheduler::Scheduler;
use gridmover_engine::services::{
    CatalogSet, HttpRpcClient, InMemoryCatalog, LocalStorageElement, RpcCatalog, RpcClient,
    RpcJobNotifier, StorageRegistry,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridmover_engine=info,gridmover_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = EngineConfig::from_env()?;

    info!(
        database_url = %config.store.database_url,
        catalogs = ?config.catalogs,
        storage_elements = config.storage_roots.len(),
        rpc_gateway = config.rpc_gateway_url.is_some(),
        "Starting Gridmover Engine"
    );

    // Storage elements
    let mut storage = StorageRegistry::new();
    for (se, root) in &config.storage_roots {
        tokio::fs::create_dir_all(root).await?;
        storage.register(Arc::new(LocalStorageElement::new(se, root)));
    }

    // Catalogs, notifier and forwarded RPC all go through the gateway when one is set
    let rpc: Option<Arc<dyn RpcClient>> = match &config.rpc_gateway_url {
        Some(url) => Some(Arc::new(HttpRpcClient::new(url, RPC_TIMEOUT)?)),
        None => None,
    };
    let mut catalogs = CatalogSet::new();
    for name in &config.catalogs {
        catalogs = match &rpc {
            Some(rpc) => catalogs.with(Arc::new(RpcCatalog::new(name, rpc.clone()))),
            None => {
                warn!(catalog = %name, "No RPC gateway configured, using an in-memory catalog");
                catalogs.with(Arc::new(InMemoryCatalog::new(name)))
            }
        };
    }

    // Topology and handlers
    let graph = shared(FtsGraph::default());
    let scheduler = Arc::new(Scheduler::new(graph.clone(), config.scheduler.clone()));
    let services = Services {
        catalogs,
        storage: storage.clone(),
        scheduler,
        rpc: rpc.clone(),
    };
    let registry = HandlerRegistry::standard(services, config.handlers.clone());
    if !config.handlers.replicate_via_fts {
        info!(
            op_type = types::REPLICATE_AND_REGISTER,
            scratch_dir = %config.handlers.scratch_dir.display(),
            "Replication copies directly between storage elements"
        );
    }

    // Request store, validating against the registered operation types
    let store = SqliteRequestStore::connect(&config.store)
        .await?
        .with_validator(registry.validator());
    info!("Connected to request store");

    let mut client = RequestClient::new(Arc::new(store));
    if let Some(rpc) = &rpc {
        client = client.with_notifier(Arc::new(RpcJobNotifier::new(rpc.clone())));
    }

    let fts = RestFtsClient::new(config.fts.task_timeout)?;

    let runtime = EngineRuntime::builder()
        .client(client)
        .handlers(Arc::new(registry))
        .fts_client(Arc::new(fts))
        .graph(graph)
        .storage(storage)
        .engine_config(&config)
        .build()?
        .start()
        .await?;

    info!("Gridmover Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Gridmover Engine shut down");

    Ok(())
}
