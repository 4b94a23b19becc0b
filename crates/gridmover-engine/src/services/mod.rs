// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External collaborators: storage elements, file catalogs and the RPC gateway.

pub mod catalog;
pub mod local_storage;
pub mod memory;
pub mod rpc;
pub mod storage;

pub use catalog::{Catalog, CatalogError, CatalogSet, ReplicaEntry};
pub use local_storage::LocalStorageElement;
pub use memory::{InMemoryCatalog, InMemoryStorageElement};
pub use rpc::{HttpRpcClient, MockRpcClient, RpcCatalog, RpcClient, RpcError, RpcJobNotifier};
pub use storage::{StorageElement, StorageError, StorageRegistry, StoredFile};
