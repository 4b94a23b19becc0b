// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Site descriptions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Read/write enablement of one storage endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeAccess {
    pub read: bool,
    pub write: bool,
}

impl Default for SeAccess {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

/// A site hosting one or more storage endpoints, served by one FTS server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FtsSite {
    pub name: String,
    pub fts_server: String,
    pub endpoints: BTreeMap<String, SeAccess>,
}

impl FtsSite {
    pub fn new(name: impl Into<String>, fts_server: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fts_server: fts_server.into(),
            endpoints: BTreeMap::new(),
        }
    }

    /// Add an endpoint with full access.
    pub fn with_endpoint(mut self, se: impl Into<String>) -> Self {
        self.endpoints.insert(se.into(), SeAccess::default());
        self
    }

    /// Add an endpoint with explicit access flags.
    pub fn with_endpoint_access(mut self, se: impl Into<String>, read: bool, write: bool) -> Self {
        self.endpoints.insert(se.into(), SeAccess { read, write });
        self
    }
}
