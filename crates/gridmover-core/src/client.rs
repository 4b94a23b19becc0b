// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request store RPC surface.
//!
//! [`RequestClient`] is what clients, executors and agents talk to. It wraps
//! a [`RequestStore`] and the origin-job [`JobNotifier`], and adds the
//! serialised and digest forms of the store verbs.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::digest::digest;
use crate::error::{Result, StoreError};
use crate::model::{Request, RequestId};
use crate::notify::{JobNotifier, NoopNotifier};
use crate::persistence::{DbSummary, RequestStore};
use crate::serialization;

/// Collaborator object over the request store.
#[derive(Clone)]
pub struct RequestClient {
    store: Arc<dyn RequestStore>,
    notifier: Arc<dyn JobNotifier>,
}

impl RequestClient {
    /// Create a client that never notifies origin jobs.
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self {
            store,
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn JobNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Insert or update a request. IDs are written back into `request`.
    #[instrument(skip(self, request), fields(request_name = %request.request_name))]
    pub async fn put_request(&self, request: &mut Request) -> Result<RequestId> {
        self.store.put_request(request).await
    }

    /// Insert or update a request given in wire form.
    pub async fn put_serialized(&self, xml: &str) -> Result<RequestId> {
        let mut request = serialization::from_xml(xml)?;
        self.put_request(&mut request).await
    }

    /// Lease the next ready request.
    pub async fn get_request(&self) -> Result<Option<Request>> {
        self.store.get_next().await
    }

    pub async fn peek_request(&self, name: &str) -> Result<Option<Request>> {
        self.store.peek_by_name(name).await
    }

    /// Wire form of a stored request.
    pub async fn peek_serialized(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .peek_request(name)
            .await?
            .map(|request| serialization::to_xml(&request)))
    }

    #[instrument(skip(self))]
    pub async fn delete_request(&self, name: &str) -> Result<()> {
        self.store.delete_request(name).await?;
        info!("Request deleted");
        Ok(())
    }

    /// Commit the final state of a request and notify its origin job.
    ///
    /// The notification is sent only when the committed status is terminal and
    /// `job_id` is non-zero. A failed notification is reported as `Transient`
    /// after the request has been committed, so calling again is safe.
    #[instrument(skip(self, request), fields(request_name = %request.request_name))]
    pub async fn finalize_request(&self, request: &mut Request, job_id: i64) -> Result<()> {
        self.store.put_request(request).await?;

        if !request.is_terminal() || job_id == 0 {
            debug!(status = %request.status, "Request finalised without notification");
            return Ok(());
        }

        self.notifier
            .notify_terminal(job_id, &request.request_name, request.status)
            .await
            .map_err(|e| {
                warn!(job_id = job_id, error = %e, "Origin job notification failed");
                StoreError::transient("notify_job", e)
            })?;

        info!(job_id = job_id, status = %request.status, "Origin job notified");
        Ok(())
    }

    pub async fn get_db_summary(&self) -> Result<DbSummary> {
        self.store.summary().await
    }

    pub async fn get_request_names_for_jobs(
        &self,
        job_ids: &[i64],
    ) -> Result<BTreeMap<i64, Vec<String>>> {
        self.store.request_names_for_jobs(job_ids).await
    }

    /// Full requests keyed by origin job identifier.
    pub async fn read_requests_for_jobs(
        &self,
        job_ids: &[i64],
    ) -> Result<BTreeMap<i64, Vec<Request>>> {
        let mut out: BTreeMap<i64, Vec<Request>> = BTreeMap::new();
        for request in self.store.list_by_job_ids(job_ids).await? {
            out.entry(request.job_id).or_default().push(request);
        }
        Ok(out)
    }

    /// Human-readable digest of a stored request.
    pub async fn get_digest(&self, name: &str) -> Result<String> {
        let request = self
            .peek_request(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(digest(&request))
    }

    #[instrument(skip(self))]
    pub async fn cancel_request(&self, name: &str) -> Result<Request> {
        self.store.cancel_request(name).await
    }

    #[instrument(skip(self))]
    pub async fn reset_request(&self, name: &str) -> Result<Request> {
        self.store.reset_request(name).await
    }
}
