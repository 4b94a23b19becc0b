// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Origin-job notification.
//!
//! When a request carrying a non-zero job identifier reaches a terminal state,
//! finalisation notifies the origin job system through a [`JobNotifier`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::model::RequestStatus;

/// Notification failure.
#[derive(Debug, thiserror::Error)]
#[error("job notification failed: {0}")]
pub struct NotifyError(pub String);

/// Seam to the origin job system.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    /// Report that the request bound to `job_id` finished with `status`.
    async fn notify_terminal(
        &self,
        job_id: i64,
        request_name: &str,
        status: RequestStatus,
    ) -> Result<(), NotifyError>;
}

/// Notifier that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl JobNotifier for NoopNotifier {
    async fn notify_terminal(
        &self,
        _job_id: i64,
        _request_name: &str,
        _status: RequestStatus,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub job_id: i64,
    pub request_name: String,
    pub status: RequestStatus,
}

/// Notifier that records every call, for tests.
#[derive(Debug, Default, Clone)]
pub struct MockNotifier {
    calls: Arc<Mutex<Vec<Notification>>>,
    /// If true, every call fails.
    pub fail: bool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a notifier whose calls always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Notifications received so far.
    pub async fn calls(&self) -> Vec<Notification> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl JobNotifier for MockNotifier {
    async fn notify_terminal(
        &self,
        job_id: i64,
        request_name: &str,
        status: RequestStatus,
    ) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError("mock notifier configured to fail".into()));
        }
        self.calls.lock().await.push(Notification {
            job_id,
            request_name: request_name.to_string(),
            status,
        });
        Ok(())
    }
}
