// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process FTS service for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use gridmover_core::{FtsFileStatus, FtsJobStatus};
use tokio::sync::Mutex;

use super::client::{FtsClient, FtsError, RemoteFileState, RemoteJobState, SubmitRequest};

#[derive(Debug, Clone)]
struct MockJob {
    server: String,
    request: SubmitRequest,
    state: RemoteJobState,
    expired: bool,
}

/// Mock FTS service. Jobs stay Submitted until a test finishes or expires them.
#[derive(Debug, Clone, Default)]
pub struct MockFtsClient {
    jobs: Arc<Mutex<HashMap<String, MockJob>>>,
    order: Arc<Mutex<Vec<String>>>,
    fail_submits: Arc<AtomicU32>,
}

impl MockFtsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` submissions with a transport error.
    pub fn fail_next_submits(&self, n: u32) {
        self.fail_submits.store(n, Ordering::SeqCst);
    }

    /// Finish a job. Target SURLs listed in `failures` fail with the given reason.
    pub async fn finish_job(&self, guid: &str, failures: &[(&str, &str)]) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(guid) {
            let files = job
                .state
                .files
                .iter()
                .map(|f| {
                    let failure = failures.iter().find(|(surl, _)| *surl == f.target_surl);
                    RemoteFileState {
                        status: if failure.is_some() {
                            FtsFileStatus::Failed
                        } else {
                            FtsFileStatus::Finished
                        },
                        reason: failure.map(|(_, reason)| reason.to_string()),
                        ..f.clone()
                    }
                })
                .collect::<Vec<_>>();
            let status = if failures.is_empty() {
                FtsJobStatus::Finished
            } else {
                FtsJobStatus::FinishedDirty
            };
            job.state = RemoteJobState::from_files(status, files);
        }
    }

    /// Make the server forget a job.
    pub async fn expire_job(&self, guid: &str) {
        if let Some(job) = self.jobs.lock().await.get_mut(guid) {
            job.expired = true;
        }
    }

    /// Every submission received, oldest first.
    pub async fn submitted(&self) -> Vec<(String, SubmitRequest)> {
        let jobs = self.jobs.lock().await;
        self.order
            .lock()
            .await
            .iter()
            .filter_map(|guid| jobs.get(guid))
            .map(|job| (job.server.clone(), job.request.clone()))
            .collect()
    }

    /// GUIDs of every submitted job, oldest first.
    pub async fn job_guids(&self) -> Vec<String> {
        self.order.lock().await.clone()
    }
}

#[async_trait]
impl FtsClient for MockFtsClient {
    async fn submit(&self, server: &str, request: &SubmitRequest) -> Result<String, FtsError> {
        let pending = self.fail_submits.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_submits.store(pending - 1, Ordering::SeqCst);
            return Err(FtsError::Transport("mock submission failure".into()));
        }

        let guid = uuid::Uuid::new_v4().to_string();
        let files = request
            .pairs
            .iter()
            .map(|pair| RemoteFileState {
                source_surl: pair.source_surl.clone(),
                target_surl: pair.target_surl.clone(),
                status: FtsFileStatus::Submitted,
                reason: None,
            })
            .collect();
        let job = MockJob {
            server: server.to_string(),
            request: request.clone(),
            state: RemoteJobState::from_files(FtsJobStatus::Submitted, files),
            expired: false,
        };
        self.jobs.lock().await.insert(guid.clone(), job);
        self.order.lock().await.push(guid.clone());
        Ok(guid)
    }

    async fn status(&self, _server: &str, guid: &str) -> Result<RemoteJobState, FtsError> {
        match self.jobs.lock().await.get(guid) {
            Some(job) if !job.expired => Ok(job.state.clone()),
            _ => Err(FtsError::UnknownJob(guid.to_string())),
        }
    }

    async fn cancel(&self, _server: &str, guid: &str) -> Result<(), FtsError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(guid)
            .filter(|job| !job.expired)
            .ok_or_else(|| FtsError::UnknownJob(guid.to_string()))?;
        let files = job
            .state
            .files
            .iter()
            .map(|f| RemoteFileState {
                status: if f.status.is_final() {
                    f.status
                } else {
                    FtsFileStatus::Canceled
                },
                ..f.clone()
            })
            .collect();
        job.state = RemoteJobState::from_files(FtsJobStatus::Cancelled, files);
        Ok(())
    }
}
