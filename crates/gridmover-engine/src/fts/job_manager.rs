// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FTS job manager.
//!
//! Two periodic cycles share one bounded worker pool:
//!
//! - **Submission** turns Waiting FTS files into jobs, one job per chunk of
//!   files sharing a (SourceSE, TargetSE) pair, capped per pair by the number
//!   of jobs already in flight.
//! - **Monitoring** polls every non-final job and, once the job is over,
//!   settles each of its files: Finished, requeued for another submission, or
//!   permanently Failed.
//!
//! Every task runs under a soft timeout. A timed-out task is dropped and its
//! records stay eligible for the next cycle.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use gridmover_core::{FtsFile, FtsFileStatus, FtsJob, FtsJobStatus, RequestStore};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::classify::FailureClassifier;
use super::client::{ChecksumMode, FtsClient, FtsError, RemoteJobState, SubmitRequest, TransferPair};
use crate::error::{Error, Result};
use crate::graph::SharedGraph;

/// Configuration for the FTS job manager.
#[derive(Debug, Clone)]
pub struct FtsJobManagerConfig {
    /// Interval between submission cycles (default: 60 seconds).
    pub submit_interval: Duration,
    /// Interval between monitoring cycles (default: 120 seconds).
    pub monitor_interval: Duration,
    /// Lower bound of the worker pool (default: 1).
    pub min_workers: usize,
    /// Upper bound of the worker pool (default: 10).
    pub max_workers: usize,
    /// Soft timeout of one task (default: 300 seconds).
    pub task_timeout: Duration,
    /// Submissions allowed per FTS file before its failure is permanent (default: 4).
    pub max_attempts: u32,
    /// In-flight jobs allowed per (SourceSE, TargetSE) pair (default: 10).
    pub max_jobs_per_channel: u32,
    pub checksum_mode: ChecksumMode,
    /// Rows read per cycle (default: 500).
    pub batch_limit: i64,
    /// Files per submitted job (default: 100).
    pub max_files_per_job: usize,
}

impl Default for FtsJobManagerConfig {
    fn default() -> Self {
        Self {
            submit_interval: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(120),
            min_workers: 1,
            max_workers: 10,
            task_timeout: Duration::from_secs(300),
            max_attempts: 4,
            max_jobs_per_channel: 10,
            checksum_mode: ChecksumMode::default(),
            batch_limit: 500,
            max_files_per_job: 100,
        }
    }
}

/// Outcome counts of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Tasks that completed.
    pub completed: usize,
    /// Tasks that returned an error or timed out.
    pub failed: usize,
    /// FTS files settled without a task (failed ancestors, missing SURLs).
    pub settled: usize,
}

/// Removes a job from the in-progress set when dropped.
struct InProgress {
    set: Arc<Mutex<HashSet<i64>>>,
    job_id: i64,
}

impl InProgress {
    fn claim(set: &Arc<Mutex<HashSet<i64>>>, job_id: i64) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(job_id).then(|| Self {
            set: set.clone(),
            job_id,
        })
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.job_id);
    }
}

/// Moves FTS files into jobs and drives jobs to a final status.
#[derive(Clone)]
pub struct FtsJobManager {
    store: Arc<dyn RequestStore>,
    client: Arc<dyn FtsClient>,
    graph: SharedGraph,
    classifier: Arc<FailureClassifier>,
    config: FtsJobManagerConfig,
    in_progress: Arc<Mutex<HashSet<i64>>>,
    shutdown: Arc<Notify>,
}

impl FtsJobManager {
    pub fn new(
        store: Arc<dyn RequestStore>,
        client: Arc<dyn FtsClient>,
        graph: SharedGraph,
        config: FtsJobManagerConfig,
    ) -> Self {
        Self {
            store,
            client,
            graph,
            classifier: Arc::new(FailureClassifier::default()),
            config,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run both cycles until shutdown.
    pub async fn run(&self) {
        info!(
            submit_interval_secs = self.config.submit_interval.as_secs(),
            monitor_interval_secs = self.config.monitor_interval.as_secs(),
            max_workers = self.config.max_workers,
            max_jobs_per_channel = self.config.max_jobs_per_channel,
            "FTS job manager started"
        );

        let floor = Duration::from_millis(100);
        let mut submit = tokio::time::interval(self.config.submit_interval.max(floor));
        let mut monitor = tokio::time::interval(self.config.monitor_interval.max(floor));
        submit.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("FTS job manager received shutdown signal");
                    break;
                }

                _ = monitor.tick() => {
                    if let Err(e) = self.run_monitor_cycle().await {
                        error!(error = %e, "FTS monitoring cycle failed");
                    }
                }

                _ = submit.tick() => {
                    if let Err(e) = self.run_submit_cycle().await {
                        error!(error = %e, "FTS submission cycle failed");
                    }
                }
            }
        }

        info!("FTS job manager stopped");
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submit every eligible Waiting FTS file.
    pub async fn run_submit_cycle(&self) -> Result<CycleReport> {
        let waiting = self.store.waiting_fts_files(self.config.batch_limit).await?;
        if waiting.is_empty() {
            return Ok(CycleReport::default());
        }

        let (ready, mut settled) = self.gate_on_ancestors(waiting).await?;

        let mut groups: BTreeMap<(String, String), Vec<FtsFile>> = BTreeMap::new();
        for mut file in ready {
            if file.source_surl.is_none() || file.target_surl.is_none() {
                file.status = FtsFileStatus::Failed;
                file.error = Some("transfer has no source or target URL".to_string());
                settled.push(file);
                continue;
            }
            groups
                .entry((file.source_se.clone(), file.target_se.clone()))
                .or_default()
                .push(file);
        }

        let mut report = CycleReport {
            settled: settled.len(),
            ..Default::default()
        };
        self.store.update_fts_files(&settled).await?;

        let active = self.store.count_active_jobs_per_route().await?;
        let mut tasks = Vec::new();
        for ((source_se, target_se), files) in groups {
            let Some(server) = self.submission_server(&source_se, &target_se).await else {
                continue;
            };

            let in_flight = active
                .get(&(source_se.clone(), target_se.clone()))
                .copied()
                .unwrap_or(0);
            let free = self.config.max_jobs_per_channel.saturating_sub(in_flight) as usize;
            if free == 0 {
                debug!(
                    source_se = %source_se,
                    target_se = %target_se,
                    in_flight = in_flight,
                    "Channel full, deferring submission"
                );
                continue;
            }

            for chunk in files
                .chunks(self.config.max_files_per_job.max(1))
                .take(free)
            {
                let this = self.clone();
                let server = server.clone();
                let (source_se, target_se) = (source_se.clone(), target_se.clone());
                let chunk = chunk.to_vec();
                tasks.push(async move { this.submit_job(server, source_se, target_se, chunk).await });
            }
        }

        // Only the remote submit call is timed; see `submit_job`.
        let (completed, failed) = self.run_tasks("submit", tasks, None).await;
        report.completed = completed;
        report.failed = failed;
        if completed + failed > 0 || report.settled > 0 {
            info!(
                jobs = completed,
                failed = failed,
                settled = report.settled,
                "FTS submission cycle complete"
            );
        }
        Ok(report)
    }

    /// Split Waiting files into those ready to go and those whose ancestor failed.
    ///
    /// A file with an ancestor waits until the transfer of the same file on the
    /// ancestor route is Finished.
    async fn gate_on_ancestors(&self, waiting: Vec<FtsFile>) -> Result<(Vec<FtsFile>, Vec<FtsFile>)> {
        let file_ids: Vec<i64> = waiting
            .iter()
            .filter(|f| f.has_ancestor())
            .filter_map(|f| f.file_id)
            .collect();
        let siblings = self.store.fts_files_for_files(&file_ids).await?;

        let mut ready = Vec::with_capacity(waiting.len());
        let mut settled = Vec::new();
        for mut file in waiting {
            let Some(ancestor) = file.ancestor.clone().filter(|a| !a.is_empty()) else {
                ready.push(file);
                continue;
            };
            let parent = siblings
                .iter()
                .find(|s| s.file_id == file.file_id && s.route == ancestor);
            match parent.map(|p| p.status) {
                Some(FtsFileStatus::Finished) => ready.push(file),
                Some(FtsFileStatus::Failed) | Some(FtsFileStatus::Canceled) | None => {
                    file.status = FtsFileStatus::Failed;
                    file.error = Some(format!("ancestor transfer on route {ancestor} did not finish"));
                    settled.push(file);
                }
                Some(_) => {}
            }
        }
        Ok((ready, settled))
    }

    /// FTS server for a pair, or `None` when the pair must not be submitted now.
    async fn submission_server(&self, source_se: &str, target_se: &str) -> Option<String> {
        let graph = self.graph.read().await;
        let (Some(source), Some(target)) = (graph.se_access(source_se), graph.se_access(target_se))
        else {
            warn!(
                source_se = %source_se,
                target_se = %target_se,
                "Storage element missing from the FTS topology, skipping"
            );
            return None;
        };
        if !source.read || !target.write {
            info!(
                source_se = %source_se,
                target_se = %target_se,
                source_read = source.read,
                target_write = target.write,
                "Endpoint banned, skipping submission"
            );
            return None;
        }
        graph.site_of(target_se).map(|site| site.fts_server.clone())
    }

    async fn submit_job(
        &self,
        server: String,
        source_se: String,
        target_se: String,
        mut files: Vec<FtsFile>,
    ) -> Result<()> {
        let request = SubmitRequest {
            submission_id: Uuid::new_v4(),
            pairs: files.iter().map(|f| self.transfer_pair(f)).collect(),
            checksum_mode: self.config.checksum_mode,
        };

        let submitted =
            tokio::time::timeout(self.config.task_timeout, self.client.submit(&server, &request))
                .await
                .unwrap_or_else(|_| {
                    Err(FtsError::Transport(format!(
                        "submission timed out after {}s",
                        self.config.task_timeout.as_secs()
                    )))
                });
        let guid = submitted.map_err(|e| {
            warn!(
                source_se = %source_se,
                target_se = %target_se,
                files = files.len(),
                error = %e,
                "FTS submission failed, files stay Waiting"
            );
            Error::from(e)
        })?;

        let now = Utc::now();
        let mut job = FtsJob {
            fts_guid: Some(guid.clone()),
            fts_server: server.clone(),
            source_se,
            target_se,
            size: files.iter().map(|f| f.size).sum(),
            files: files.len() as u32,
            status: FtsJobStatus::Submitted,
            creation_time: Some(now),
            submit_time: Some(now),
            ..Default::default()
        };
        for file in &mut files {
            file.status = FtsFileStatus::Submitted;
            file.fts_guid = Some(guid.clone());
            file.error = None;
        }

        match self.store.insert_fts_job(&mut job, &files).await {
            Ok(job_id) => {
                info!(
                    fts_job_id = job_id,
                    fts_guid = %guid,
                    server = %server,
                    files = files.len(),
                    "FTS job submitted"
                );
                Ok(())
            }
            Err(e) => {
                // Nothing records the remote job; withdraw it so the files can be resubmitted.
                if let Err(cancel_err) = self.client.cancel(&server, &guid).await {
                    warn!(fts_guid = %guid, error = %cancel_err, "Failed to cancel unrecorded FTS job");
                }
                Err(e.into())
            }
        }
    }

    fn transfer_pair(&self, file: &FtsFile) -> TransferPair {
        let checksum = match (self.config.checksum_mode, &file.checksum) {
            (ChecksumMode::None, _) | (_, None) => None,
            (_, Some(value)) if file.checksum_type == gridmover_core::ChecksumType::None => {
                debug!(lfn = %file.lfn, value = %value, "Checksum without algorithm not verified");
                None
            }
            (_, Some(value)) => Some(format!("{}:{}", file.checksum_type, value)),
        };
        TransferPair {
            source_surl: file.source_surl.clone().unwrap_or_default(),
            target_surl: file.target_surl.clone().unwrap_or_default(),
            size: file.size,
            checksum,
        }
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Poll every non-final job once.
    pub async fn run_monitor_cycle(&self) -> Result<CycleReport> {
        let jobs = self.store.active_fts_jobs(self.config.batch_limit).await?;
        if jobs.is_empty() {
            return Ok(CycleReport::default());
        }
        let tasks = jobs
            .into_iter()
            .map(|job| {
                let this = self.clone();
                async move { this.monitor_job(job).await }
            })
            .collect();
        let (completed, failed) = self
            .run_tasks("monitor", tasks, Some(self.config.task_timeout))
            .await;
        debug!(jobs = completed + failed, failed = failed, "FTS monitoring cycle complete");
        Ok(CycleReport {
            completed,
            failed,
            settled: 0,
        })
    }

    /// Poll one job and settle its files if it is over.
    pub async fn monitor_job(&self, mut job: FtsJob) -> Result<()> {
        let Some(job_id) = job.fts_job_id else {
            return Err(Error::Other("FTS job has no identifier".to_string()));
        };
        let Some(_claim) = InProgress::claim(&self.in_progress, job_id) else {
            debug!(fts_job_id = job_id, "FTS job already being processed");
            return Ok(());
        };

        let state = match &job.fts_guid {
            Some(guid) => self.client.status(&job.fts_server, guid).await,
            None => Err(FtsError::UnknownJob(format!("job {job_id} has no GUID"))),
        };
        let state = match state {
            Ok(state) => state,
            Err(e) if e.is_unknown_job() => return self.expire_job(job).await,
            Err(e) => {
                warn!(fts_job_id = job_id, error = %e, "FTS status poll failed");
                return Err(e.into());
            }
        };

        let mut files = self.store.fts_files_for_job(job_id).await?;
        job.status = state.status;
        job.completeness = state.completeness;

        if !state.status.is_final() {
            for file in &mut files {
                if let Some(remote) = state.file(file.target_surl.as_deref().unwrap_or_default())
                    && !remote.status.is_final()
                {
                    file.status = remote.status;
                }
            }
            self.store.update_fts_job(&job, &files).await?;
            debug!(fts_job_id = job_id, status = %job.status, completeness = job.completeness, "FTS job progressing");
            return Ok(());
        }

        self.settle_files(&job, &state, &mut files);
        let failed: Vec<&FtsFile> = files
            .iter()
            .filter(|f| f.status != FtsFileStatus::Finished)
            .collect();
        job.failed_files = failed.len() as u32;
        job.failed_size = failed.iter().map(|f| f.size).sum();
        self.store.update_fts_job(&job, &files).await?;

        info!(
            fts_job_id = job_id,
            status = %job.status,
            files = files.len(),
            failed_files = job.failed_files,
            "FTS job finished"
        );
        Ok(())
    }

    fn settle_files(&self, job: &FtsJob, state: &RemoteJobState, files: &mut [FtsFile]) {
        for file in files.iter_mut() {
            let remote = state.file(file.target_surl.as_deref().unwrap_or_default());
            let (status, reason) = match remote {
                Some(remote) => (remote.status, remote.reason.clone()),
                None => (FtsFileStatus::Failed, Some("file missing from FTS report".to_string())),
            };
            match status {
                FtsFileStatus::Finished => {
                    file.status = FtsFileStatus::Finished;
                    file.error = None;
                }
                FtsFileStatus::Canceled if job.status == FtsJobStatus::Cancelled => {
                    file.status = FtsFileStatus::Canceled;
                    file.error = reason.or_else(|| Some("FTS job cancelled".to_string()));
                }
                _ => {
                    let reason = reason.unwrap_or_else(|| format!("transfer ended {status}"));
                    if self.classifier.is_source_missing(&reason) {
                        debug!(lfn = %file.lfn, reason = %reason, "Source missing, not retrying");
                        file.status = FtsFileStatus::Failed;
                        file.error = Some(reason);
                    } else if file.attempt + 1 < self.config.max_attempts {
                        file.requeue(Some(reason));
                    } else {
                        file.status = FtsFileStatus::Failed;
                        file.error = Some(format!(
                            "{reason} (giving up after {} attempts)",
                            file.attempt + 1
                        ));
                    }
                }
            }
        }
    }

    /// The server no longer knows the job: requeue every file and fail the job.
    async fn expire_job(&self, mut job: FtsJob) -> Result<()> {
        let job_id = job.fts_job_id.unwrap_or_default();
        let mut files = self.store.fts_files_for_job(job_id).await?;
        let guid = job.fts_guid.clone().unwrap_or_default();
        for file in &mut files {
            file.requeue(Some(format!("FTS job {guid} expired")));
        }
        job.status = FtsJobStatus::Failed;
        job.error = Some("job unknown to the FTS server".to_string());
        self.store.update_fts_job(&job, &files).await?;
        warn!(fts_job_id = job_id, fts_guid = %guid, files = files.len(), "FTS job expired, files requeued");
        Ok(())
    }

    /// Cancel a job at the server. Returns false when it was already over.
    pub async fn cancel_job(&self, job_id: i64) -> Result<bool> {
        let mut job = self
            .store
            .get_fts_job(job_id)
            .await?
            .ok_or_else(|| Error::Other(format!("FTS job {job_id} not found")))?;
        if job.status.is_final() {
            return Ok(false);
        }
        let Some(_claim) = InProgress::claim(&self.in_progress, job_id) else {
            return Err(Error::Other(format!("FTS job {job_id} is being processed")));
        };

        if let Some(guid) = &job.fts_guid {
            match self.client.cancel(&job.fts_server, guid).await {
                Ok(()) => {}
                Err(e) if e.is_unknown_job() => {
                    debug!(fts_job_id = job_id, "FTS job already gone at the server");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut files = self.store.fts_files_for_job(job_id).await?;
        for file in &mut files {
            if !file.status.is_final() {
                file.status = FtsFileStatus::Canceled;
                file.error = Some("FTS job cancelled".to_string());
            }
        }
        job.status = FtsJobStatus::Cancelled;
        self.store.update_fts_job(&job, &files).await?;
        info!(fts_job_id = job_id, files = files.len(), "FTS job cancelled");
        Ok(true)
    }

    // ========================================================================
    // Worker pool
    // ========================================================================

    async fn run_tasks<F>(
        &self,
        kind: &'static str,
        tasks: Vec<F>,
        timeout: Option<Duration>,
    ) -> (usize, usize)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut set = JoinSet::new();
        for task in tasks {
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, task).await,
                    None => Ok(task.await),
                }
            });
        }

        let (mut completed, mut failed) = (0, 0);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(Ok(()))) => completed += 1,
                Ok(Ok(Err(e))) => {
                    failed += 1;
                    debug!(task = kind, error = %e, "FTS task failed");
                }
                Ok(Err(_)) => {
                    failed += 1;
                    warn!(
                        task = kind,
                        timeout_secs = timeout.map_or(0, |limit| limit.as_secs()),
                        "FTS task timed out, record left for the next cycle"
                    );
                }
                Err(e) => {
                    failed += 1;
                    error!(task = kind, "FTS task panicked: {}", e);
                }
            }
        }
        (completed, failed)
    }
}
