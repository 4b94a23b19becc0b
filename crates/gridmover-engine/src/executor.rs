// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request executor.
//!
//! Each cycle leases up to `requests_per_cycle` Waiting requests and runs them
//! on a bounded pool. A task processes exactly one operation of its request:
//!
//! 1. Skip the request if it was cancelled after the lease.
//! 2. Dispatch the current operation to its handler.
//! 3. Insert any follow-up operations right after it and recompute statuses.
//! 4. Commit. Terminal requests with an origin job are finalized, which
//!    notifies the job.
//!
//! A commit rejected with `Conflict` means the request was cancelled while it
//! was being processed; the result is discarded. A task that times out or
//! fails fatally hands its lease back so the request is picked up again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridmover_core::{Request, RequestClient, RequestId, RequestStatus, StoreError};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handlers::{HandlerContext, HandlerRegistry};

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Requests leased per cycle (default: 100).
    pub requests_per_cycle: usize,
    /// Lower bound of the pool (default: 2). Validated against `max_process` only.
    pub min_process: usize,
    /// Requests processed concurrently (default: 4).
    pub max_process: usize,
    /// Leased requests allowed to wait for a free slot (default: 20).
    pub queue_size: usize,
    /// Upper bound for draining the pool at the end of a cycle (default: 900 seconds).
    pub pool_timeout: Duration,
    /// Soft timeout for one request (default: 900 seconds).
    pub task_timeout: Duration,
    /// Wait between checks while the queue is full (default: 5 seconds).
    pub pool_sleep: Duration,
    /// Interval between cycles (default: 10 seconds).
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            requests_per_cycle: 100,
            min_process: 2,
            max_process: 4,
            queue_size: 20,
            pool_timeout: Duration::from_secs(900),
            task_timeout: Duration::from_secs(900),
            pool_sleep: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// What happened to one leased request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The new state was committed.
    Committed(RequestStatus),
    /// The request was cancelled; nothing was committed.
    Cancelled,
    /// The lease was handed back untouched.
    Reset,
}

/// Counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub leased: usize,
    pub committed: usize,
    pub cancelled: usize,
    pub reset: usize,
    /// Tasks that panicked or were aborted at the pool timeout.
    pub failed: usize,
}

impl ExecutionReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Committed(_) => self.committed += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
            TaskOutcome::Reset => self.reset += 1,
        }
    }
}

/// Leases requests and drives them through their handlers.
#[derive(Clone)]
pub struct Executor {
    client: RequestClient,
    handlers: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    in_flight: Arc<Mutex<HashSet<RequestId>>>,
    shutdown: Arc<Notify>,
}

impl Executor {
    pub fn new(client: RequestClient, handlers: Arc<HandlerRegistry>, config: ExecutorConfig) -> Self {
        Self {
            client,
            handlers,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Run cycles until shutdown.
    ///
    /// A shutdown signal stops leasing at once; requests already leased are
    /// drained before the loop exits.
    pub async fn run(&self) {
        info!(
            requests_per_cycle = self.config.requests_per_cycle,
            max_process = self.config.max_process,
            queue_size = self.config.queue_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            operation_types = ?self.handlers.op_types().collect::<Vec<_>>(),
            "Executor started"
        );

        let mut interval =
            tokio::time::interval(self.config.poll_interval.max(Duration::from_millis(100)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Executor received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.leased > 0 => {
                            info!(
                                leased = report.leased,
                                committed = report.committed,
                                cancelled = report.cancelled,
                                reset = report.reset,
                                failed = report.failed,
                                "Executor cycle completed"
                            );
                        }
                        Ok(_) => debug!("Executor cycle completed, nothing to do"),
                        Err(e) => error!(error = %e, "Executor cycle failed"),
                    }
                }
            }
        }

        info!("Executor stopped");
    }

    /// Lease and process one batch of requests.
    pub async fn run_cycle(&self) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        let permits = Arc::new(Semaphore::new(self.config.max_process.max(1)));
        let capacity = self.config.max_process.max(1) + self.config.queue_size;
        let mut set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut stopping = false;
        let mut lease_error = None;

        while report.leased < self.config.requests_per_cycle {
            if self.shutdown_requested().await {
                stopping = true;
                break;
            }
            while set.len() >= capacity {
                match tokio::time::timeout(self.config.pool_sleep, set.join_next()).await {
                    Ok(Some(joined)) => record_joined(&mut report, joined),
                    Ok(None) => break,
                    Err(_) => debug!(queued = set.len(), "Executor queue full, waiting"),
                }
            }

            let request = match self.client.get_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    lease_error = Some(e);
                    break;
                }
            };
            let Some(request_id) = request.request_id else {
                warn!(request_name = %request.request_name, "Leased request has no id, skipping");
                continue;
            };

            report.leased += 1;
            self.track(request_id);
            let executor = self.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = executor.execute(request).await;
                executor.untrack(request_id);
                outcome
            });
        }

        self.drain(&mut set, &mut report).await;
        self.reset_in_flight().await;

        if stopping {
            // Re-arm the signal for the run loop.
            self.shutdown.notify_one();
        }
        match lease_error {
            Some(e) if report.leased == 0 => Err(e.into()),
            Some(e) => {
                warn!(error = %e, "Leasing stopped early");
                Ok(report)
            }
            None => Ok(report),
        }
    }

    /// Process one leased request under the task timeout.
    pub async fn execute(&self, request: Request) -> TaskOutcome {
        let request_name = request.request_name.clone();
        let request_id = request.request_id;
        match tokio::time::timeout(self.config.task_timeout, self.process(request)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(request_name = %request_name, error = %e, "Request processing failed, handing lease back");
                self.reset(request_id).await;
                TaskOutcome::Reset
            }
            Err(_) => {
                warn!(
                    request_name = %request_name,
                    timeout_secs = self.config.task_timeout.as_secs(),
                    "Request processing timed out, handing lease back"
                );
                self.reset(request_id).await;
                TaskOutcome::Reset
            }
        }
    }

    async fn process(&self, mut request: Request) -> Result<TaskOutcome> {
        let request_id = request
            .request_id
            .ok_or_else(|| Error::Other("leased request has no id".to_string()))?;

        if self.client.store().request_status(request_id).await? == Some(RequestStatus::Cancelled) {
            info!(request_name = %request.request_name, "Request cancelled before processing, skipping");
            return Ok(TaskOutcome::Cancelled);
        }

        // Promote the first pending operation before looking for it.
        request.recompute();
        if let Some(index) = request.current_operation_index() {
            let ctx = HandlerContext::from_request(&request);
            let op = &mut request.operations[index];
            debug!(
                request_name = %ctx.request_name,
                op_type = %op.op_type,
                order = op.order,
                "Executing operation"
            );
            let follow_ups = self.handlers.dispatch(&ctx, op).await?;
            if !follow_ups.is_empty() {
                debug!(request_name = %ctx.request_name, count = follow_ups.len(), "Inserting follow-up operations");
                request.insert_operations_after(index, follow_ups);
            }
            request.recompute();
        }

        let job_id = request.job_id;
        let committed = if request.is_terminal() && job_id != 0 {
            self.client.finalize_request(&mut request, job_id).await
        } else {
            self.client.put_request(&mut request).await.map(|_| ())
        };

        match committed {
            Ok(()) => {
                if request.is_terminal() {
                    info!(request_name = %request.request_name, status = %request.status, "Request completed");
                }
                Ok(TaskOutcome::Committed(request.status))
            }
            Err(StoreError::Conflict(reason)) => {
                info!(request_name = %request.request_name, reason = %reason, "Request cancelled during processing, result discarded");
                Ok(TaskOutcome::Cancelled)
            }
            Err(StoreError::Transient { ref operation, ref details }) if operation == "notify_job" => {
                warn!(request_name = %request.request_name, job_id = job_id, error = %details, "Request committed but origin job not notified");
                Ok(TaskOutcome::Committed(request.status))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for every task, aborting the rest at the pool timeout.
    async fn drain(&self, set: &mut JoinSet<TaskOutcome>, report: &mut ExecutionReport) {
        let deadline = tokio::time::Instant::now() + self.config.pool_timeout;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(joined)) => record_joined(report, joined),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = set.len(),
                        timeout_secs = self.config.pool_timeout.as_secs(),
                        "Executor pool timed out, aborting remaining tasks"
                    );
                    set.abort_all();
                    while let Some(joined) = set.join_next().await {
                        if joined.is_err() {
                            report.failed += 1;
                        }
                    }
                    break;
                }
            }
        }
    }

    async fn shutdown_requested(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.notified() => true,
            _ = std::future::ready(()) => false,
        }
    }

    fn track(&self, request_id: RequestId) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id);
    }

    fn untrack(&self, request_id: RequestId) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
    }

    /// Hand back the leases of tasks that never finished.
    async fn reset_in_flight(&self) {
        let stranded: Vec<RequestId> = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for request_id in stranded {
            self.reset(Some(request_id)).await;
        }
    }

    async fn reset(&self, request_id: Option<RequestId>) {
        let Some(request_id) = request_id else {
            return;
        };
        match self.client.store().reset_assigned(request_id).await {
            Ok(true) => debug!(request_id = request_id, "Lease handed back"),
            Ok(false) => debug!(request_id = request_id, "Request no longer assigned"),
            Err(e) => error!(request_id = request_id, error = %e, "Failed to hand lease back"),
        }
    }
}

fn record_joined(
    report: &mut ExecutionReport,
    joined: std::result::Result<TaskOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok(outcome) => report.record(outcome),
        Err(e) => {
            report.failed += 1;
            error!("Executor task panicked: {}", e);
        }
    }
}
