//! Persistence interfaces and backends for gridmover-core.
//!
//! [`RequestStore`] is the system of record. Every method is transactional at
//! the row group of one request; no method retries on its own.

pub mod sqlite;

pub use self::sqlite::SqliteRequestStore;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::model::{FtsFile, FtsHistory, FtsJob, FtsSite, Request, RequestId, RequestStatus};

/// Default FTS history window.
pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(3600);

/// Counts grouped by kind and status, for health pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DbSummary {
    /// Request counts by status.
    pub requests: BTreeMap<String, i64>,
    /// Operation counts by type, then status.
    pub operations: BTreeMap<String, BTreeMap<String, i64>>,
    /// File counts by status.
    pub files: BTreeMap<String, i64>,
    /// FTS job counts by status.
    pub fts_jobs: BTreeMap<String, i64>,
}

/// Durable, transactional persistence of requests and FTS bookkeeping.
#[async_trait]
pub trait RequestStore: Send + Sync {
    // ========================================================================
    // Requests
    // ========================================================================

    /// Insert a new request or update an existing one in place.
    ///
    /// The request is validated and its statuses recomputed first. The whole
    /// tree (request, operations, files and new FTS files) is written in one
    /// transaction. On success the assigned IDs are written back into `request`.
    ///
    /// Fails with `Conflict` on a duplicate name or when the stored request
    /// has been cancelled, `Validation` when the request is invalid and
    /// `Transient` on backend errors.
    async fn put_request(&self, request: &mut Request) -> Result<RequestId>;

    /// Lease one Waiting request: flip it to Assigned and return it.
    async fn get_next(&self) -> Result<Option<Request>>;

    async fn peek_by_name(&self, name: &str) -> Result<Option<Request>>;

    async fn peek_by_id(&self, request_id: RequestId) -> Result<Option<Request>>;

    /// Stored status only, without loading the tree.
    async fn request_status(&self, request_id: RequestId) -> Result<Option<RequestStatus>>;

    /// Delete a terminal request and all its dependents.
    async fn delete_request(&self, name: &str) -> Result<()>;

    async fn list_by_job_ids(&self, job_ids: &[i64]) -> Result<Vec<Request>>;

    /// Request names keyed by origin job identifier.
    async fn request_names_for_jobs(&self, job_ids: &[i64]) -> Result<BTreeMap<i64, Vec<String>>>;

    async fn list_by_status(&self, status: RequestStatus, limit: i64) -> Result<Vec<Request>>;

    async fn summary(&self) -> Result<DbSummary>;

    /// Mark a non-terminal request and all its unfinished children Cancelled.
    async fn cancel_request(&self, name: &str) -> Result<Request>;

    /// Put Failed files (and Failed file-less operations) back to Waiting.
    async fn reset_request(&self, name: &str) -> Result<Request>;

    // ========================================================================
    // Leases and maintenance
    // ========================================================================

    /// Release one lease: Assigned back to Waiting. Returns whether a row changed.
    async fn reset_assigned(&self, request_id: RequestId) -> Result<bool>;

    /// Release every lease whose LastUpdate is older than `cutoff`.
    async fn reset_stale_assigned(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Names of Done requests whose LastUpdate is older than `cutoff`.
    async fn done_requests_older_than(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<String>>;

    /// Delete requests by name regardless of status. Returns the number deleted.
    async fn delete_requests(&self, names: &[String]) -> Result<u64>;

    // ========================================================================
    // FTS bookkeeping
    // ========================================================================

    /// FTS files in status Waiting belonging to live requests.
    async fn waiting_fts_files(&self, limit: i64) -> Result<Vec<FtsFile>>;

    /// Every FTS file scheduled for the given operation files.
    async fn fts_files_for_files(&self, file_ids: &[i64]) -> Result<Vec<FtsFile>>;

    async fn fts_files_for_job(&self, fts_job_id: i64) -> Result<Vec<FtsFile>>;

    /// Insert a job and bind `files` to it atomically. Returns the job ID.
    async fn insert_fts_job(&self, job: &mut FtsJob, files: &[FtsFile]) -> Result<i64>;

    /// Update a job and its files atomically.
    async fn update_fts_job(&self, job: &FtsJob, files: &[FtsFile]) -> Result<()>;

    /// Update FTS files that are not bound to a job, atomically.
    async fn update_fts_files(&self, files: &[FtsFile]) -> Result<()>;

    async fn get_fts_job(&self, fts_job_id: i64) -> Result<Option<FtsJob>>;

    /// Jobs that still need polling.
    async fn active_fts_jobs(&self, limit: i64) -> Result<Vec<FtsJob>>;

    /// In-flight job counts keyed by (SourceSE, TargetSE).
    async fn count_active_jobs_per_route(&self) -> Result<HashMap<(String, String), u32>>;

    /// FTS history aggregation over the trailing `window`.
    async fn fts_history(&self, window: Duration) -> Result<Vec<FtsHistory>>;

    async fn fts_sites(&self) -> Result<Vec<FtsSite>>;

    /// Insert or replace a site and its endpoints.
    async fn put_fts_site(&self, site: &FtsSite) -> Result<()>;
}
