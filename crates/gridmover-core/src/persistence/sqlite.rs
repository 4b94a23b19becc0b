//! SQLite-backed request store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use rand::seq::SliceRandom;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::migrations::SQLITE as MIGRATOR;
use crate::model::{
    File, FtsFile, FtsHistory, FtsJob, FtsJobStatus, FtsSite, Operation, OperationStatus, Request,
    RequestId, RequestStatus, SeAccess, FileStatus, state,
};
use crate::validation::Validator;

use super::{DbSummary, RequestStore};

/// How many of the oldest Waiting requests `get_next` considers.
const GET_NEXT_CANDIDATES: i64 = 10;

const REQUEST_COLUMNS: &str = "request_id, request_name, owner_dn, owner_group, job_id, setup, \
     source_component, status, error, creation_time, submit_time, last_update";

const FTS_FILE_COLUMNS: &str = "f.fts_file_id, f.request_id, f.operation_id, f.file_id, f.lfn, \
     f.size, f.checksum, f.checksum_type, f.source_se, f.source_surl, f.target_se, f.target_surl, \
     f.route, f.ancestor, f.attempt, f.fts_guid, f.fts_job_id, f.status, f.error, \
     f.creation_time, f.last_update";

const FTS_JOB_COLUMNS: &str = "fts_job_id, fts_guid, fts_server, source_se, target_se, size, \
     files, failed_files, failed_size, completeness, status, error, creation_time, submit_time, \
     last_update";

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

fn parse_column<T: FromStr>(value: &str, column: &'static str) -> Result<T> {
    value
        .parse()
        .map_err(|_| StoreError::transient("decode", format!("invalid {column} '{value}'")))
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    request_id: i64,
    request_name: String,
    owner_dn: Option<String>,
    owner_group: Option<String>,
    job_id: i64,
    setup: Option<String>,
    source_component: Option<String>,
    status: String,
    error: Option<String>,
    creation_time: DateTime<Utc>,
    submit_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

impl RequestRow {
    fn into_request(self) -> Result<Request> {
        Ok(Request {
            request_id: Some(self.request_id),
            request_name: self.request_name,
            owner_dn: self.owner_dn,
            owner_group: self.owner_group,
            job_id: self.job_id,
            setup: self.setup,
            source_component: self.source_component,
            status: parse_column(&self.status, "request status")?,
            error: self.error,
            creation_time: Some(self.creation_time),
            submit_time: Some(self.submit_time),
            last_update: Some(self.last_update),
            operations: Vec::new(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    operation_id: i64,
    op_order: i64,
    op_type: String,
    arguments: Option<Vec<u8>>,
    source_se: Option<String>,
    target_se: Option<String>,
    catalog: Option<String>,
    status: String,
    error: Option<String>,
    creation_time: DateTime<Utc>,
    submit_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

impl OperationRow {
    fn into_operation(self) -> Result<Operation> {
        Ok(Operation {
            operation_id: Some(self.operation_id),
            order: self.op_order.max(0) as u32,
            op_type: self.op_type,
            arguments: self.arguments,
            source_se: self.source_se,
            target_se: self.target_se,
            catalog: self.catalog,
            status: parse_column(&self.status, "operation status")?,
            error: self.error,
            creation_time: Some(self.creation_time),
            submit_time: Some(self.submit_time),
            last_update: Some(self.last_update),
            files: Vec::new(),
            fts_files: Vec::new(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FileRow {
    file_id: i64,
    operation_id: i64,
    lfn: String,
    pfn: Option<String>,
    size: i64,
    checksum: Option<String>,
    checksum_type: String,
    guid: Option<String>,
    status: String,
    error: Option<String>,
    attempt: i64,
}

impl FileRow {
    fn into_file(self) -> Result<File> {
        Ok(File {
            file_id: Some(self.file_id),
            lfn: self.lfn,
            pfn: self.pfn,
            size: non_negative(self.size),
            checksum: self.checksum,
            checksum_type: parse_column(&self.checksum_type, "checksum type")?,
            guid: self.guid,
            status: parse_column(&self.status, "file status")?,
            error: self.error,
            attempt: self.attempt.max(0) as u32,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FtsFileRow {
    fts_file_id: i64,
    request_id: i64,
    operation_id: i64,
    file_id: i64,
    lfn: String,
    size: i64,
    checksum: Option<String>,
    checksum_type: String,
    source_se: String,
    source_surl: Option<String>,
    target_se: String,
    target_surl: Option<String>,
    route: String,
    ancestor: Option<String>,
    attempt: i64,
    fts_guid: Option<String>,
    fts_job_id: Option<i64>,
    status: String,
    error: Option<String>,
    creation_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
}

impl FtsFileRow {
    fn into_fts_file(self) -> Result<FtsFile> {
        Ok(FtsFile {
            fts_file_id: Some(self.fts_file_id),
            request_id: Some(self.request_id),
            operation_id: Some(self.operation_id),
            file_id: Some(self.file_id),
            lfn: self.lfn,
            size: non_negative(self.size),
            checksum: self.checksum,
            checksum_type: parse_column(&self.checksum_type, "checksum type")?,
            source_se: self.source_se,
            source_surl: self.source_surl,
            target_se: self.target_se,
            target_surl: self.target_surl,
            route: self.route,
            ancestor: self.ancestor,
            attempt: self.attempt.max(0) as u32,
            fts_guid: self.fts_guid,
            fts_job_id: self.fts_job_id,
            status: parse_column(&self.status, "fts file status")?,
            error: self.error,
            creation_time: Some(self.creation_time),
            last_update: Some(self.last_update),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FtsJobRow {
    fts_job_id: i64,
    fts_guid: Option<String>,
    fts_server: String,
    source_se: String,
    target_se: String,
    size: i64,
    files: i64,
    failed_files: i64,
    failed_size: i64,
    completeness: f64,
    status: String,
    error: Option<String>,
    creation_time: DateTime<Utc>,
    submit_time: Option<DateTime<Utc>>,
    last_update: DateTime<Utc>,
}

impl FtsJobRow {
    fn into_job(self) -> Result<FtsJob> {
        Ok(FtsJob {
            fts_job_id: Some(self.fts_job_id),
            fts_guid: self.fts_guid,
            fts_server: self.fts_server,
            source_se: self.source_se,
            target_se: self.target_se,
            size: non_negative(self.size),
            files: self.files.max(0) as u32,
            failed_files: self.failed_files.max(0) as u32,
            failed_size: non_negative(self.failed_size),
            completeness: self.completeness,
            status: parse_column(&self.status, "fts job status")?,
            error: self.error,
            creation_time: Some(self.creation_time),
            submit_time: self.submit_time,
            last_update: Some(self.last_update),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    source_se: String,
    target_se: String,
    status: String,
    jobs: i64,
    files: i64,
    failed_files: i64,
    size: i64,
    failed_size: i64,
    completeness: f64,
}

// ============================================================================
// Store
// ============================================================================

/// SQLite-backed request store.
#[derive(Clone)]
pub struct SqliteRequestStore {
    pool: SqlitePool,
    validator: Validator,
}

impl SqliteRequestStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            validator: Validator::default(),
        }
    }

    /// Replace the put-time validator.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::transient(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&StoreConfig {
            database_url: url,
            max_connections: 5,
        })
        .await
    }

    /// Connect using a store configuration and run migrations.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| StoreError::transient("connect", e))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| {
                StoreError::transient(
                    "connect",
                    format!("Failed to connect to {}: {}", config.database_url, e),
                )
            })?;

        MIGRATOR.run(&pool).await?;

        info!(database_url = %config.database_url, "Request store connected");
        Ok(Self::new(pool))
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn request_row_by_name(&self, name: &str) -> Result<Option<RequestRow>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE request_name = ?");
        Ok(sqlx::query_as::<_, RequestRow>(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Load a request with its whole tree inside one read transaction.
    async fn load(&self, row: Option<RequestRow>) -> Result<Option<Request>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut tx = self.pool.begin().await?;
        let request = load_tree(&mut tx, row).await?;
        tx.commit().await?;
        Ok(Some(request))
    }

    async fn load_all(&self, rows: Vec<RequestRow>) -> Result<Vec<Request>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(request) = self.load(Some(row)).await? {
                out.push(request);
            }
        }
        Ok(out)
    }
}

async fn load_tree(conn: &mut SqliteConnection, row: RequestRow) -> Result<Request> {
    let request_id = row.request_id;
    let mut request = row.into_request()?;

    let op_rows = sqlx::query_as::<_, OperationRow>(
        r#"
        SELECT operation_id, op_order, op_type, arguments, source_se, target_se, catalog,
               status, error, creation_time, submit_time, last_update
        FROM operations
        WHERE request_id = ?
        ORDER BY op_order
        "#,
    )
    .bind(request_id)
    .fetch_all(&mut *conn)
    .await?;

    let file_rows = sqlx::query_as::<_, FileRow>(
        r#"
        SELECT f.file_id, f.operation_id, f.lfn, f.pfn, f.size, f.checksum, f.checksum_type,
               f.guid, f.status, f.error, f.attempt
        FROM files f
        JOIN operations o ON o.operation_id = f.operation_id
        WHERE o.request_id = ?
        ORDER BY f.operation_id, f.position
        "#,
    )
    .bind(request_id)
    .fetch_all(&mut *conn)
    .await?;

    let fts_sql = format!(
        "SELECT {FTS_FILE_COLUMNS} FROM fts_files f WHERE f.request_id = ? ORDER BY f.fts_file_id"
    );
    let fts_rows = sqlx::query_as::<_, FtsFileRow>(&fts_sql)
        .bind(request_id)
        .fetch_all(&mut *conn)
        .await?;

    let mut files: HashMap<i64, Vec<File>> = HashMap::new();
    for row in file_rows {
        let operation_id = row.operation_id;
        files.entry(operation_id).or_default().push(row.into_file()?);
    }
    let mut fts_files: HashMap<i64, Vec<FtsFile>> = HashMap::new();
    for row in fts_rows {
        let operation_id = row.operation_id;
        fts_files
            .entry(operation_id)
            .or_default()
            .push(row.into_fts_file()?);
    }

    for row in op_rows {
        let mut op = row.into_operation()?;
        if let Some(id) = op.operation_id {
            op.files = files.remove(&id).unwrap_or_default();
            op.fts_files = fts_files.remove(&id).unwrap_or_default();
        }
        request.operations.push(op);
    }
    Ok(request)
}

async fn write_fts_file_state(
    conn: &mut SqliteConnection,
    file: &FtsFile,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(fts_file_id) = file.fts_file_id else {
        return Err(StoreError::validation(
            "FtsFile.FTSFileID",
            "FTS file has not been persisted",
        ));
    };
    sqlx::query(
        r#"
        UPDATE fts_files
        SET status = ?, fts_guid = ?, fts_job_id = ?, attempt = ?, error = ?,
            source_surl = ?, target_surl = ?, last_update = ?
        WHERE fts_file_id = ?
        "#,
    )
    .bind(file.status.as_ref())
    .bind(file.fts_guid.as_deref())
    .bind(file.fts_job_id)
    .bind(file.attempt as i64)
    .bind(file.error.as_deref())
    .bind(file.source_surl.as_deref())
    .bind(file.target_surl.as_deref())
    .bind(now)
    .bind(fts_file_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl RequestStore for SqliteRequestStore {
    async fn put_request(&self, request: &mut Request) -> Result<RequestId> {
        request.renumber();
        request.recompute();
        self.validator.validate(request)?;

        let now = now();
        let creation_time = request.creation_time.unwrap_or(now);
        let submit_time = request.submit_time.unwrap_or(now);

        let mut tx = self.pool.begin().await?;

        let request_id = match request.request_id {
            None => {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO requests (request_name, owner_dn, owner_group, job_id, setup,
                                          source_component, status, error, creation_time,
                                          submit_time, last_update)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING request_id
                    "#,
                )
                .bind(&request.request_name)
                .bind(request.owner_dn.as_deref())
                .bind(request.owner_group.as_deref())
                .bind(request.job_id)
                .bind(request.setup.as_deref())
                .bind(request.source_component.as_deref())
                .bind(request.status.as_ref())
                .bind(request.error.as_deref())
                .bind(creation_time)
                .bind(submit_time)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| match StoreError::from(e) {
                    StoreError::Conflict(_) => StoreError::Conflict(format!(
                        "request name '{}' already exists",
                        request.request_name
                    )),
                    other => other,
                })?
            }
            Some(id) => {
                let stored: Option<String> =
                    sqlx::query_scalar("SELECT status FROM requests WHERE request_id = ?")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?;
                let Some(stored) = stored else {
                    return Err(StoreError::NotFound(request.request_name.clone()));
                };
                let stored: RequestStatus = parse_column(&stored, "request status")?;
                if stored == RequestStatus::Cancelled && request.status != RequestStatus::Cancelled
                {
                    return Err(StoreError::Conflict(format!(
                        "request '{}' has been cancelled",
                        request.request_name
                    )));
                }

                sqlx::query(
                    r#"
                    UPDATE requests
                    SET request_name = ?, owner_dn = ?, owner_group = ?, job_id = ?, setup = ?,
                        source_component = ?, status = ?, error = ?, creation_time = ?,
                        submit_time = ?, last_update = ?
                    WHERE request_id = ?
                    "#,
                )
                .bind(&request.request_name)
                .bind(request.owner_dn.as_deref())
                .bind(request.owner_group.as_deref())
                .bind(request.job_id)
                .bind(request.setup.as_deref())
                .bind(request.source_component.as_deref())
                .bind(request.status.as_ref())
                .bind(request.error.as_deref())
                .bind(creation_time)
                .bind(submit_time)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                id
            }
        };

        // Operations: park existing orders below zero so positions can move freely.
        sqlx::query("UPDATE operations SET op_order = -op_order WHERE request_id = ?")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;

        let mut operation_ids = Vec::with_capacity(request.operations.len());
        for op in &request.operations {
            let op_id: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO operations (operation_id, request_id, op_order, op_type, arguments,
                                        source_se, target_se, catalog, status, error,
                                        creation_time, submit_time, last_update)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(operation_id) DO UPDATE SET
                    op_order = excluded.op_order,
                    op_type = excluded.op_type,
                    arguments = excluded.arguments,
                    source_se = excluded.source_se,
                    target_se = excluded.target_se,
                    catalog = excluded.catalog,
                    status = excluded.status,
                    error = excluded.error,
                    last_update = excluded.last_update
                WHERE operations.request_id = excluded.request_id
                RETURNING operation_id
                "#,
            )
            .bind(op.operation_id)
            .bind(request_id)
            .bind(op.order as i64)
            .bind(&op.op_type)
            .bind(op.arguments.as_deref())
            .bind(op.source_se.as_deref())
            .bind(op.target_se.as_deref())
            .bind(op.catalog.as_deref())
            .bind(op.status.as_ref())
            .bind(op.error.as_deref())
            .bind(op.creation_time.unwrap_or(now))
            .bind(op.submit_time.unwrap_or(now))
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
            let op_id = op_id.ok_or_else(|| {
                StoreError::Conflict(format!(
                    "operation {:?} does not belong to request '{}'",
                    op.operation_id, request.request_name
                ))
            })?;
            operation_ids.push(op_id);
        }

        sqlx::query("DELETE FROM operations WHERE request_id = ? AND op_order < 0")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;

        // Files: same scheme with positions.
        sqlx::query(
            r#"
            UPDATE files SET position = -1
            WHERE operation_id IN (SELECT operation_id FROM operations WHERE request_id = ?)
            "#,
        )
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        let mut file_ids: Vec<Vec<i64>> = Vec::with_capacity(request.operations.len());
        for (op, &op_id) in request.operations.iter().zip(&operation_ids) {
            let mut ids = Vec::with_capacity(op.files.len());
            for (position, file) in op.files.iter().enumerate() {
                let file_id: Option<i64> = sqlx::query_scalar(
                    r#"
                    INSERT INTO files (file_id, operation_id, position, lfn, pfn, size, checksum,
                                       checksum_type, guid, status, error, attempt)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(file_id) DO UPDATE SET
                        position = excluded.position,
                        lfn = excluded.lfn,
                        pfn = excluded.pfn,
                        size = excluded.size,
                        checksum = excluded.checksum,
                        checksum_type = excluded.checksum_type,
                        guid = excluded.guid,
                        status = excluded.status,
                        error = excluded.error,
                        attempt = excluded.attempt
                    WHERE files.operation_id = excluded.operation_id
                    RETURNING file_id
                    "#,
                )
                .bind(file.file_id)
                .bind(op_id)
                .bind(position as i64)
                .bind(&file.lfn)
                .bind(file.pfn.as_deref())
                .bind(file.size as i64)
                .bind(file.checksum.as_deref())
                .bind(file.checksum_type.as_ref())
                .bind(file.guid.as_deref())
                .bind(file.status.as_ref())
                .bind(file.error.as_deref())
                .bind(file.attempt as i64)
                .fetch_optional(&mut *tx)
                .await?;
                ids.push(file_id.ok_or_else(|| {
                    StoreError::Conflict(format!(
                        "file {:?} does not belong to operation {}",
                        file.file_id, op_id
                    ))
                })?);
            }
            file_ids.push(ids);
        }

        sqlx::query(
            r#"
            DELETE FROM files
            WHERE position < 0
              AND operation_id IN (SELECT operation_id FROM operations WHERE request_id = ?)
            "#,
        )
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        // FTS files: only new ones are written here. Persisted rows belong to the
        // FTS job manager from then on.
        let mut fts_ids: Vec<Vec<Option<(i64, i64)>>> = Vec::with_capacity(request.operations.len());
        for ((op, &op_id), ids) in request
            .operations
            .iter()
            .zip(&operation_ids)
            .zip(&file_ids)
        {
            let mut assigned = Vec::with_capacity(op.fts_files.len());
            for fts in &op.fts_files {
                if fts.fts_file_id.is_some() {
                    assigned.push(None);
                    continue;
                }
                let file_id = op
                    .files
                    .iter()
                    .zip(ids)
                    .find(|(file, id)| {
                        fts.file_id == Some(**id) || (fts.file_id.is_none() && file.lfn == fts.lfn)
                    })
                    .map(|(_, id)| *id)
                    .ok_or_else(|| {
                        StoreError::validation(
                            format!("Operation[{}].FtsFile", op.order),
                            format!("no operation file matches '{}'", fts.lfn),
                        )
                    })?;

                let fts_file_id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO fts_files (request_id, operation_id, file_id, lfn, size, checksum,
                                           checksum_type, source_se, source_surl, target_se,
                                           target_surl, route, ancestor, attempt, fts_guid,
                                           fts_job_id, status, error, creation_time, last_update)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING fts_file_id
                    "#,
                )
                .bind(request_id)
                .bind(op_id)
                .bind(file_id)
                .bind(&fts.lfn)
                .bind(fts.size as i64)
                .bind(fts.checksum.as_deref())
                .bind(fts.checksum_type.as_ref())
                .bind(&fts.source_se)
                .bind(fts.source_surl.as_deref())
                .bind(&fts.target_se)
                .bind(fts.target_surl.as_deref())
                .bind(&fts.route)
                .bind(fts.ancestor.as_deref())
                .bind(fts.attempt as i64)
                .bind(fts.fts_guid.as_deref())
                .bind(fts.fts_job_id)
                .bind(fts.status.as_ref())
                .bind(fts.error.as_deref())
                .bind(now)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                assigned.push(Some((fts_file_id, file_id)));
            }
            fts_ids.push(assigned);
        }

        tx.commit().await?;

        // Write identities back only once the transaction is durable.
        request.request_id = Some(request_id);
        request.creation_time = Some(creation_time);
        request.submit_time = Some(submit_time);
        request.last_update = Some(now);
        for (((op, op_id), ids), fts_assigned) in request
            .operations
            .iter_mut()
            .zip(operation_ids)
            .zip(file_ids)
            .zip(fts_ids)
        {
            op.operation_id = Some(op_id);
            op.creation_time.get_or_insert(now);
            op.submit_time.get_or_insert(now);
            op.last_update = Some(now);
            for (file, id) in op.files.iter_mut().zip(ids) {
                file.file_id = Some(id);
            }
            for (fts, assigned) in op.fts_files.iter_mut().zip(fts_assigned) {
                if let Some((fts_file_id, file_id)) = assigned {
                    fts.fts_file_id = Some(fts_file_id);
                    fts.file_id = Some(file_id);
                    fts.operation_id = Some(op_id);
                    fts.request_id = Some(request_id);
                    fts.creation_time = Some(now);
                    fts.last_update = Some(now);
                }
            }
        }

        debug!(
            request_id = request_id,
            request_name = %request.request_name,
            status = %request.status,
            "Request stored"
        );
        Ok(request_id)
    }

    async fn get_next(&self) -> Result<Option<Request>> {
        let mut candidates = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            r#"
            SELECT request_id, last_update
            FROM requests
            WHERE status = 'Waiting'
            ORDER BY last_update ASC
            LIMIT ?
            "#,
        )
        .bind(GET_NEXT_CANDIDATES)
        .fetch_all(&self.pool)
        .await?;

        // Random order among equal LastUpdate, oldest first overall.
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by_key(|(_, last_update)| *last_update);

        for (request_id, _) in candidates {
            let claimed = sqlx::query(
                r#"
                UPDATE requests
                SET status = 'Assigned', last_update = ?
                WHERE request_id = ? AND status = 'Waiting'
                "#,
            )
            .bind(now())
            .bind(request_id)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                debug!(request_id = request_id, "Request leased");
                return self.peek_by_id(request_id).await;
            }
        }
        Ok(None)
    }

    async fn peek_by_name(&self, name: &str) -> Result<Option<Request>> {
        let row = self.request_row_by_name(name).await?;
        self.load(row).await
    }

    async fn peek_by_id(&self, request_id: RequestId) -> Result<Option<Request>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE request_id = ?");
        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        self.load(row).await
    }

    async fn request_status(&self, request_id: RequestId) -> Result<Option<RequestStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM requests WHERE request_id = ?")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;
        status
            .map(|s| parse_column(&s, "request status"))
            .transpose()
    }

    async fn delete_request(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM requests WHERE request_name = ?")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(status) = status else {
            return Err(StoreError::NotFound(name.to_string()));
        };
        let status: RequestStatus = parse_column(&status, "request status")?;
        if !status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "request '{name}' is {status}; only terminal requests can be deleted"
            )));
        }
        sqlx::query("DELETE FROM requests WHERE request_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_by_job_ids(&self, job_ids: &[i64]) -> Result<Vec<Request>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE job_id IN ("
        ));
        let mut separated = qb.separated(", ");
        for id in job_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY request_id");
        let rows: Vec<RequestRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        self.load_all(rows).await
    }

    async fn request_names_for_jobs(&self, job_ids: &[i64]) -> Result<BTreeMap<i64, Vec<String>>> {
        let mut out: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        if job_ids.is_empty() {
            return Ok(out);
        }
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT job_id, request_name FROM requests WHERE job_id IN (");
        let mut separated = qb.separated(", ");
        for id in job_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY request_id");
        let rows: Vec<(i64, String)> = qb.build_query_as().fetch_all(&self.pool).await?;
        for (job_id, name) in rows {
            out.entry(job_id).or_default().push(name);
        }
        Ok(out)
    }

    async fn list_by_status(&self, status: RequestStatus, limit: i64) -> Result<Vec<Request>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE status = ? ORDER BY last_update LIMIT ?"
        );
        let rows = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(status.as_ref())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        self.load_all(rows).await
    }

    async fn summary(&self) -> Result<DbSummary> {
        let mut summary = DbSummary::default();

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM requests GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        summary.requests = rows.into_iter().collect();

        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT op_type, status, COUNT(*) FROM operations GROUP BY op_type, status")
                .fetch_all(&self.pool)
                .await?;
        for (op_type, status, count) in rows {
            summary
                .operations
                .entry(op_type)
                .or_default()
                .insert(status, count);
        }

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM files GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        summary.files = rows.into_iter().collect();

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM fts_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        summary.fts_jobs = rows.into_iter().collect();

        Ok(summary)
    }

    async fn cancel_request(&self, name: &str) -> Result<Request> {
        let mut request = self
            .peek_by_name(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if request.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "request '{name}' is already {}",
                request.status
            )));
        }
        state::cancel(&mut request);
        self.put_request(&mut request).await?;
        info!(request_name = %name, "Request cancelled");
        Ok(request)
    }

    async fn reset_request(&self, name: &str) -> Result<Request> {
        let mut request = self
            .peek_by_name(name)
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if request.status == RequestStatus::Cancelled {
            return Err(StoreError::Conflict(format!(
                "request '{name}' is cancelled and cannot be reset"
            )));
        }
        for op in &mut request.operations {
            if matches!(
                op.status,
                OperationStatus::Failed | OperationStatus::Cancelled
            ) {
                op.status = OperationStatus::Queued;
                op.error = None;
                for file in &mut op.files {
                    if matches!(file.status, FileStatus::Failed | FileStatus::Cancelled) {
                        file.status = FileStatus::Waiting;
                        file.error = None;
                        file.attempt = 0;
                    }
                }
            }
        }
        request.status = RequestStatus::Waiting;
        request.error = None;
        self.put_request(&mut request).await?;
        info!(request_name = %name, status = %request.status, "Request reset");
        Ok(request)
    }

    async fn reset_assigned(&self, request_id: RequestId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE requests SET status = 'Waiting', last_update = ?
            WHERE request_id = ? AND status = 'Assigned'
            "#,
        )
        .bind(now())
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_stale_assigned(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE requests SET status = 'Waiting', last_update = ?
            WHERE status = 'Assigned' AND last_update < ?
            "#,
        )
        .bind(now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn done_requests_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT request_name FROM requests
            WHERE status = 'Done' AND last_update < ?
            ORDER BY last_update
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_requests(&self, names: &[String]) -> Result<u64> {
        if names.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM requests WHERE request_name IN (");
        let mut separated = qb.separated(", ");
        for name in names {
            separated.push_bind(name.as_str());
        }
        separated.push_unseparated(")");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn waiting_fts_files(&self, limit: i64) -> Result<Vec<FtsFile>> {
        let sql = format!(
            r#"
            SELECT {FTS_FILE_COLUMNS}
            FROM fts_files f
            JOIN requests r ON r.request_id = f.request_id
            WHERE f.status = 'Waiting' AND r.status != 'Cancelled'
            ORDER BY f.fts_file_id
            LIMIT ?
            "#
        );
        let rows = sqlx::query_as::<_, FtsFileRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(FtsFileRow::into_fts_file).collect()
    }

    async fn fts_files_for_files(&self, file_ids: &[i64]) -> Result<Vec<FtsFile>> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {FTS_FILE_COLUMNS} FROM fts_files f WHERE f.file_id IN ("
        ));
        let mut separated = qb.separated(", ");
        for id in file_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY f.fts_file_id");
        let rows: Vec<FtsFileRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(FtsFileRow::into_fts_file).collect()
    }

    async fn fts_files_for_job(&self, fts_job_id: i64) -> Result<Vec<FtsFile>> {
        let sql = format!(
            "SELECT {FTS_FILE_COLUMNS} FROM fts_files f WHERE f.fts_job_id = ? ORDER BY f.fts_file_id"
        );
        let rows = sqlx::query_as::<_, FtsFileRow>(&sql)
            .bind(fts_job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(FtsFileRow::into_fts_file).collect()
    }

    async fn insert_fts_job(&self, job: &mut FtsJob, files: &[FtsFile]) -> Result<i64> {
        let now = now();
        let mut tx = self.pool.begin().await?;

        let fts_job_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO fts_jobs (fts_guid, fts_server, source_se, target_se, size, files,
                                  failed_files, failed_size, completeness, status, error,
                                  creation_time, submit_time, last_update)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING fts_job_id
            "#,
        )
        .bind(job.fts_guid.as_deref())
        .bind(&job.fts_server)
        .bind(&job.source_se)
        .bind(&job.target_se)
        .bind(job.size as i64)
        .bind(job.files as i64)
        .bind(job.failed_files as i64)
        .bind(job.failed_size as i64)
        .bind(job.completeness)
        .bind(job.status.as_ref())
        .bind(job.error.as_deref())
        .bind(job.creation_time.unwrap_or(now))
        .bind(job.submit_time)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for file in files {
            let mut file = file.clone();
            file.fts_job_id = Some(fts_job_id);
            write_fts_file_state(&mut tx, &file, now).await?;
        }

        tx.commit().await?;

        job.fts_job_id = Some(fts_job_id);
        job.creation_time.get_or_insert(now);
        job.last_update = Some(now);
        Ok(fts_job_id)
    }

    async fn update_fts_job(&self, job: &FtsJob, files: &[FtsFile]) -> Result<()> {
        let Some(fts_job_id) = job.fts_job_id else {
            return Err(StoreError::validation(
                "FtsJob.FTSJobID",
                "FTS job has not been persisted",
            ));
        };
        let now = now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE fts_jobs
            SET fts_guid = ?, status = ?, error = ?, files = ?, failed_files = ?, size = ?,
                failed_size = ?, completeness = ?, submit_time = ?, last_update = ?
            WHERE fts_job_id = ?
            "#,
        )
        .bind(job.fts_guid.as_deref())
        .bind(job.status.as_ref())
        .bind(job.error.as_deref())
        .bind(job.files as i64)
        .bind(job.failed_files as i64)
        .bind(job.size as i64)
        .bind(job.failed_size as i64)
        .bind(job.completeness)
        .bind(job.submit_time)
        .bind(now)
        .bind(fts_job_id)
        .execute(&mut *tx)
        .await?;

        for file in files {
            write_fts_file_state(&mut tx, file, now).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_fts_files(&self, files: &[FtsFile]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let now = now();
        let mut tx = self.pool.begin().await?;
        for file in files {
            write_fts_file_state(&mut tx, file, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_fts_job(&self, fts_job_id: i64) -> Result<Option<FtsJob>> {
        let sql = format!("SELECT {FTS_JOB_COLUMNS} FROM fts_jobs WHERE fts_job_id = ?");
        sqlx::query_as::<_, FtsJobRow>(&sql)
            .bind(fts_job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(FtsJobRow::into_job)
            .transpose()
    }

    async fn active_fts_jobs(&self, limit: i64) -> Result<Vec<FtsJob>> {
        let sql = format!(
            r#"
            SELECT {FTS_JOB_COLUMNS} FROM fts_jobs
            WHERE status IN ('Submitted', 'Executing')
            ORDER BY last_update
            LIMIT ?
            "#
        );
        let rows = sqlx::query_as::<_, FtsJobRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(FtsJobRow::into_job).collect()
    }

    async fn count_active_jobs_per_route(&self) -> Result<HashMap<(String, String), u32>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT source_se, target_se, COUNT(*)
            FROM fts_jobs
            WHERE status IN ('Submitted', 'Executing')
            GROUP BY source_se, target_se
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(source, target, count)| ((source, target), count.max(0) as u32))
            .collect())
    }

    async fn fts_history(&self, window: Duration) -> Result<Vec<FtsHistory>> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| StoreError::validation("window", e.to_string()))?;
        let cutoff = Utc::now() - window;

        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT source_se, target_se, status,
                   COUNT(*) AS jobs,
                   COALESCE(SUM(files), 0) AS files,
                   COALESCE(SUM(failed_files), 0) AS failed_files,
                   COALESCE(SUM(size), 0) AS size,
                   COALESCE(SUM(failed_size), 0) AS failed_size,
                   COALESCE(AVG(completeness), 0.0) AS completeness
            FROM fts_jobs
            WHERE last_update > ?
            GROUP BY source_se, target_se, status
            ORDER BY source_se, target_se, status
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(FtsHistory {
                    status: parse_column::<FtsJobStatus>(&row.status, "fts job status")?,
                    source_se: row.source_se,
                    target_se: row.target_se,
                    jobs: non_negative(row.jobs),
                    files: non_negative(row.files),
                    failed_files: non_negative(row.failed_files),
                    size: non_negative(row.size),
                    failed_size: non_negative(row.failed_size),
                    completeness: row.completeness,
                })
            })
            .collect()
    }

    async fn fts_sites(&self) -> Result<Vec<FtsSite>> {
        let sites: Vec<(String, String)> =
            sqlx::query_as("SELECT name, fts_server FROM fts_sites ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        let endpoints: Vec<(String, String, bool, bool)> = sqlx::query_as(
            r#"
            SELECT site_name, se_name, read_access, write_access
            FROM fts_site_endpoints
            ORDER BY site_name, se_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_site: BTreeMap<String, FtsSite> = sites
            .into_iter()
            .map(|(name, server)| (name.clone(), FtsSite::new(name, server)))
            .collect();
        for (site, se, read, write) in endpoints {
            if let Some(entry) = by_site.get_mut(&site) {
                entry.endpoints.insert(se, SeAccess { read, write });
            }
        }
        Ok(by_site.into_values().collect())
    }

    async fn put_fts_site(&self, site: &FtsSite) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO fts_sites (name, fts_server) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET fts_server = excluded.fts_server
            "#,
        )
        .bind(&site.name)
        .bind(&site.fts_server)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM fts_site_endpoints WHERE site_name = ?")
            .bind(&site.name)
            .execute(&mut *tx)
            .await?;

        for (se, access) in &site.endpoints {
            sqlx::query(
                r#"
                INSERT INTO fts_site_endpoints (site_name, se_name, read_access, write_access)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&site.name)
            .bind(se)
            .bind(access.read)
            .bind(access.write)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChecksumType, FtsFileStatus, types};

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    async fn test_store() -> SqliteRequestStore {
        SqliteRequestStore::new(test_pool().await)
    }

    fn put_request(name: &str) -> Request {
        Request::new(name).with_job_id(11).with_operation(
            Operation::new(types::PUT_AND_REGISTER)
                .with_target_se("CERN-DISK")
                .with_file(
                    File::new("/vo/a/b/c")
                        .with_pfn("/tmp/c")
                        .with_size(100)
                        .with_checksum("abc", ChecksumType::Adler32),
                ),
        )
    }

    fn replicate_request(name: &str) -> Request {
        Request::new(name).with_operation(
            Operation::new(types::FTS_SCHEDULE)
                .with_source_se("CERN-DISK")
                .with_target_se("RAL-DISK")
                .with_file(File::new("/vo/r/f1").with_size(10))
                .with_file(File::new("/vo/r/f2").with_size(20)),
        )
    }

    async fn backdate(store: &SqliteRequestStore, name: &str, age: chrono::Duration) {
        sqlx::query("UPDATE requests SET last_update = ? WHERE request_name = ?")
            .bind(now() - age)
            .bind(name)
            .execute(store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_and_peek() {
        let store = test_store().await;
        let mut request = put_request("put-1");

        let id = store.put_request(&mut request).await.unwrap();
        assert_eq!(request.request_id, Some(id));
        assert!(request.operations[0].operation_id.is_some());
        assert!(request.operations[0].files[0].file_id.is_some());

        let stored = store.peek_by_name("put-1").await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Waiting);
        assert_eq!(stored.job_id, 11);
        assert_eq!(stored.operations.len(), 1);
        assert_eq!(stored.operations[0].status, OperationStatus::Waiting);
        assert_eq!(stored.operations[0].files[0].lfn, "/vo/a/b/c");
        assert_eq!(stored.operations[0].files[0].size, 100);

        let by_id = store.peek_by_id(id).await.unwrap().unwrap();
        assert_eq!(by_id, stored);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let store = test_store().await;
        store
            .put_request(&mut put_request("dup"))
            .await
            .unwrap();

        let err = store
            .put_request(&mut put_request("dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_invalid_request_is_never_persisted() {
        let store = test_store().await;
        let mut request = put_request("bad");
        request.operations[0].files[0].lfn = "relative".into();

        let err = store.put_request(&mut request).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        assert!(store.peek_by_name("bad").await.unwrap().is_none());
        assert!(request.request_id.is_none());
    }

    #[tokio::test]
    async fn test_update_in_place_keeps_ids_and_dense_orders() {
        let store = test_store().await;
        let mut request = put_request("grow");
        store.put_request(&mut request).await.unwrap();
        let first_op_id = request.operations[0].operation_id;
        let first_file_id = request.operations[0].files[0].file_id;

        request.operations[0].files[0].mark_failed("register failed");
        let follow_up = Operation::new(types::REGISTER_FILE)
            .with_target_se("CERN-DISK")
            .with_file(
                File::new("/vo/a/b/c")
                    .with_pfn("srm://cern/vo/a/b/c")
                    .with_size(100)
                    .with_checksum("abc", ChecksumType::Adler32)
                    .with_guid("6f1c1a2b-9e21-4c7a-8e51-3f6e8c2a9d10"),
            );
        request.insert_operations_after(0, vec![follow_up]);
        store.put_request(&mut request).await.unwrap();

        let stored = store.peek_by_name("grow").await.unwrap().unwrap();
        let orders: Vec<u32> = stored.operations.iter().map(|op| op.order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(stored.operations[0].operation_id, first_op_id);
        assert_eq!(stored.operations[0].files[0].file_id, first_file_id);
        assert_eq!(stored.operations[0].status, OperationStatus::Failed);
        assert_eq!(stored.operations[1].op_type, types::REGISTER_FILE);
        assert_eq!(stored.operations[1].status, OperationStatus::Waiting);
        assert_eq!(stored.status, RequestStatus::Waiting);
    }

    #[tokio::test]
    async fn test_removed_operations_are_deleted() {
        let store = test_store().await;
        let mut request = put_request("shrink");
        request.add_operation(Operation::new(types::REMOVE_FILE).with_file(File::new("/vo/x")));
        store.put_request(&mut request).await.unwrap();

        request.operations.truncate(1);
        store.put_request(&mut request).await.unwrap();

        let stored = store.peek_by_name("shrink").await.unwrap().unwrap();
        assert_eq!(stored.operations.len(), 1);
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_get_next_leases_exclusively() {
        let store = test_store().await;
        store.put_request(&mut put_request("lease-1")).await.unwrap();
        store.put_request(&mut put_request("lease-2")).await.unwrap();

        let first = store.get_next().await.unwrap().unwrap();
        let second = store.get_next().await.unwrap().unwrap();
        assert_eq!(first.status, RequestStatus::Assigned);
        assert_ne!(first.request_id, second.request_id);
        assert!(store.get_next().await.unwrap().is_none());

        assert!(store.reset_assigned(first.request_id.unwrap()).await.unwrap());
        let again = store.get_next().await.unwrap().unwrap();
        assert_eq!(again.request_id, first.request_id);
    }

    #[tokio::test]
    async fn test_get_next_prefers_oldest() {
        let store = test_store().await;
        store.put_request(&mut put_request("young")).await.unwrap();
        store.put_request(&mut put_request("old")).await.unwrap();
        backdate(&store, "old", chrono::Duration::hours(1)).await;

        let next = store.get_next().await.unwrap().unwrap();
        assert_eq!(next.request_name, "old");
    }

    #[tokio::test]
    async fn test_cancel_blocks_later_put() {
        let store = test_store().await;
        store.put_request(&mut put_request("cancel-me")).await.unwrap();
        let mut leased = store.get_next().await.unwrap().unwrap();

        let cancelled = store.cancel_request("cancel-me").await.unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert_eq!(cancelled.operations[0].status, OperationStatus::Cancelled);

        leased.operations[0].files[0].mark_done();
        let err = store.put_request(&mut leased).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store.cancel_request("cancel-me").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_only_terminal() {
        let store = test_store().await;
        let mut request = put_request("del");
        store.put_request(&mut request).await.unwrap();

        let err = store.delete_request("del").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        request.operations[0].files[0].mark_done();
        store.put_request(&mut request).await.unwrap();
        assert_eq!(request.status, RequestStatus::Done);

        store.delete_request("del").await.unwrap();
        assert!(store.peek_by_name("del").await.unwrap().is_none());
        let err = store.delete_request("del").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reset_request_restores_failed_files() {
        let store = test_store().await;
        let mut request = put_request("retry");
        store.put_request(&mut request).await.unwrap();
        request.operations[0].files[0].mark_failed("SE down");
        store.put_request(&mut request).await.unwrap();
        assert_eq!(request.status, RequestStatus::Failed);

        let reset = store.reset_request("retry").await.unwrap();
        assert_eq!(reset.status, RequestStatus::Waiting);
        assert_eq!(reset.operations[0].status, OperationStatus::Waiting);
        assert_eq!(reset.operations[0].files[0].status, FileStatus::Waiting);
        assert!(reset.operations[0].files[0].error.is_none());
    }

    #[tokio::test]
    async fn test_jobs_selectors_and_summary() {
        let store = test_store().await;
        store.put_request(&mut put_request("job-a")).await.unwrap();
        let mut other = replicate_request("job-b");
        other.job_id = 12;
        store.put_request(&mut other).await.unwrap();

        let names = store.request_names_for_jobs(&[11, 12, 99]).await.unwrap();
        assert_eq!(names.get(&11), Some(&vec!["job-a".to_string()]));
        assert_eq!(names.get(&12), Some(&vec!["job-b".to_string()]));
        assert!(!names.contains_key(&99));

        let requests = store.list_by_job_ids(&[12]).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].operations[0].files.len(), 2);

        let waiting = store.list_by_status(RequestStatus::Waiting, 10).await.unwrap();
        assert_eq!(waiting.len(), 2);

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.requests.get("Waiting"), Some(&2));
        assert_eq!(summary.files.get("Waiting"), Some(&3));
        assert_eq!(
            summary.operations[types::FTS_SCHEDULE].get("Waiting"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_maintenance_selectors() {
        let store = test_store().await;
        let mut done = put_request("done-old");
        done.operations[0].files[0].mark_done();
        store.put_request(&mut done).await.unwrap();
        backdate(&store, "done-old", chrono::Duration::days(8)).await;

        store.put_request(&mut put_request("stale")).await.unwrap();
        store.get_next().await.unwrap().unwrap();
        backdate(&store, "stale", chrono::Duration::hours(3)).await;

        let cutoff = Utc::now() - chrono::Duration::days(7);
        let names = store.done_requests_older_than(cutoff, 100).await.unwrap();
        assert_eq!(names, vec!["done-old".to_string()]);
        assert_eq!(store.delete_requests(&names).await.unwrap(), 1);

        let reset = store
            .reset_stale_assigned(Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(reset, 1);
        let stale = store.peek_by_name("stale").await.unwrap().unwrap();
        assert_eq!(stale.status, RequestStatus::Waiting);
    }

    fn schedule_fts(request: &mut Request) {
        let op = &mut request.operations[0];
        for file in &mut op.files {
            file.status = FileStatus::Scheduled;
            op.fts_files.push(FtsFile {
                file_id: file.file_id,
                lfn: file.lfn.clone(),
                size: file.size,
                source_se: "CERN-DISK".into(),
                target_se: "RAL-DISK".into(),
                route: "CERN#RAL".into(),
                ..Default::default()
            });
        }
    }

    #[tokio::test]
    async fn test_fts_job_lifecycle() {
        let store = test_store().await;
        let mut request = replicate_request("fts-1");
        store.put_request(&mut request).await.unwrap();
        schedule_fts(&mut request);
        store.put_request(&mut request).await.unwrap();
        assert!(request.operations[0].fts_files.iter().all(|f| f.fts_file_id.is_some()));

        let mut waiting = store.waiting_fts_files(100).await.unwrap();
        assert_eq!(waiting.len(), 2);

        let mut job = FtsJob {
            fts_guid: Some("0b6c2c1e-5d5a-4e38-9a52-8f8a0c0f2a11".into()),
            fts_server: "https://fts.cern.ch:8446".into(),
            source_se: "CERN-DISK".into(),
            target_se: "RAL-DISK".into(),
            size: 30,
            files: 2,
            submit_time: Some(now()),
            ..Default::default()
        };
        for file in &mut waiting {
            file.status = FtsFileStatus::Submitted;
            file.fts_guid = job.fts_guid.clone();
        }
        let job_id = store.insert_fts_job(&mut job, &waiting).await.unwrap();
        assert!(store.waiting_fts_files(100).await.unwrap().is_empty());

        let routes = store.count_active_jobs_per_route().await.unwrap();
        assert_eq!(
            routes.get(&("CERN-DISK".to_string(), "RAL-DISK".to_string())),
            Some(&1)
        );

        let mut members = store.fts_files_for_job(job_id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|f| f.status == FtsFileStatus::Submitted));

        job.status = FtsJobStatus::FinishedDirty;
        job.failed_files = 1;
        job.failed_size = 20;
        job.completeness = 1.0;
        members[0].status = FtsFileStatus::Finished;
        members[1].status = FtsFileStatus::Failed;
        members[1].error = Some("transfer failed".into());
        store.update_fts_job(&job, &members).await.unwrap();

        assert!(store.active_fts_jobs(10).await.unwrap().is_empty());
        let stored = store.get_fts_job(job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, FtsJobStatus::FinishedDirty);

        // A later executor put must not overwrite job-manager state.
        store.put_request(&mut request).await.unwrap();
        let file_ids: Vec<i64> = request.operations[0]
            .files
            .iter()
            .filter_map(|f| f.file_id)
            .collect();
        let fts = store.fts_files_for_files(&file_ids).await.unwrap();
        assert_eq!(fts[0].status, FtsFileStatus::Finished);
        assert_eq!(fts[1].status, FtsFileStatus::Failed);

        let history = store.fts_history(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, FtsJobStatus::FinishedDirty);
        assert_eq!(history[0].files, 2);
        assert_eq!(history[0].failed_files, 1);
        assert_eq!(history[0].successful_size(), 10);
    }

    #[tokio::test]
    async fn test_deleting_request_cascades_to_fts_files() {
        let store = test_store().await;
        let mut request = replicate_request("cascade");
        store.put_request(&mut request).await.unwrap();
        schedule_fts(&mut request);
        store.put_request(&mut request).await.unwrap();

        store.delete_requests(&["cascade".to_string()]).await.unwrap();
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fts_files")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn test_sites_round_trip() {
        let store = test_store().await;
        let site = FtsSite::new("CERN", "https://fts.cern.ch:8446")
            .with_endpoint("CERN-DISK")
            .with_endpoint_access("CERN-TAPE", true, false);
        store.put_fts_site(&site).await.unwrap();
        store
            .put_fts_site(&FtsSite::new("RAL", "https://fts.ral.uk:8446").with_endpoint("RAL-DISK"))
            .await
            .unwrap();

        let sites = store.fts_sites().await.unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0], site);

        let moved = FtsSite::new("CERN", "https://fts3.cern.ch:8446").with_endpoint("CERN-DISK");
        store.put_fts_site(&moved).await.unwrap();
        let sites = store.fts_sites().await.unwrap();
        assert_eq!(sites[0], moved);
    }
}
