// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor cycles against the standard handlers and in-memory services.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::TestContext;
use gridmover_core::model::types;
use gridmover_core::{
    ChecksumType, File, FileStatus, Operation, OperationStatus, Request, RequestStatus,
    RequestStore,
};
use gridmover_engine::executor::ExecutorConfig;
use gridmover_engine::handlers::{
    HandlerConfig, HandlerContext, HandlerError, HandlerRegistry, OperationHandler,
};

/// A 100-byte local file to upload.
fn local_file(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("payload.dat");
    std::fs::write(&path, vec![7u8; 100]).unwrap();
    path.to_string_lossy().into_owned()
}

fn put_request(name: &str, pfn: &str) -> Request {
    Request::new(name).with_job_id(42).with_operation(
        Operation::new(types::PUT_AND_REGISTER)
            .with_target_se("CERN-DISK")
            .with_file(
                File::new("/a/b/c")
                    .with_size(100)
                    .with_checksum("abc", ChecksumType::Adler32)
                    .with_pfn(pfn),
            ),
    )
}

#[tokio::test]
async fn test_put_and_register_completes_in_one_cycle() {
    let ctx = TestContext::new().await;
    let dir = tempfile::tempdir().unwrap();
    ctx.submit(put_request("put-1", &local_file(&dir))).await;

    let report = ctx.executor().run_cycle().await.unwrap();
    assert_eq!(report.leased, 1);
    assert_eq!(report.committed, 1);

    let request = ctx.peek("put-1").await;
    assert_eq!(request.status, RequestStatus::Done);
    assert_eq!(request.operations[0].status, OperationStatus::Done);
    assert_eq!(request.operations[0].files[0].status, FileStatus::Done);
    assert!(ctx.cern.contains("/a/b/c").await);
    assert!(ctx.catalog.contains("/a/b/c").await);

    let calls = ctx.notifier.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].job_id, 42);
    assert_eq!(calls[0].status, RequestStatus::Done);
}

#[tokio::test]
async fn test_failed_registration_appends_register_file() {
    let ctx = TestContext::new().await;
    let dir = tempfile::tempdir().unwrap();
    ctx.catalog.fail_next_registrations(1);
    ctx.submit(put_request("put-2", &local_file(&dir))).await;

    ctx.executor().run_cycle().await.unwrap();

    let request = ctx.peek("put-2").await;
    assert_eq!(request.status, RequestStatus::Waiting);
    assert_eq!(request.operations.len(), 2);
    assert_eq!(request.operations[0].status, OperationStatus::Failed);
    assert_eq!(request.operations[0].files[0].status, FileStatus::Failed);

    let follow_up = &request.operations[1];
    assert_eq!(follow_up.op_type, types::REGISTER_FILE);
    assert_eq!(follow_up.status, OperationStatus::Waiting);
    assert_eq!(follow_up.files.len(), 1);
    assert_eq!(follow_up.files[0].lfn, "/a/b/c");
    assert_eq!(follow_up.files[0].checksum.as_deref(), Some("abc"));
    assert!(ctx.notifier.calls().await.is_empty());

    // The follow-up registers the file; the upload failure still decides the outcome.
    ctx.executor().run_cycle().await.unwrap();
    let request = ctx.peek("put-2").await;
    assert_eq!(request.operations[1].status, OperationStatus::Done);
    assert_eq!(request.status, RequestStatus::Failed);
    assert!(ctx.catalog.contains("/a/b/c").await);
    assert_eq!(ctx.notifier.calls().await[0].status, RequestStatus::Failed);
}

fn replicate_request(name: &str, targets: &str) -> Request {
    Request::new(name).with_operation(
        Operation::new(types::REPLICATE_AND_REGISTER)
            .with_source_se("CERN-DISK")
            .with_target_se(targets)
            .with_file(File::new("/a/b/c").with_size(100)),
    )
}

#[tokio::test]
async fn test_missing_route_keeps_file_waiting() {
    let ctx = TestContext::new().await;
    ctx.submit(replicate_request("rep-1", "RAL-DISK,PIC-DISK")).await;

    ctx.executor().run_cycle().await.unwrap();

    let request = ctx.peek("rep-1").await;
    assert_eq!(request.status, RequestStatus::Waiting);
    let op = &request.operations[0];
    assert_eq!(op.status, OperationStatus::Waiting);
    assert_eq!(op.files[0].status, FileStatus::Waiting);
    assert_eq!(op.files[0].attempt, 1);
    assert!(op.files[0].error.as_deref().unwrap().contains("PIC-DISK"));

    // Only the reachable target was handed to FTS.
    let planned = ctx.store.waiting_fts_files(100).await.unwrap();
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].target_se, "RAL-DISK");
    assert_eq!(planned[0].route, "CERN#RAL");
}

#[tokio::test]
async fn test_missing_route_gives_up_after_retry_cap() {
    let ctx = TestContext::with_handler_config(HandlerConfig {
        schedule_max_attempts: 3,
        ..Default::default()
    })
    .await;
    ctx.submit(replicate_request("rep-2", "RAL-DISK,PIC-DISK")).await;
    let executor = ctx.executor();

    for _ in 0..2 {
        executor.run_cycle().await.unwrap();
        assert_eq!(ctx.peek("rep-2").await.status, RequestStatus::Waiting);
    }
    executor.run_cycle().await.unwrap();

    let request = ctx.peek("rep-2").await;
    let file = &request.operations[0].files[0];
    assert_eq!(file.status, FileStatus::Failed);
    assert_eq!(file.attempt, 3);
    assert!(file.error.as_deref().unwrap().contains("giving up"));
    assert_eq!(request.status, RequestStatus::Failed);
    // Retries never plan the same target twice.
    let planned = ctx
        .store
        .fts_files_for_files(&[file.file_id.unwrap()])
        .await
        .unwrap();
    assert_eq!(planned.len(), 1);
}

/// Handler that outlives any sensible task timeout.
struct StuckHandler;

#[async_trait]
impl OperationHandler for StuckHandler {
    fn op_type(&self) -> &'static str {
        types::REMOVE_FILE
    }

    async fn execute(
        &self,
        _ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        for file in &mut op.files {
            file.mark_done();
        }
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_timed_out_request_returns_to_waiting() {
    let ctx = TestContext::new().await;
    ctx.submit(Request::new("slow").with_operation(
        Operation::new(types::REMOVE_FILE).with_file(File::new("/a/b/c")),
    ))
    .await;

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(StuckHandler));
    let executor = ctx.executor_with(
        registry,
        ExecutorConfig {
            task_timeout: Duration::from_secs(1),
            ..Default::default()
        },
    );

    let started = std::time::Instant::now();
    let report = executor.run_cycle().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.reset, 1);

    let request = ctx.peek("slow").await;
    assert_eq!(request.status, RequestStatus::Waiting);
    assert_eq!(request.operations[0].files[0].status, FileStatus::Waiting);
    assert!(ctx.store.get_next().await.unwrap().is_some());
}
