// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication through FTS: scheduling, submission, monitoring and reconciliation.

mod common;

use common::TestContext;
use gridmover_core::model::types;
use gridmover_core::{
    File, FileStatus, FtsFileStatus, FtsJobStatus, Operation, Request, RequestStatus,
    RequestStore,
};
use gridmover_engine::services::ReplicaEntry;

async fn seed_replica(ctx: &TestContext, lfn: &str) {
    ctx.cern.insert(lfn, vec![1u8; 100]).await;
    ctx.catalog
        .add_file(ReplicaEntry {
            lfn: lfn.to_string(),
            pfn: format!("mem://CERN-DISK{lfn}"),
            se: "CERN-DISK".to_string(),
            size: 100,
            ..Default::default()
        })
        .await;
}

fn replicate(name: &str, lfns: &[&str]) -> Request {
    let mut op = Operation::new(types::REPLICATE_AND_REGISTER).with_target_se("RAL-DISK");
    for lfn in lfns {
        op = op.with_file(File::new(*lfn).with_size(100));
    }
    Request::new(name).with_job_id(7).with_operation(op)
}

#[tokio::test]
async fn test_replication_completes_through_fts() {
    let ctx = TestContext::new().await;
    seed_replica(&ctx, "/vo/data/f1").await;
    ctx.submit(replicate("via-fts", &["/vo/data/f1"])).await;
    let executor = ctx.executor();
    let jobs = ctx.job_manager();

    executor.run_cycle().await.unwrap();
    let request = ctx.peek("via-fts").await;
    assert_eq!(request.operations[0].files[0].status, FileStatus::Scheduled);
    assert_eq!(request.status, RequestStatus::Waiting);

    let report = jobs.run_submit_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    let submitted = ctx.fts.submitted().await;
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].0, "https://fts.ral.ac.uk:8446");
    assert_eq!(submitted[0].1.pairs[0].source_surl, "mem://CERN-DISK/vo/data/f1");

    // Still in flight: the file stays Scheduled.
    executor.run_cycle().await.unwrap();
    assert_eq!(
        ctx.peek("via-fts").await.operations[0].files[0].status,
        FileStatus::Scheduled
    );

    let guid = ctx.fts.job_guids().await[0].clone();
    ctx.fts.finish_job(&guid, &[]).await;
    jobs.run_monitor_cycle().await.unwrap();

    executor.run_cycle().await.unwrap();
    let request = ctx.peek("via-fts").await;
    assert_eq!(request.operations[0].files[0].status, FileStatus::Done);
    assert_eq!(request.status, RequestStatus::Done);
    assert_eq!(
        ctx.catalog.replica_ses("/vo/data/f1").await,
        vec!["CERN-DISK".to_string(), "RAL-DISK".to_string()]
    );

    let calls = ctx.notifier.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].job_id, 7);
}

#[tokio::test]
async fn test_expired_job_requeues_its_files() {
    let ctx = TestContext::new().await;
    seed_replica(&ctx, "/vo/data/f1").await;
    seed_replica(&ctx, "/vo/data/f2").await;
    ctx.submit(replicate("expiring", &["/vo/data/f1", "/vo/data/f2"]))
        .await;
    let jobs = ctx.job_manager();

    ctx.executor().run_cycle().await.unwrap();
    jobs.run_submit_cycle().await.unwrap();

    let active = ctx.store.active_fts_jobs(10).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].files, 2);
    let job_id = active[0].fts_job_id.unwrap();

    let guid = ctx.fts.job_guids().await[0].clone();
    ctx.fts.expire_job(&guid).await;
    jobs.run_monitor_cycle().await.unwrap();

    let job = ctx.store.get_fts_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, FtsJobStatus::Failed);

    let requeued = ctx.store.waiting_fts_files(100).await.unwrap();
    assert_eq!(requeued.len(), 2);
    for file in &requeued {
        assert_eq!(file.status, FtsFileStatus::Waiting);
        assert!(file.fts_guid.is_none());
        assert_eq!(file.attempt, 1);
    }

    // The files go out again in a fresh job.
    jobs.run_submit_cycle().await.unwrap();
    assert_eq!(ctx.fts.job_guids().await.len(), 2);
    assert!(ctx.store.waiting_fts_files(100).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_transfer_fails_the_file() {
    let ctx = TestContext::new().await;
    seed_replica(&ctx, "/vo/data/f1").await;
    ctx.submit(replicate("doomed", &["/vo/data/f1"])).await;
    let executor = ctx.executor();
    let jobs = ctx.job_manager();

    executor.run_cycle().await.unwrap();
    jobs.run_submit_cycle().await.unwrap();
    let guid = ctx.fts.job_guids().await[0].clone();
    ctx.fts
        .finish_job(
            &guid,
            &[("mem://RAL-DISK/vo/data/f1", "SOURCE file does not exist")],
        )
        .await;
    jobs.run_monitor_cycle().await.unwrap();

    executor.run_cycle().await.unwrap();
    let request = ctx.peek("doomed").await;
    let file = &request.operations[0].files[0];
    assert_eq!(file.status, FileStatus::Failed);
    assert!(file.error.as_deref().unwrap().contains("RAL-DISK"));
    assert_eq!(request.status, RequestStatus::Failed);
    assert_eq!(
        ctx.catalog.replica_ses("/vo/data/f1").await,
        vec!["CERN-DISK".to_string()]
    );
}
