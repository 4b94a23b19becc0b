// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the cleaner against aged request rows.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use gridmover_core::model::types;
use gridmover_core::{File, Operation, Request, RequestStatus, RequestStore, SqliteRequestStore};
use gridmover_engine::cleaner::{Cleaner, CleanerConfig};

fn remove_request(name: &str) -> Request {
    Request::new(name).with_operation(
        Operation::new(types::REMOVE_FILE).with_file(File::new(format!("/vo/{name}"))),
    )
}

/// Backdate a request's last update.
async fn age_request(store: &SqliteRequestStore, name: &str, age: ChronoDuration) {
    sqlx::query("UPDATE requests SET last_update = ? WHERE request_name = ?")
        .bind(Utc::now() - age)
        .bind(name)
        .execute(store.pool())
        .await
        .expect("Failed to backdate request");
}

#[tokio::test]
async fn test_cleaner_reclaims_old_and_stale_requests() {
    let store = common::memory_store().await;

    let mut done = remove_request("finished");
    done.operations[0].files[0].mark_done();
    done.recompute();
    store.put_request(&mut done).await.unwrap();
    age_request(&store, "finished", ChronoDuration::days(8)).await;

    store.put_request(&mut remove_request("stuck")).await.unwrap();
    let leased = store.get_next().await.unwrap().unwrap();
    assert_eq!(leased.request_name, "stuck");
    age_request(&store, "stuck", ChronoDuration::hours(3)).await;

    // Fresh rows in both states stay as they are.
    let mut recent = remove_request("recent");
    recent.operations[0].files[0].mark_done();
    recent.recompute();
    store.put_request(&mut recent).await.unwrap();
    store.put_request(&mut remove_request("busy")).await.unwrap();
    store.get_next().await.unwrap().unwrap();

    let cleaner = Cleaner::new(store.clone(), CleanerConfig::default());
    let report = cleaner.run_once().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.reset, 1);

    assert!(store.peek_by_name("finished").await.unwrap().is_none());
    let stuck = store.peek_by_name("stuck").await.unwrap().unwrap();
    assert_eq!(stuck.status, RequestStatus::Waiting);
    assert!(store.peek_by_name("recent").await.unwrap().is_some());
    let busy = store.peek_by_name("busy").await.unwrap().unwrap();
    assert_eq!(busy.status, RequestStatus::Assigned);
}

#[tokio::test]
async fn test_cleaner_deletes_request_tree() {
    let store = common::memory_store().await;
    let mut done = Request::new("tree").with_operation(
        Operation::new(types::REMOVE_FILE)
            .with_file(File::new("/vo/a"))
            .with_file(File::new("/vo/b")),
    );
    for file in &mut done.operations[0].files {
        file.mark_done();
    }
    done.recompute();
    let request_id = store.put_request(&mut done).await.unwrap();
    age_request(&store, "tree", ChronoDuration::days(30)).await;

    Cleaner::new(store.clone(), CleanerConfig::default())
        .run_once()
        .await
        .unwrap();

    assert!(store.peek_by_id(request_id).await.unwrap().is_none());
    let (files,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(files, 0);
}
