// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request store tests against a file-backed SQLite database.

use std::collections::HashSet;
use std::sync::Arc;

use gridmover_core::model::types;
use gridmover_core::{
    File, Operation, Request, RequestStatus, RequestStore, SqliteRequestStore, StoreError,
};

async fn file_store() -> (tempfile::TempDir, Arc<SqliteRequestStore>) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = SqliteRequestStore::from_path(dir.path().join("db").join("requests.db"))
        .await
        .expect("Failed to open store");
    (dir, Arc::new(store))
}

fn remove_request(name: &str) -> Request {
    Request::new(name).with_operation(
        Operation::new(types::REMOVE_FILE).with_file(File::new(format!("/vo/{name}"))),
    )
}

#[tokio::test]
async fn test_concurrent_get_next_never_leases_twice() {
    let (_dir, store) = file_store().await;
    for i in 0..20 {
        store
            .put_request(&mut remove_request(&format!("lease-{i}")))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut leased = Vec::new();
            loop {
                match store.get_next().await {
                    Ok(Some(request)) => leased.push(request.request_id.unwrap()),
                    Ok(None) => break,
                    // Lock contention between pool connections; try again.
                    Err(e) if e.is_retryable() => continue,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            leased
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "request {id} leased twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn test_failed_put_leaves_no_trace() {
    let (_dir, store) = file_store().await;
    let mut owner = remove_request("owner");
    store.put_request(&mut owner).await.unwrap();

    // Steal an operation ID from another request: the upsert must refuse it.
    let mut thief = remove_request("thief");
    let mut stolen = owner.operations[0].clone();
    stolen.files[0].file_id = None;
    thief.add_operation(stolen);

    let err = store.put_request(&mut thief).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    assert!(store.peek_by_name("thief").await.unwrap().is_none());
    assert!(thief.request_id.is_none());

    let owner_again = store.peek_by_name("owner").await.unwrap().unwrap();
    assert_eq!(owner_again.operations.len(), 1);
    assert_eq!(owner_again.operations[0].files[0].lfn, "/vo/owner");
}

#[tokio::test]
async fn test_reopened_store_keeps_requests() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("requests.db");
    {
        let store = SqliteRequestStore::from_path(&path).await.unwrap();
        store
            .put_request(&mut remove_request("durable"))
            .await
            .unwrap();
    }
    let store = SqliteRequestStore::from_path(&path).await.unwrap();
    let request = store.peek_by_name("durable").await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Waiting);
    assert_eq!(
        store.request_status(request.request_id.unwrap()).await.unwrap(),
        Some(RequestStatus::Waiting)
    );
}
