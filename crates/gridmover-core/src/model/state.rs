// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status computation and the in-request state machine.
//!
//! Everything here is a pure function of the request tree and idempotent:
//! recomputing twice yields the same statuses as recomputing once.
//!
//! Rules:
//! - An operation with files derives its status from them (any Waiting or
//!   Scheduled file makes it Waiting, all Done makes it Done, otherwise
//!   Failed when any file Failed, otherwise Cancelled).
//! - File-less operations keep the status their handler set.
//! - The earliest non-terminal operation is promoted from Queued to Waiting;
//!   every later operation is Queued.
//! - Cancelled requests are terminal and sticky.

use super::file::File;
use super::operation::Operation;
use super::request::Request;
use super::status::{FileStatus, OperationStatus, RequestStatus};

/// Derive an operation status from its files. `None` for file-less operations.
pub fn operation_status_from_files(files: &[File]) -> Option<OperationStatus> {
    if files.is_empty() {
        return None;
    }
    if files.iter().any(|f| f.is_pending()) {
        return Some(OperationStatus::Waiting);
    }
    if files.iter().all(|f| f.status == FileStatus::Done) {
        return Some(OperationStatus::Done);
    }
    if files.iter().any(|f| f.status == FileStatus::Failed) {
        return Some(OperationStatus::Failed);
    }
    Some(OperationStatus::Cancelled)
}

/// Derive a request status from its operations.
pub fn request_status_from_operations(operations: &[Operation]) -> Option<RequestStatus> {
    if operations.is_empty() {
        return None;
    }
    let status = if operations.iter().any(|op| !op.status.is_terminal()) {
        RequestStatus::Waiting
    } else if operations
        .iter()
        .all(|op| op.status == OperationStatus::Done)
    {
        RequestStatus::Done
    } else if operations
        .iter()
        .any(|op| op.status == OperationStatus::Failed)
    {
        RequestStatus::Failed
    } else {
        RequestStatus::Cancelled
    };
    Some(status)
}

fn refresh_from_files(op: &mut Operation) {
    if let Some(status) = operation_status_from_files(&op.files) {
        op.status = status;
        if status == OperationStatus::Done {
            op.error = None;
        } else if status == OperationStatus::Failed && op.error.is_none() {
            op.error = op.files.iter().find_map(|f| f.error.clone());
        }
    }
}

/// Cancel everything that has not finished yet.
pub fn cancel(request: &mut Request) {
    request.status = RequestStatus::Cancelled;
    for op in &mut request.operations {
        if !op.status.is_terminal() {
            op.status = OperationStatus::Cancelled;
        }
        for file in &mut op.files {
            if !file.status.is_terminal() {
                file.status = FileStatus::Cancelled;
            }
        }
    }
}

/// Recompute every operation status and the request status.
pub fn recompute(request: &mut Request) {
    if request.status == RequestStatus::Cancelled {
        cancel(request);
        return;
    }

    // Running operations follow their files.
    for op in &mut request.operations {
        if !matches!(
            op.status,
            OperationStatus::Queued | OperationStatus::Cancelled
        ) {
            refresh_from_files(op);
        }
    }

    // Promote the earliest non-terminal operation, demote any stray Waiting ones.
    let mut current_found = false;
    for op in &mut request.operations {
        if current_found {
            if op.status == OperationStatus::Waiting {
                op.status = OperationStatus::Queued;
            }
            continue;
        }
        if op.status == OperationStatus::Queued {
            op.status = OperationStatus::Waiting;
            refresh_from_files(op);
        }
        if !op.status.is_terminal() {
            current_found = true;
        }
    }

    if let Some(status) = request_status_from_operations(&request.operations) {
        request.status = status;
    }

    request.error = if request.status == RequestStatus::Failed {
        first_failure(request)
    } else {
        None
    };
}

/// Short summary of the first non-retryable cause.
fn first_failure(request: &Request) -> Option<String> {
    request
        .operations
        .iter()
        .filter(|op| op.status == OperationStatus::Failed)
        .find_map(|op| {
            op.error.clone().or_else(|| {
                op.files
                    .iter()
                    .filter(|f| f.status == FileStatus::Failed)
                    .find_map(|f| f.error.clone())
            })
        })
        .or_else(|| Some("Operation failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::operation::types;

    fn file(status: FileStatus) -> File {
        File {
            lfn: "/vo/f".into(),
            status,
            ..Default::default()
        }
    }

    fn op_with(files: Vec<File>) -> Operation {
        Operation {
            op_type: types::REMOVE_FILE.into(),
            files,
            ..Default::default()
        }
    }

    #[test]
    fn test_operation_status_from_files() {
        use FileStatus::*;
        assert_eq!(operation_status_from_files(&[]), None);
        assert_eq!(
            operation_status_from_files(&[file(Done), file(Scheduled)]),
            Some(OperationStatus::Waiting)
        );
        assert_eq!(
            operation_status_from_files(&[file(Done), file(Done)]),
            Some(OperationStatus::Done)
        );
        assert_eq!(
            operation_status_from_files(&[file(Done), file(Failed)]),
            Some(OperationStatus::Failed)
        );
        assert_eq!(
            operation_status_from_files(&[file(Cancelled), file(Done)]),
            Some(OperationStatus::Cancelled)
        );
    }

    #[test]
    fn test_exactly_one_waiting_operation() {
        let mut request = Request::new("r");
        request.operations = vec![
            op_with(vec![file(FileStatus::Waiting)]),
            op_with(vec![file(FileStatus::Waiting)]),
            op_with(vec![file(FileStatus::Waiting)]),
        ];
        request.renumber();
        recompute(&mut request);

        let statuses: Vec<_> = request.operations.iter().map(|op| op.status).collect();
        assert_eq!(
            statuses,
            vec![
                OperationStatus::Waiting,
                OperationStatus::Queued,
                OperationStatus::Queued
            ]
        );
        assert_eq!(request.status, RequestStatus::Waiting);
    }

    #[test]
    fn test_promotion_skips_already_finished_operations() {
        let mut request = Request::new("r");
        request.operations = vec![
            op_with(vec![file(FileStatus::Done)]),
            op_with(vec![file(FileStatus::Done)]),
            op_with(vec![file(FileStatus::Waiting)]),
        ];
        request.operations[0].status = OperationStatus::Waiting;
        request.renumber();
        recompute(&mut request);

        assert_eq!(request.operations[0].status, OperationStatus::Done);
        assert_eq!(request.operations[1].status, OperationStatus::Done);
        assert_eq!(request.operations[2].status, OperationStatus::Waiting);
        assert_eq!(request.current_order(), 2);
    }

    #[test]
    fn test_stray_waiting_is_demoted() {
        let mut request = Request::new("r");
        request.operations = vec![
            op_with(vec![file(FileStatus::Waiting)]),
            op_with(vec![file(FileStatus::Waiting)]),
        ];
        request.operations[0].status = OperationStatus::Waiting;
        request.operations[1].status = OperationStatus::Waiting;
        recompute(&mut request);

        assert_eq!(request.operations[0].status, OperationStatus::Waiting);
        assert_eq!(request.operations[1].status, OperationStatus::Queued);
    }

    #[test]
    fn test_failed_operation_with_followup_keeps_request_waiting() {
        let mut failed = file(FileStatus::Failed);
        failed.error = Some("register failed".into());
        let mut request = Request::new("r");
        request.operations = vec![op_with(vec![failed]), op_with(vec![file(FileStatus::Waiting)])];
        request.operations[0].status = OperationStatus::Waiting;
        recompute(&mut request);

        assert_eq!(request.operations[0].status, OperationStatus::Failed);
        assert_eq!(request.operations[1].status, OperationStatus::Waiting);
        assert_eq!(request.status, RequestStatus::Waiting);
        assert!(request.error.is_none());

        request.operations[1].files[0].status = FileStatus::Done;
        recompute(&mut request);
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.error.as_deref(), Some("register failed"));
    }

    #[test]
    fn test_file_less_operation_keeps_handler_status() {
        let mut request = Request::new("r");
        request.operations = vec![Operation::new(types::FORWARD_RPC)];
        recompute(&mut request);
        assert_eq!(request.operations[0].status, OperationStatus::Waiting);

        request.operations[0].set_status(OperationStatus::Done, None);
        recompute(&mut request);
        assert_eq!(request.status, RequestStatus::Done);
    }

    #[test]
    fn test_cancelled_is_sticky() {
        let mut request = Request::new("r");
        request.operations = vec![
            op_with(vec![file(FileStatus::Done)]),
            op_with(vec![file(FileStatus::Waiting)]),
        ];
        recompute(&mut request);
        request.status = RequestStatus::Cancelled;
        recompute(&mut request);

        assert_eq!(request.status, RequestStatus::Cancelled);
        assert_eq!(request.operations[0].status, OperationStatus::Done);
        assert_eq!(request.operations[1].status, OperationStatus::Cancelled);
        assert_eq!(request.operations[1].files[0].status, FileStatus::Cancelled);

        recompute(&mut request);
        assert_eq!(request.status, RequestStatus::Cancelled);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let mut request = Request::new("r");
        request.operations = vec![
            op_with(vec![file(FileStatus::Done), file(FileStatus::Scheduled)]),
            op_with(vec![file(FileStatus::Waiting)]),
        ];
        recompute(&mut request);
        let once = request.clone();
        recompute(&mut request);
        assert_eq!(once, request);
    }
}
