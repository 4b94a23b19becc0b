// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Requests: ordered bundles of operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::operation::Operation;
use super::state;
use super::status::{OperationStatus, RequestStatus};

/// Store-assigned request identifier.
pub type RequestId = i64;

/// A unit of work: operations run strictly in declared order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Request {
    /// Store-assigned ID, `None` until the first successful put.
    pub request_id: Option<RequestId>,
    /// Unique, human-assigned name.
    pub request_name: String,
    pub owner_dn: Option<String>,
    pub owner_group: Option<String>,
    /// Origin job identifier, 0 when the request has no origin job.
    pub job_id: i64,
    pub setup: Option<String>,
    pub source_component: Option<String>,
    pub status: RequestStatus,
    pub error: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub submit_time: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub operations: Vec<Operation>,
}

impl Request {
    /// Create an empty Waiting request.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            request_name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, dn: impl Into<String>, group: impl Into<String>) -> Self {
        self.owner_dn = Some(dn.into());
        self.owner_group = Some(group.into());
        self
    }

    pub fn with_job_id(mut self, job_id: i64) -> Self {
        self.job_id = job_id;
        self
    }

    /// Append an operation and recompute statuses.
    pub fn add_operation(&mut self, operation: Operation) {
        self.operations.push(operation);
        self.renumber();
        self.recompute();
    }

    /// Builder form of [`Request::add_operation`].
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.add_operation(operation);
        self
    }

    /// Insert operations right after the operation at `index`, preserving their order.
    ///
    /// Inserted operations start Queued and are promoted by the next recomputation.
    pub fn insert_operations_after(&mut self, index: usize, operations: Vec<Operation>) {
        let at = (index + 1).min(self.operations.len());
        for (offset, mut op) in operations.into_iter().enumerate() {
            op.status = OperationStatus::Queued;
            op.operation_id = None;
            self.operations.insert(at + offset, op);
        }
        self.renumber();
    }

    /// Keep positions dense and 1-based.
    pub fn renumber(&mut self) {
        for (i, op) in self.operations.iter_mut().enumerate() {
            op.order = (i + 1) as u32;
        }
    }

    /// Recompute operation and request statuses from their children.
    pub fn recompute(&mut self) {
        state::recompute(self);
    }

    /// Index of the sole Waiting operation.
    pub fn current_operation_index(&self) -> Option<usize> {
        self.operations
            .iter()
            .position(|op| op.status == OperationStatus::Waiting)
    }

    /// Current execution order: index of the Waiting operation, or the operation count.
    pub fn current_order(&self) -> usize {
        self.current_operation_index()
            .unwrap_or(self.operations.len())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Find an operation by store ID.
    pub fn operation_by_id(&self, operation_id: i64) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.operation_id == Some(operation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::operation::types;
    use crate::model::{File, FileStatus};

    fn two_step_request() -> Request {
        Request::new("req")
            .with_operation(
                Operation::new(types::PUT_AND_REGISTER)
                    .with_target_se("CERN")
                    .with_file(File::new("/a/b/c")),
            )
            .with_operation(Operation::new(types::REMOVE_FILE).with_file(File::new("/a/b/d")))
    }

    #[test]
    fn test_orders_are_dense_and_one_based() {
        let request = two_step_request();
        let orders: Vec<u32> = request.operations.iter().map(|op| op.order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(request.current_order(), 0);
    }

    #[test]
    fn test_insert_after_current() {
        let mut request = two_step_request();
        request.insert_operations_after(
            0,
            vec![Operation::new(types::REGISTER_FILE).with_file(File::new("/a/b/c"))],
        );
        let kinds: Vec<&str> = request
            .operations
            .iter()
            .map(|op| op.op_type.as_str())
            .collect();
        assert_eq!(
            kinds,
            vec![types::PUT_AND_REGISTER, types::REGISTER_FILE, types::REMOVE_FILE]
        );
        let orders: Vec<u32> = request.operations.iter().map(|op| op.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(request.operations[1].status, OperationStatus::Queued);
    }

    #[test]
    fn test_current_order_when_done() {
        let mut request = two_step_request();
        for op in &mut request.operations {
            for file in &mut op.files {
                file.status = FileStatus::Done;
            }
        }
        request.recompute();
        assert_eq!(request.status, RequestStatus::Done);
        assert_eq!(request.current_order(), 2);
    }
}
