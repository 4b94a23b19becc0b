// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `forwardRPC`: replay a remote call stored in the operation arguments.

use std::sync::Arc;

use async_trait::async_trait;
use gridmover_core::model::{RpcStub, types};
use gridmover_core::{Operation, OperationStatus};
use tracing::{info, warn};

use super::{HandlerContext, HandlerError, OperationHandler};
use crate::services::RpcClient;

pub struct ForwardRpcHandler {
    rpc: Arc<dyn RpcClient>,
}

impl ForwardRpcHandler {
    pub fn new(rpc: Arc<dyn RpcClient>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl OperationHandler for ForwardRpcHandler {
    fn op_type(&self) -> &'static str {
        types::FORWARD_RPC
    }

    async fn execute(
        &self,
        ctx: &HandlerContext,
        op: &mut Operation,
    ) -> Result<Vec<Operation>, HandlerError> {
        let Some(arguments) = op.arguments.as_deref() else {
            op.set_status(OperationStatus::Failed, Some("missing RPC stub".to_string()));
            return Ok(Vec::new());
        };
        let stub = match RpcStub::decode(arguments) {
            Ok(stub) => stub,
            Err(e) => {
                op.set_status(OperationStatus::Failed, Some(format!("malformed RPC stub: {e}")));
                return Ok(Vec::new());
            }
        };

        match self.rpc.call(&stub).await {
            Ok(_) => {
                info!(request_name = %ctx.request_name, service = %stub.service, method = %stub.method, "RPC forwarded");
                op.set_status(OperationStatus::Done, None);
            }
            Err(e) if e.is_retryable() => {
                warn!(request_name = %ctx.request_name, error = %e, "RPC forward failed, will retry");
                op.error = Some(e.to_string());
            }
            Err(e) => {
                warn!(request_name = %ctx.request_name, error = %e, "RPC forward rejected");
                op.set_status(OperationStatus::Failed, Some(e.to_string()));
            }
        }
        Ok(Vec::new())
    }
}
