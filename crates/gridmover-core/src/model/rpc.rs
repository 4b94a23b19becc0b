// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Encoded remote-call stubs.
//!
//! A stub is stored as the JSON-encoded `Arguments` blob of a `forwardRPC`
//! operation. The store never interprets `args`.

use serde::{Deserialize, Serialize};

/// One remote call, addressed by service and method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcStub {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl RpcStub {
    pub fn new(service: impl Into<String>, method: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args,
        }
    }

    /// Encode as an operation argument blob.
    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of strings and a Value into a Vec cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode from an operation argument blob.
    pub fn decode(blob: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stub_decode() {
        let stub = RpcStub::decode(br#"{"service":"Jobs","method":"setStatus","args":[1,"Done"]}"#).unwrap();
        assert_eq!(stub.service, "Jobs");
        assert_eq!(stub.method, "setStatus");
        assert_eq!(stub.args, json!([1, "Done"]));
    }

    #[test]
    fn test_stub_args_default_to_null() {
        let stub = RpcStub::decode(br#"{"service":"a","method":"b"}"#).unwrap();
        assert!(stub.args.is_null());
        assert!(RpcStub::decode(b"not json").is_err());
    }
}
