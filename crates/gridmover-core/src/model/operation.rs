// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations: one typed step of a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::file::File;
use super::fts::FtsFile;
use super::status::OperationStatus;

/// Built-in operation type keys.
pub mod types {
    pub const PUT_AND_REGISTER: &str = "putAndRegister";
    pub const REPLICATE_AND_REGISTER: &str = "replicateAndRegister";
    pub const REGISTER_FILE: &str = "registerFile";
    pub const REMOVE_FILE: &str = "removeFile";
    pub const REMOVE_REPLICA: &str = "removeReplica";
    pub const FTS_SCHEDULE: &str = "ftsSchedule";
    pub const FORWARD_RPC: &str = "forwardRPC";
}

/// One step of a request, bound to one handler type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Operation {
    /// Store-assigned ID, `None` until the first successful put.
    pub operation_id: Option<i64>,
    /// 1-based position within the request. Maintained by [`super::Request`].
    pub order: u32,
    /// Handler key.
    pub op_type: String,
    /// Opaque argument blob.
    #[serde(default, with = "blob")]
    pub arguments: Option<Vec<u8>>,
    pub source_se: Option<String>,
    /// Target storage element, possibly a comma-joined set.
    pub target_se: Option<String>,
    /// Comma-joined catalogue list.
    pub catalog: Option<String>,
    pub status: OperationStatus,
    pub error: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub submit_time: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub files: Vec<File>,
    /// Transfers scheduled on behalf of this operation's files.
    pub fts_files: Vec<FtsFile>,
}

impl Operation {
    /// Create a Queued operation of the given type.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            ..Default::default()
        }
    }

    pub fn with_target_se(mut self, target_se: impl Into<String>) -> Self {
        self.target_se = Some(target_se.into());
        self
    }

    pub fn with_source_se(mut self, source_se: impl Into<String>) -> Self {
        self.source_se = Some(source_se.into());
        self
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn with_arguments(mut self, arguments: impl Into<Vec<u8>>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    pub fn with_file(mut self, file: File) -> Self {
        self.files.push(file);
        self
    }

    /// Distinct target SEs in declaration order.
    pub fn target_ses(&self) -> Vec<String> {
        split_list(self.target_se.as_deref())
    }

    /// Distinct source SEs in declaration order.
    pub fn source_ses(&self) -> Vec<String> {
        split_list(self.source_se.as_deref())
    }

    /// Catalogue names in declaration order.
    pub fn catalogs(&self) -> Vec<String> {
        split_list(self.catalog.as_deref())
    }

    /// The single distinct target SE, or `None` when zero or several are set.
    pub fn single_target_se(&self) -> Option<String> {
        let mut targets = self.target_ses();
        if targets.len() == 1 { targets.pop() } else { None }
    }

    /// Set the operation status directly. Used by handlers of file-less operations.
    pub fn set_status(&mut self, status: OperationStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
    }

    /// Find a file by LFN.
    pub fn file_mut(&mut self, lfn: &str) -> Option<&mut File> {
        self.files.iter_mut().find(|f| f.lfn == lfn)
    }
}

/// Split a comma-joined list, trimming blanks and dropping duplicates.
pub fn split_list(value: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in value.unwrap_or_default().split(',') {
        let item = item.trim();
        if !item.is_empty() && !out.iter().any(|existing| existing == item) {
            out.push(item.to_string());
        }
    }
    out
}

/// Base64 encoding for the argument blob in JSON.
mod blob {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_list_is_deduplicated() {
        let op = Operation::new(types::REPLICATE_AND_REGISTER).with_target_se("RAL, PIC,RAL,,");
        assert_eq!(op.target_ses(), vec!["RAL".to_string(), "PIC".to_string()]);
        assert_eq!(op.single_target_se(), None);
    }

    #[test]
    fn test_single_target() {
        let op = Operation::new(types::PUT_AND_REGISTER).with_target_se("CERN,CERN");
        assert_eq!(op.single_target_se().as_deref(), Some("CERN"));

        let op = Operation::new(types::PUT_AND_REGISTER);
        assert_eq!(op.single_target_se(), None);
    }

    #[test]
    fn test_arguments_are_base64_in_json() {
        let op = Operation::new(types::FORWARD_RPC).with_arguments(b"{}".to_vec());
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["arguments"], "e30=");

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back.arguments.as_deref(), Some(b"{}".as_slice()));
    }
}
