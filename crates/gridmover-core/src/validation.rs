// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Put-time request validation.
//!
//! A request is rejected before any row is written when:
//! - its name is empty or it has no operations,
//! - an operation type is not registered,
//! - an operation lacks an attribute its type requires,
//! - a file LFN is not absolute or a GUID is not canonical.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{Operation, Request, RpcStub, types};

/// Attributes an operation type requires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationRequirements {
    /// TargetSE must be set.
    pub target_se: bool,
    /// TargetSE must resolve to exactly one distinct SE.
    pub single_target: bool,
    /// At least one file.
    pub files: bool,
    /// Every file carries a PFN.
    pub pfn: bool,
    /// Every file carries a size and checksum.
    pub size_and_checksum: bool,
    /// Every file carries a GUID.
    pub guid: bool,
    /// Arguments decode as a remote-call stub.
    pub rpc_stub: bool,
}

/// Validator keyed by operation type.
#[derive(Debug, Clone)]
pub struct Validator {
    requirements: HashMap<String, OperationRequirements>,
}

impl Default for Validator {
    fn default() -> Self {
        // Replication sources come from the catalog, so only uploads and
        // registrations need a PFN on every file.
        let transfer = OperationRequirements {
            target_se: true,
            files: true,
            ..Default::default()
        };
        let mut validator = Self::empty();
        validator
            .register(
                types::PUT_AND_REGISTER,
                OperationRequirements {
                    single_target: true,
                    pfn: true,
                    ..transfer
                },
            )
            .register(types::REPLICATE_AND_REGISTER, transfer)
            .register(types::FTS_SCHEDULE, transfer)
            .register(
                types::REGISTER_FILE,
                OperationRequirements {
                    pfn: true,
                    size_and_checksum: true,
                    guid: true,
                    ..transfer
                },
            )
            .register(
                types::REMOVE_FILE,
                OperationRequirements {
                    files: true,
                    ..Default::default()
                },
            )
            .register(
                types::REMOVE_REPLICA,
                OperationRequirements {
                    single_target: true,
                    ..transfer
                },
            )
            .register(
                types::FORWARD_RPC,
                OperationRequirements {
                    rpc_stub: true,
                    ..Default::default()
                },
            );
        validator
    }
}

impl Validator {
    /// A validator that knows no operation types.
    pub fn empty() -> Self {
        Self {
            requirements: HashMap::new(),
        }
    }

    /// Register (or replace) the requirements of an operation type.
    pub fn register(&mut self, op_type: &str, requirements: OperationRequirements) -> &mut Self {
        self.requirements.insert(op_type.to_string(), requirements);
        self
    }

    /// Whether the type is known.
    pub fn knows(&self, op_type: &str) -> bool {
        self.requirements.contains_key(op_type)
    }

    /// Requirements registered for a type.
    pub fn requirements(&self, op_type: &str) -> Option<OperationRequirements> {
        self.requirements.get(op_type).copied()
    }

    /// A copy that only knows the given types.
    ///
    /// Types unknown to `self` are registered without requirements.
    pub fn restricted_to<'a>(&self, op_types: impl IntoIterator<Item = &'a str>) -> Self {
        let mut restricted = Self::empty();
        for op_type in op_types {
            restricted.register(op_type, self.requirements(op_type).unwrap_or_default());
        }
        restricted
    }

    /// Validate a whole request.
    pub fn validate(&self, request: &Request) -> Result<()> {
        if request.request_name.trim().is_empty() {
            return Err(StoreError::validation("RequestName", "must not be empty"));
        }
        if request.operations.is_empty() {
            return Err(StoreError::validation(
                "Operations",
                "request has no operations",
            ));
        }
        for (index, op) in request.operations.iter().enumerate() {
            self.validate_operation(index + 1, op)?;
        }
        Ok(())
    }

    fn validate_operation(&self, position: usize, op: &Operation) -> Result<()> {
        let field = |name: &str| format!("Operation[{position}].{name}");

        let Some(req) = self.requirements.get(&op.op_type) else {
            return Err(StoreError::validation(
                field("Type"),
                format!("unknown operation type '{}'", op.op_type),
            ));
        };

        let targets = op.target_ses();
        if req.target_se && targets.is_empty() {
            return Err(StoreError::validation(field("TargetSE"), "is required"));
        }
        if req.single_target && targets.len() != 1 {
            return Err(StoreError::validation(
                field("TargetSE"),
                format!("expected exactly one target, got {}", targets.len()),
            ));
        }
        if req.files && op.files.is_empty() {
            return Err(StoreError::validation(field("Files"), "at least one file is required"));
        }
        if req.rpc_stub {
            let blob = op
                .arguments
                .as_deref()
                .ok_or_else(|| StoreError::validation(field("Arguments"), "is required"))?;
            RpcStub::decode(blob).map_err(|e| {
                StoreError::validation(field("Arguments"), format!("not a valid RPC stub: {e}"))
            })?;
        }

        for (i, file) in op.files.iter().enumerate() {
            let file_field = |name: &str| format!("Operation[{position}].Files[{i}].{name}");

            if !file.lfn.starts_with('/') {
                return Err(StoreError::validation(
                    file_field("LFN"),
                    format!("'{}' is not an absolute path", file.lfn),
                ));
            }
            if let Some(guid) = &file.guid
                && !is_canonical_guid(guid)
            {
                return Err(StoreError::validation(
                    file_field("GUID"),
                    format!("'{guid}' is not a canonical GUID"),
                ));
            }
            if req.pfn && file.pfn.as_deref().is_none_or(str::is_empty) {
                return Err(StoreError::validation(file_field("PFN"), "is required"));
            }
            if req.size_and_checksum {
                if file.size == 0 {
                    return Err(StoreError::validation(file_field("Size"), "is required"));
                }
                if file.checksum.as_deref().is_none_or(str::is_empty) {
                    return Err(StoreError::validation(file_field("Checksum"), "is required"));
                }
            }
            if req.guid && file.guid.is_none() {
                return Err(StoreError::validation(file_field("GUID"), "is required"));
            }
        }
        Ok(())
    }
}

/// `8-4-4-4-12` hexadecimal with dashes, either case.
pub fn is_canonical_guid(value: &str) -> bool {
    value.len() == 36 && Uuid::parse_str(value).is_ok()
}
