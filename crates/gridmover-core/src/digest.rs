// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Human-readable request digests.
//!
//! One line per entity, indented by depth:
//!
//! ```text
//! transfer-42:Waiting JobID=42 Owner=/DC=org/CN=alice:vo_user
//!   [1] ftsSchedule:Waiting Target=RAL,PIC Files=2
//!     /vo/f1:Scheduled
//!     /vo/f2:Waiting Error=no route CERN#PIC
//! ```

use std::fmt::Write;

use crate::model::Request;

/// Render the digest of a request.
pub fn digest(request: &Request) -> String {
    let mut out = String::new();
    let _ = write!(out, "{}:{}", request.request_name, request.status);
    if request.job_id != 0 {
        let _ = write!(out, " JobID={}", request.job_id);
    }
    if let Some(dn) = &request.owner_dn {
        let _ = write!(out, " Owner={dn}:{}", request.owner_group.as_deref().unwrap_or(""));
    }
    if let Some(error) = &request.error {
        let _ = write!(out, " Error={error}");
    }
    out.push('\n');

    for op in &request.operations {
        let _ = write!(out, "  [{}] {}:{}", op.order, op.op_type, op.status);
        if let Some(source) = &op.source_se {
            let _ = write!(out, " Source={source}");
        }
        if let Some(target) = &op.target_se {
            let _ = write!(out, " Target={target}");
        }
        if !op.files.is_empty() {
            let _ = write!(out, " Files={}", op.files.len());
        }
        if let Some(error) = &op.error {
            let _ = write!(out, " Error={error}");
        }
        out.push('\n');

        for file in &op.files {
            let _ = write!(out, "    {}:{}", file.lfn, file.status);
            if file.attempt > 0 {
                let _ = write!(out, " Attempt={}", file.attempt);
            }
            if let Some(error) = &file.error {
                let _ = write!(out, " Error={error}");
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{File, Operation, types};

    #[test]
    fn test_digest_includes_errors() {
        let mut request = Request::new("transfer-1").with_job_id(7).with_operation(
            Operation::new(types::REPLICATE_AND_REGISTER)
                .with_target_se("RAL,PIC")
                .with_file(File::new("/vo/f1"))
                .with_file(File::new("/vo/f2")),
        );
        request.operations[0].files[1].mark_retry("no route CERN#PIC");

        let text = digest(&request);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "transfer-1:Waiting JobID=7");
        assert_eq!(lines[1], "  [1] replicateAndRegister:Waiting Target=RAL,PIC Files=2");
        assert_eq!(lines[2], "    /vo/f1:Waiting");
        assert_eq!(lines[3], "    /vo/f2:Waiting Error=no route CERN#PIC");
    }
}
