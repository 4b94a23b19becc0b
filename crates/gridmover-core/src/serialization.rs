// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tag-attribute serialisation of requests.
//!
//! Canonical form: one element per entity, scalar fields as attributes, children
//! carrying operations and files. No element text.
//!
//! ```text
//! <request RequestName="r" Status="Waiting" ...>
//!   <operation Order="1" Type="ftsSchedule" TargetSE="RAL,PIC" ...>
//!     <file LFN="/vo/data/f1" Size="100" .../>
//!     <ftsfile Route="CERN#RAL" SourceSE="CERN-DISK" .../>
//!   </operation>
//! </request>
//! ```
//!
//! Absent optional fields are omitted. The `Arguments` blob is base64.

use std::fmt::Display;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Result, StoreError};
use crate::model::{File, FtsFile, Operation, Request};

/// Serialise a request to its canonical tag-attribute form.
pub fn to_xml(request: &Request) -> String {
    let mut out = String::with_capacity(512);
    let mut tag = Tag::open(&mut out, "request");
    tag.opt("RequestID", request.request_id);
    tag.attr("RequestName", &request.request_name);
    tag.opt("OwnerDN", request.owner_dn.as_ref());
    tag.opt("OwnerGroup", request.owner_group.as_ref());
    tag.attr("JobID", request.job_id);
    tag.opt("Setup", request.setup.as_ref());
    tag.opt("SourceComponent", request.source_component.as_ref());
    tag.attr("Status", request.status);
    tag.opt("Error", request.error.as_ref());
    tag.time("CreationTime", request.creation_time);
    tag.time("SubmitTime", request.submit_time);
    tag.time("LastUpdate", request.last_update);

    if request.operations.is_empty() {
        tag.close_empty();
        return out;
    }
    tag.close();
    for op in &request.operations {
        write_operation(&mut out, op);
    }
    out.push_str("</request>");
    out
}

fn write_operation(out: &mut String, op: &Operation) {
    let mut tag = Tag::open(out, "operation");
    tag.opt("OperationID", op.operation_id);
    tag.attr("Order", op.order);
    tag.attr("Type", &op.op_type);
    tag.opt("Arguments", op.arguments.as_ref().map(|a| STANDARD.encode(a)));
    tag.opt("SourceSE", op.source_se.as_ref());
    tag.opt("TargetSE", op.target_se.as_ref());
    tag.opt("Catalog", op.catalog.as_ref());
    tag.attr("Status", op.status);
    tag.opt("Error", op.error.as_ref());
    tag.time("CreationTime", op.creation_time);
    tag.time("SubmitTime", op.submit_time);
    tag.time("LastUpdate", op.last_update);

    if op.files.is_empty() && op.fts_files.is_empty() {
        tag.close_empty();
        return;
    }
    tag.close();
    for file in &op.files {
        write_file(out, file);
    }
    for fts in &op.fts_files {
        write_fts_file(out, fts);
    }
    out.push_str("</operation>");
}

fn write_file(out: &mut String, file: &File) {
    let mut tag = Tag::open(out, "file");
    tag.opt("FileID", file.file_id);
    tag.attr("LFN", &file.lfn);
    tag.opt("PFN", file.pfn.as_ref());
    tag.attr("Size", file.size);
    tag.opt("Checksum", file.checksum.as_ref());
    tag.attr("ChecksumType", file.checksum_type);
    tag.opt("GUID", file.guid.as_ref());
    tag.attr("Status", file.status);
    tag.opt("Error", file.error.as_ref());
    tag.attr("Attempt", file.attempt);
    tag.close_empty();
}

fn write_fts_file(out: &mut String, fts: &FtsFile) {
    let mut tag = Tag::open(out, "ftsfile");
    tag.opt("FTSFileID", fts.fts_file_id);
    tag.opt("RequestID", fts.request_id);
    tag.opt("OperationID", fts.operation_id);
    tag.opt("FileID", fts.file_id);
    tag.attr("LFN", &fts.lfn);
    tag.attr("Size", fts.size);
    tag.opt("Checksum", fts.checksum.as_ref());
    tag.attr("ChecksumType", fts.checksum_type);
    tag.attr("SourceSE", &fts.source_se);
    tag.opt("SourceSURL", fts.source_surl.as_ref());
    tag.attr("TargetSE", &fts.target_se);
    tag.opt("TargetSURL", fts.target_surl.as_ref());
    tag.attr("Route", &fts.route);
    tag.opt("Ancestor", fts.ancestor.as_ref());
    tag.attr("Attempt", fts.attempt);
    tag.opt("FTSGUID", fts.fts_guid.as_ref());
    tag.opt("FTSJobID", fts.fts_job_id);
    tag.attr("Status", fts.status);
    tag.opt("Error", fts.error.as_ref());
    tag.time("CreationTime", fts.creation_time);
    tag.time("LastUpdate", fts.last_update);
    tag.close_empty();
}

/// Attribute writer for one start tag.
struct Tag<'a> {
    out: &'a mut String,
}

impl<'a> Tag<'a> {
    fn open(out: &'a mut String, name: &str) -> Self {
        out.push('<');
        out.push_str(name);
        Self { out }
    }

    fn attr(&mut self, name: &str, value: impl Display) {
        self.out.push(' ');
        self.out.push_str(name);
        self.out.push_str("=\"");
        escape_into(self.out, &value.to_string());
        self.out.push('"');
    }

    fn opt(&mut self, name: &str, value: Option<impl Display>) {
        if let Some(value) = value {
            self.attr(name, value);
        }
    }

    fn time(&mut self, name: &str, value: Option<DateTime<Utc>>) {
        self.opt(
            name,
            value.map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
    }

    fn close(self) {
        self.out.push('>');
    }

    fn close_empty(self) {
        self.out.push_str("/>");
    }
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#9;"),
            c => out.push(c),
        }
    }
}

/// Parse a request from its tag-attribute form.
pub fn from_xml(text: &str) -> Result<Request> {
    let doc = roxmltree::Document::parse(text)
        .map_err(|e| StoreError::validation("xml", e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "request" {
        return Err(StoreError::validation(
            "xml",
            format!("expected <request>, found <{}>", root.tag_name().name()),
        ));
    }

    let node = Node(root);
    let mut request = Request {
        request_id: node.parse("RequestID")?,
        request_name: node.required("RequestName")?.to_string(),
        owner_dn: node.string("OwnerDN"),
        owner_group: node.string("OwnerGroup"),
        job_id: node.parse("JobID")?.unwrap_or(0),
        setup: node.string("Setup"),
        source_component: node.string("SourceComponent"),
        status: node.parse("Status")?.unwrap_or_default(),
        error: node.string("Error"),
        creation_time: node.time("CreationTime")?,
        submit_time: node.time("SubmitTime")?,
        last_update: node.time("LastUpdate")?,
        operations: Vec::new(),
    };

    for child in node.children()? {
        match child.0.tag_name().name() {
            "operation" => {
                let position = request.operations.len() as u32 + 1;
                request.operations.push(read_operation(child, position)?);
            }
            other => return Err(unexpected("request", other)),
        }
    }
    Ok(request)
}

fn read_operation(node: Node<'_, '_>, position: u32) -> Result<Operation> {
    let arguments = node
        .0
        .attribute("Arguments")
        .map(|encoded| {
            STANDARD
                .decode(encoded)
                .map_err(|e| StoreError::validation("operation.Arguments", e.to_string()))
        })
        .transpose()?;

    let mut op = Operation {
        operation_id: node.parse("OperationID")?,
        order: node.parse("Order")?.unwrap_or(position),
        op_type: node.required("Type")?.to_string(),
        arguments,
        source_se: node.string("SourceSE"),
        target_se: node.string("TargetSE"),
        catalog: node.string("Catalog"),
        status: node.parse("Status")?.unwrap_or_default(),
        error: node.string("Error"),
        creation_time: node.time("CreationTime")?,
        submit_time: node.time("SubmitTime")?,
        last_update: node.time("LastUpdate")?,
        files: Vec::new(),
        fts_files: Vec::new(),
    };

    for child in node.children()? {
        match child.0.tag_name().name() {
            "file" => op.files.push(read_file(child)?),
            "ftsfile" => op.fts_files.push(read_fts_file(child)?),
            other => return Err(unexpected("operation", other)),
        }
    }
    Ok(op)
}

fn read_file(node: Node<'_, '_>) -> Result<File> {
    Ok(File {
        file_id: node.parse("FileID")?,
        lfn: node.required("LFN")?.to_string(),
        pfn: node.string("PFN"),
        size: node.parse("Size")?.unwrap_or(0),
        checksum: node.string("Checksum"),
        checksum_type: node.parse("ChecksumType")?.unwrap_or_default(),
        guid: node.string("GUID"),
        status: node.parse("Status")?.unwrap_or_default(),
        error: node.string("Error"),
        attempt: node.parse("Attempt")?.unwrap_or(0),
    })
}

fn read_fts_file(node: Node<'_, '_>) -> Result<FtsFile> {
    Ok(FtsFile {
        fts_file_id: node.parse("FTSFileID")?,
        request_id: node.parse("RequestID")?,
        operation_id: node.parse("OperationID")?,
        file_id: node.parse("FileID")?,
        lfn: node.required("LFN")?.to_string(),
        size: node.parse("Size")?.unwrap_or(0),
        checksum: node.string("Checksum"),
        checksum_type: node.parse("ChecksumType")?.unwrap_or_default(),
        source_se: node.required("SourceSE")?.to_string(),
        source_surl: node.string("SourceSURL"),
        target_se: node.required("TargetSE")?.to_string(),
        target_surl: node.string("TargetSURL"),
        route: node.required("Route")?.to_string(),
        ancestor: node.string("Ancestor"),
        attempt: node.parse("Attempt")?.unwrap_or(0),
        fts_guid: node.string("FTSGUID"),
        fts_job_id: node.parse("FTSJobID")?,
        status: node.parse("Status")?.unwrap_or_default(),
        error: node.string("Error"),
        creation_time: node.time("CreationTime")?,
        last_update: node.time("LastUpdate")?,
    })
}

fn unexpected(parent: &str, tag: &str) -> StoreError {
    StoreError::validation(parent, format!("unexpected element <{tag}>"))
}

/// Attribute accessors over one element.
#[derive(Clone, Copy)]
struct Node<'a, 'input>(roxmltree::Node<'a, 'input>);

impl<'a, 'input> Node<'a, 'input> {
    fn field(&self, name: &str) -> String {
        format!("{}.{}", self.0.tag_name().name(), name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.0.attribute(name).map(str::to_string)
    }

    fn required(&self, name: &str) -> Result<&'a str> {
        self.0
            .attribute(name)
            .ok_or_else(|| StoreError::validation(self.field(name), "attribute is required"))
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.0
            .attribute(name)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    StoreError::validation(self.field(name), format!("'{raw}': {e}"))
                })
            })
            .transpose()
    }

    fn time(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.0
            .attribute(name)
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| StoreError::validation(self.field(name), format!("'{raw}': {e}")))
            })
            .transpose()
    }

    /// Child elements; text content is rejected.
    fn children(&self) -> Result<Vec<Node<'a, 'input>>> {
        let mut out = Vec::new();
        for child in self.0.children() {
            if child.is_element() {
                out.push(Node(child));
            } else if child.is_text() && child.text().is_some_and(|t| !t.trim().is_empty()) {
                return Err(StoreError::validation(
                    self.0.tag_name().name(),
                    "element text is not allowed",
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ChecksumType, FileStatus, FtsFileStatus, OperationStatus, RequestStatus, RpcStub, types,
    };
    use chrono::TimeZone;

    fn sample() -> Request {
        let mut request = Request::new("transfer-42")
            .with_owner("/DC=org/CN=alice", "vo_user")
            .with_job_id(42);
        request.creation_time = Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap());
        request.add_operation(
            Operation::new(types::FTS_SCHEDULE)
                .with_source_se("CERN-DISK")
                .with_target_se("RAL-DISK,PIC-DISK")
                .with_file(
                    File::new("/vo/data/run1/f1 & \"quoted\"")
                        .with_size(1024)
                        .with_checksum("0a1b2c3d", ChecksumType::Adler32),
                ),
        );
        request.add_operation(
            Operation::new(types::FORWARD_RPC)
                .with_arguments(RpcStub::new("Jobs", "setStatus", serde_json::json!([42])).encode()),
        );
        request.operations[0].error = Some("line one\nline two".into());
        request.operations[0].fts_files.push(FtsFile {
            lfn: "/vo/data/run1/f1".into(),
            size: 1024,
            source_se: "CERN-DISK".into(),
            target_se: "RAL-DISK".into(),
            route: "CERN#RAL".into(),
            status: FtsFileStatus::Submitted,
            fts_guid: Some("0b6c2c1e-5d5a-4e38-9a52-8f8a0c0f2a11".into()),
            ..Default::default()
        });
        request
    }

    #[test]
    fn test_round_trip_preserves_attributes_and_order() {
        let request = sample();
        let xml = to_xml(&request);
        let back = from_xml(&xml).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_canonical_form_has_no_text() {
        let xml = to_xml(&sample());
        assert!(xml.starts_with("<request RequestName=\"transfer-42\""));
        assert!(xml.contains("<ftsfile "));
        assert!(xml.contains("&amp; &quot;quoted&quot;"));
        assert!(xml.contains("line one&#10;line two"));
        assert!(!xml.contains(">\n"));
    }

    #[test]
    fn test_defaults_for_missing_attributes() {
        let request = from_xml(
            r#"<request RequestName="r"><operation Type="removeFile"><file LFN="/a"/></operation></request>"#,
        )
        .unwrap();
        assert_eq!(request.status, RequestStatus::Waiting);
        assert_eq!(request.job_id, 0);
        assert_eq!(request.operations[0].order, 1);
        assert_eq!(request.operations[0].status, OperationStatus::Queued);
        assert_eq!(request.operations[0].files[0].status, FileStatus::Waiting);
    }

    #[test]
    fn test_rejects_element_text() {
        let err = from_xml(r#"<request RequestName="r">text</request>"#).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn test_rejects_bad_status_and_unknown_tags() {
        assert!(from_xml(r#"<request RequestName="r" Status="Sleeping"/>"#).is_err());
        assert!(from_xml(r#"<request RequestName="r"><job/></request>"#).is_err());
        assert!(from_xml(r#"<operation Type="x"/>"#).is_err());
        assert!(from_xml(r#"<request/>"#).is_err());
    }
}
