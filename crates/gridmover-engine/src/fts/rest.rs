// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FTS3 REST client.
//!
//! Verbs: `POST {server}/jobs`, `GET {server}/jobs/{guid}?files=...` and
//! `DELETE {server}/jobs/{guid}`.

use std::time::Duration;

use async_trait::async_trait;
use gridmover_core::FtsFileStatus;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::client::{
    ChecksumMode, FtsClient, FtsError, RemoteFileState, RemoteJobState, SubmitRequest,
    map_file_state, map_job_state,
};

const FILE_FIELDS: &str = "file_state,source_surl,dest_surl,reason";

/// Message the server uses for jobs it has forgotten.
const UNKNOWN_JOB_MARKER: &str = "not authorised to query request";

#[derive(Debug, Deserialize)]
struct SubmitReply {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobReply {
    job_state: String,
    #[serde(default)]
    files: Vec<FileReply>,
}

#[derive(Debug, Deserialize)]
struct FileReply {
    file_state: String,
    #[serde(default)]
    source_surl: String,
    #[serde(default)]
    dest_surl: String,
    #[serde(default)]
    reason: Option<String>,
}

/// [`FtsClient`] over the FTS3 REST API.
#[derive(Debug, Clone)]
pub struct RestFtsClient {
    http: reqwest::Client,
}

impl RestFtsClient {
    pub fn new(timeout: Duration) -> Result<Self, FtsError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FtsError::Transport(e.to_string()))?;
        Ok(Self { http })
    }

    fn jobs_url(server: &str) -> String {
        format!("{}/jobs", server.trim_end_matches('/'))
    }

    async fn read_body(
        response: reqwest::Response,
        guid: Option<&str>,
    ) -> Result<String, FtsError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FtsError::Transport(e.to_string()))?;
        if status.is_success() {
            return Ok(body);
        }
        let subject = guid.unwrap_or("<submission>").to_string();
        Err(match status {
            StatusCode::NOT_FOUND if guid.is_some() => FtsError::UnknownJob(subject),
            StatusCode::FORBIDDEN if body.contains(UNKNOWN_JOB_MARKER) => {
                FtsError::UnknownJob(subject)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                FtsError::Auth(format!("HTTP {status}: {body}"))
            }
            s if s.is_server_error() => FtsError::Transport(format!("HTTP {status}: {body}")),
            _ => FtsError::Protocol(format!("HTTP {status}: {body}")),
        })
    }
}

fn submit_body(request: &SubmitRequest) -> Value {
    let verify = request.checksum_mode != ChecksumMode::None;
    let files: Vec<Value> = request
        .pairs
        .iter()
        .map(|pair| {
            let mut file = json!({
                "sources": [pair.source_surl],
                "destinations": [pair.target_surl],
                "filesize": pair.size,
            });
            if verify && let Some(checksum) = &pair.checksum {
                file["checksum"] = json!(checksum);
            }
            file
        })
        .collect();
    json!({
        "files": files,
        "params": {
            "verify_checksum": verify,
            "job_metadata": {"submission_id": request.submission_id.to_string()},
        },
    })
}

#[async_trait]
impl FtsClient for RestFtsClient {
    async fn submit(&self, server: &str, request: &SubmitRequest) -> Result<String, FtsError> {
        let response = self
            .http
            .post(Self::jobs_url(server))
            .json(&submit_body(request))
            .send()
            .await
            .map_err(|e| FtsError::Transport(e.to_string()))?;
        let body = Self::read_body(response, None).await?;
        let reply: SubmitReply =
            serde_json::from_str(&body).map_err(|e| FtsError::Protocol(e.to_string()))?;
        debug!(server = %server, fts_guid = %reply.job_id, files = request.pairs.len(), "FTS job submitted");
        Ok(reply.job_id)
    }

    async fn status(&self, server: &str, guid: &str) -> Result<RemoteJobState, FtsError> {
        let response = self
            .http
            .get(format!("{}/{guid}", Self::jobs_url(server)))
            .query(&[("files", FILE_FIELDS)])
            .send()
            .await
            .map_err(|e| FtsError::Transport(e.to_string()))?;
        let body = Self::read_body(response, Some(guid)).await?;
        let reply: JobReply =
            serde_json::from_str(&body).map_err(|e| FtsError::Protocol(e.to_string()))?;

        let status = map_job_state(&reply.job_state)
            .ok_or_else(|| FtsError::Protocol(format!("unknown job state '{}'", reply.job_state)))?;
        let files = reply
            .files
            .into_iter()
            .map(|f| {
                let file_status = map_file_state(&f.file_state).unwrap_or_else(|| {
                    warn!(fts_guid = %guid, state = %f.file_state, "Unknown FTS file state");
                    FtsFileStatus::Submitted
                });
                RemoteFileState {
                    source_surl: f.source_surl,
                    target_surl: f.dest_surl,
                    status: file_status,
                    reason: f.reason.filter(|r| !r.is_empty()),
                }
            })
            .collect();
        Ok(RemoteJobState::from_files(status, files))
    }

    async fn cancel(&self, server: &str, guid: &str) -> Result<(), FtsError> {
        let response = self
            .http
            .delete(format!("{}/{guid}", Self::jobs_url(server)))
            .send()
            .await
            .map_err(|e| FtsError::Transport(e.to_string()))?;
        Self::read_body(response, Some(guid)).await?;
        Ok(())
    }
}
