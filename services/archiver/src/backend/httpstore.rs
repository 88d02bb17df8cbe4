// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! HTTP object-store backend
//!
//! Talks to an object-store-style HTTP endpoint: objects are addressed as
//! `{base_url}/{key}` and manipulated with plain PUT / GET / DELETE. The
//! store is synchronous from the engine's point of view, so poll answers
//! from a HEAD request on the object.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use archiver_types::JobStatus;

use super::{Backend, BackendError, Capabilities};

#[derive(Debug, Deserialize)]
struct Params {
    base_url: String,
    #[serde(default = "default_max_object_size")]
    max_object_size: u64,
    #[serde(default = "default_max_objects")]
    max_objects_per_batch: u32,
}

fn default_max_object_size() -> u64 {
    // Common single-request upload ceiling for S3-compatible stores
    5 * 1024 * 1024 * 1024
}

fn default_max_objects() -> u32 {
    1000
}

pub struct HttpStoreBackend {
    name: String,
    base_url: String,
    client: Client,
    caps: Capabilities,
}

impl HttpStoreBackend {
    pub fn from_params(
        name: &str,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Self> {
        let p: Params =
            serde_json::from_value(params.clone()).context("invalid httpstore params")?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            name: name.to_string(),
            base_url: p.base_url.trim_end_matches('/').to_string(),
            client,
            caps: Capabilities {
                requires_packing: true,
                max_object_size: p.max_object_size,
                max_objects_per_batch: p.max_objects_per_batch,
                supports_async_jobs: false,
            },
        })
    }

    fn object_url(&self, remote_key: &str) -> String {
        format!("{}/{}", self.base_url, remote_key)
    }

    fn check_status(status: StatusCode, remote_key: &str) -> Result<(), BackendError> {
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(BackendError::NotFound(remote_key.to_string()))
        } else if status.is_server_error() {
            Err(BackendError::Unavailable(format!(
                "{remote_key}: HTTP {status}"
            )))
        } else {
            Err(BackendError::Rejected(format!(
                "{remote_key}: HTTP {status}"
            )))
        }
    }
}

#[async_trait::async_trait]
impl Backend for HttpStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn put(&self, local: &Path, remote_key: &str) -> Result<String, BackendError> {
        let body = tokio::fs::read(local).await?;
        let resp = self
            .client
            .put(self.object_url(remote_key))
            .body(body)
            .send()
            .await?;
        Self::check_status(resp.status(), remote_key)?;
        Ok(format!("put:{remote_key}"))
    }

    async fn get(&self, remote_key: &str, dest: &Path) -> Result<String, BackendError> {
        let resp = self.client.get(self.object_url(remote_key)).send().await?;
        Self::check_status(resp.status(), remote_key)?;
        let body = resp.bytes().await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &body).await?;
        Ok(format!("get:{remote_key}"))
    }

    async fn delete(&self, remote_key: &str) -> Result<String, BackendError> {
        let resp = self
            .client
            .delete(self.object_url(remote_key))
            .send()
            .await?;
        // Already-gone objects are fine; delete is idempotent.
        if resp.status() != StatusCode::NOT_FOUND {
            Self::check_status(resp.status(), remote_key)?;
        }
        Ok(format!("delete:{remote_key}"))
    }

    async fn poll(&self, handle: &str) -> Result<JobStatus, BackendError> {
        let Some((op, remote_key)) = handle.split_once(':') else {
            return Err(BackendError::Rejected(format!("bad job handle {handle:?}")));
        };

        let resp = self.client.head(self.object_url(remote_key)).send().await?;
        let exists = resp.status().is_success();

        match op {
            "put" | "get" => {
                if exists {
                    Ok(JobStatus::Done)
                } else {
                    Ok(JobStatus::Failed(format!("object {remote_key} not found")))
                }
            }
            "delete" => {
                if exists {
                    Ok(JobStatus::Pending)
                } else {
                    Ok(JobStatus::Done)
                }
            }
            other => Err(BackendError::Rejected(format!(
                "unknown job kind {other:?} in handle"
            ))),
        }
    }
}
