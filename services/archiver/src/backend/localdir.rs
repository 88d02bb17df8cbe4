// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Local-directory backend
//!
//! Stores objects as plain files under a root directory. Asynchronous
//! backend jobs are modelled with a per-object sidecar file recording when
//! the job becomes visible, so the monitor worker has something real to
//! poll. With a zero job delay every job polls `Done` immediately, which
//! is how the integration tests drive full pipelines.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use archiver_types::JobStatus;

use super::{Backend, BackendError, Capabilities};

/// Sidecar recording an in-flight put job.
#[derive(Debug, Serialize, Deserialize)]
struct JobSidecar {
    ready_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct Params {
    root: PathBuf,
    #[serde(default)]
    job_delay_ms: u64,
    #[serde(default = "default_max_object_size")]
    max_object_size: u64,
    #[serde(default = "default_max_objects")]
    max_objects_per_batch: u32,
}

fn default_max_object_size() -> u64 {
    // 5 GiB, the usual single-object ceiling
    5 * 1024 * 1024 * 1024
}

fn default_max_objects() -> u32 {
    10_000
}

pub struct LocalDirBackend {
    name: String,
    root: PathBuf,
    job_delay: Duration,
    caps: Capabilities,
}

impl LocalDirBackend {
    pub fn new(name: &str, root: PathBuf, job_delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            root,
            job_delay,
            caps: Capabilities {
                requires_packing: true,
                max_object_size: default_max_object_size(),
                max_objects_per_batch: default_max_objects(),
                supports_async_jobs: true,
            },
        }
    }

    pub fn from_params(name: &str, params: &serde_json::Value) -> Result<Self> {
        let p: Params =
            serde_json::from_value(params.clone()).context("invalid localdir params")?;
        let mut backend = Self::new(name, p.root, Duration::from_millis(p.job_delay_ms));
        backend.caps.max_object_size = p.max_object_size;
        backend.caps.max_objects_per_batch = p.max_objects_per_batch;
        Ok(backend)
    }

    fn object_path(&self, remote_key: &str) -> PathBuf {
        self.root.join(remote_key)
    }

    fn sidecar_path(&self, remote_key: &str) -> PathBuf {
        self.root.join(format!("{remote_key}.job"))
    }
}

#[async_trait::async_trait]
impl Backend for LocalDirBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn put(&self, local: &Path, remote_key: &str) -> Result<String, BackendError> {
        let dest = self.object_path(remote_key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &dest).await?;

        let sidecar = JobSidecar {
            ready_at: Utc::now()
                + chrono::Duration::milliseconds(self.job_delay.as_millis() as i64),
        };
        let body = serde_json::to_vec(&sidecar)
            .map_err(|e| BackendError::Rejected(format!("sidecar encode: {e}")))?;
        tokio::fs::write(self.sidecar_path(remote_key), body).await?;

        Ok(format!("put:{remote_key}"))
    }

    async fn get(&self, remote_key: &str, dest: &Path) -> Result<String, BackendError> {
        let src = self.object_path(remote_key);
        if !tokio::fs::try_exists(&src).await? {
            return Err(BackendError::NotFound(remote_key.to_string()));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest).await?;
        Ok(format!("get:{remote_key}"))
    }

    async fn delete(&self, remote_key: &str) -> Result<String, BackendError> {
        for path in [self.object_path(remote_key), self.sidecar_path(remote_key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(format!("delete:{remote_key}"))
    }

    async fn poll(&self, handle: &str) -> Result<JobStatus, BackendError> {
        let Some((op, remote_key)) = handle.split_once(':') else {
            return Err(BackendError::Rejected(format!("bad job handle {handle:?}")));
        };

        match op {
            "put" => {
                let object = self.object_path(remote_key);
                if !tokio::fs::try_exists(&object).await? {
                    return Ok(JobStatus::Failed(format!(
                        "object {remote_key} missing after put"
                    )));
                }
                match tokio::fs::read(self.sidecar_path(remote_key)).await {
                    Ok(body) => {
                        let sidecar: JobSidecar = serde_json::from_slice(&body).map_err(|e| {
                            BackendError::Rejected(format!("sidecar decode: {e}"))
                        })?;
                        if sidecar.ready_at <= Utc::now() {
                            Ok(JobStatus::Done)
                        } else {
                            Ok(JobStatus::Pending)
                        }
                    }
                    // Object present but sidecar gone: the job completed and
                    // was cleaned up at some point. Treat as done.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JobStatus::Done),
                    Err(e) => Err(e.into()),
                }
            }
            "get" => {
                if tokio::fs::try_exists(self.object_path(remote_key)).await? {
                    Ok(JobStatus::Done)
                } else {
                    Ok(JobStatus::Failed(format!("object {remote_key} vanished")))
                }
            }
            "delete" => {
                if tokio::fs::try_exists(self.object_path(remote_key)).await? {
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
