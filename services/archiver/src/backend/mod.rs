// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Backend abstraction
//!
//! Every external storage system implements the same put/get/delete/poll
//! interface and declares capability flags. Backends are looked up through
//! a static registry built from the backend registry file at process
//! start, so an unknown or misconfigured backend fails fast rather than at
//! first use.

mod httpstore;
mod localdir;

pub use httpstore::HttpStoreBackend;
pub use localdir::LocalDirBackend;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use thiserror::Error;

use archiver_types::JobStatus;

use crate::config::RegistryFile;

/// Backend operation errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached or timed out; retryable
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the request outright; not retryable
    #[error("Backend rejected request: {0}")]
    Rejected(String),

    /// The named object does not exist on the backend
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Local filesystem error while staging data for the backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BackendError {
    /// Whether the owning phase should retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable(_) => true,
            BackendError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            BackendError::Io(_) => true,
            BackendError::Rejected(_) | BackendError::NotFound(_) => false,
        }
    }
}

/// Capability flags a backend declares about itself.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Whether batch files must be packed into archives before upload.
    /// Backends that can take small objects natively still receive one
    /// single-file archive per batch member so metadata travels with it.
    pub requires_packing: bool,
    /// Maximum size of one uploaded object, in bytes
    pub max_object_size: u64,
    /// Maximum number of objects one batch may occupy
    pub max_objects_per_batch: u32,
    /// Whether put/get/delete complete asynchronously on the backend side
    pub supports_async_jobs: bool,
}

/// Uniform interface each external storage system implements.
///
/// `put`, `get` and `delete` each start one backend job and return a job
/// handle; `poll` reports the job's status. Synchronous backends return
/// handles whose poll is immediately `Done`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registered backend name
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Upload the staged archive at `local` under `remote_key`.
    async fn put(&self, local: &Path, remote_key: &str) -> Result<String, BackendError>;

    /// Download the object at `remote_key` to the local path `dest`.
    async fn get(&self, remote_key: &str, dest: &Path) -> Result<String, BackendError>;

    /// Remove the object at `remote_key`. Removing an object that is
    /// already gone is not an error.
    async fn delete(&self, remote_key: &str) -> Result<String, BackendError>;

    /// Report the status of a previously returned job handle.
    async fn poll(&self, handle: &str) -> Result<JobStatus, BackendError>;
}

/// Static mapping from backend name to implementation.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Build the registry from a parsed registry file, validating every
    /// entry. Duplicate names and unknown kinds are startup errors.
    pub fn from_file(file: &RegistryFile, http_timeout: Duration) -> Result<Self> {
        let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();

        for entry in &file.backends {
            let backend: Arc<dyn Backend> = match entry.kind.as_str() {
                "localdir" => Arc::new(
                    LocalDirBackend::from_params(&entry.name, &entry.params)
                        .with_context(|| format!("backend {}", entry.name))?,
                ),
                "httpstore" => Arc::new(
                    HttpStoreBackend::from_params(&entry.name, &entry.params, http_timeout)
                        .with_context(|| format!("backend {}", entry.name))?,
                ),
                other => bail!("backend {}: unknown kind {:?}", entry.name, other),
            };

            if backends.insert(entry.name.clone(), backend).is_some() {
                bail!("duplicate backend name {:?}", entry.name);
            }
        }

        Ok(Self { backends })
    }

    /// Build a registry directly from instantiated backends (tests, embedders).
    pub fn from_backends(list: Vec<Arc<dyn Backend>>) -> Self {
        let backends = list
            .into_iter()
            .map(|b| (b.name().to_string(), b))
            .collect();
        Self { backends }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(String::as_str).collect()
    }
}
