// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Monitor phase
//!
//! Polls the backend jobs the transfer phase issued and performs the
//! exits from the chunked `*ING` states once every archive's job has
//! completed. A cleared job handle marks a confirmed job, so polling is
//! idempotent and a crashed invocation re-polls at worst. Migrations that
//! sit in a monitored state longer than the poll budget are failed rather
//! than polled forever.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use archiver_types::{ArchiveStatus, JobStatus, Migration, MigrationState, Phase};

use crate::backend::BackendRegistry;
use crate::store::MigrationStore;
use crate::workers::{Outcome, PhaseWorker, WorkerError};

pub struct MonitorWorker {
    store: Arc<dyn MigrationStore>,
    registry: Arc<BackendRegistry>,
    max_poll_secs: i64,
}

impl MonitorWorker {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: Arc<BackendRegistry>,
        max_poll_secs: i64,
    ) -> Self {
        Self {
            store,
            registry,
            max_poll_secs,
        }
    }
}

#[async_trait]
impl PhaseWorker for MonitorWorker {
    fn phase(&self) -> Phase {
        Phase::Monitor
    }

    async fn process(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        // updated_at is only bumped by state transitions, so this measures
        // time spent in the current chunked state.
        let in_state = Utc::now() - migration.updated_at;
        if in_state.num_seconds() > self.max_poll_secs {
            return Err(WorkerError::Permanent(format!(
                "backend jobs still incomplete after {}s in {}",
                in_state.num_seconds(),
                migration.state
            )));
        }

        let backend = self.registry.get(&migration.backend).ok_or_else(|| {
            WorkerError::Permanent(format!("unknown backend {:?}", migration.backend))
        })?;

        let archives = self.store.archives_for(migration.id).await?;
        let mut pending = 0u32;
        let mut completed = 0u32;

        for mut archive in archives.iter().cloned() {
            let Some(handle) = archive.job_handle.clone() else {
                continue;
            };
            match backend.poll(&handle).await? {
                JobStatus::Pending => pending += 1,
                JobStatus::Done => {
                    archive.job_handle = None;
                    if migration.state == MigrationState::Putting {
                        archive.status = ArchiveStatus::Transferred;
                    }
                    self.store.save_archive(&archive).await?;
                    completed += 1;
                    debug!(
                        migration = %migration.id,
                        index = archive.index,
                        "backend job complete"
                    );
                }
                JobStatus::Failed(reason) => {
                    return Err(WorkerError::Permanent(format!(
                        "backend job for archive {} failed: {reason}",
                        archive.index
                    )));
                }
            }
        }

        // Every archive is either confirmed (handle cleared) or polled
        // Done just now, so no pending jobs plus a full cursor means the
        // chunked state is finished.
        let all_issued = migration.cursor as usize >= archives.len();
        if all_issued && pending == 0 {
            let next = migration.state.successor().ok_or_else(|| {
                WorkerError::Permanent(format!("{} has no successor", migration.state))
            })?;
            migration.advance(next);
            info!(migration = %migration.id, state = %migration.state, "all backend jobs complete");
            return Ok(Outcome::Advanced);
        }

        if completed > 0 {
            Ok(Outcome::Progress)
        } else {
            Ok(Outcome::NoChange)
        }
    }
}
