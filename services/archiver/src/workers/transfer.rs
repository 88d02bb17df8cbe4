// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Transfer phase
//!
//! Moves migrations out of their `*_PENDING` states and then issues one
//! backend job per invocation while a migration sits in a chunked `*ING`
//! state. The cursor records how many archives have had their job issued;
//! the monitor phase watches those jobs and performs the state exits. One
//! bounded unit per invocation keeps a single huge batch from starving
//! everyone else sharing the cron slot.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use archiver_types::{Archive, Migration, MigrationState, Phase};

use crate::backend::{Backend, BackendRegistry};
use crate::pack::Staging;
use crate::store::MigrationStore;
use crate::workers::{Outcome, PhaseWorker, WorkerError};

pub struct TransferWorker {
    store: Arc<dyn MigrationStore>,
    registry: Arc<BackendRegistry>,
    staging: Staging,
}

impl TransferWorker {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: Arc<BackendRegistry>,
        staging: Staging,
    ) -> Self {
        Self {
            store,
            registry,
            staging,
        }
    }

    fn backend(&self, migration: &Migration) -> Result<Arc<dyn Backend>, WorkerError> {
        self.registry.get(&migration.backend).ok_or_else(|| {
            WorkerError::Permanent(format!("unknown backend {:?}", migration.backend))
        })
    }

    /// Next archive whose job has not been issued, per the cursor.
    async fn next_archive(
        &self,
        migration: &Migration,
    ) -> Result<Option<Archive>, WorkerError> {
        let archives = self.store.archives_for(migration.id).await?;
        Ok(archives.into_iter().nth(migration.cursor as usize))
    }

    async fn issue_put(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        let Some(mut archive) = self.next_archive(migration).await? else {
            return Ok(Outcome::NoChange);
        };
        let backend = self.backend(migration)?;

        let local = archive.local_path.clone().ok_or_else(|| {
            WorkerError::Permanent(format!("archive {} has no staged file", archive.id))
        })?;
        let handle = backend
            .put(std::path::Path::new(&local), &archive.remote_key)
            .await?;
        archive.job_handle = Some(handle);
        self.store.save_archive(&archive).await?;

        migration.cursor += 1;
        debug!(
            migration = %migration.id,
            index = archive.index,
            key = %archive.remote_key,
            "issued upload job"
        );
        Ok(Outcome::Progress)
    }

    async fn issue_get(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        let Some(mut archive) = self.next_archive(migration).await? else {
            return Ok(Outcome::NoChange);
        };
        let backend = self.backend(migration)?;

        let dest = self.staging.download_path(migration.id, archive.index);
        let handle = backend.get(&archive.remote_key, &dest).await?;
        archive.local_path = Some(dest.to_string_lossy().to_string());
        archive.job_handle = Some(handle);
        self.store.save_archive(&archive).await?;

        migration.cursor += 1;
        debug!(
            migration = %migration.id,
            index = archive.index,
            key = %archive.remote_key,
            "issued download job"
        );
        Ok(Outcome::Progress)
    }

    async fn issue_delete(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        let Some(mut archive) = self.next_archive(migration).await? else {
            return Ok(Outcome::NoChange);
        };
        let backend = self.backend(migration)?;

        let handle = backend.delete(&archive.remote_key).await?;
        archive.job_handle = Some(handle);
        self.store.save_archive(&archive).await?;

        migration.cursor += 1;
        debug!(
            migration = %migration.id,
            index = archive.index,
            key = %archive.remote_key,
            "issued delete job"
        );
        Ok(Outcome::Progress)
    }

    /// Enter a chunked state from its pending state.
    fn enter(&self, migration: &mut Migration, next: MigrationState) -> Outcome {
        if migration.request_type == archiver_types::RequestType::Put
            && migration.external_id.is_none()
        {
            // The backend-side batch identity is the key prefix shared by
            // this migration's objects.
            migration.external_id = Some(format!("batch-{}", migration.batch_id));
        }
        migration.advance(next);
        info!(migration = %migration.id, state = %migration.state, "transfer started");
        Outcome::Advanced
    }
}

#[async_trait]
impl PhaseWorker for TransferWorker {
    fn phase(&self) -> Phase {
        Phase::Transfer
    }

    async fn process(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        use MigrationState::*;
        match migration.state {
            PutPending => Ok(self.enter(migration, Putting)),
            GetPending => Ok(self.enter(migration, Getting)),
            DeletePending => Ok(self.enter(migration, Deleting)),
            VerifyPending => Ok(self.enter(migration, VerifyGetting)),

            Putting => self.issue_put(migration).await,
            Getting | VerifyGetting => self.issue_get(migration).await,
            Deleting => self.issue_delete(migration).await,

            other => Err(WorkerError::Permanent(format!(
                "transfer phase cannot process state {other}"
            ))),
        }
    }
}
