// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Tidy phase
//!
//! Final housekeeping for every pipeline: remove the migration's staging
//! subtree, guarantee remote removal for DELETE, and move completed
//! migrations to their terminal `deleted` bookkeeping state. Everything
//! here is idempotent; staging removal of an absent tree and deletion of
//! an already-gone object are both no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use archiver_types::{JobStatus, Migration, MigrationState, Phase};

use crate::backend::BackendRegistry;
use crate::pack::Staging;
use crate::store::MigrationStore;
use crate::workers::{Outcome, PhaseWorker, WorkerError};

pub struct TidyWorker {
    store: Arc<dyn MigrationStore>,
    registry: Arc<BackendRegistry>,
    staging: Staging,
}

impl TidyWorker {
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

    async fn tidy_local(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        self.staging.remove_migration(migration.id)?;
        let next = migration.state.successor().ok_or_else(|| {
            WorkerError::Permanent(format!("{} has no successor", migration.state))
        })?;
        migration.advance(next);
        info!(migration = %migration.id, state = %migration.state, "pipeline complete");
        Ok(Outcome::Advanced)
    }

    /// DELETE tidy re-issues every archive's backend delete. The transfer
    /// and monitor phases already did this once; re-deleting an absent
    /// object is free, and doing it here makes remote removal a
    /// postcondition of leaving `DELETE_TIDY` even if earlier confirmations
    /// were lost.
    async fn tidy_delete(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        let backend = self.registry.get(&migration.backend).ok_or_else(|| {
            WorkerError::Permanent(format!("unknown backend {:?}", migration.backend))
        })?;

        let archives = self.store.archives_for(migration.id).await?;
        let mut pending = 0u32;
        for archive in &archives {
            let handle = backend.delete(&archive.remote_key).await?;
            if backend.poll(&handle).await? == JobStatus::Pending {
                pending += 1;
            }
        }
        if pending > 0 {
            debug!(
                migration = %migration.id,
                pending,
                "remote deletes still pending"
            );
            return Ok(Outcome::NoChange);
        }

        self.staging.remove_migration(migration.id)?;
        migration.advance(MigrationState::DeleteCompleted);
        info!(
            migration = %migration.id,
            archives = archives.len(),
            "remote copy removed"
        );
        Ok(Outcome::Advanced)
    }
}

#[async_trait]
impl PhaseWorker for TidyWorker {
    fn phase(&self) -> Phase {
        Phase::Tidy
    }

    async fn process(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        use MigrationState::*;
        match migration.state {
            PutTidy | GetTidy => self.tidy_local(migration).await,
            DeleteTidy => self.tidy_delete(migration).await,
            // Completed migrations age out into the purgeable record state
            // on the next tidy pass.
            PutCompleted | GetCompleted | DeleteCompleted => {
                migration.advance(Deleted);
                debug!(migration = %migration.id, "record marked purgeable");
                Ok(Outcome::Advanced)
            }
            other => Err(WorkerError::Permanent(format!(
                "tidy phase cannot process state {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalDirBackend};
    use crate::store::MemoryStore;
    use archiver_types::{Archive, ArchiveStatus, Batch, RequestType};
    use std::path::Path;
    use std::time::Duration;
    use uuid::Uuid;

    fn setup(tmp: &Path, store: Arc<MemoryStore>) -> (Arc<LocalDirBackend>, TidyWorker) {
        let backend = Arc::new(LocalDirBackend::new(
            "near",
            tmp.join("objects"),
            Duration::ZERO,
        ));
        let registry = Arc::new(BackendRegistry::from_backends(vec![backend.clone()]));
        let worker = TidyWorker::new(store, registry, Staging::new(tmp.join("staging")));
        (backend, worker)
    }

    async fn migration_in(
        store: &MemoryStore,
        request_type: RequestType,
        state: MigrationState,
    ) -> Migration {
        let batch = Batch {
            id: Uuid::new_v4(),
            name: "b".to_string(),
            owner: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            common_path: "/data".to_string(),
            files: Vec::new(),
        };
        store.create_batch(&batch).await.unwrap();
        let mut m = Migration::new(batch.id, "near", request_type);
        m.state = state;
        store.create_migration(&m).await.unwrap();
        m
    }

    #[tokio::test]
    async fn put_tidy_removes_staging_and_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (_backend, worker) = setup(tmp.path(), store.clone());
        let mut m = migration_in(&store, RequestType::Put, MigrationState::PutTidy).await;

        let staging = Staging::new(tmp.path().join("staging"));
        let leftover = staging.archive_path(m.id, 0);
        std::fs::create_dir_all(leftover.parent().unwrap()).unwrap();
        std::fs::write(&leftover, b"x").unwrap();

        assert_eq!(worker.process(&mut m).await.unwrap(), Outcome::Advanced);
        assert_eq!(m.state, MigrationState::PutCompleted);
        assert!(!staging.migration_dir_exists(m.id));
    }

    #[tokio::test]
    async fn delete_tidy_guarantees_remote_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (backend, worker) = setup(tmp.path(), store.clone());
        let mut m = migration_in(&store, RequestType::Delete, MigrationState::DeleteTidy).await;

        // One object still present remotely, one already gone.
        let staged = tmp.path().join("staged.tar");
        std::fs::write(&staged, b"bytes").unwrap();
        backend.put(&staged, "k0").await.unwrap();

        for (i, key) in ["k0", "k1"].iter().enumerate() {
            let mut a = Archive::new(m.id, i as u32, key.to_string());
            a.status = ArchiveStatus::Transferred;
            store.create_archive(&a).await.unwrap();
        }

        assert_eq!(worker.process(&mut m).await.unwrap(), Outcome::Advanced);
        assert_eq!(m.state, MigrationState::DeleteCompleted);
        assert!(matches!(
            backend.get("k0", &tmp.path().join("out")).await,
            Err(crate::backend::BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn completed_records_age_into_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (_backend, worker) = setup(tmp.path(), store.clone());
        let mut m =
            migration_in(&store, RequestType::Get, MigrationState::GetCompleted).await;

        assert_eq!(worker.process(&mut m).await.unwrap(), Outcome::Advanced);
        assert_eq!(m.state, MigrationState::Deleted);
        assert!(m.state.is_final());
    }
}
