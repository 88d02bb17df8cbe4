// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Pack/unpack phase
//!
//! Owns the staging-filesystem half of the pipelines: building archives
//! for PUT (`PUT_PACKING`), extracting downloaded archives for GET
//! (`GET_UNPACK`) and restoring the extracted tree to its target
//! (`GET_RESTORE`). The migration cursor records the next archive to
//! handle, so an interrupted invocation resumes where it stopped; each
//! individual archive is rebuilt or re-extracted from scratch.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use archiver_types::{ArchiveStatus, Migration, MigrationState, Phase};

use crate::backend::BackendRegistry;
use crate::pack::{self, Staging};
use crate::store::MigrationStore;
use crate::workers::{Outcome, PhaseWorker, WorkerError};

pub struct PackWorker {
    store: Arc<dyn MigrationStore>,
    registry: Arc<BackendRegistry>,
    staging: Staging,
}

impl PackWorker {
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

    async fn pack(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        let batch = self.store.load_batch(migration.batch_id).await?;
        let backend = self
            .registry
            .get(&migration.backend)
            .ok_or_else(|| {
                WorkerError::Permanent(format!("unknown backend {:?}", migration.backend))
            })?;

        let mut archives = self.store.archives_for(migration.id).await?;
        if archives.is_empty() {
            let plan = pack::plan_archives(&batch, migration.id, &backend.capabilities())?;
            info!(
                migration = %migration.id,
                archives = plan.len(),
                files = batch.files.len(),
                "planned archive set"
            );
            for archive in &plan {
                self.store.create_archive(archive).await?;
            }
            archives = plan;
        }

        for archive in archives.iter_mut().skip(migration.cursor as usize) {
            if archive.status == ArchiveStatus::Building {
                let dest = self.staging.archive_path(migration.id, archive.index);
                let (size, digest) = pack::pack_archive(&batch, archive, &dest)?;
                archive.local_path = Some(dest.to_string_lossy().to_string());
                archive.size = size;
                archive.digest = Some(digest);
                archive.status = ArchiveStatus::Packed;
                self.store.save_archive(archive).await?;
                debug!(
                    migration = %migration.id,
                    index = archive.index,
                    size,
                    "packed archive"
                );
            }
            migration.cursor = archive.index + 1;
        }

        let next = MigrationState::PutPending;
        migration.advance(next);
        Ok(Outcome::Advanced)
    }

    async fn unpack(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        let archives = self.store.archives_for(migration.id).await?;
        let extract_dir = self.staging.extract_dir(migration.id);

        for archive in archives.iter().skip(migration.cursor as usize) {
            let tar_path = archive
                .local_path
                .as_deref()
                .map(Path::new)
                .ok_or(pack::PackError::MissingLocal(archive.id))?;
            let digest = archive.digest.as_deref().ok_or_else(|| {
                WorkerError::Permanent(format!("archive {} has no recorded digest", archive.id))
            })?;
            pack::unpack_archive(tar_path, digest, &extract_dir)?;
            migration.cursor = archive.index + 1;
            debug!(migration = %migration.id, index = archive.index, "extracted archive");
        }

        migration.advance(MigrationState::GetRestore);
        Ok(Outcome::Advanced)
    }

    async fn restore(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        let target = migration.target_path.clone().ok_or_else(|| {
            WorkerError::Permanent("GET migration has no target path".to_string())
        })?;
        let extract_dir = self.staging.extract_dir(migration.id);
        let archives = self.store.archives_for(migration.id).await?;

        for archive in archives.iter().skip(migration.cursor as usize) {
            pack::restore_tree(&extract_dir, Path::new(&target), &archive.manifest)?;
            migration.cursor = archive.index + 1;
        }

        info!(migration = %migration.id, target = %target, "batch restored");
        migration.advance(MigrationState::GetTidy);
        Ok(Outcome::Advanced)
    }
}

#[async_trait]
impl PhaseWorker for PackWorker {
    fn phase(&self) -> Phase {
        Phase::Pack
    }

    async fn process(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        match migration.state {
            MigrationState::PutPacking => self.pack(migration).await,
            MigrationState::GetUnpack => self.unpack(migration).await,
            MigrationState::GetRestore => self.restore(migration).await,
            other => Err(WorkerError::Permanent(format!(
                "pack phase cannot process state {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalDirBackend;
    use crate::store::MemoryStore;
    use archiver_types::{Batch, RequestType};
    use std::time::Duration;
    use uuid::Uuid;

    fn worker(tmp: &Path, store: Arc<MemoryStore>) -> PackWorker {
        let registry = Arc::new(BackendRegistry::from_backends(vec![Arc::new(
            LocalDirBackend::new("near", tmp.join("objects"), Duration::ZERO),
        )]));
        PackWorker::new(store, registry, Staging::new(tmp.join("staging")))
    }

    async fn put_batch_on_disk(tmp: &Path, store: &MemoryStore) -> (Batch, Migration) {
        let src = tmp.join("data");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("one.txt"), b"first file").unwrap();
        std::fs::write(src.join("two.txt"), b"second file").unwrap();

        let files = pack::scan_tree(&src).unwrap();
        let batch = Batch {
            id: Uuid::new_v4(),
            name: "docs".to_string(),
            owner: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            common_path: src.to_string_lossy().to_string(),
            files,
        };
        store.create_batch(&batch).await.unwrap();

        let mut m = Migration::new(batch.id, "near", RequestType::Put);
        m.state = MigrationState::PutPacking;
        store.create_migration(&m).await.unwrap();
        (batch, m)
    }

    #[tokio::test]
    async fn packing_builds_archives_and_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let worker = worker(tmp.path(), store.clone());
        let (_batch, mut m) = put_batch_on_disk(tmp.path(), &store).await;

        let outcome = worker.process(&mut m).await.unwrap();
        assert_eq!(outcome, Outcome::Advanced);
        assert_eq!(m.state, MigrationState::PutPending);
        assert_eq!(m.cursor, 0);

        let archives = store.archives_for(m.id).await.unwrap();
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].status, ArchiveStatus::Packed);
        assert!(archives[0].size > 0);
        let local = archives[0].local_path.as_deref().unwrap();
        assert!(Path::new(local).is_file());
        assert_eq!(archives[0].digest.as_deref().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn packing_twice_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let worker = worker(tmp.path(), store.clone());
        let (_batch, mut m) = put_batch_on_disk(tmp.path(), &store).await;

        worker.process(&mut m).await.unwrap();
        let first = store.archives_for(m.id).await.unwrap();

        // Simulate a replay: state back to packing, archives reset.
        m.advance(MigrationState::PutPacking);
        store.save_migration(&m).await.unwrap();
        worker.process(&mut m).await.unwrap();

        let second = store.archives_for(m.id).await.unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].digest, second[0].digest);
    }

    #[tokio::test]
    async fn wrong_state_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let worker = worker(tmp.path(), store.clone());
        let (_batch, mut m) = put_batch_on_disk(tmp.path(), &store).await;
        m.state = MigrationState::Putting;

        let err = worker.process(&mut m).await.unwrap_err();
        assert!(matches!(err, WorkerError::Permanent(_)));
    }
}
