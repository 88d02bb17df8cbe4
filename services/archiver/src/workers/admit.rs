// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Lock-admission phase
//!
//! Admits `*_START` migrations into their pipelines, subject to the
//! same-target ordering rule: while an earlier migration against the same
//! (batch, backend) has not reached a safe-interrupt boundary, later ones
//! wait in their start state. This is what lets a DELETE be submitted
//! while a PUT is in flight and still come out correct.
//!
//! GET and DELETE admissions also inherit their archive set from the most
//! recent completed PUT of the same target, since archives are owned by
//! the migration that created them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use archiver_types::{Archive, ArchiveStatus, Migration, Phase, RequestType};

use crate::backend::BackendRegistry;
use crate::store::MigrationStore;
use crate::workers::{Outcome, PhaseWorker, WorkerError};

pub struct AdmitWorker {
    store: Arc<dyn MigrationStore>,
    registry: Arc<BackendRegistry>,
}

impl AdmitWorker {
    pub fn new(store: Arc<dyn MigrationStore>, registry: Arc<BackendRegistry>) -> Self {
        Self { store, registry }
    }

    /// Copy the archive set of `source` onto `migration_id`: same keys,
    /// manifests and digests, no staging path or job handle. Idempotent
    /// via the existing-archives check in `process`.
    async fn clone_archives(
        &self,
        migration_id: Uuid,
        source: &Migration,
    ) -> Result<usize, WorkerError> {
        let sources = self.store.archives_for(source.id).await?;
        for src in &sources {
            let mut archive = Archive::new(migration_id, src.index, src.remote_key.clone());
            archive.manifest = src.manifest.clone();
            archive.size = src.size;
            archive.digest = src.digest.clone();
            archive.status = ArchiveStatus::Transferred;
            self.store.create_archive(&archive).await?;
        }
        Ok(sources.len())
    }
}

#[async_trait]
impl PhaseWorker for AdmitWorker {
    fn phase(&self) -> Phase {
        Phase::Lock
    }

    async fn process(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        if let Some(blocker) = self.store.older_active_sibling(migration).await? {
            debug!(
                migration = %migration.id,
                blocker = %blocker.id,
                blocker_state = %blocker.state,
                "admission deferred by same-target ordering"
            );
            return Ok(Outcome::Blocked);
        }

        if self.registry.get(&migration.backend).is_none() {
            return Err(WorkerError::Permanent(format!(
                "unknown backend {:?}",
                migration.backend
            )));
        }

        match migration.request_type {
            RequestType::Put => {}
            RequestType::Get => {
                if migration.target_path.is_none() {
                    return Err(WorkerError::Permanent(
                        "GET migration has no target path".to_string(),
                    ));
                }
                self.inherit_archives(migration).await?;
            }
            RequestType::Delete => {
                self.inherit_archives_for_delete(migration).await?;
            }
        }

        let next = migration
            .state
            .successor()
            .ok_or_else(|| WorkerError::Permanent(format!("{} has no successor", migration.state)))?;
        migration.advance(next);
        info!(migration = %migration.id, state = %migration.state, "admitted");
        Ok(Outcome::Advanced)
    }
}

impl AdmitWorker {
    async fn inherit_archives(&self, migration: &mut Migration) -> Result<(), WorkerError> {
        // A re-run after a crash mid-admission already has its archives.
        if !self.store.archives_for(migration.id).await?.is_empty() {
            return Ok(());
        }

        let source = self
            .store
            .latest_completed_put(migration.batch_id, &migration.backend)
            .await?
            .ok_or_else(|| {
                WorkerError::Permanent(format!(
                    "no completed PUT of batch {} on backend {:?}",
                    migration.batch_id, migration.backend
                ))
            })?;

        let count = self.clone_archives(migration.id, &source).await?;
        migration.external_id = source.external_id.clone();
        debug!(
            migration = %migration.id,
            source = %source.id,
            archives = count,
            "inherited archive set"
        );
        Ok(())
    }

    /// DELETE is a cleanup operation: it must be able to remove the
    /// half-uploaded objects of a PUT that failed mid-transfer, so it
    /// falls back from the latest completed PUT to the latest PUT that
    /// owns archives at all. A batch never uploaded admits with an empty
    /// archive set and runs through trivially.
    async fn inherit_archives_for_delete(
        &self,
        migration: &mut Migration,
    ) -> Result<(), WorkerError> {
        if !self.store.archives_for(migration.id).await?.is_empty() {
            return Ok(());
        }

        let source = match self
            .store
            .latest_completed_put(migration.batch_id, &migration.backend)
            .await?
        {
            Some(put) => Some(put),
            None => {
                self.store
                    .latest_archived_put(migration.batch_id, &migration.backend)
                    .await?
            }
        };

        match source {
            Some(put) => {
                let count = self.clone_archives(migration.id, &put).await?;
                migration.external_id = put.external_id.clone();
                debug!(
                    migration = %migration.id,
                    source = %put.id,
                    source_state = %put.state,
                    archives = count,
                    "inherited archive set"
                );
            }
            None => {
                info!(
                    migration = %migration.id,
                    batch = %migration.batch_id,
                    "nothing uploaded for this target, delete is trivial"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalDirBackend;
    use crate::store::MemoryStore;
    use archiver_types::{Batch, MigrationState};
    use std::time::Duration;

    fn registry(tmp: &std::path::Path) -> Arc<BackendRegistry> {
        Arc::new(BackendRegistry::from_backends(vec![Arc::new(
            LocalDirBackend::new("near", tmp.join("store"), Duration::ZERO),
        )]))
    }

    async fn seeded_store() -> (Arc<MemoryStore>, Batch) {
        let store = Arc::new(MemoryStore::new());
        let batch = Batch {
            id: Uuid::new_v4(),
            name: "b".to_string(),
            owner: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            common_path: "/data/b".to_string(),
            files: Vec::new(),
        };
        store.create_batch(&batch).await.unwrap();
        (store, batch)
    }

    #[tokio::test]
    async fn put_admission_advances_to_packing() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, batch) = seeded_store().await;
        let worker = AdmitWorker::new(store.clone(), registry(tmp.path()));

        let mut m = Migration::new(batch.id, "near", RequestType::Put);
        store.create_migration(&m).await.unwrap();

        let outcome = worker.process(&mut m).await.unwrap();
        assert_eq!(outcome, Outcome::Advanced);
        assert_eq!(m.state, MigrationState::PutPacking);
    }

    #[tokio::test]
    async fn admission_blocked_by_inflight_sibling() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, batch) = seeded_store().await;
        let worker = AdmitWorker::new(store.clone(), registry(tmp.path()));

        let mut put = Migration::new(batch.id, "near", RequestType::Put);
        put.state = MigrationState::Putting;
        store.create_migration(&put).await.unwrap();

        let mut del = Migration::new(batch.id, "near", RequestType::Delete);
        store.create_migration(&del).await.unwrap();

        assert_eq!(worker.process(&mut del).await.unwrap(), Outcome::Blocked);
        assert_eq!(del.state, MigrationState::DeleteStart);
    }

    #[tokio::test]
    async fn unknown_backend_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, batch) = seeded_store().await;
        let worker = AdmitWorker::new(store.clone(), registry(tmp.path()));

        let mut m = Migration::new(batch.id, "nonesuch", RequestType::Put);
        store.create_migration(&m).await.unwrap();

        let err = worker.process(&mut m).await.unwrap_err();
        assert!(matches!(err, WorkerError::Permanent(_)));
    }

    #[tokio::test]
    async fn get_without_completed_put_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, batch) = seeded_store().await;
        let worker = AdmitWorker::new(store.clone(), registry(tmp.path()));

        let mut get = Migration::new(batch.id, "near", RequestType::Get);
        get.target_path = Some("/restore/here".to_string());
        store.create_migration(&get).await.unwrap();

        let err = worker.process(&mut get).await.unwrap_err();
        assert!(matches!(err, WorkerError::Permanent(_)));
    }

    #[tokio::test]
    async fn delete_falls_back_to_archives_of_a_failed_put() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, batch) = seeded_store().await;
        let worker = AdmitWorker::new(store.clone(), registry(tmp.path()));

        // A PUT that died mid-transfer: archives exist, pipeline Failed.
        let mut put = Migration::new(batch.id, "near", RequestType::Put);
        put.state = MigrationState::Failed;
        store.create_migration(&put).await.unwrap();
        let src = Archive::new(put.id, 0, format!("batch-{}/archive-0.tar", batch.id));
        store.create_archive(&src).await.unwrap();

        let mut del = Migration::new(batch.id, "near", RequestType::Delete);
        store.create_migration(&del).await.unwrap();

        assert_eq!(worker.process(&mut del).await.unwrap(), Outcome::Advanced);
        assert_eq!(del.state, MigrationState::DeletePending);
        let cloned = store.archives_for(del.id).await.unwrap();
        assert_eq!(cloned.len(), 1);
        assert_eq!(cloned[0].remote_key, src.remote_key);
    }

    #[tokio::test]
    async fn delete_of_never_uploaded_batch_admits_with_no_archives() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, batch) = seeded_store().await;
        let worker = AdmitWorker::new(store.clone(), registry(tmp.path()));

        let mut del = Migration::new(batch.id, "near", RequestType::Delete);
        store.create_migration(&del).await.unwrap();

        assert_eq!(worker.process(&mut del).await.unwrap(), Outcome::Advanced);
        assert_eq!(del.state, MigrationState::DeletePending);
        assert!(store.archives_for(del.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_inherits_archives_from_completed_put() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, batch) = seeded_store().await;
        let worker = AdmitWorker::new(store.clone(), registry(tmp.path()));

        let mut put = Migration::new(batch.id, "near", RequestType::Put);
        put.state = MigrationState::PutCompleted;
        put.external_id = Some(format!("batch-{}", batch.id));
        store.create_migration(&put).await.unwrap();

        let mut src = Archive::new(put.id, 0, format!("batch-{}/archive-0.tar", batch.id));
        src.size = 42;
        src.digest = Some("abc123".to_string());
        src.status = ArchiveStatus::Verified;
        store.create_archive(&src).await.unwrap();

        let mut get = Migration::new(batch.id, "near", RequestType::Get);
        get.target_path = Some("/restore/here".to_string());
        store.create_migration(&get).await.unwrap();

        assert_eq!(worker.process(&mut get).await.unwrap(), Outcome::Advanced);
        assert_eq!(get.state, MigrationState::GetPending);
        assert_eq!(get.external_id, put.external_id);

        let cloned = store.archives_for(get.id).await.unwrap();
        assert_eq!(cloned.len(), 1);
        assert_eq!(cloned[0].remote_key, src.remote_key);
        assert_eq!(cloned[0].digest.as_deref(), Some("abc123"));
        assert_eq!(cloned[0].status, ArchiveStatus::Transferred);
        assert!(cloned[0].local_path.is_none());
        assert!(cloned[0].job_handle.is_none());

        // Processing again (crash replay) must not duplicate archives.
        let mut get2 = get.clone();
        get2.state = MigrationState::GetStart;
        store.save_migration(&get2).await.unwrap();
        worker.process(&mut get2).await.unwrap();
        assert_eq!(store.archives_for(get.id).await.unwrap().len(), 1);
    }
}
