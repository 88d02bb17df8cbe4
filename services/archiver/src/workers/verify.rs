// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Verify phase
//!
//! Compares the digests of the re-downloaded archives against the digests
//! recorded at pack time. A clean comparison releases the PUT towards
//! tidy; a mismatch sends the whole migration back to `PUT_PACKING` for a
//! rebuild-and-resend round, up to the configured attempt budget.
//! Verification touches nothing but staging files and archive rows, so
//! running it twice over the same downloads is harmless.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use archiver_types::{ArchiveStatus, Migration, MigrationState, Phase};

use crate::pack::{self, Staging};
use crate::store::MigrationStore;
use crate::workers::{Outcome, PhaseWorker, WorkerError};

pub struct VerifyWorker {
    store: Arc<dyn MigrationStore>,
    staging: Staging,
    max_verify_attempts: u32,
}

impl VerifyWorker {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        staging: Staging,
        max_verify_attempts: u32,
    ) -> Self {
        Self {
            store,
            staging,
            max_verify_attempts,
        }
    }
}

#[async_trait]
impl PhaseWorker for VerifyWorker {
    fn phase(&self) -> Phase {
        Phase::Verify
    }

    async fn process(&self, migration: &mut Migration) -> Result<Outcome, WorkerError> {
        let mut archives = self.store.archives_for(migration.id).await?;
        let mut mismatched: Vec<u32> = Vec::new();

        for archive in &archives {
            let expected = archive.digest.as_deref().ok_or_else(|| {
                WorkerError::Permanent(format!("archive {} has no recorded digest", archive.id))
            })?;
            let downloaded = archive
                .local_path
                .as_deref()
                .ok_or(pack::PackError::MissingLocal(archive.id))?;
            let actual = pack::file_digest(Path::new(downloaded))?;
            if actual != expected {
                warn!(
                    migration = %migration.id,
                    index = archive.index,
                    expected,
                    actual,
                    "archive digest mismatch"
                );
                mismatched.push(archive.index);
            }
        }

        if mismatched.is_empty() {
            for archive in &mut archives {
                archive.status = ArchiveStatus::Verified;
                self.store.save_archive(archive).await?;
            }
            migration.advance(MigrationState::PutTidy);
            info!(
                migration = %migration.id,
                archives = archives.len(),
                "verification passed"
            );
            return Ok(Outcome::Advanced);
        }

        migration.verify_attempts += 1;
        if migration.verify_attempts >= self.max_verify_attempts {
            return Err(WorkerError::Permanent(format!(
                "verification failed for archives {:?} after {} attempts",
                mismatched, migration.verify_attempts
            )));
        }

        // Rebuild round: reset every archive to Building and run the PUT
        // pipeline again from packing. verify_attempts survives advance.
        for archive in &mut archives {
            archive.status = ArchiveStatus::Building;
            archive.job_handle = None;
            archive.local_path = None;
            self.store.save_archive(archive).await?;
        }
        self.staging.remove_downloads(migration.id)?;
        migration.advance(MigrationState::PutPacking);
        warn!(
            migration = %migration.id,
            attempt = migration.verify_attempts,
            "verification failed, rebuilding archives"
        );
        Ok(Outcome::Advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use archiver_types::{Archive, Batch, RequestType};
    use uuid::Uuid;

    async fn verifying_migration(
        store: &MemoryStore,
        downloaded: &Path,
        digest: &str,
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

        let mut m = Migration::new(batch.id, "near", RequestType::Put);
        m.state = MigrationState::Verifying;
        store.create_migration(&m).await.unwrap();

        let mut a = Archive::new(m.id, 0, format!("batch-{}/archive-0.tar", batch.id));
        a.local_path = Some(downloaded.to_string_lossy().to_string());
        a.digest = Some(digest.to_string());
        a.status = ArchiveStatus::Transferred;
        store.create_archive(&a).await.unwrap();
        m
    }

    #[tokio::test]
    async fn matching_digest_advances_to_tidy() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let worker = VerifyWorker::new(store.clone(), Staging::new(tmp.path().join("s")), 3);

        let downloaded = tmp.path().join("a.tar");
        std::fs::write(&downloaded, b"tar bytes").unwrap();
        let digest = pack::file_digest(&downloaded).unwrap();
        let mut m = verifying_migration(&store, &downloaded, &digest).await;

        assert_eq!(worker.process(&mut m).await.unwrap(), Outcome::Advanced);
        assert_eq!(m.state, MigrationState::PutTidy);
        let archives = store.archives_for(m.id).await.unwrap();
        assert_eq!(archives[0].status, ArchiveStatus::Verified);
    }

    #[tokio::test]
    async fn verifying_twice_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let worker = VerifyWorker::new(store.clone(), Staging::new(tmp.path().join("s")), 3);

        let downloaded = tmp.path().join("a.tar");
        std::fs::write(&downloaded, b"tar bytes").unwrap();
        let digest = pack::file_digest(&downloaded).unwrap();
        let mut m = verifying_migration(&store, &downloaded, &digest).await;

        worker.process(&mut m).await.unwrap();
        // Replay the verify on the same downloads (crash before save).
        m.state = MigrationState::Verifying;
        assert_eq!(worker.process(&mut m).await.unwrap(), Outcome::Advanced);
        assert_eq!(m.state, MigrationState::PutTidy);
    }

    #[tokio::test]
    async fn mismatch_triggers_rebuild_then_fails_at_budget() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let worker = VerifyWorker::new(store.clone(), Staging::new(tmp.path().join("s")), 2);

        let downloaded = tmp.path().join("a.tar");
        std::fs::write(&downloaded, b"tar bytes").unwrap();
        let mut m = verifying_migration(&store, &downloaded, "not-the-digest").await;

        // First mismatch: back to packing with everything reset.
        assert_eq!(worker.process(&mut m).await.unwrap(), Outcome::Advanced);
        assert_eq!(m.state, MigrationState::PutPacking);
        assert_eq!(m.verify_attempts, 1);
        let archives = store.archives_for(m.id).await.unwrap();
        assert_eq!(archives[0].status, ArchiveStatus::Building);
        assert!(archives[0].local_path.is_none());

        // Second mismatch exhausts the budget.
        m.state = MigrationState::Verifying;
        let mut a = archives[0].clone();
        a.local_path = Some(downloaded.to_string_lossy().to_string());
        a.digest = Some("not-the-digest".to_string());
        store.save_archive(&a).await.unwrap();

        let err = worker.process(&mut m).await.unwrap_err();
        assert!(matches!(err, WorkerError::Permanent(_)));
    }
}
