// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Per-migration lock coordination
//!
//! Wraps the store's lock table with one holder identity per worker
//! invocation and the configured lease length. Also hosts the same-target
//! ordering check the admission phase applies to `*_START` migrations.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use archiver_types::Migration;

use crate::store::{MigrationStore, StoreError};

/// One worker invocation's handle on the lock table.
pub struct LockCoordinator {
    store: Arc<dyn MigrationStore>,
    holder: Uuid,
    lease: Duration,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn MigrationStore>, lease_secs: i64) -> Self {
        Self {
            store,
            holder: Uuid::new_v4(),
            lease: Duration::seconds(lease_secs),
        }
    }

    /// This invocation's holder identity.
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Attempt to take the per-migration lock. Returns false when another
    /// live holder has it.
    pub async fn try_acquire(&self, migration_id: Uuid) -> Result<bool, StoreError> {
        let acquired = self
            .store
            .try_acquire_lock(migration_id, self.holder, self.lease)
            .await?;
        if !acquired {
            debug!(%migration_id, "lock held elsewhere, skipping");
        }
        Ok(acquired)
    }

    /// Extend the lease mid-phase. A `StaleLock` here means our lease
    /// expired and was reclaimed; the caller must abandon the migration.
    pub async fn renew(&self, migration_id: Uuid) -> Result<(), StoreError> {
        self.store
            .renew_lock(migration_id, self.holder, self.lease)
            .await
    }

    /// Release the lock. A stale release is logged, not propagated: it
    /// means the lease expired while we worked and someone else may already
    /// own the migration, which the idempotent phase design tolerates.
    pub async fn release(&self, migration_id: Uuid) {
        match self.store.release_lock(migration_id, self.holder).await {
            Ok(()) => {}
            Err(StoreError::StaleLock(_)) => {
                warn!(%migration_id, "lock lease expired before release");
            }
            Err(e) => {
                warn!(%migration_id, error = %e, "failed to release lock");
            }
        }
    }

    /// Remove expired locks so their migrations become eligible again.
    pub async fn reap_expired(&self) -> Result<u64, StoreError> {
        let reaped = self.store.reap_expired_locks().await?;
        if reaped > 0 {
            debug!(reaped, "reclaimed expired locks");
        }
        Ok(reaped)
    }

    /// Same-target ordering rule: a `*_START` migration may not be admitted
    /// while an earlier migration against the same (batch, backend) is
    /// still short of a safe-interrupt boundary. Returns the blocking
    /// migration, if any.
    pub async fn blocked_by_same_target(
        &self,
        migration: &Migration,
    ) -> Result<Option<Migration>, StoreError> {
        self.store.older_active_sibling(migration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use archiver_types::{Batch, MigrationState, RequestType};

    fn batch() -> Batch {
        Batch {
            id: Uuid::new_v4(),
            name: "b".to_string(),
            owner: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            common_path: "/data/b".to_string(),
            files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn two_coordinators_exclude_each_other() {
        let store = Arc::new(MemoryStore::new());
        let a = LockCoordinator::new(store.clone(), 300);
        let b = LockCoordinator::new(store.clone(), 300);
        let id = Uuid::new_v4();

        assert!(a.try_acquire(id).await.unwrap());
        assert!(!b.try_acquire(id).await.unwrap());
        a.release(id).await;
        assert!(b.try_acquire(id).await.unwrap());
    }

    #[tokio::test]
    async fn reacquire_by_same_holder_is_refused_then_fine_after_release() {
        let store = Arc::new(MemoryStore::new());
        let a = LockCoordinator::new(store.clone(), 300);
        let id = Uuid::new_v4();

        assert!(a.try_acquire(id).await.unwrap());
        // The lock table has no reentrancy; a second acquire by the same
        // holder still finds a live lock.
        assert!(!a.try_acquire(id).await.unwrap());
        a.release(id).await;
        assert!(a.try_acquire(id).await.unwrap());
    }

    #[tokio::test]
    async fn renew_extends_own_lease_but_not_a_lost_one() {
        let store = Arc::new(MemoryStore::new());
        let a = LockCoordinator::new(store.clone(), 300);
        let b = LockCoordinator::new(store.clone(), 300);
        let id = Uuid::new_v4();

        assert!(a.try_acquire(id).await.unwrap());
        a.renew(id).await.unwrap();

        // Lease expires and another invocation reclaims the migration;
        // the original holder's renewal must now be refused.
        store.expire_lock(id).await;
        assert!(b.try_acquire(id).await.unwrap());
        let err = a.renew(id).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleLock(_)));
    }

    #[tokio::test]
    async fn same_target_blocking_follows_boundaries() {
        let store = Arc::new(MemoryStore::new());
        let coord = LockCoordinator::new(store.clone(), 300);
        let batch = batch();
        store.create_batch(&batch).await.unwrap();

        let mut put = Migration::new(batch.id, "near", RequestType::Put);
        put.state = MigrationState::Putting;
        store.create_migration(&put).await.unwrap();

        let del = Migration::new(batch.id, "near", RequestType::Delete);
        store.create_migration(&del).await.unwrap();

        let blocker = coord.blocked_by_same_target(&del).await.unwrap();
        assert_eq!(blocker.map(|m| m.id), Some(put.id));

        put.advance(MigrationState::PutTidy);
        store.save_migration(&put).await.unwrap();
        assert!(coord.blocked_by_same_target(&del).await.unwrap().is_none());
    }
}
