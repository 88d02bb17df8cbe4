// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! In-memory migration store
//!
//! Implements the full repository interface over hash maps behind one
//! async mutex. Used by the unit and integration tests, and handy for
//! embedding the engine without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use archiver_types::{Archive, Batch, Lock, Migration, MigrationState, RequestType};

use super::{MigrationStore, StoreError};

#[derive(Default)]
struct Inner {
    batches: HashMap<Uuid, Batch>,
    migrations: HashMap<Uuid, Migration>,
    archives: HashMap<Uuid, Archive>,
    locks: HashMap<Uuid, Lock>,
}

/// In-memory implementation of [`MigrationStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate a lock's lease so it reads as expired. Test support for
    /// exercising the crashed-holder/reclaim path.
    pub async fn expire_lock(&self, migration_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(lock) = inner.locks.get_mut(&migration_id) {
            lock.lease_expiry = Utc::now() - Duration::seconds(1);
        }
    }

    /// The current lock holder for a migration, if a lock row exists.
    pub async fn lock_holder(&self, migration_id: Uuid) -> Option<Uuid> {
        let inner = self.inner.lock().await;
        inner.locks.get(&migration_id).map(|l| l.holder)
    }

    /// Number of live (unexpired) locks. Test support.
    pub async fn live_lock_count(&self) -> usize {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        inner.locks.values().filter(|l| !l.is_expired(now)).count()
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.batches.contains_key(&batch.id) {
            return Err(StoreError::Conflict(format!("batch {}", batch.id)));
        }
        inner.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn load_batch(&self, id: Uuid) -> Result<Batch, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))
    }

    async fn create_migration(&self, migration: &Migration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.migrations.contains_key(&migration.id) {
            return Err(StoreError::Conflict(format!("migration {}", migration.id)));
        }
        inner.migrations.insert(migration.id, migration.clone());
        Ok(())
    }

    async fn load_migration(&self, id: Uuid) -> Result<Migration, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .migrations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("migration {id}")))
    }

    async fn load_by_state(
        &self,
        states: &[MigrationState],
    ) -> Result<Vec<Migration>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Migration> = inner
            .migrations
            .values()
            .filter(|m| states.contains(&m.state))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.created_at);
        Ok(out)
    }

    async fn save_migration(&self, migration: &Migration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.migrations.contains_key(&migration.id) {
            return Err(StoreError::NotFound(format!("migration {}", migration.id)));
        }
        inner.migrations.insert(migration.id, migration.clone());
        Ok(())
    }

    async fn older_active_sibling(
        &self,
        migration: &Migration,
    ) -> Result<Option<Migration>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .migrations
            .values()
            .filter(|m| {
                m.id != migration.id
                    && m.batch_id == migration.batch_id
                    && m.backend == migration.backend
                    && m.created_at < migration.created_at
                    && !m.state.is_safe_interrupt_boundary()
            })
            .min_by_key(|m| m.created_at)
            .cloned())
    }

    async fn latest_completed_put(
        &self,
        batch_id: Uuid,
        backend: &str,
    ) -> Result<Option<Migration>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .migrations
            .values()
            .filter(|m| {
                m.batch_id == batch_id
                    && m.backend == backend
                    && m.request_type == RequestType::Put
                    && matches!(
                        m.state,
                        MigrationState::PutCompleted | MigrationState::Deleted
                    )
            })
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn latest_archived_put(
        &self,
        batch_id: Uuid,
        backend: &str,
    ) -> Result<Option<Migration>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .migrations
            .values()
            .filter(|m| {
                m.batch_id == batch_id
                    && m.backend == backend
                    && m.request_type == RequestType::Put
                    && inner.archives.values().any(|a| a.migration_id == m.id)
            })
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn create_archive(&self, archive: &Archive) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.archives.contains_key(&archive.id) {
            return Err(StoreError::Conflict(format!("archive {}", archive.id)));
        }
        inner.archives.insert(archive.id, archive.clone());
        Ok(())
    }

    async fn save_archive(&self, archive: &Archive) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.archives.contains_key(&archive.id) {
            return Err(StoreError::NotFound(format!("archive {}", archive.id)));
        }
        inner.archives.insert(archive.id, archive.clone());
        Ok(())
    }

    async fn archives_for(&self, migration_id: Uuid) -> Result<Vec<Archive>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Archive> = inner
            .archives
            .values()
            .filter(|a| a.migration_id == migration_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.index);
        Ok(out)
    }

    async fn try_acquire_lock(
        &self,
        migration_id: Uuid,
        holder: Uuid,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if let Some(existing) = inner.locks.get(&migration_id) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
            // Expired lease: dead lock, reclaimable.
        }

        inner.locks.insert(
            migration_id,
            Lock {
                migration_id,
                holder,
                acquired_at: now,
                lease_expiry: now + lease,
            },
        );
        Ok(true)
    }

    async fn renew_lock(
        &self,
        migration_id: Uuid,
        holder: Uuid,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.locks.get_mut(&migration_id) {
            Some(lock) if lock.holder == holder && !lock.is_expired(now) => {
                lock.lease_expiry = now + lease;
                Ok(())
            }
            _ => Err(StoreError::StaleLock(format!(
                "migration {migration_id} holder {holder}"
            ))),
        }
    }

    async fn release_lock(&self, migration_id: Uuid, holder: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.locks.get(&migration_id) {
            Some(lock) if lock.holder == holder => {
                inner.locks.remove(&migration_id);
                Ok(())
            }
            _ => Err(StoreError::StaleLock(format!(
                "migration {migration_id} holder {holder}"
            ))),
        }
    }

    async fn reap_expired_locks(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let before = inner.locks.len();
        inner.locks.retain(|_, lock| !lock.is_expired(now));
        Ok((before - inner.locks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_migration(batch_id: Uuid) -> Migration {
        Migration::new(batch_id, "near", RequestType::Put)
    }

    #[tokio::test]
    async fn lock_excludes_second_holder() {
        let store = MemoryStore::new();
        let mid = Uuid::new_v4();
        let (h1, h2) = (Uuid::new_v4(), Uuid::new_v4());
        let lease = Duration::seconds(300);

        assert!(store.try_acquire_lock(mid, h1, lease).await.unwrap());
        assert!(!store.try_acquire_lock(mid, h2, lease).await.unwrap());
        assert_eq!(store.live_lock_count().await, 1);

        store.release_lock(mid, h1).await.unwrap();
        assert!(store.try_acquire_lock(mid, h2, lease).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimable_and_old_holder_is_stale() {
        let store = MemoryStore::new();
        let mid = Uuid::new_v4();
        let (crashed, reaper) = (Uuid::new_v4(), Uuid::new_v4());
        let lease = Duration::seconds(300);

        assert!(store.try_acquire_lock(mid, crashed, lease).await.unwrap());
        store.expire_lock(mid).await;

        // A different invocation reclaims the dead lock.
        assert!(store.try_acquire_lock(mid, reaper, lease).await.unwrap());
        assert_eq!(store.lock_holder(mid).await, Some(reaper));

        // The crashed holder's completion attempt is rejected.
        let err = store.release_lock(mid, crashed).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleLock(_)));
        let err = store.renew_lock(mid, crashed, lease).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleLock(_)));
    }

    #[tokio::test]
    async fn reap_removes_only_expired_locks() {
        let store = MemoryStore::new();
        let (m1, m2) = (Uuid::new_v4(), Uuid::new_v4());
        let holder = Uuid::new_v4();
        let lease = Duration::seconds(300);

        store.try_acquire_lock(m1, holder, lease).await.unwrap();
        store.try_acquire_lock(m2, holder, lease).await.unwrap();
        store.expire_lock(m1).await;

        assert_eq!(store.reap_expired_locks().await.unwrap(), 1);
        assert_eq!(store.lock_holder(m1).await, None);
        assert_eq!(store.lock_holder(m2).await, Some(holder));
    }

    #[tokio::test]
    async fn older_active_sibling_respects_boundaries() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();

        let mut earlier = put_migration(batch_id);
        earlier.state = MigrationState::Putting;
        store.create_migration(&earlier).await.unwrap();

        let mut later = Migration::new(batch_id, "near", RequestType::Delete);
        later.created_at = earlier.created_at + Duration::seconds(1);
        store.create_migration(&later).await.unwrap();

        let blocking = store.older_active_sibling(&later).await.unwrap();
        assert_eq!(blocking.map(|m| m.id), Some(earlier.id));

        // Once the earlier migration reaches its tidy state the later one
        // is no longer blocked.
        let mut earlier = store.load_migration(earlier.id).await.unwrap();
        earlier.advance(MigrationState::PutTidy);
        store.save_migration(&earlier).await.unwrap();
        assert!(store.older_active_sibling(&later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sibling_on_other_backend_does_not_block() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();

        let mut earlier = put_migration(batch_id);
        earlier.state = MigrationState::Putting;
        earlier.backend = "far".to_string();
        store.create_migration(&earlier).await.unwrap();

        let mut later = Migration::new(batch_id, "near", RequestType::Get);
        later.created_at = earlier.created_at + Duration::seconds(1);
        store.create_migration(&later).await.unwrap();

        assert!(store.older_active_sibling(&later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_completed_put_picks_newest() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();

        let mut old_put = put_migration(batch_id);
        old_put.state = MigrationState::Deleted;
        store.create_migration(&old_put).await.unwrap();

        let mut new_put = put_migration(batch_id);
        new_put.state = MigrationState::PutCompleted;
        new_put.created_at = old_put.created_at + Duration::seconds(5);
        store.create_migration(&new_put).await.unwrap();

        let mut failed_put = put_migration(batch_id);
        failed_put.state = MigrationState::Failed;
        failed_put.created_at = new_put.created_at + Duration::seconds(5);
        store.create_migration(&failed_put).await.unwrap();

        let found = store
            .latest_completed_put(batch_id, "near")
            .await
            .unwrap()
            .map(|m| m.id);
        assert_eq!(found, Some(new_put.id));
    }

    #[tokio::test]
    async fn latest_archived_put_includes_failed_puts_with_archives() {
        let store = MemoryStore::new();
        let batch_id = Uuid::new_v4();

        // A PUT that failed after its archives were planned and partly
        // uploaded still owns archive rows.
        let mut failed_put = put_migration(batch_id);
        failed_put.state = MigrationState::Failed;
        store.create_migration(&failed_put).await.unwrap();
        let a = Archive::new(failed_put.id, 0, "k/0".to_string());
        store.create_archive(&a).await.unwrap();

        // A newer PUT that never got far enough to plan archives.
        let mut bare_put = put_migration(batch_id);
        bare_put.state = MigrationState::Failed;
        bare_put.created_at = failed_put.created_at + Duration::seconds(5);
        store.create_migration(&bare_put).await.unwrap();

        assert!(store
            .latest_completed_put(batch_id, "near")
            .await
            .unwrap()
            .is_none());
        let found = store
            .latest_archived_put(batch_id, "near")
            .await
            .unwrap()
            .map(|m| m.id);
        assert_eq!(found, Some(failed_put.id));
    }

    #[tokio::test]
    async fn archives_ordered_by_index() {
        let store = MemoryStore::new();
        let mid = Uuid::new_v4();
        for index in [2u32, 0, 1] {
            let a = Archive::new(mid, index, format!("k/{index}"));
            store.create_archive(&a).await.unwrap();
        }
        let archives = store.archives_for(mid).await.unwrap();
        let indexes: Vec<u32> = archives.iter().map(|a| a.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }
}
