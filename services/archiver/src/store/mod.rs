// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Durable migration store
//!
//! The repository interface every phase worker is injected with: load by
//! state, load by id, save, archive CRUD and the lock table operations.
//! The external request API creates batches and migrations; workers mutate
//! migrations and archives; nothing else touches the store.
//!
//! Two implementations: PostgreSQL for production and an in-memory store
//! for tests and embedding.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::Duration;
use thiserror::Error;
use uuid::Uuid;

use archiver_types::{Archive, Batch, Migration, MigrationState};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    /// Lock held by (or released to) a different holder
    #[error("Stale lock: {0}")]
    StaleLock(String),
}

#[async_trait]
pub trait MigrationStore: Send + Sync {
    // -- batches ------------------------------------------------------------

    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    async fn load_batch(&self, id: Uuid) -> Result<Batch, StoreError>;

    // -- migrations ---------------------------------------------------------

    async fn create_migration(&self, migration: &Migration) -> Result<(), StoreError>;

    async fn load_migration(&self, id: Uuid) -> Result<Migration, StoreError>;

    /// All migrations currently in any of `states`, oldest first.
    async fn load_by_state(
        &self,
        states: &[MigrationState],
    ) -> Result<Vec<Migration>, StoreError>;

    /// Persist the full migration row.
    async fn save_migration(&self, migration: &Migration) -> Result<(), StoreError>;

    /// The earliest-created migration sharing `(batch_id, backend)` that was
    /// created before `migration` and has not yet reached a safe-interrupt
    /// boundary. Used by the same-target ordering rule.
    async fn older_active_sibling(
        &self,
        migration: &Migration,
    ) -> Result<Option<Migration>, StoreError>;

    /// The most recent PUT migration for `(batch_id, backend)` whose
    /// pipeline completed, if any. GET admission clones its archive set
    /// from it.
    async fn latest_completed_put(
        &self,
        batch_id: Uuid,
        backend: &str,
    ) -> Result<Option<Migration>, StoreError>;

    /// The most recent PUT migration for `(batch_id, backend)` that owns
    /// at least one archive row, in any state including `Failed`. DELETE
    /// admission falls back to it so a cleanup of a half-uploaded PUT can
    /// still find the objects to remove.
    async fn latest_archived_put(
        &self,
        batch_id: Uuid,
        backend: &str,
    ) -> Result<Option<Migration>, StoreError>;

    // -- archives -----------------------------------------------------------

    async fn create_archive(&self, archive: &Archive) -> Result<(), StoreError>;

    async fn save_archive(&self, archive: &Archive) -> Result<(), StoreError>;

    /// Archives owned by a migration, ordered by index.
    async fn archives_for(&self, migration_id: Uuid) -> Result<Vec<Archive>, StoreError>;

    // -- locks --------------------------------------------------------------

    /// Attempt to take the per-migration lock with the given lease. An
    /// expired lock on the same migration is reclaimed. Returns false when
    /// a live lock is held by someone else.
    async fn try_acquire_lock(
        &self,
        migration_id: Uuid,
        holder: Uuid,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend the lease on a held lock. Fails with `StaleLock` when the
    /// lock is gone or held by a different holder.
    async fn renew_lock(
        &self,
        migration_id: Uuid,
        holder: Uuid,
        lease: Duration,
    ) -> Result<(), StoreError>;

    /// Release a held lock. Fails with `StaleLock` when the lock is gone or
    /// held by a different holder (the crashed-and-reclaimed case).
    async fn release_lock(&self, migration_id: Uuid, holder: Uuid) -> Result<(), StoreError>;

    /// Delete all locks whose lease has expired, returning the count.
    async fn reap_expired_locks(&self) -> Result<u64, StoreError>;
}
