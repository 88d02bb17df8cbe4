// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! PostgreSQL migration store using tokio-postgres
//!
//! Async store implementation over a deadpool connection pool (pure-Rust
//! driver, no libpq dependency). Schema migrations and admin tooling are
//! owned elsewhere; [`SCHEMA`] documents the expected tables.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::NoTls;
use tokio_postgres::Row;
use uuid::Uuid;

use archiver_types::{
    Archive, ArchiveStatus, Batch, FileMeta, Migration, MigrationState, RequestType,
};
use strum::IntoEnumIterator;

use super::{MigrationStore, StoreError};

/// The tables this store expects. Applied by the deployment's schema
/// tooling, not by the engine.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batches (
    id           UUID PRIMARY KEY,
    name         TEXT NOT NULL,
    owner        TEXT NOT NULL,
    uid          INTEGER NOT NULL,
    gid          INTEGER NOT NULL,
    common_path  TEXT NOT NULL,
    files        JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS migrations (
    id              UUID PRIMARY KEY,
    batch_id        UUID NOT NULL REFERENCES batches (id),
    backend         TEXT NOT NULL,
    request_type    TEXT NOT NULL,
    state           TEXT NOT NULL,
    cursor          INTEGER NOT NULL DEFAULT 0,
    retries         INTEGER NOT NULL DEFAULT 0,
    verify_attempts INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    external_id     TEXT,
    target_path     TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS migrations_state_idx ON migrations (state);
CREATE INDEX IF NOT EXISTS migrations_target_idx ON migrations (batch_id, backend);

CREATE TABLE IF NOT EXISTS archives (
    id           UUID PRIMARY KEY,
    migration_id UUID NOT NULL REFERENCES migrations (id),
    ordinal      INTEGER NOT NULL,
    manifest     JSONB NOT NULL,
    local_path   TEXT,
    remote_key   TEXT NOT NULL,
    job_handle   TEXT,
    size         BIGINT NOT NULL DEFAULT 0,
    digest       TEXT,
    status       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS archives_migration_idx ON archives (migration_id);

CREATE TABLE IF NOT EXISTS locks (
    migration_id UUID PRIMARY KEY,
    holder       UUID NOT NULL,
    acquired_at  TIMESTAMPTZ NOT NULL,
    lease_expiry TIMESTAMPTZ NOT NULL
);
"#;

const MIGRATION_COLS: &str = "id, batch_id, backend, request_type, state, cursor, retries, \
     verify_attempts, last_error, external_id, target_path, created_at, updated_at";

const ARCHIVE_COLS: &str =
    "id, migration_id, ordinal, manifest, local_path, remote_key, job_handle, size, digest, status";

/// PostgreSQL implementation of [`MigrationStore`].
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Create a connection pool from a connection URL and verify it works.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e| StoreError::Connection(format!("Invalid database URL: {e}")))?;

        let mut cfg = Config::new();
        if let Some(host) = pg_config.get_hosts().first() {
            match host {
                tokio_postgres::config::Host::Tcp(host) => {
                    cfg.host = Some(host.clone());
                }
                tokio_postgres::config::Host::Unix(path) => {
                    cfg.host = Some(path.to_string_lossy().to_string());
                }
            }
        }
        if let Some(port) = pg_config.get_ports().first() {
            cfg.port = Some(*port);
        }
        if let Some(user) = pg_config.get_user() {
            cfg.user = Some(user.to_string());
        }
        if let Some(password) = pg_config.get_password() {
            cfg.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(dbname) = pg_config.get_dbname() {
            cfg.dbname = Some(dbname.to_string());
        }

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Connection(format!("Failed to create pool: {e}")))?;

        let client = pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    /// The `state` spellings outside a safe-interrupt boundary, for the
    /// same-target ordering query.
    fn active_state_names() -> Vec<String> {
        MigrationState::iter()
            .filter(|s| !s.is_safe_interrupt_boundary())
            .map(|s| s.to_string())
            .collect()
    }
}

fn query_err(e: tokio_postgres::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn migration_from_row(row: &Row) -> Result<Migration, StoreError> {
    let request_type: String = row.get(3);
    let state: String = row.get(4);
    let cursor: i32 = row.get(5);
    let retries: i32 = row.get(6);
    let verify_attempts: i32 = row.get(7);

    Ok(Migration {
        id: row.get(0),
        batch_id: row.get(1),
        backend: row.get(2),
        request_type: request_type
            .parse::<RequestType>()
            .map_err(|e| StoreError::Query(format!("bad request_type: {e}")))?,
        state: state
            .parse::<MigrationState>()
            .map_err(|e| StoreError::Query(format!("bad state: {e}")))?,
        cursor: cursor as u32,
        retries: retries as u32,
        verify_attempts: verify_attempts as u32,
        last_error: row.get(8),
        external_id: row.get(9),
        target_path: row.get(10),
        created_at: row.get(11),
        updated_at: row.get(12),
    })
}

fn archive_from_row(row: &Row) -> Result<Archive, StoreError> {
    let ordinal: i32 = row.get(2);
    let manifest: serde_json::Value = row.get(3);
    let size: i64 = row.get(7);
    let status: String = row.get(9);

    Ok(Archive {
        id: row.get(0),
        migration_id: row.get(1),
        index: ordinal as u32,
        manifest: serde_json::from_value::<Vec<FileMeta>>(manifest)
            .map_err(|e| StoreError::Query(format!("bad manifest: {e}")))?,
        local_path: row.get(4),
        remote_key: row.get(5),
        job_handle: row.get(6),
        size: size as u64,
        digest: row.get(8),
        status: status
            .parse::<ArchiveStatus>()
            .map_err(|e| StoreError::Query(format!("bad archive status: {e}")))?,
    })
}

#[async_trait]
impl MigrationStore for PostgresStore {
    async fn create_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let client = self.client().await?;
        let files = serde_json::to_value(&batch.files)
            .map_err(|e| StoreError::Query(format!("encode files: {e}")))?;
        client
            .execute(
                "INSERT INTO batches (id, name, owner, uid, gid, common_path, files)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &batch.id,
                    &batch.name,
                    &batch.owner,
                    &(batch.uid as i32),
                    &(batch.gid as i32),
                    &batch.common_path,
                    &files,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn load_batch(&self, id: Uuid) -> Result<Batch, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, name, owner, uid, gid, common_path, files
                 FROM batches WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(query_err)?
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?;

        let uid: i32 = row.get(3);
        let gid: i32 = row.get(4);
        let files: serde_json::Value = row.get(6);
        Ok(Batch {
            id: row.get(0),
            name: row.get(1),
            owner: row.get(2),
            uid: uid as u32,
            gid: gid as u32,
            common_path: row.get(5),
            files: serde_json::from_value(files)
                .map_err(|e| StoreError::Query(format!("bad files: {e}")))?,
        })
    }

    async fn create_migration(&self, m: &Migration) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO migrations (id, batch_id, backend, request_type, state, cursor,
                     retries, verify_attempts, last_error, external_id, target_path,
                     created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
                &[
                    &m.id,
                    &m.batch_id,
                    &m.backend,
                    &m.request_type.to_string(),
                    &m.state.to_string(),
                    &(m.cursor as i32),
                    &(m.retries as i32),
                    &(m.verify_attempts as i32),
                    &m.last_error,
                    &m.external_id,
                    &m.target_path,
                    &m.created_at,
                    &m.updated_at,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn load_migration(&self, id: Uuid) -> Result<Migration, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!("SELECT {MIGRATION_COLS} FROM migrations WHERE id = $1"),
                &[&id],
            )
            .await
            .map_err(query_err)?
            .ok_or_else(|| StoreError::NotFound(format!("migration {id}")))?;
        migration_from_row(&row)
    }

    async fn load_by_state(
        &self,
        states: &[MigrationState],
    ) -> Result<Vec<Migration>, StoreError> {
        let client = self.client().await?;
        let names: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        let rows = client
            .query(
                &format!(
                    "SELECT {MIGRATION_COLS} FROM migrations
                     WHERE state = ANY($1) ORDER BY created_at"
                ),
                &[&names],
            )
            .await
            .map_err(query_err)?;
        rows.iter().map(migration_from_row).collect()
    }

    async fn save_migration(&self, m: &Migration) -> Result<(), StoreError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE migrations SET state = $2, cursor = $3, retries = $4,
                     verify_attempts = $5, last_error = $6, external_id = $7,
                     target_path = $8, updated_at = $9
                 WHERE id = $1",
                &[
                    &m.id,
                    &m.state.to_string(),
                    &(m.cursor as i32),
                    &(m.retries as i32),
                    &(m.verify_attempts as i32),
                    &m.last_error,
                    &m.external_id,
                    &m.target_path,
                    &m.updated_at,
                ],
            )
            .await
            .map_err(query_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("migration {}", m.id)));
        }
        Ok(())
    }

    async fn older_active_sibling(
        &self,
        migration: &Migration,
    ) -> Result<Option<Migration>, StoreError> {
        let client = self.client().await?;
        let active = Self::active_state_names();
        let row = client
            .query_opt(
                &format!(
                    "SELECT {MIGRATION_COLS} FROM migrations
                     WHERE batch_id = $1 AND backend = $2 AND id != $3
                       AND created_at < $4 AND state = ANY($5)
                     ORDER BY created_at LIMIT 1"
                ),
                &[
                    &migration.batch_id,
                    &migration.backend,
                    &migration.id,
                    &migration.created_at,
                    &active,
                ],
            )
            .await
            .map_err(query_err)?;
        row.as_ref().map(migration_from_row).transpose()
    }

    async fn latest_completed_put(
        &self,
        batch_id: Uuid,
        backend: &str,
    ) -> Result<Option<Migration>, StoreError> {
        let client = self.client().await?;
        let done = vec![
            MigrationState::PutCompleted.to_string(),
            MigrationState::Deleted.to_string(),
        ];
        let row = client
            .query_opt(
                &format!(
                    "SELECT {MIGRATION_COLS} FROM migrations
                     WHERE batch_id = $1 AND backend = $2
                       AND request_type = $3 AND state = ANY($4)
                     ORDER BY created_at DESC LIMIT 1"
                ),
                &[
                    &batch_id,
                    &backend,
                    &RequestType::Put.to_string(),
                    &done,
                ],
            )
            .await
            .map_err(query_err)?;
        row.as_ref().map(migration_from_row).transpose()
    }

    async fn latest_archived_put(
        &self,
        batch_id: Uuid,
        backend: &str,
    ) -> Result<Option<Migration>, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {MIGRATION_COLS} FROM migrations m
                     WHERE batch_id = $1 AND backend = $2 AND request_type = $3
                       AND EXISTS (SELECT 1 FROM archives a WHERE a.migration_id = m.id)
                     ORDER BY created_at DESC LIMIT 1"
                ),
                &[&batch_id, &backend, &RequestType::Put.to_string()],
            )
            .await
            .map_err(query_err)?;
        row.as_ref().map(migration_from_row).transpose()
    }

    async fn create_archive(&self, a: &Archive) -> Result<(), StoreError> {
        let client = self.client().await?;
        let manifest = serde_json::to_value(&a.manifest)
            .map_err(|e| StoreError::Query(format!("encode manifest: {e}")))?;
        client
            .execute(
                &format!(
                    "INSERT INTO archives ({ARCHIVE_COLS})
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
                ),
                &[
                    &a.id,
                    &a.migration_id,
                    &(a.index as i32),
                    &manifest,
                    &a.local_path,
                    &a.remote_key,
                    &a.job_handle,
                    &(a.size as i64),
                    &a.digest,
                    &a.status.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn save_archive(&self, a: &Archive) -> Result<(), StoreError> {
        let client = self.client().await?;
        let manifest = serde_json::to_value(&a.manifest)
            .map_err(|e| StoreError::Query(format!("encode manifest: {e}")))?;
        let updated = client
            .execute(
                "UPDATE archives SET manifest = $2, local_path = $3, job_handle = $4,
                     size = $5, digest = $6, status = $7
                 WHERE id = $1",
                &[
                    &a.id,
                    &manifest,
                    &a.local_path,
                    &a.job_handle,
                    &(a.size as i64),
                    &a.digest,
                    &a.status.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("archive {}", a.id)));
        }
        Ok(())
    }

    async fn archives_for(&self, migration_id: Uuid) -> Result<Vec<Archive>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {ARCHIVE_COLS} FROM archives
                     WHERE migration_id = $1 ORDER BY ordinal"
                ),
                &[&migration_id],
            )
            .await
            .map_err(query_err)?;
        rows.iter().map(archive_from_row).collect()
    }

    async fn try_acquire_lock(
        &self,
        migration_id: Uuid,
        holder: Uuid,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let client = self.client().await?;
        let now = Utc::now();

        // Reclaim a dead lock on this migration, then attempt the insert;
        // ON CONFLICT means someone else holds a live lease.
        client
            .execute(
                "DELETE FROM locks WHERE migration_id = $1 AND lease_expiry <= $2",
                &[&migration_id, &now],
            )
            .await
            .map_err(query_err)?;

        let inserted = client
            .execute(
                "INSERT INTO locks (migration_id, holder, acquired_at, lease_expiry)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (migration_id) DO NOTHING",
                &[&migration_id, &holder, &now, &(now + lease)],
            )
            .await
            .map_err(query_err)?;

        Ok(inserted == 1)
    }

    async fn renew_lock(
        &self,
        migration_id: Uuid,
        holder: Uuid,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let client = self.client().await?;
        let now = Utc::now();
        let updated = client
            .execute(
                "UPDATE locks SET lease_expiry = $3
                 WHERE migration_id = $1 AND holder = $2 AND lease_expiry > $4",
                &[&migration_id, &holder, &(now + lease), &now],
            )
            .await
            .map_err(query_err)?;
        if updated == 0 {
            return Err(StoreError::StaleLock(format!(
                "migration {migration_id} holder {holder}"
            )));
        }
        Ok(())
    }

    async fn release_lock(&self, migration_id: Uuid, holder: Uuid) -> Result<(), StoreError> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM locks WHERE migration_id = $1 AND holder = $2",
                &[&migration_id, &holder],
            )
            .await
            .map_err(query_err)?;
        if deleted == 0 {
            return Err(StoreError::StaleLock(format!(
                "migration {migration_id} holder {holder}"
            )));
        }
        Ok(())
    }

    async fn reap_expired_locks(&self) -> Result<u64, StoreError> {
        let client = self.client().await?;
        let now = Utc::now();
        client
            .execute("DELETE FROM locks WHERE lease_expiry <= $1", &[&now])
            .await
            .map_err(query_err)
    }
}
