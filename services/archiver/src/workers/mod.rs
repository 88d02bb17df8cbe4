// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Phase workers
//!
//! Each worker implements one phase of the state machine and is driven by
//! the shared [`run_phase`] loop: reap expired locks, scan for migrations
//! in the phase's states, and for each one acquire the lock, re-check the
//! state, process, persist, release. Workers only ever see a migration
//! they hold the lock on, and every mutation goes through the store, so a
//! crashed invocation leaves nothing a later invocation cannot pick up.

mod admit;
mod monitor;
mod packer;
mod tidy;
mod transfer;
mod verify;

pub use admit::AdmitWorker;
pub use monitor::MonitorWorker;
pub use packer::PackWorker;
pub use tidy::TidyWorker;
pub use transfer::TransferWorker;
pub use verify::VerifyWorker;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use archiver_types::{Migration, Phase};

use crate::backend::BackendError;
use crate::lock::LockCoordinator;
use crate::pack::PackError;
use crate::store::{MigrationStore, StoreError};

/// Errors a worker can hit while processing one migration.
///
/// The classification drives the retry policy: transient errors leave the
/// migration in place and bump its retry count, permanent errors fail it
/// immediately, store errors abort the whole invocation.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BackendError> for WorkerError {
    fn from(e: BackendError) -> Self {
        if e.is_transient() {
            WorkerError::Transient(e.to_string())
        } else {
            WorkerError::Permanent(e.to_string())
        }
    }
}

impl From<PackError> for WorkerError {
    fn from(e: PackError) -> Self {
        if e.is_transient() {
            WorkerError::Transient(e.to_string())
        } else {
            WorkerError::Permanent(e.to_string())
        }
    }
}

/// What processing one migration accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The migration moved to a new state
    Advanced,
    /// One unit of chunked work completed, state unchanged
    Progress,
    /// Admission deferred by the same-target ordering rule
    Blocked,
    /// Nothing to do yet (e.g. backend jobs still pending)
    NoChange,
}

/// Counters for one phase invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub scanned: u64,
    pub advanced: u64,
    pub progressed: u64,
    pub blocked: u64,
    /// Lock contention or state moved under us
    pub skipped: u64,
    pub retried: u64,
    pub failed: u64,
}

/// One phase of the migration state machine.
#[async_trait]
pub trait PhaseWorker: Send + Sync {
    fn phase(&self) -> Phase;

    /// Process one locked migration, mutating it in place. The caller
    /// persists the migration afterwards whatever the outcome.
    async fn process(&self, migration: &mut Migration) -> Result<Outcome, WorkerError>;
}

/// Run one invocation of a phase worker over everything in its states.
///
/// Per-migration failures are absorbed into the report; only store errors
/// propagate, since without a working store nothing can make progress.
pub async fn run_phase(
    store: Arc<dyn MigrationStore>,
    locks: &LockCoordinator,
    worker: &dyn PhaseWorker,
    max_retries: u32,
) -> Result<RunReport, StoreError> {
    let phase = worker.phase();
    let mut report = RunReport::default();

    locks.reap_expired().await?;

    let candidates = store.load_by_state(phase.scan_states()).await?;
    report.scanned = candidates.len() as u64;
    debug!(%phase, candidates = candidates.len(), "phase scan");

    for candidate in candidates {
        if !locks.try_acquire(candidate.id).await? {
            report.skipped += 1;
            continue;
        }

        // Reload under the lock; another phase may have moved the
        // migration between scan and acquire.
        let result = async {
            let mut migration = store.load_migration(candidate.id).await?;
            if !phase.owns(migration.state) {
                return Ok(None);
            }

            let processed = worker.process(&mut migration).await;

            // Lease fence: confirm the lock is still ours before
            // persisting anything. If the lease expired mid-phase another
            // invocation may have reclaimed the migration; a stale save
            // here would clobber the new holder's state.
            match locks.renew(candidate.id).await {
                Ok(()) => {}
                Err(StoreError::StaleLock(_)) => {
                    warn!(
                        %phase,
                        migration = %candidate.id,
                        "lock lease lost mid-phase, abandoning without saving"
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }

            match processed {
                Ok(outcome) => {
                    store.save_migration(&migration).await?;
                    Ok(Some(Ok(outcome)))
                }
                Err(WorkerError::Transient(msg)) => {
                    migration.retries += 1;
                    migration.last_error = Some(msg.clone());
                    let exhausted = migration.retries >= max_retries;
                    if exhausted {
                        migration.fail(format!("retries exhausted: {msg}"));
                    }
                    store.save_migration(&migration).await?;
                    Ok(Some(Err((msg, exhausted))))
                }
                Err(WorkerError::Permanent(msg)) => {
                    migration.fail(msg.clone());
                    store.save_migration(&migration).await?;
                    Ok(Some(Err((msg, true))))
                }
                Err(WorkerError::Store(e)) => Err(e),
            }
        }
        .await;

        locks.release(candidate.id).await;

        match result {
            Ok(None) => report.skipped += 1,
            Ok(Some(Ok(outcome))) => {
                match outcome {
                    Outcome::Advanced => report.advanced += 1,
                    Outcome::Progress => report.progressed += 1,
                    Outcome::Blocked => report.blocked += 1,
                    Outcome::NoChange => {}
                }
                debug!(%phase, migration = %candidate.id, ?outcome, "processed");
            }
            Ok(Some(Err((msg, true)))) => {
                report.failed += 1;
                error!(%phase, migration = %candidate.id, error = %msg, "migration failed");
            }
            Ok(Some(Err((msg, false)))) => {
                report.retried += 1;
                warn!(%phase, migration = %candidate.id, error = %msg, "transient error, will retry");
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        %phase,
        scanned = report.scanned,
        advanced = report.advanced,
        progressed = report.progressed,
        blocked = report.blocked,
        skipped = report.skipped,
        retried = report.retried,
        failed = report.failed,
        "phase invocation complete"
    );
    Ok(report)
}
