// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the batch archiver engine.
//!
//! This crate defines the vocabulary everything else speaks: the request
//! types, the migration state machine and its phase-ownership table, and
//! the persisted record shapes (batch, migration, archive, lock). The
//! engine service and any request-producing frontends both depend on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

// ============================================================================
// Request types
// ============================================================================

/// The three operations a migration can perform against a backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// Archive a batch and upload it to a backend
    Put,
    /// Retrieve a batch from a backend and restore it to disk
    Get,
    /// Remove a batch's remote copy from a backend
    Delete,
}

impl RequestType {
    /// The state a freshly created migration of this type starts in.
    pub fn initial_state(&self) -> MigrationState {
        match self {
            RequestType::Put => MigrationState::PutStart,
            RequestType::Get => MigrationState::GetStart,
            RequestType::Delete => MigrationState::DeleteStart,
        }
    }
}

// ============================================================================
// Migration state machine
// ============================================================================

/// Every state a migration can occupy.
///
/// Three linear pipelines (PUT, GET, DELETE) plus the shared `Failed` sink
/// and the final bookkeeping state `Deleted`. The wire/database spelling is
/// the SCREAMING_SNAKE_CASE name, except `Deleted` which is literally
/// `deleted`: it marks the local record as purgeable and says nothing about
/// the remote copy unless the migration itself was a DELETE.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    // PUT pipeline
    PutStart,
    PutPacking,
    PutPending,
    Putting,
    VerifyPending,
    VerifyGetting,
    Verifying,
    PutTidy,
    PutCompleted,

    // GET pipeline
    GetStart,
    GetPending,
    Getting,
    GetUnpack,
    GetRestore,
    GetTidy,
    GetCompleted,

    // DELETE pipeline
    DeleteStart,
    DeletePending,
    Deleting,
    DeleteTidy,
    DeleteCompleted,

    /// Terminal for automatic processing; requires an explicit resubmission
    Failed,

    /// Local record may be purged
    #[strum(serialize = "deleted")]
    Deleted,
}

impl MigrationState {
    /// The next state in the pipeline, or `None` for `Failed` / `Deleted`.
    ///
    /// This is the only legal forward transition from each state; the
    /// self-transitions of the chunked states are expressed separately by
    /// [`MigrationState::is_chunked`].
    pub fn successor(&self) -> Option<MigrationState> {
        use MigrationState::*;
        match self {
            PutStart => Some(PutPacking),
            PutPacking => Some(PutPending),
            PutPending => Some(Putting),
            Putting => Some(VerifyPending),
            VerifyPending => Some(VerifyGetting),
            VerifyGetting => Some(Verifying),
            Verifying => Some(PutTidy),
            PutTidy => Some(PutCompleted),
            PutCompleted => Some(Deleted),

            GetStart => Some(GetPending),
            GetPending => Some(Getting),
            Getting => Some(GetUnpack),
            GetUnpack => Some(GetRestore),
            GetRestore => Some(GetTidy),
            GetTidy => Some(GetCompleted),
            GetCompleted => Some(Deleted),

            DeleteStart => Some(DeletePending),
            DeletePending => Some(Deleting),
            Deleting => Some(DeleteTidy),
            DeleteTidy => Some(DeleteCompleted),
            DeleteCompleted => Some(Deleted),

            Failed | Deleted => None,
        }
    }

    /// States that self-transition once per unit of chunked progress.
    pub fn is_chunked(&self) -> bool {
        matches!(
            self,
            MigrationState::Putting
                | MigrationState::Getting
                | MigrationState::Deleting
                | MigrationState::VerifyGetting
        )
    }

    /// The `*_START` states, the only states a migration may occupy while
    /// blocked on the same-target ordering rule.
    pub fn is_start(&self) -> bool {
        matches!(
            self,
            MigrationState::PutStart | MigrationState::GetStart | MigrationState::DeleteStart
        )
    }

    /// States from which another migration against the same (batch, backend)
    /// may safely be admitted: the first `*_TIDY` state or later, or
    /// `Failed`.
    pub fn is_safe_interrupt_boundary(&self) -> bool {
        matches!(
            self,
            MigrationState::PutTidy
                | MigrationState::GetTidy
                | MigrationState::DeleteTidy
                | MigrationState::PutCompleted
                | MigrationState::GetCompleted
                | MigrationState::DeleteCompleted
                | MigrationState::Failed
                | MigrationState::Deleted
        )
    }

    /// No phase worker will ever act on these again.
    pub fn is_final(&self) -> bool {
        matches!(self, MigrationState::Failed | MigrationState::Deleted)
    }

    /// The request pipeline this state belongs to, if it belongs to one.
    pub fn request_type(&self) -> Option<RequestType> {
        use MigrationState::*;
        match self {
            PutStart | PutPacking | PutPending | Putting | VerifyPending | VerifyGetting
            | Verifying | PutTidy | PutCompleted => Some(RequestType::Put),
            GetStart | GetPending | Getting | GetUnpack | GetRestore | GetTidy | GetCompleted => {
                Some(RequestType::Get)
            }
            DeleteStart | DeletePending | Deleting | DeleteTidy | DeleteCompleted => {
                Some(RequestType::Delete)
            }
            Failed | Deleted => None,
        }
    }
}

/// The six phase workers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    /// Admits `*_START` migrations subject to the same-target ordering rule
    Lock,
    /// Builds archives for PUT, extracts and restores them for GET
    Pack,
    /// Moves one bounded unit of data per migration per invocation
    Transfer,
    /// Polls asynchronous backend jobs and advances on completion
    Monitor,
    /// Compares re-retrieved archive digests against pack-time digests
    Verify,
    /// Removes staging artifacts and performs final bookkeeping
    Tidy,
}

impl Phase {
    /// The states this phase scans for.
    ///
    /// Transfer and Monitor both scan the chunked `*ING` states: Transfer
    /// performs the self-transitions (more units of work), Monitor performs
    /// the exits (backend job completion). Every other arrow has exactly
    /// one scanning phase.
    pub fn scan_states(&self) -> &'static [MigrationState] {
        use MigrationState::*;
        match self {
            Phase::Lock => &[PutStart, GetStart, DeleteStart],
            Phase::Pack => &[PutPacking, GetUnpack, GetRestore],
            Phase::Transfer => &[
                PutPending,
                GetPending,
                DeletePending,
                VerifyPending,
                Putting,
                Getting,
                Deleting,
                VerifyGetting,
            ],
            Phase::Monitor => &[Putting, Getting, Deleting, VerifyGetting],
            Phase::Verify => &[Verifying],
            Phase::Tidy => &[
                PutTidy,
                GetTidy,
                DeleteTidy,
                PutCompleted,
                GetCompleted,
                DeleteCompleted,
            ],
        }
    }

    /// Whether this phase may act on a migration in the given state.
    pub fn owns(&self, state: MigrationState) -> bool {
        self.scan_states().contains(&state)
    }
}

// ============================================================================
// Backend job status
// ============================================================================

/// Status of an asynchronous backend job, as reported by `Backend::poll`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum JobStatus {
    /// The backend is still working on the job
    Pending,
    /// The job finished successfully
    Done,
    /// The job failed on the backend side
    Failed(String),
}

// ============================================================================
// File metadata
// ============================================================================

/// What kind of filesystem entry a batch member is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum FileKind {
    File,
    Dir,
    Link,
}

/// Per-file metadata carried through pack, transfer and restore.
///
/// Paths are relative to the batch's common path prefix so a GET can be
/// restored to a different target directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Path relative to the batch common path
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    /// SHA-256 hex digest; empty for directories and links
    #[serde(default)]
    pub digest: String,
    pub uid: u32,
    pub gid: u32,
    /// Unix permission bits
    pub mode: u32,
    /// Link target for `FileKind::Link` entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

// ============================================================================
// Persisted records
// ============================================================================

/// A named collection of files under one user/group, migrated as one unit.
///
/// Created by the external request API; the engine treats it as immutable
/// once a migration referencing it begins transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    /// Human-readable label
    pub name: String,
    /// Owning user name
    pub owner: String,
    pub uid: u32,
    pub gid: u32,
    /// Common absolute path prefix of all member files
    pub common_path: String,
    pub files: Vec<FileMeta>,
}

/// One PUT / GET / DELETE request against a (batch, backend) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Registered backend name
    pub backend: String,
    pub request_type: RequestType,
    pub state: MigrationState,
    /// Phase-local progress cursor: index of the next archive to process
    pub cursor: u32,
    /// Transient-error retries within the current phase
    pub retries: u32,
    /// Whole-pipeline verification attempts (rebuild-and-resend loops)
    pub verify_attempts: u32,
    pub last_error: Option<String>,
    /// Backend-side batch identifier, once one exists
    pub external_id: Option<String>,
    /// Target directory for GET requests
    pub target_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Migration {
    /// Build a new migration in its pipeline's `*_START` state.
    pub fn new(batch_id: Uuid, backend: &str, request_type: RequestType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            batch_id,
            backend: backend.to_string(),
            request_type,
            state: request_type.initial_state(),
            cursor: 0,
            retries: 0,
            verify_attempts: 0,
            last_error: None,
            external_id: None,
            target_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance to `state`, resetting the per-phase cursor and retry count.
    pub fn advance(&mut self, state: MigrationState) {
        self.state = state;
        self.cursor = 0;
        self.retries = 0;
        self.updated_at = Utc::now();
    }

    /// Record a permanent failure.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = MigrationState::Failed;
        self.last_error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

/// Lifecycle of a packed archive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum ArchiveStatus {
    Building,
    Packed,
    Transferred,
    Verified,
}

/// One packed transfer unit built from a batch's files.
///
/// Owned exclusively by its parent migration; immutable once `Transferred`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub id: Uuid,
    pub migration_id: Uuid,
    /// Position within the migration's archive set
    pub index: u32,
    /// Member files, in archive order
    pub manifest: Vec<FileMeta>,
    /// Staging path of the packed tar file, while one exists
    pub local_path: Option<String>,
    /// Backend object key
    pub remote_key: String,
    /// Backend job handle for the in-flight put/get/delete, if any
    pub job_handle: Option<String>,
    pub size: u64,
    /// SHA-256 hex digest of the packed tar file
    pub digest: Option<String>,
    pub status: ArchiveStatus,
}

impl Archive {
    pub fn new(migration_id: Uuid, index: u32, remote_key: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            migration_id,
            index,
            manifest: Vec::new(),
            local_path: None,
            remote_key,
            job_handle: None,
            size: 0,
            digest: None,
            status: ArchiveStatus::Building,
        }
    }
}

/// Lease-based mutual-exclusion record for one migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub migration_id: Uuid,
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry <= now
    }
}

/// Walk a pipeline from its start state collecting the forward sequence.
pub fn pipeline(request_type: RequestType) -> Vec<MigrationState> {
    let mut states = Vec::new();
    let mut cur = Some(request_type.initial_state());
    while let Some(s) = cur {
        states.push(s);
        cur = s.successor();
    }
    states
}

// ============================================================================
// Tests
// ============================================================================
