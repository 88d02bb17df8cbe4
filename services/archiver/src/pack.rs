// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Archive packing, unpacking and restore
//!
//! Pure filesystem machinery used by the pack and verify phases: planning
//! a batch's files into archives under backend capability limits, building
//! deterministic tar files with the batch's ownership and permission bits,
//! digesting them, extracting them and restoring the tree to its target.
//!
//! Packing is rebuild-from-scratch: a partially written archive from an
//! interrupted invocation is deleted and built again, never resumed. That
//! makes the pack phase idempotent without any partial-write bookkeeping.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use archiver_types::{Archive, Batch, FileKind, FileMeta};

use crate::backend::Capabilities;

/// Name of the manifest entry embedded in every archive. Extraction
/// skips it, so it never lands on disk; restore works from the manifest
/// rows in the store.
const MANIFEST_ENTRY: &str = ".archive-manifest.json";

/// Per-entry tar overhead assumed when planning archive sizes (header
/// block plus padding).
const ENTRY_OVERHEAD: u64 = 1024;

const DIGEST_BUF_SIZE: usize = 256 * 1024;

/// Packing and restore errors.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File {path} is {size} bytes, over the backend object limit {limit}")]
    ObjectTooLarge { path: String, size: u64, limit: u64 },

    #[error("Batch needs {needed} objects, over the backend limit {limit}")]
    TooManyObjects { needed: usize, limit: u32 },

    #[error("Archive digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Archive {0} has no staged file to operate on")]
    MissingLocal(Uuid),

    #[error("Manifest encoding error: {0}")]
    Manifest(#[from] serde_json::Error),
}

impl PackError {
    /// I/O failures may be transient (full disk, NFS hiccup); everything
    /// else reflects a condition a retry cannot change.
    pub fn is_transient(&self) -> bool {
        matches!(self, PackError::Io(_))
    }
}

// ============================================================================
// Staging layout
// ============================================================================

/// Staging-directory layout: one exclusive subtree per migration, gone by
/// the end of tidy.
#[derive(Clone, Debug)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn migration_dir(&self, migration_id: Uuid) -> PathBuf {
        self.root.join(migration_id.to_string())
    }

    /// Where PUT builds its packed archives.
    pub fn archive_path(&self, migration_id: Uuid, index: u32) -> PathBuf {
        self.migration_dir(migration_id)
            .join("archives")
            .join(format!("archive-{index}.tar"))
    }

    /// Where GET and verify download remote archives.
    pub fn download_path(&self, migration_id: Uuid, index: u32) -> PathBuf {
        self.download_dir(migration_id)
            .join(format!("archive-{index}.tar"))
    }

    pub fn download_dir(&self, migration_id: Uuid) -> PathBuf {
        self.migration_dir(migration_id).join("download")
    }

    /// Clear downloaded archives so a verification rebuild re-fetches
    /// fresh copies. Absent is fine.
    pub fn remove_downloads(&self, migration_id: Uuid) -> Result<(), PackError> {
        match std::fs::remove_dir_all(self.download_dir(migration_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Where GET extracts downloaded archives before restore.
    pub fn extract_dir(&self, migration_id: Uuid) -> PathBuf {
        self.migration_dir(migration_id).join("extract")
    }

    /// Remove the migration's entire staging subtree. Absent is fine.
    pub fn remove_migration(&self, migration_id: Uuid) -> Result<(), PackError> {
        match std::fs::remove_dir_all(self.migration_dir(migration_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn migration_dir_exists(&self, migration_id: Uuid) -> bool {
        self.migration_dir(migration_id).is_dir()
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Backend object key for one archive of a batch.
pub fn remote_key(batch_id: Uuid, index: u32) -> String {
    format!("batch-{batch_id}/archive-{index}.tar")
}

/// Split a batch's files into archives under the backend's limits.
///
/// File order is preserved. Backends that do not require packing get one
/// single-member archive per batch entry, so ownership and permission
/// metadata still travels inside a tar. Packing backends get greedy
/// size-bounded grouping.
pub fn plan_archives(
    batch: &Batch,
    migration_id: Uuid,
    caps: &Capabilities,
) -> Result<Vec<Archive>, PackError> {
    for f in &batch.files {
        let est = f.size + ENTRY_OVERHEAD;
        if est > caps.max_object_size {
            return Err(PackError::ObjectTooLarge {
                path: f.path.clone(),
                size: f.size,
                limit: caps.max_object_size,
            });
        }
    }

    let mut groups: Vec<Vec<FileMeta>> = Vec::new();
    if caps.requires_packing {
        let mut current: Vec<FileMeta> = Vec::new();
        let mut current_size: u64 = 0;
        for f in &batch.files {
            let est = f.size + ENTRY_OVERHEAD;
            if !current.is_empty() && current_size + est > caps.max_object_size {
                groups.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += est;
            current.push(f.clone());
        }
        if !current.is_empty() {
            groups.push(current);
        }
    } else {
        groups.extend(batch.files.iter().map(|f| vec![f.clone()]));
    }

    if groups.len() > caps.max_objects_per_batch as usize {
        return Err(PackError::TooManyObjects {
            needed: groups.len(),
            limit: caps.max_objects_per_batch,
        });
    }

    Ok(groups
        .into_iter()
        .enumerate()
        .map(|(i, manifest)| {
            let mut archive =
                Archive::new(migration_id, i as u32, remote_key(batch.id, i as u32));
            archive.manifest = manifest;
            archive
        })
        .collect())
}

// ============================================================================
// Packing
// ============================================================================

/// Build the tar file for one archive at `dest`, returning its size and
/// SHA-256 hex digest. Any existing file at `dest` is deleted first.
pub fn pack_archive(batch: &Batch, archive: &Archive, dest: &Path) -> Result<(u64, String), PackError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut builder = tar::Builder::new(File::create(dest)?);

    let manifest_json = serde_json::to_vec_pretty(&archive.manifest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_json.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, MANIFEST_ENTRY, manifest_json.as_slice())?;

    let common = Path::new(&batch.common_path);
    for meta in &archive.manifest {
        let source = common.join(&meta.path);
        let mut header = tar::Header::new_gnu();
        header.set_mode(meta.mode);
        header.set_uid(u64::from(meta.uid));
        header.set_gid(u64::from(meta.gid));

        match meta.kind {
            FileKind::File => {
                let file = File::open(&source)?;
                header.set_size(meta.size);
                header.set_entry_type(tar::EntryType::Regular);
                builder.append_data(&mut header, &meta.path, BufReader::new(file))?;
            }
            FileKind::Dir => {
                header.set_size(0);
                header.set_entry_type(tar::EntryType::Directory);
                builder.append_data(&mut header, &meta.path, std::io::empty())?;
            }
            FileKind::Link => {
                let target = meta.link_target.as_deref().unwrap_or_default();
                header.set_size(0);
                header.set_entry_type(tar::EntryType::Symlink);
                builder.append_link(&mut header, &meta.path, target)?;
            }
        }
    }

    let mut file = builder.into_inner()?;
    file.flush()?;
    drop(file);

    let size = std::fs::metadata(dest)?.len();
    let digest = file_digest(dest)?;
    Ok((size, digest))
}

/// SHA-256 hex digest of a file, streamed in fixed-size chunks.
pub fn file_digest(path: &Path) -> Result<String, PackError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// Unpacking and restore
// ============================================================================

/// Verify a downloaded archive against its pack-time digest and extract it
/// into `extract_dir`.
pub fn unpack_archive(
    tar_path: &Path,
    expected_digest: &str,
    extract_dir: &Path,
) -> Result<(), PackError> {
    let actual = file_digest(tar_path)?;
    if actual != expected_digest {
        return Err(PackError::DigestMismatch {
            expected: expected_digest.to_string(),
            actual,
        });
    }

    std::fs::create_dir_all(extract_dir)?;
    let mut archive = tar::Archive::new(BufReader::new(File::open(tar_path)?));
    archive.set_preserve_permissions(false);
    for entry in archive.entries()? {
        let mut entry = entry?;
        // The embedded manifest entry stays inside the tar; restore works
        // from the manifest rows in the store.
        if entry.path()?.as_ref() == Path::new(MANIFEST_ENTRY) {
            continue;
        }
        entry.unpack_in(extract_dir)?;
    }
    Ok(())
}

/// Move extracted entries to the restore target and reapply ownership and
/// permission bits from the manifest.
///
/// Ownership changes need privilege; when chown is denied the restore
/// still succeeds with the file owned by the engine's user, logged at
/// warn.
pub fn restore_tree(
    extract_dir: &Path,
    target_dir: &Path,
    manifest: &[FileMeta],
) -> Result<(), PackError> {
    std::fs::create_dir_all(target_dir)?;

    // Place contents first; directory modes come last, since a manifest
    // may carry a directory mode without write permission and moving
    // files into such a directory would fail.
    for meta in manifest {
        let dest = target_dir.join(&meta.path);
        match meta.kind {
            FileKind::Dir => {
                std::fs::create_dir_all(&dest)?;
                continue;
            }
            FileKind::File => {
                let src = extract_dir.join(&meta.path);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                move_file(&src, &dest)?;
            }
            FileKind::Link => {
                let target = meta.link_target.as_deref().unwrap_or_default();
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                match std::fs::remove_file(&dest) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                std::os::unix::fs::symlink(target, &dest)?;
                // Symlink modes are ignored on Linux; ownership alone.
                apply_ownership(&dest, meta);
                continue;
            }
        }

        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(meta.mode))?;
        apply_ownership(&dest, meta);
    }

    // Deepest directories first, so a parent going execute-only cannot
    // cut off access to a child still awaiting its mode.
    let mut dirs: Vec<&FileMeta> = manifest
        .iter()
        .filter(|m| m.kind == FileKind::Dir)
        .collect();
    dirs.sort_by_key(|m| std::cmp::Reverse(m.path.matches('/').count()));
    for meta in dirs {
        let dest = target_dir.join(&meta.path);
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(meta.mode))?;
        apply_ownership(&dest, meta);
    }

    Ok(())
}

fn move_file(src: &Path, dest: &Path) -> Result<(), PackError> {
    // An interrupted restore may have moved this entry already.
    if !src.exists() && dest.exists() {
        return Ok(());
    }
    match std::fs::rename(src, dest) {
        Ok(()) => Ok(()),
        // Cross-device: staging and target on different filesystems.
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            std::fs::copy(src, dest)?;
            std::fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn apply_ownership(path: &Path, meta: &FileMeta) {
    if let Err(e) = std::os::unix::fs::lchown(path, Some(meta.uid), Some(meta.gid)) {
        warn!(
            path = %path.display(),
            uid = meta.uid,
            gid = meta.gid,
            error = %e,
            "could not restore ownership"
        );
    }
}

// ============================================================================
// Batch scanning
// ============================================================================

/// Walk a directory tree building the file metadata list for a batch.
/// Entries come out sorted by relative path, directories before their
/// contents, which keeps archive layout deterministic.
pub fn scan_tree(common_path: &Path) -> Result<Vec<FileMeta>, PackError> {
    let mut out = Vec::new();
    scan_dir(common_path, common_path, &mut out)?;
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn scan_dir(root: &Path, dir: &Path, out: &mut Vec<FileMeta>) -> Result<(), PackError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        let rel = path
            .strip_prefix(root)
            .map_err(|_| std::io::Error::other("entry escaped scan root"))?
            .to_string_lossy()
            .to_string();

        if meta.is_dir() {
            out.push(FileMeta {
                path: rel,
                kind: FileKind::Dir,
                size: 0,
                digest: String::new(),
                uid: meta.uid(),
                gid: meta.gid(),
                mode: meta.mode() & 0o7777,
                link_target: None,
            });
            scan_dir(root, &path, out)?;
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            out.push(FileMeta {
                path: rel,
                kind: FileKind::Link,
                size: 0,
                digest: String::new(),
                uid: meta.uid(),
                gid: meta.gid(),
                mode: meta.mode() & 0o7777,
                link_target: Some(target.to_string_lossy().to_string()),
            });
        } else {
            out.push(FileMeta {
                path: rel,
                kind: FileKind::File,
                size: meta.len(),
                digest: file_digest(&path)?,
                uid: meta.uid(),
                gid: meta.gid(),
                mode: meta.mode() & 0o7777,
                link_target: None,
            });
        }
    }
    Ok(())
}
