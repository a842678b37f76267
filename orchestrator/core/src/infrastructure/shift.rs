// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! On-disk ownership shifting.
//!
//! Walks a tree without following symlinks and rewrites the owner of every
//! entry whose current uid/gid falls inside a source range of the plan, along
//! with the ids named in POSIX ACLs and the root owner of file capabilities.
//! Entries are judged by their current ownership only, so an interrupted run
//! is resumed by running again and a completed run is a no-op.

use crate::domain::idmap::IdKind;
use crate::domain::remap::{RemapError, RemapPlan, RemapReport};
use std::collections::HashSet;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const SETID_BITS: u32 = 0o6000;

const ACL_ACCESS_XATTR: &str = "system.posix_acl_access";
const ACL_DEFAULT_XATTR: &str = "system.posix_acl_default";
const CAPABILITY_XATTR: &str = "security.capability";

// struct posix_acl_xattr_header / posix_acl_xattr_entry, little endian
const ACL_XATTR_VERSION: u32 = 0x0002;
const ACL_HEADER_LEN: usize = 4;
const ACL_ENTRY_LEN: usize = 8;
const ACL_USER: u16 = 0x02;
const ACL_GROUP: u16 = 0x08;

// struct vfs_ns_cap_data
const VFS_CAP_REVISION_MASK: u32 = 0xFF00_0000;
const VFS_CAP_REVISION_3: u32 = 0x0300_0000;
const VFS_CAP_V3_LEN: usize = 24;
const VFS_CAP_ROOTID_OFFSET: usize = 20;

fn io_error(path: &Path, e: impl std::fmt::Display) -> RemapError {
    RemapError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn to_raw(path: &Path, id: Option<i64>) -> Result<Option<u32>, RemapError> {
    id.map(|id| u32::try_from(id).map_err(|_| io_error(path, format!("id {} out of range", id))))
        .transpose()
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

fn read_xattr(path: &Path, name: &str) -> Result<Option<Vec<u8>>, RemapError> {
    match xattr::get(path, name) {
        Ok(value) => Ok(value),
        Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

/// Translate the qualifiers of named user and group entries in a POSIX ACL
/// xattr. `None` when the value is malformed or nothing moves.
pub fn shift_acl(value: &[u8], plan: &RemapPlan) -> Option<Vec<u8>> {
    if read_u32(value, 0)? != ACL_XATTR_VERSION
        || (value.len() - ACL_HEADER_LEN) % ACL_ENTRY_LEN != 0
    {
        return None;
    }

    let mut shifted = value.to_vec();
    let mut changed = false;
    for entry in shifted[ACL_HEADER_LEN..].chunks_exact_mut(ACL_ENTRY_LEN) {
        let kind = match u16::from_le_bytes([entry[0], entry[1]]) {
            ACL_USER => IdKind::Uid,
            ACL_GROUP => IdKind::Gid,
            _ => continue,
        };
        let id = read_u32(entry, 4)?;
        if let Some(to) = plan
            .translate(kind, i64::from(id))
            .and_then(|to| u32::try_from(to).ok())
        {
            entry[4..8].copy_from_slice(&to.to_le_bytes());
            changed = true;
        }
    }
    changed.then_some(shifted)
}

/// Translate the namespace root owner of a v3 file capability. v2 values
/// carry no owner and are returned as `None`.
pub fn shift_capability(value: &[u8], plan: &RemapPlan) -> Option<Vec<u8>> {
    let magic = read_u32(value, 0)?;
    if value.len() != VFS_CAP_V3_LEN || magic & VFS_CAP_REVISION_MASK != VFS_CAP_REVISION_3 {
        return None;
    }
    let root_id = read_u32(value, VFS_CAP_ROOTID_OFFSET)?;
    let to = u32::try_from(plan.translate(IdKind::Uid, i64::from(root_id))?).ok()?;
    let mut shifted = value.to_vec();
    shifted[VFS_CAP_ROOTID_OFFSET..].copy_from_slice(&to.to_le_bytes());
    Some(shifted)
}

/// Returns whether the ACL changed.
fn shift_acl_xattr(path: &Path, name: &str, plan: &RemapPlan) -> Result<bool, RemapError> {
    let Some(value) = read_xattr(path, name)? else {
        return Ok(false);
    };
    let Some(shifted) = shift_acl(&value, plan) else {
        return Ok(false);
    };
    xattr::set(path, name, &shifted).map_err(|e| io_error(path, e))?;
    Ok(true)
}

/// Apply `plan` to every entry under `root`. Blocking; run it on a worker.
pub fn shift_tree(root: &Path, plan: &RemapPlan) -> Result<RemapReport, RemapError> {
    match std::fs::symlink_metadata(root) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RemapError::MissingRoot(root.display().to_string()))
        }
        Err(e) => return Err(io_error(root, e)),
    }

    let mut report = RemapReport {
        mismatches: plan.mismatches().to_vec(),
        ..Default::default()
    };
    if plan.is_noop() {
        debug!(root = %root.display(), "Idmap unchanged, nothing to shift");
        return Ok(report);
    }

    let mut seen_inodes: HashSet<(u64, u64)> = HashSet::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            io_error(&path, e)
        })?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| io_error(path, e))?;

        if !meta.is_dir() && meta.nlink() > 1 && !seen_inodes.insert((meta.dev(), meta.ino())) {
            continue;
        }

        let uid = plan.translate(IdKind::Uid, i64::from(meta.uid()));
        let gid = plan.translate(IdKind::Gid, i64::from(meta.gid()));
        let is_link = meta.file_type().is_symlink();
        let mut changed = false;

        if uid.is_some() || gid.is_some() {
            // chown drops file capabilities; keep them to write back
            let caps = if meta.is_file() {
                read_xattr(path, CAPABILITY_XATTR)?
            } else {
                None
            };

            std::os::unix::fs::lchown(path, to_raw(path, uid)?, to_raw(path, gid)?)
                .map_err(|e| io_error(path, e))?;

            // chown drops setuid/setgid on regular files
            let mode = meta.mode();
            if meta.is_file() && mode & SETID_BITS != 0 {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
                    .map_err(|e| io_error(path, e))?;
            }

            if let Some(caps) = caps {
                let caps = shift_capability(&caps, plan).unwrap_or(caps);
                if let Err(e) = xattr::set(path, CAPABILITY_XATTR, &caps) {
                    warn!(path = %path.display(), error = %e, "Unable to restore file capabilities");
                }
            }
            changed = true;
        }

        if !is_link {
            changed |= shift_acl_xattr(path, ACL_ACCESS_XATTR, plan)?;
            if meta.is_dir() {
                changed |= shift_acl_xattr(path, ACL_DEFAULT_XATTR, plan)?;
            }
        }

        if changed {
            report.changed += 1;
        } else {
            report.unchanged += 1;
        }
    }

    info!(
        root = %root.display(),
        changed = report.changed,
        unchanged = report.unchanged,
        "Shifted tree ownership"
    );
    Ok(report)
}
