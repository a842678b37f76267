// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Instance Aggregate
//!
//! A container or VM known to this daemon: its root filesystem location, its
//! idmap configuration and the volatile idmap state that tracks what is on
//! disk versus what the next start must use.

use crate::domain::exec::ExecError;
use crate::domain::idmap::{IdmapError, IdmapSet};
use crate::domain::operation::OperationError;
use crate::domain::remap::RemapError;
use crate::domain::repository::RepositoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("Instance {0} not found")]
    NotFound(String),
    #[error("Instance {0} already exists")]
    AlreadyExists(String),
    #[error("Invalid instance name {0:?}")]
    InvalidName(String),
    #[error("Instance {0} is still being migrated")]
    Migrating(String),
    #[error("Instance {0} is already running")]
    AlreadyRunning(String),
    #[error("Instance {0} is running")]
    Running(String),
    #[error("Instance {0} is not running")]
    NotRunning(String),
    #[error("Instance {0} has an unfinished idmap remap and cannot start")]
    RemapPending(String),
    #[error("Instance {0} is being remapped")]
    Remapping(String),
    #[error(transparent)]
    Idmap(#[from] IdmapError),
    #[error(transparent)]
    Remap(#[from] RemapError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("Instance I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
    /// Receiving a migration; start is refused until it completes.
    Migrating,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::Stopped => "Stopped",
            InstanceStatus::Running => "Running",
            InstanceStatus::Migrating => "Migrating",
        };
        f.write_str(name)
    }
}

/// User-facing idmap settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapConfig {
    /// Reserve a private host range instead of sharing the default one.
    #[serde(default)]
    pub isolated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<i64>,
    /// Raw custom entries, one per line.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw: String,
}

/// Daemon-managed idmap state, persisted with the instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatileIdmap {
    /// Host base of an isolated reservation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<i64>,
    /// Map the next start must use.
    #[serde(default)]
    pub next: IdmapSet,
    /// Map the files on disk were written with.
    #[serde(default)]
    pub last_state: IdmapSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub root_path: PathBuf,
    pub status: InstanceStatus,
    #[serde(default)]
    pub idmap: IdmapConfig,
    #[serde(default)]
    pub volatile: VolatileIdmap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(name: impl Into<String>, root_path: impl Into<PathBuf>, idmap: IdmapConfig) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            root_path: root_path.into(),
            status: InstanceStatus::Stopped,
            idmap,
            volatile: VolatileIdmap::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Names become directory names and URL segments.
    pub fn validate_name(name: &str) -> Result<(), InstanceError> {
        let valid = !name.is_empty()
            && name.len() <= 63
            && !name.starts_with('-')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if valid {
            Ok(())
        } else {
            Err(InstanceError::InvalidName(name.to_string()))
        }
    }

    pub fn rootfs(&self) -> PathBuf {
        self.root_path.join("rootfs")
    }

    /// Checkpoint directory used by stateful transfers.
    pub fn state_dir(&self) -> PathBuf {
        self.root_path.join("state")
    }

    pub fn url(&self) -> String {
        format!("/{}/instances/{}", crate::domain::operation::API_VERSION, self.name)
    }

    /// Ownership on disk differs from what the next start expects.
    pub fn remap_pending(&self) -> bool {
        !self.volatile.last_state.is_empty()
            && !self.volatile.last_state.equivalent(&self.volatile.next)
    }

    /// Record that the tree on disk now carries `set`.
    pub fn mark_on_disk(&mut self, set: IdmapSet) {
        self.volatile.last_state = set;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Start preconditions once any pending remap has been attempted.
    pub fn ensure_startable(&self) -> Result<(), InstanceError> {
        match self.status {
            InstanceStatus::Running => return Err(InstanceError::AlreadyRunning(self.name.clone())),
            InstanceStatus::Migrating => return Err(InstanceError::Migrating(self.name.clone())),
            InstanceStatus::Stopped => {}
        }
        if self.remap_pending() {
            return Err(InstanceError::RemapPending(self.name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> Instance {
        Instance::new("c1", "/var/lib/lodge/instances/c1", IdmapConfig::default())
    }

    #[test]
    fn test_name_validation() {
        assert!(Instance::validate_name("web-01").is_ok());
        assert!(Instance::validate_name("").is_err());
        assert!(Instance::validate_name("../etc").is_err());
        assert!(Instance::validate_name("-lead").is_err());
    }

    #[test]
    fn test_fresh_instance_is_startable() {
        let mut inst = instance();
        inst.volatile.next = IdmapSet::for_range(1_000_000, 65_536);
        assert!(!inst.remap_pending());
        assert!(inst.ensure_startable().is_ok());
    }

    #[test]
    fn test_pending_remap_blocks_start() {
        let mut inst = instance();
        inst.volatile.next = IdmapSet::for_range(2_000_000, 65_536);
        inst.mark_on_disk(IdmapSet::for_range(1_000_000, 65_536));
        assert!(matches!(
            inst.ensure_startable(),
            Err(InstanceError::RemapPending(_))
        ));

        inst.mark_on_disk(inst.volatile.next.clone());
        assert!(inst.ensure_startable().is_ok());
    }

    #[test]
    fn test_migrating_blocks_start() {
        let mut inst = instance();
        inst.status = InstanceStatus::Migrating;
        assert!(matches!(inst.ensure_startable(), Err(InstanceError::Migrating(_))));
    }
}
