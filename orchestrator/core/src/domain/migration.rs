// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Migration Domain Types
//!
//! Transport and checkpoint kinds, rsync feature negotiation, the offer and
//! answer exchanged on the "control" channel and the filesystem transport
//! seam implemented by infrastructure.
//!
//! # Negotiation
//!
//! The source offers its preferred transport, its full rsync feature set,
//! CRIU when live and its on-disk idmap. The target answers with a subset:
//! the optimized transport only when both ends agree on it (otherwise rsync),
//! the feature intersection and CRIU only when live was requested.

use crate::domain::channel::{ChannelConn, ChannelError};
use crate::domain::idmap::{IdmapEntry, IdmapError};
use crate::domain::instance::InstanceError;
use crate::domain::remap::RemapError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MigrationFsType {
    #[default]
    Rsync,
    Btrfs,
    Zfs,
    Rbd,
    BlockAndRsync,
}

impl MigrationFsType {
    pub fn as_i32(&self) -> i32 {
        match self {
            MigrationFsType::Rsync => 0,
            MigrationFsType::Btrfs => 1,
            MigrationFsType::Zfs => 2,
            MigrationFsType::Rbd => 3,
            MigrationFsType::BlockAndRsync => 4,
        }
    }
}

impl TryFrom<i32> for MigrationFsType {
    type Error = MigrationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MigrationFsType::Rsync),
            1 => Ok(MigrationFsType::Btrfs),
            2 => Ok(MigrationFsType::Zfs),
            3 => Ok(MigrationFsType::Rbd),
            4 => Ok(MigrationFsType::BlockAndRsync),
            other => Err(MigrationError::UnsupportedTransport(format!(
                "filesystem type {}",
                other
            ))),
        }
    }
}

impl fmt::Display for MigrationFsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationFsType::Rsync => "rsync",
            MigrationFsType::Btrfs => "btrfs",
            MigrationFsType::Zfs => "zfs",
            MigrationFsType::Rbd => "rbd",
            MigrationFsType::BlockAndRsync => "block_and_rsync",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CriuType {
    CriuRsync,
    Phaul,
    None,
    VmQemu,
}

impl CriuType {
    pub fn as_i32(&self) -> i32 {
        match self {
            CriuType::CriuRsync => 0,
            CriuType::Phaul => 1,
            CriuType::None => 2,
            CriuType::VmQemu => 3,
        }
    }

    /// Whether this kind carries runtime state.
    pub fn is_stateful(&self) -> bool {
        !matches!(self, CriuType::None)
    }
}

impl TryFrom<i32> for CriuType {
    type Error = MigrationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CriuType::CriuRsync),
            1 => Ok(CriuType::Phaul),
            2 => Ok(CriuType::None),
            3 => Ok(CriuType::VmQemu),
            other => Err(MigrationError::UnsupportedTransport(format!(
                "checkpoint type {}",
                other
            ))),
        }
    }
}

/// Optional rsync behaviours. Absent means not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RsyncFeatureSet {
    pub xattrs: bool,
    pub delete: bool,
    pub compress: bool,
    pub bidirectional: bool,
}

impl RsyncFeatureSet {
    /// Everything this implementation supports.
    pub fn all() -> Self {
        Self {
            xattrs: true,
            delete: true,
            compress: true,
            bidirectional: true,
        }
    }

    pub fn intersect(&self, other: &RsyncFeatureSet) -> RsyncFeatureSet {
        RsyncFeatureSet {
            xattrs: self.xattrs && other.xattrs,
            delete: self.delete && other.delete,
            compress: self.compress && other.compress,
            bidirectional: self.bidirectional && other.bidirectional,
        }
    }

    pub fn is_subset_of(&self, other: &RsyncFeatureSet) -> bool {
        self.intersect(other) == *self
    }

    /// Command-line options enabled by these features.
    pub fn rsync_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.xattrs {
            args.push("--xattrs".to_string());
        }
        if self.delete {
            args.push("--delete".to_string());
        }
        if self.compress {
            args.push("--compress".to_string());
            args.push("--compress-level=2".to_string());
        }
        args
    }
}

/// What the target can do, consulted when answering an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkCapabilities {
    pub fs_type: MigrationFsType,
    pub rsync_features: RsyncFeatureSet,
    pub live: bool,
}

/// Migration header as exchanged once in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationOffer {
    pub fs_type: MigrationFsType,
    pub criu: Option<CriuType>,
    pub idmap: Vec<IdmapEntry>,
    pub snapshot_names: Vec<String>,
    pub rsync_features: RsyncFeatureSet,
    pub predump: bool,
    pub refresh: bool,
}

impl MigrationOffer {
    pub fn is_live(&self) -> bool {
        self.criu.map(|c| c.is_stateful()).unwrap_or(false)
    }

    /// The target's answer: never claims more than was offered.
    pub fn answer(&self, local: &SinkCapabilities) -> MigrationOffer {
        let fs_type = if self.fs_type == local.fs_type {
            self.fs_type
        } else {
            MigrationFsType::Rsync
        };
        let live = self.is_live() && local.live;

        MigrationOffer {
            fs_type,
            criu: if live { self.criu } else { None },
            idmap: Vec::new(),
            snapshot_names: self.snapshot_names.clone(),
            rsync_features: self.rsync_features.intersect(&local.rsync_features),
            predump: self.predump && live,
            refresh: self.refresh,
        }
    }

    /// Source-side check that `answer` stays within this offer.
    pub fn check_answer(&self, answer: &MigrationOffer) -> Result<(), MigrationError> {
        if answer.fs_type != self.fs_type && answer.fs_type != MigrationFsType::Rsync {
            return Err(MigrationError::Protocol(format!(
                "answer selected transport {} which was not offered",
                answer.fs_type
            )));
        }
        if !answer.rsync_features.is_subset_of(&self.rsync_features) {
            return Err(MigrationError::Protocol(
                "answer claims rsync features that were not offered".to_string(),
            ));
        }
        if answer.is_live() && answer.criu != self.criu {
            return Err(MigrationError::Protocol(
                "answer claims a checkpoint transfer that was not offered".to_string(),
            ));
        }
        if answer.predump && !self.predump {
            return Err(MigrationError::Protocol(
                "answer claims pre-dump which was not offered".to_string(),
            ));
        }
        if answer.refresh && !self.refresh {
            return Err(MigrationError::Protocol(
                "answer claims refresh which was not offered".to_string(),
            ));
        }
        Ok(())
    }
}

/// Final outcome message on the "control" channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub success: bool,
    pub message: String,
}

impl ControlMessage {
    pub fn success() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration protocol error: {0}")]
    Protocol(String),
    #[error("Unsupported migration transport: {0}")]
    UnsupportedTransport(String),
    #[error("Filesystem transfer failed: {0}")]
    Transfer(String),
    /// Failure reported by the peer over "control".
    #[error("{0}")]
    Aborted(String),
    #[error("Timed out waiting for a migration control message")]
    ControlTimeout,
    #[error("Control channel closed before the migration completed")]
    ControlClosed,
    #[error("Migration cancelled")]
    Cancelled,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Idmap(#[from] IdmapError),
    #[error(transparent)]
    Remap(#[from] RemapError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
}

/// Moves a filesystem tree across one channel.
#[async_trait]
pub trait FsTransport: Send + Sync {
    fn fs_type(&self) -> MigrationFsType;

    /// Stream the tree at `path` to the peer.
    async fn send(
        &self,
        path: &Path,
        conn: &mut ChannelConn,
        features: &RsyncFeatureSet,
    ) -> Result<(), MigrationError>;

    /// Materialize the peer's tree at `path`.
    async fn recv(
        &self,
        path: &Path,
        conn: &mut ChannelConn,
        features: &RsyncFeatureSet,
    ) -> Result<(), MigrationError>;
}
