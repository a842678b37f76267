// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host id pool discovery.
//!
//! Four signals decide where isolated ranges come from: the subordinate id
//! files and the `newuidmap`/`newgidmap` helpers. Either all of them are
//! present, or none is (a synthetic pool is used). Anything in between is a
//! broken host setup and every idmap operation reports it.

use crate::domain::idmap::{HostRange, IdKind, IdmapError, FALLBACK_BASE, FALLBACK_RANGE, POSIX_RANGE};
use crate::domain::node_config::IdmapPoolConfig;
use std::path::Path;
use tracing::{info, warn};

/// The host ranges available for container ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostIdmapPool {
    Ready { uid: HostRange, gid: HostRange },
    /// Every idmap operation fails with this error.
    Unusable(IdmapError),
}

impl HostIdmapPool {
    pub fn fallback() -> Self {
        let range = HostRange::new(FALLBACK_BASE, FALLBACK_RANGE);
        HostIdmapPool::Ready { uid: range, gid: range }
    }
}

/// Raw discovery inputs.
#[derive(Debug, Clone, Default)]
pub struct PoolSignals {
    pub subuid: Option<String>,
    pub subgid: Option<String>,
    pub newuidmap: bool,
    pub newgidmap: bool,
}

impl PoolSignals {
    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.subuid.is_none() {
            missing.push("subuid file");
        }
        if self.subgid.is_none() {
            missing.push("subgid file");
        }
        if !self.newuidmap {
            missing.push("newuidmap");
        }
        if !self.newgidmap {
            missing.push("newgidmap");
        }
        missing
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, IdmapError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IdmapError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

pub fn read_signals(config: &IdmapPoolConfig) -> Result<PoolSignals, IdmapError> {
    Ok(PoolSignals {
        subuid: read_optional(&config.subuid_path)?,
        subgid: read_optional(&config.subgid_path)?,
        newuidmap: which::which("newuidmap").is_ok(),
        newgidmap: which::which("newgidmap").is_ok(),
    })
}

/// First range of `username` in a subuid/subgid file holding at least one
/// full POSIX range.
pub fn parse_subid(content: &str, username: &str, kind: IdKind) -> Result<HostRange, IdmapError> {
    let mut largest: Option<i64> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 3 || fields[0] != username {
            continue;
        }
        let (Ok(start), Ok(size)) = (fields[1].parse::<i64>(), fields[2].parse::<i64>()) else {
            warn!(line, %kind, "Ignoring malformed subordinate id entry");
            continue;
        };
        if size >= POSIX_RANGE {
            return Ok(HostRange::new(start, size));
        }
        largest = Some(largest.map_or(size, |l| l.max(size)));
    }

    match largest {
        Some(available) => Err(IdmapError::PoolTooSmall {
            available,
            required: POSIX_RANGE,
        }),
        None => Err(IdmapError::NoUserMap(username.to_string())),
    }
}

pub fn resolve_pool(signals: &PoolSignals, username: &str) -> HostIdmapPool {
    let missing = signals.missing();
    if missing.len() == 4 {
        return HostIdmapPool::fallback();
    }
    if !missing.is_empty() {
        return HostIdmapPool::Unusable(IdmapError::PoolInconsistent(format!(
            "missing {}",
            missing.join(", ")
        )));
    }

    let subuid = signals.subuid.as_deref().unwrap_or_default();
    let subgid = signals.subgid.as_deref().unwrap_or_default();
    let ranges = parse_subid(subuid, username, IdKind::Uid)
        .and_then(|uid| parse_subid(subgid, username, IdKind::Gid).map(|gid| (uid, gid)));
    match ranges {
        Ok((uid, gid)) => HostIdmapPool::Ready { uid, gid },
        Err(e) => HostIdmapPool::Unusable(e),
    }
}

pub fn discover_host_pool(config: &IdmapPoolConfig) -> HostIdmapPool {
    let pool = match read_signals(config) {
        Ok(signals) => resolve_pool(&signals, &config.username),
        Err(e) => HostIdmapPool::Unusable(e),
    };
    match &pool {
        HostIdmapPool::Ready { uid, gid } => {
            info!(user = %config.username, %uid, %gid, "Host id pool discovered")
        }
        HostIdmapPool::Unusable(e) => {
            warn!(user = %config.username, error = %e, "Host id pool unusable, idmap operations will fail")
        }
    }
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(subuid: &str, subgid: &str) -> PoolSignals {
        PoolSignals {
            subuid: Some(subuid.to_string()),
            subgid: Some(subgid.to_string()),
            newuidmap: true,
            newgidmap: true,
        }
    }

    #[test]
    fn test_no_signals_uses_fallback() {
        assert_eq!(resolve_pool(&PoolSignals::default(), "root"), HostIdmapPool::fallback());
    }

    #[test]
    fn test_partial_signals_are_inconsistent() {
        let signals = PoolSignals {
            subuid: Some("root:100000:65536\n".to_string()),
            ..Default::default()
        };
        match resolve_pool(&signals, "root") {
            HostIdmapPool::Unusable(IdmapError::PoolInconsistent(reason)) => {
                assert!(reason.contains("subgid file"));
                assert!(reason.contains("newgidmap"));
            }
            other => panic!("unexpected pool {:?}", other),
        }
    }

    #[test]
    fn test_first_large_enough_range_wins() {
        let subuid = "lodge:1000:100\nroot:100000:1000\nroot:200000:131072\nroot:900000:65536\n";
        let subgid = "# comment\nroot:300000:65536\n";
        match resolve_pool(&full(subuid, subgid), "root") {
            HostIdmapPool::Ready { uid, gid } => {
                assert_eq!(uid, HostRange::new(200_000, 131_072));
                assert_eq!(gid, HostRange::new(300_000, 65_536));
            }
            other => panic!("unexpected pool {:?}", other),
        }
    }

    #[test]
    fn test_small_ranges_are_refused() {
        assert_eq!(
            parse_subid("root:100000:1000\n", "root", IdKind::Uid),
            Err(IdmapError::PoolTooSmall {
                available: 1000,
                required: POSIX_RANGE
            })
        );
        assert_eq!(
            parse_subid("other:100000:65536\n", "root", IdKind::Gid),
            Err(IdmapError::NoUserMap("root".to_string()))
        );
    }
}
