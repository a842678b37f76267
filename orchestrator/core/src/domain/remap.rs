// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Ownership remap planning.
//!
//! Pairs the idmap a tree was written with against the idmap it must carry
//! and yields a per-kind translation. The filesystem walk lives in
//! `infrastructure::shift`.

use crate::domain::idmap::{IdKind, IdmapEntry, IdmapSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemapError {
    #[error("Cannot remap {kind} {ns_id}: on-disk range of {from_range} ids differs from target range of {to_range}")]
    RangeMismatch {
        kind: IdKind,
        ns_id: i64,
        from_range: i64,
        to_range: i64,
    },
    #[error("Cannot remap {kind} {ns_id}: host ranges overlap")]
    OverlappingHostRanges { kind: IdKind, ns_id: i64 },
    #[error("No such file or directory: {0}")]
    MissingRoot(String),
    #[error("Failed to remap {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("Remap worker failed: {0}")]
    Worker(String),
}

/// One contiguous translation of host ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftPair {
    pub kind: IdKind,
    pub ns_id: i64,
    pub from_host: i64,
    pub to_host: i64,
    pub range: i64,
}

impl ShiftPair {
    fn translate(&self, id: i64) -> Option<i64> {
        (id >= self.from_host && id < self.from_host + self.range)
            .then(|| id - self.from_host + self.to_host)
    }

    fn from_overlaps(&self, start: i64, range: i64) -> bool {
        self.from_host < start + range && start < self.from_host + self.range
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapPlan {
    pairs: Vec<ShiftPair>,
    mismatches: Vec<IdmapEntry>,
}

impl RemapPlan {
    /// Pair entries by `(kind, ns_id)`.
    ///
    /// Identical pairs are dropped. Entries present on one side only are
    /// reported as mismatches and left alone.
    pub fn build(on_disk: &IdmapSet, target: &IdmapSet) -> Result<Self, RemapError> {
        let from = on_disk.normalized();
        let to = target.normalized();
        let mut plan = RemapPlan::default();
        let kind_of = |e: &IdmapEntry| if e.is_uid { IdKind::Uid } else { IdKind::Gid };

        for src in &from {
            let kind = kind_of(src);
            let Some(dst) = to
                .iter()
                .find(|t| kind_of(t) == kind && t.ns_id == src.ns_id)
            else {
                plan.mismatches.push(*src);
                continue;
            };

            if dst.map_range != src.map_range {
                return Err(RemapError::RangeMismatch {
                    kind,
                    ns_id: src.ns_id,
                    from_range: src.map_range,
                    to_range: dst.map_range,
                });
            }
            if dst.host_id == src.host_id {
                continue;
            }
            if src.host_ids_intersect(dst) {
                return Err(RemapError::OverlappingHostRanges {
                    kind,
                    ns_id: src.ns_id,
                });
            }
            plan.pairs.push(ShiftPair {
                kind,
                ns_id: src.ns_id,
                from_host: src.host_id,
                to_host: dst.host_id,
                range: src.map_range,
            });
        }

        for dst in &to {
            let kind = kind_of(dst);
            if !from.iter().any(|s| kind_of(s) == kind && s.ns_id == dst.ns_id) {
                plan.mismatches.push(*dst);
            }
        }

        // A destination range that feeds another pair's source would make a
        // second pass move files again.
        for pair in &plan.pairs {
            if plan
                .pairs
                .iter()
                .any(|other| other.kind == pair.kind && other.from_overlaps(pair.to_host, pair.range))
            {
                return Err(RemapError::OverlappingHostRanges {
                    kind: pair.kind,
                    ns_id: pair.ns_id,
                });
            }
        }

        Ok(plan)
    }

    pub fn pairs(&self) -> &[ShiftPair] {
        &self.pairs
    }

    pub fn mismatches(&self) -> &[IdmapEntry] {
        &self.mismatches
    }

    /// True when no file needs to change.
    pub fn is_noop(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn translate(&self, kind: IdKind, id: i64) -> Option<i64> {
        self.pairs
            .iter()
            .filter(|p| p.kind == kind)
            .find_map(|p| p.translate(id))
    }
}

/// Outcome of one remap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapReport {
    pub changed: u64,
    pub unchanged: u64,
    pub mismatches: Vec<IdmapEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_translates_shifted_range() {
        let disk = IdmapSet::for_range(1_000_000, 65_536);
        let target = IdmapSet::for_range(2_000_000, 65_536);
        let plan = RemapPlan::build(&disk, &target).unwrap();

        assert_eq!(plan.pairs().len(), 2);
        assert_eq!(plan.translate(IdKind::Uid, 1_000_005), Some(2_000_005));
        assert_eq!(plan.translate(IdKind::Gid, 1_065_535), Some(2_065_535));
        assert_eq!(plan.translate(IdKind::Uid, 2_000_005), None);
    }

    #[test]
    fn test_identical_sets_are_noop() {
        let set = IdmapSet::for_range(1_000_000, 65_536);
        let plan = RemapPlan::build(&set, &set).unwrap();
        assert!(plan.is_noop());
        assert!(plan.mismatches().is_empty());
    }

    #[test]
    fn test_unequal_ranges_rejected() {
        let disk = IdmapSet::for_range(1_000_000, 65_536);
        let target = IdmapSet::for_range(2_000_000, 1000);
        assert!(matches!(
            RemapPlan::build(&disk, &target),
            Err(RemapError::RangeMismatch { from_range: 65_536, to_range: 1000, .. })
        ));
    }

    #[test]
    fn test_overlapping_host_ranges_rejected() {
        let disk = IdmapSet::for_range(1_000_000, 65_536);
        let target = IdmapSet::for_range(1_000_100, 65_536);
        assert!(matches!(
            RemapPlan::build(&disk, &target),
            Err(RemapError::OverlappingHostRanges { .. })
        ));
    }

    #[test]
    fn test_unpaired_entries_reported() {
        let disk = IdmapSet::from_entries(vec![
            IdmapEntry::uid(1_000_000, 0, 100),
            IdmapEntry::uid(5000, 1000, 1),
        ]);
        let target = IdmapSet::from_entries(vec![IdmapEntry::uid(2_000_000, 0, 100)]);
        let plan = RemapPlan::build(&disk, &target).unwrap();

        assert_eq!(plan.pairs().len(), 1);
        assert_eq!(plan.mismatches(), &[IdmapEntry::uid(5000, 1000, 1)]);
    }

    #[test]
    fn test_chained_destination_rejected() {
        let disk = IdmapSet::from_entries(vec![
            IdmapEntry::uid(100, 0, 100),
            IdmapEntry::uid(300, 100, 100),
        ]);
        let target = IdmapSet::from_entries(vec![
            IdmapEntry::uid(300, 0, 100),
            IdmapEntry::uid(500, 100, 100),
        ]);
        assert!(RemapPlan::build(&disk, &target).is_err());
    }
}
