// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Identity Map Domain Types
//!
//! UID/GID mapping entries, ordered idmap sets with split-on-overlap insertion,
//! raw custom-entry parsing and the pure first-fit host range allocator.
//!
//! # Architecture
//!
//! - **Layer:** Domain
//! - **Used by:** `application::idmap_allocator`, `infrastructure::shift`,
//!   migration header encoding

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One full POSIX ID range. Smallest usable allocation.
pub const POSIX_RANGE: i64 = 65_536;

/// Synthetic pool used when the host carries no shadow-utils configuration.
pub const FALLBACK_BASE: i64 = 1_000_000;
pub const FALLBACK_RANGE: i64 = 1_000_000_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdmapError {
    #[error("Host id is in the range of subids")]
    HostIdIsSubId,
    #[error("Invalid raw idmap line {line:?}: {reason}")]
    InvalidRawLine { line: String, reason: String },
    #[error("idmap ranges of different sizes {0}")]
    RangeSizeMismatch(String),
    #[error("Bad mapping: id wraparound")]
    Wraparound,
    #[error("Not enough uid/gid available for a range of {size} ids")]
    PoolExhausted { size: i64 },
    #[error("Requested base {base} with size {size} is outside the host id pool")]
    BaseOutOfPool { base: i64, size: i64 },
    #[error("Requested base {base} with size {size} overlaps an existing allocation")]
    BaseOverlap { base: i64, size: i64 },
    #[error("Host id pool provides {available} ids, at least {required} are required")]
    PoolTooSmall { available: i64, required: i64 },
    #[error("Host id configuration is inconsistent: {0}")]
    PoolInconsistent(String),
    #[error("No map found for user {0}")]
    NoUserMap(String),
    #[error("Invalid idmap size {0}")]
    InvalidSize(i64),
    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("Invalid idmap encoding: {0}")]
    Encoding(String),
}

/// Which ID kind an entry or operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    Uid,
    Gid,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::Uid => f.write_str("uid"),
            IdKind::Gid => f.write_str("gid"),
        }
    }
}

/// A contiguous mapping of `map_range` ids starting at `ns_id` inside the
/// namespace onto `host_id` on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdmapEntry {
    pub is_uid: bool,
    pub is_gid: bool,
    pub host_id: i64,
    pub ns_id: i64,
    pub map_range: i64,
}

/// `x` in `[low, high)`.
fn is_between(x: i64, low: i64, high: i64) -> bool {
    x >= low && x < high
}

impl IdmapEntry {
    pub fn uid(host_id: i64, ns_id: i64, map_range: i64) -> Self {
        Self {
            is_uid: true,
            is_gid: false,
            host_id,
            ns_id,
            map_range,
        }
    }

    pub fn gid(host_id: i64, ns_id: i64, map_range: i64) -> Self {
        Self {
            is_uid: false,
            is_gid: true,
            host_id,
            ns_id,
            map_range,
        }
    }

    pub fn both(host_id: i64, ns_id: i64, map_range: i64) -> Self {
        Self {
            is_uid: true,
            is_gid: true,
            host_id,
            ns_id,
            map_range,
        }
    }

    pub fn covers_kind(&self, kind: IdKind) -> bool {
        match kind {
            IdKind::Uid => self.is_uid,
            IdKind::Gid => self.is_gid,
        }
    }

    /// Copy of this entry restricted to one kind.
    pub fn with_kind(&self, kind: IdKind) -> Self {
        Self {
            is_uid: kind == IdKind::Uid,
            is_gid: kind == IdKind::Gid,
            ..*self
        }
    }

    fn shares_kind(&self, other: &IdmapEntry) -> bool {
        (self.is_uid && other.is_uid) || (self.is_gid && other.is_gid)
    }

    /// Last host id covered, inclusive.
    pub fn host_end(&self) -> i64 {
        self.host_id + self.map_range - 1
    }

    pub fn ns_end(&self) -> i64 {
        self.ns_id + self.map_range - 1
    }

    pub fn contains_host_id(&self, id: i64) -> bool {
        is_between(id, self.host_id, self.host_id + self.map_range)
    }

    /// Whether the host ranges of two entries of a common kind overlap.
    pub fn host_ids_intersect(&self, other: &IdmapEntry) -> bool {
        self.shares_kind(other)
            && self.host_id < other.host_id + other.map_range
            && other.host_id < self.host_id + self.map_range
    }

    /// Whether two entries of a common kind overlap on the host side or in the
    /// namespace.
    pub fn intersects(&self, other: &IdmapEntry) -> bool {
        if !self.shares_kind(other) {
            return false;
        }
        let ns_overlap = self.ns_id < other.ns_id + other.map_range
            && other.ns_id < self.ns_id + self.map_range;
        self.host_ids_intersect(other) || ns_overlap
    }

    /// Namespace id to host id. `None` when the entry does not apply.
    pub fn shift_into_ns(&self, id: i64) -> Option<i64> {
        is_between(id, self.ns_id, self.ns_id + self.map_range)
            .then(|| id - self.ns_id + self.host_id)
    }

    /// Host id back to namespace id.
    pub fn shift_from_ns(&self, id: i64) -> Option<i64> {
        is_between(id, self.host_id, self.host_id + self.map_range)
            .then(|| id - self.host_id + self.ns_id)
    }

    /// `u <ns> <host> <range>` / `g ...` lines in LXC config syntax.
    pub fn to_lxc_strings(&self) -> Vec<String> {
        let digits = format!("{} {} {}", self.ns_id, self.host_id, self.map_range);
        let mut lines = Vec::with_capacity(2);
        if self.is_uid {
            lines.push(format!("u {}", digits));
        }
        if self.is_gid {
            lines.push(format!("g {}", digits));
        }
        lines
    }

    fn validate(&self) -> Result<(), IdmapError> {
        if self.map_range <= 0 {
            return Err(IdmapError::InvalidSize(self.map_range));
        }
        if self.host_id.checked_add(self.map_range).is_none()
            || self.ns_id.checked_add(self.map_range).is_none()
        {
            return Err(IdmapError::Wraparound);
        }
        Ok(())
    }
}

/// Ordered collection of idmap entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdmapSet {
    entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<IdmapEntry>) -> Self {
        Self { entries }
    }

    /// Standard isolated layout: uid and gid both map namespace 0.. onto
    /// `host_base`.
    pub fn for_range(host_base: i64, size: i64) -> Self {
        Self {
            entries: vec![
                IdmapEntry::uid(host_base, 0, size),
                IdmapEntry::gid(host_base, 0, size),
            ],
        }
    }

    pub fn entries(&self) -> &[IdmapEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<IdmapEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of one kind, `both` entries included.
    pub fn entries_of(&self, kind: IdKind) -> impl Iterator<Item = &IdmapEntry> {
        self.entries.iter().filter(move |e| e.covers_kind(kind))
    }

    pub fn intersects(&self, entry: &IdmapEntry) -> bool {
        self.entries.iter().any(|e| e.intersects(entry))
    }

    pub fn host_ids_intersect(&self, entry: &IdmapEntry) -> bool {
        self.entries.iter().any(|e| e.host_ids_intersect(entry))
    }

    /// Append an entry that must not overlap any existing entry.
    pub fn append(&mut self, entry: IdmapEntry) -> Result<(), IdmapError> {
        entry.validate()?;
        if self.intersects(&entry) {
            return Err(IdmapError::InvalidRawLine {
                line: entry.to_lxc_strings().join(", "),
                reason: "Conflicting id mapping".to_string(),
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Insert `entry`, splitting any existing entry whose namespace range it
    /// overlaps. Fails with [`IdmapError::HostIdIsSubId`] when the host ids
    /// collide instead.
    pub fn add_safe(&mut self, entry: IdmapEntry) -> Result<(), IdmapError> {
        entry.validate()?;
        if entry.is_uid {
            self.add_safe_kind(entry.with_kind(IdKind::Uid))?;
        }
        if entry.is_gid {
            self.add_safe_kind(entry.with_kind(IdKind::Gid))?;
        }
        Ok(())
    }

    fn add_safe_kind(&mut self, new: IdmapEntry) -> Result<(), IdmapError> {
        let kind = if new.is_uid { IdKind::Uid } else { IdKind::Gid };
        let mut result = Vec::with_capacity(self.entries.len() + 2);
        let mut added = false;

        for existing in &self.entries {
            if !existing.intersects(&new) {
                result.push(*existing);
                continue;
            }
            if existing.host_ids_intersect(&new) {
                return Err(IdmapError::HostIdIsSubId);
            }

            // Keep the untouched kind of a combined entry as-is.
            let other = match kind {
                IdKind::Uid => IdKind::Gid,
                IdKind::Gid => IdKind::Uid,
            };
            if existing.covers_kind(other) {
                result.push(existing.with_kind(other));
            }
            let current = existing.with_kind(kind);

            let lower_len = (new.ns_id - current.ns_id).clamp(0, current.map_range);
            if lower_len > 0 {
                result.push(IdmapEntry {
                    map_range: lower_len,
                    ..current
                });
            }
            if !added {
                result.push(new);
                added = true;
            }
            let upper_ns = new.ns_id + new.map_range;
            let upper_len = current.ns_id + current.map_range - upper_ns;
            if upper_len > 0 {
                let offset = upper_ns - current.ns_id;
                result.push(IdmapEntry {
                    host_id: current.host_id + offset,
                    ns_id: upper_ns,
                    map_range: upper_len,
                    ..current
                });
            }
        }

        if !added {
            result.push(new);
        }
        self.entries = result;
        Ok(())
    }

    /// Namespace (uid, gid) to host ids. First matching entry wins per kind.
    pub fn shift_into_ns(&self, uid: i64, gid: i64) -> (Option<i64>, Option<i64>) {
        let u = self
            .entries_of(IdKind::Uid)
            .find_map(|e| e.shift_into_ns(uid));
        let g = self
            .entries_of(IdKind::Gid)
            .find_map(|e| e.shift_into_ns(gid));
        (u, g)
    }

    /// Host (uid, gid) back to namespace ids.
    pub fn shift_from_ns(&self, uid: i64, gid: i64) -> (Option<i64>, Option<i64>) {
        let u = self
            .entries_of(IdKind::Uid)
            .find_map(|e| e.shift_from_ns(uid));
        let g = self
            .entries_of(IdKind::Gid)
            .find_map(|e| e.shift_from_ns(gid));
        (u, g)
    }

    /// De-duplicated LXC config lines.
    pub fn to_lxc_strings(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for line in self.entries.iter().flat_map(|e| e.to_lxc_strings()) {
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
        lines
    }

    /// Per-kind entries in a canonical order. Combined entries are split.
    pub fn normalized(&self) -> Vec<IdmapEntry> {
        let mut out: Vec<IdmapEntry> = Vec::with_capacity(self.entries.len() * 2);
        for e in &self.entries {
            if e.is_uid {
                out.push(e.with_kind(IdKind::Uid));
            }
            if e.is_gid {
                out.push(e.with_kind(IdKind::Gid));
            }
        }
        out.sort_by_key(|e| (!e.is_uid, e.ns_id, e.host_id, e.map_range));
        out.dedup();
        out
    }

    /// Set equality that ignores ordering and combined/split representation.
    pub fn equivalent(&self, other: &IdmapSet) -> bool {
        self.normalized() == other.normalized()
    }

    pub fn to_json(&self) -> Result<String, IdmapError> {
        serde_json::to_string(self).map_err(|e| IdmapError::Encoding(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, IdmapError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| IdmapError::Encoding(e.to_string()))
    }
}

impl fmt::Display for IdmapSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_lxc_strings().join(", "))
    }
}

/// Parses `a-b` (inclusive) or a single id into `(base, size)`.
fn parse_range(raw: &str, line: &str) -> Result<(i64, i64), IdmapError> {
    let invalid = |reason: String| IdmapError::InvalidRawLine {
        line: line.to_string(),
        reason,
    };
    let mut parts = raw.split('-');
    let base_str = parts.next().unwrap_or_default();
    let end_str = parts.next();
    if parts.next().is_some() {
        return Err(invalid(format!("invalid range {}", raw)));
    }
    let base: i64 = base_str
        .parse()
        .map_err(|_| invalid(format!("invalid id {:?}", base_str)))?;
    let size = match end_str {
        Some(end_str) => {
            let end: i64 = end_str
                .parse()
                .map_err(|_| invalid(format!("invalid id {:?}", end_str)))?;
            if end < base {
                return Err(invalid(format!("range {} ends before it starts", raw)));
            }
            end - base + 1
        }
        None => 1,
    };
    Ok((base, size))
}

/// Parses raw idmap text, one `{both|uid|gid} <host-range> <ns-range>` entry
/// per line, merging entries with [`IdmapSet::add_safe`].
pub fn parse_raw_idmap(value: &str) -> Result<Vec<IdmapEntry>, IdmapError> {
    let mut set = IdmapSet::new();

    for line in value.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(IdmapError::InvalidRawLine {
                line: line.to_string(),
                reason: "expected 3 fields".to_string(),
            });
        }

        let (host_base, host_size) = parse_range(fields[1], line)?;
        let (ns_base, ns_size) = parse_range(fields[2], line)?;
        if host_size != ns_size {
            return Err(IdmapError::RangeSizeMismatch(line.to_string()));
        }

        let entry = match fields[0] {
            "both" => IdmapEntry::both(host_base, ns_base, ns_size),
            "uid" => IdmapEntry::uid(host_base, ns_base, ns_size),
            "gid" => IdmapEntry::gid(host_base, ns_base, ns_size),
            other => {
                return Err(IdmapError::InvalidRawLine {
                    line: line.to_string(),
                    reason: format!("invalid type {:?}", other),
                })
            }
        };
        set.add_safe(entry)?;
    }

    Ok(set.into_entries())
}

/// Half-open host id range `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostRange {
    pub start: i64,
    pub size: i64,
}

impl HostRange {
    pub fn new(start: i64, size: i64) -> Self {
        Self { start, size }
    }

    /// Saturates at `i64::MAX`, so an oversized range never fits a pool.
    pub fn end_exclusive(&self) -> i64 {
        self.start.saturating_add(self.size)
    }

    /// Last id in the range, inclusive.
    pub fn last(&self) -> i64 {
        self.end_exclusive() - 1
    }

    pub fn overlaps(&self, other: &HostRange) -> bool {
        self.start < other.end_exclusive() && other.start < self.end_exclusive()
    }

    pub fn contains_range(&self, other: &HostRange) -> bool {
        other.start >= self.start && other.end_exclusive() <= self.end_exclusive()
    }
}

impl fmt::Display for HostRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.last())
    }
}

/// First-fit allocator of disjoint sub-ranges from one host pool.
///
/// Pure bookkeeping: callers serialize access.
#[derive(Debug, Clone)]
pub struct RangeAllocator {
    pool: HostRange,
    reserved: Vec<HostRange>,
}

impl RangeAllocator {
    pub fn new(pool: HostRange) -> Self {
        Self {
            pool,
            reserved: Vec::new(),
        }
    }

    pub fn pool(&self) -> HostRange {
        self.pool
    }

    pub fn reserved(&self) -> &[HostRange] {
        &self.reserved
    }

    /// Reserve `size` ids, at `base` when given, otherwise at the lowest free
    /// offset. Nothing is recorded on failure.
    pub fn reserve(&mut self, size: i64, base: Option<i64>) -> Result<HostRange, IdmapError> {
        if size <= 0 {
            return Err(IdmapError::InvalidSize(size));
        }

        let range = match base {
            Some(base) => {
                let wanted = HostRange::new(base, size);
                if !self.pool.contains_range(&wanted) {
                    return Err(IdmapError::BaseOutOfPool { base, size });
                }
                if self.reserved.iter().any(|r| r.overlaps(&wanted)) {
                    return Err(IdmapError::BaseOverlap { base, size });
                }
                wanted
            }
            None => self.find_first_fit(size)?,
        };

        self.insert_sorted(range);
        Ok(range)
    }

    fn find_first_fit(&self, size: i64) -> Result<HostRange, IdmapError> {
        let exhausted = IdmapError::PoolExhausted { size };
        if size > self.pool.size {
            return Err(exhausted);
        }
        let mut cursor = self.pool.start;
        for taken in &self.reserved {
            let end = cursor.checked_add(size).ok_or_else(|| exhausted.clone())?;
            if end <= taken.start {
                return Ok(HostRange::new(cursor, size));
            }
            cursor = cursor.max(taken.end_exclusive());
        }
        match cursor.checked_add(size) {
            Some(end) if end <= self.pool.end_exclusive() => Ok(HostRange::new(cursor, size)),
            _ => Err(exhausted),
        }
    }

    /// Record an existing reservation, e.g. one restored from persisted
    /// instance state. Overlap with another reservation is rejected.
    pub fn restore(&mut self, range: HostRange) -> Result<(), IdmapError> {
        if self.reserved.iter().any(|r| r.overlaps(&range)) {
            return Err(IdmapError::BaseOverlap {
                base: range.start,
                size: range.size,
            });
        }
        self.insert_sorted(range);
        Ok(())
    }

    /// Drop the reservation starting at `start`. Returns whether one existed.
    pub fn release(&mut self, start: i64) -> bool {
        let before = self.reserved.len();
        self.reserved.retain(|r| r.start != start);
        before != self.reserved.len()
    }

    fn insert_sorted(&mut self, range: HostRange) {
        let pos = self
            .reserved
            .partition_point(|r| r.start < range.start);
        self.reserved.insert(pos, range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_equal_ranges() {
        let entries = parse_raw_idmap("uid 50-60 500-510").unwrap();
        assert_eq!(entries, vec![IdmapEntry::uid(50, 500, 11)]);
    }

    #[test]
    fn test_parse_raw_rejects_size_mismatch() {
        let err = parse_raw_idmap("uid 50-61 500-510").unwrap_err();
        assert_eq!(err, IdmapError::RangeSizeMismatch("uid 50-61 500-510".into()));
    }

    #[test]
    fn test_parse_raw_single_ids_and_both() {
        let entries = parse_raw_idmap("both 1000 0\ngid 2000-2001 5-6\n").unwrap();
        assert!(entries.contains(&IdmapEntry::uid(1000, 0, 1)));
        assert!(entries.contains(&IdmapEntry::gid(1000, 0, 1)));
        assert!(entries.contains(&IdmapEntry::gid(2000, 5, 2)));
    }

    #[test]
    fn test_parse_raw_names_bad_line() {
        let err = parse_raw_idmap("uid 1 1\nfoo 1 2").unwrap_err();
        match err {
            IdmapError::InvalidRawLine { line, .. } => assert_eq!(line, "foo 1 2"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_add_safe_splits_namespace_overlap() {
        let mut set = IdmapSet::from_entries(vec![IdmapEntry::uid(100_000, 0, 65_536)]);
        set.add_safe(IdmapEntry::uid(1000, 1000, 1)).unwrap();

        assert_eq!(
            set.entries(),
            &[
                IdmapEntry::uid(100_000, 0, 1000),
                IdmapEntry::uid(1000, 1000, 1),
                IdmapEntry::uid(101_001, 1001, 64_535),
            ]
        );
    }

    #[test]
    fn test_add_safe_preserves_other_kind_of_combined_entry() {
        let mut set = IdmapSet::from_entries(vec![IdmapEntry::both(100_000, 0, 10)]);
        set.add_safe(IdmapEntry::uid(5, 5, 1)).unwrap();

        let (u, g) = set.shift_into_ns(5, 5);
        assert_eq!(u, Some(5));
        assert_eq!(g, Some(100_005));
    }

    #[test]
    fn test_add_safe_rejects_host_collision() {
        let mut set = IdmapSet::for_range(100_000, 65_536);
        let err = set.add_safe(IdmapEntry::uid(100_010, 10, 1)).unwrap_err();
        assert_eq!(err, IdmapError::HostIdIsSubId);
    }

    #[test]
    fn test_shift_roundtrip() {
        let set = IdmapSet::for_range(1_000_000, 65_536);
        assert_eq!(set.shift_into_ns(0, 5), (Some(1_000_000), Some(1_000_005)));
        assert_eq!(set.shift_from_ns(1_000_000, 1_000_005), (Some(0), Some(5)));
        assert_eq!(set.shift_into_ns(70_000, 0).0, None);
    }

    #[test]
    fn test_lxc_strings() {
        let set = IdmapSet::from_entries(vec![IdmapEntry::both(1_000_000, 0, 65_536)]);
        assert_eq!(
            set.to_lxc_strings(),
            vec!["u 0 1000000 65536".to_string(), "g 0 1000000 65536".to_string()]
        );
    }

    #[test]
    fn test_equivalent_ignores_split_and_order() {
        let combined = IdmapSet::from_entries(vec![IdmapEntry::both(10, 0, 5)]);
        let split = IdmapSet::from_entries(vec![IdmapEntry::gid(10, 0, 5), IdmapEntry::uid(10, 0, 5)]);
        assert!(combined.equivalent(&split));
        assert!(!combined.equivalent(&IdmapSet::for_range(11, 5)));
    }

    #[test]
    fn test_json_roundtrip_and_empty() {
        let set = IdmapSet::for_range(1_000_000, 65_536);
        let json = set.to_json().unwrap();
        assert_eq!(IdmapSet::from_json(&json).unwrap(), set);
        assert!(IdmapSet::from_json("").unwrap().is_empty());
    }

    #[test]
    fn test_allocator_two_ranges_fill_pool() {
        let base = 1_065_536;
        let mut alloc = RangeAllocator::new(HostRange::new(base, 131_072));
        let first = alloc.reserve(65_536, None).unwrap();
        let second = alloc.reserve(65_536, None).unwrap();

        assert_eq!((first.start, first.last()), (base, base + 65_535));
        assert_eq!((second.start, second.last()), (base + 65_536, base + 131_071));
    }

    #[test]
    fn test_allocator_exact_fit_then_one_more_fails() {
        let mut alloc = RangeAllocator::new(HostRange::new(0, 100));
        alloc.reserve(60, None).unwrap();
        assert!(alloc.reserve(41, None).is_err());
        assert_eq!(alloc.reserved().len(), 1);
        alloc.reserve(40, None).unwrap();
        assert_eq!(alloc.reserve(1, None), Err(IdmapError::PoolExhausted { size: 1 }));
    }

    #[test]
    fn test_allocator_reuses_released_gap() {
        let mut alloc = RangeAllocator::new(HostRange::new(0, 300));
        let a = alloc.reserve(100, None).unwrap();
        alloc.reserve(100, None).unwrap();
        assert!(alloc.release(a.start));
        assert_eq!(alloc.reserve(100, None).unwrap().start, 0);
    }

    #[test]
    fn test_allocator_explicit_base() {
        let mut alloc = RangeAllocator::new(HostRange::new(1000, 1000));
        assert_eq!(alloc.reserve(10, Some(1500)).unwrap(), HostRange::new(1500, 10));
        assert!(matches!(
            alloc.reserve(10, Some(1505)),
            Err(IdmapError::BaseOverlap { .. })
        ));
        assert!(matches!(
            alloc.reserve(10, Some(1995)),
            Err(IdmapError::BaseOutOfPool { .. })
        ));
        // first-fit still starts at the pool base
        assert_eq!(alloc.reserve(10, None).unwrap().start, 1000);
    }

    #[test]
    fn test_allocator_near_id_limit_never_wraps() {
        let mut alloc = RangeAllocator::new(HostRange::new(i64::MAX - 100, 100));
        alloc.reserve(50, None).unwrap();
        assert_eq!(alloc.reserve(60, None), Err(IdmapError::PoolExhausted { size: 60 }));
        assert_eq!(
            alloc.reserve(i64::MAX, None),
            Err(IdmapError::PoolExhausted { size: i64::MAX })
        );
        assert!(matches!(
            alloc.reserve(i64::MAX, Some(i64::MAX - 50)),
            Err(IdmapError::BaseOutOfPool { .. })
        ));
        assert_eq!(alloc.reserved().len(), 1);
    }
}
