// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host id allocation for instances.
//!
//! The first 65,536 ids of the host pool form the shared default map. Isolated
//! instances reserve disjoint ranges from the remainder. Uid and gid pools are
//! addressed by offset, so an isolated instance gets the same offset in both.

use crate::domain::idmap::{
    parse_raw_idmap, HostRange, IdmapEntry, IdmapError, IdmapSet, RangeAllocator, POSIX_RANGE,
};
use crate::domain::instance::IdmapConfig;
use crate::infrastructure::host_idmap::HostIdmapPool;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Result of an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdmapAllocation {
    pub set: IdmapSet,
    /// Host uid base of an isolated reservation.
    pub base: Option<i64>,
}

struct ReadyPool {
    uid: HostRange,
    gid: HostRange,
    /// Offsets into both pools, excluding the default range.
    isolated: Mutex<RangeAllocator>,
}

enum PoolState {
    Ready(ReadyPool),
    Unusable(IdmapError),
}

pub struct IdmapAllocator {
    state: PoolState,
}

fn record(result: &Result<IdmapAllocation, IdmapError>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!("lodge_idmap_allocations_total", "result" => outcome).increment(1);
}

impl IdmapAllocator {
    pub fn new(pool: HostIdmapPool) -> Self {
        let state = match pool {
            HostIdmapPool::Ready { uid, gid } if uid.size < POSIX_RANGE || gid.size < POSIX_RANGE => {
                PoolState::Unusable(IdmapError::PoolTooSmall {
                    available: uid.size.min(gid.size),
                    required: POSIX_RANGE,
                })
            }
            HostIdmapPool::Ready { uid, gid } => {
                let usable = uid.size.min(gid.size);
                let isolated = HostRange::new(POSIX_RANGE, usable - POSIX_RANGE);
                PoolState::Ready(ReadyPool {
                    uid,
                    gid,
                    isolated: Mutex::new(RangeAllocator::new(isolated)),
                })
            }
            HostIdmapPool::Unusable(e) => PoolState::Unusable(e),
        };
        Self { state }
    }

    fn ready(&self) -> Result<&ReadyPool, IdmapError> {
        match &self.state {
            PoolState::Ready(pool) => Ok(pool),
            PoolState::Unusable(e) => Err(e.clone()),
        }
    }

    /// Fails with the discovery error when the host pool is unusable.
    pub fn check(&self) -> Result<(), IdmapError> {
        self.ready().map(|_| ())
    }

    /// Map shared by every non-isolated instance.
    pub fn default_set(&self) -> Result<IdmapSet, IdmapError> {
        let pool = self.ready()?;
        Ok(IdmapSet::from_entries(vec![
            IdmapEntry::uid(pool.uid.start, 0, POSIX_RANGE),
            IdmapEntry::gid(pool.gid.start, 0, POSIX_RANGE),
        ]))
    }

    fn set_at(pool: &ReadyPool, offset: i64, size: i64) -> IdmapSet {
        IdmapSet::from_entries(vec![
            IdmapEntry::uid(pool.uid.start + offset, 0, size),
            IdmapEntry::gid(pool.gid.start + offset, 0, size),
        ])
    }

    /// Allocate the map for an instance. Nothing stays reserved on failure.
    pub fn allocate(&self, config: &IdmapConfig) -> Result<IdmapAllocation, IdmapError> {
        let result = self.allocate_inner(config);
        record(&result);
        result
    }

    fn allocate_inner(&self, config: &IdmapConfig) -> Result<IdmapAllocation, IdmapError> {
        let pool = self.ready()?;
        // Parse before reserving so a bad raw map never holds a range.
        let raw = parse_raw_idmap(&config.raw)?;

        let (mut set, base, offset) = if config.isolated {
            let size = config.size.unwrap_or(POSIX_RANGE);
            if size <= 0 {
                return Err(IdmapError::InvalidSize(size));
            }
            let wanted = match config.base {
                Some(base) => Some(
                    base.checked_sub(pool.uid.start)
                        .ok_or(IdmapError::BaseOutOfPool { base, size })?,
                ),
                None => None,
            };
            let range = pool
                .isolated
                .lock()
                .reserve(size, wanted)
                .map_err(|e| match (e, config.base) {
                    (IdmapError::BaseOutOfPool { size, .. }, Some(base)) => {
                        IdmapError::BaseOutOfPool { base, size }
                    }
                    (IdmapError::BaseOverlap { size, .. }, Some(base)) => {
                        IdmapError::BaseOverlap { base, size }
                    }
                    (other, _) => other,
                })?;
            let base = pool.uid.start + range.start;
            debug!(base, size, "Reserved isolated id range");
            (Self::set_at(pool, range.start, size), Some(base), Some(range.start))
        } else {
            (self.default_set()?, None, None)
        };

        let applied = raw.into_iter().try_for_each(|entry| {
            if set.host_ids_intersect(&entry) {
                return Err(IdmapError::HostIdIsSubId);
            }
            set.add_safe(entry)
        });
        if let Err(e) = applied {
            if let Some(offset) = offset {
                pool.isolated.lock().release(offset);
            }
            return Err(e);
        }

        Ok(IdmapAllocation { set, base })
    }

    /// Re-register a reservation recorded before a restart.
    pub fn restore(&self, base: i64, size: i64) -> Result<(), IdmapError> {
        let pool = self.ready()?;
        pool.isolated
            .lock()
            .restore(HostRange::new(base.saturating_sub(pool.uid.start), size))?;
        info!(base, size, "Restored isolated id range");
        Ok(())
    }

    /// Give back the reservation at host uid `base`.
    pub fn release(&self, base: i64) -> bool {
        match &self.state {
            PoolState::Ready(pool) => pool
                .isolated
                .lock()
                .release(base.saturating_sub(pool.uid.start)),
            PoolState::Unusable(_) => false,
        }
    }

    /// Host ranges currently reserved for isolated instances.
    pub fn reserved(&self) -> Vec<HostRange> {
        match &self.state {
            PoolState::Ready(pool) => pool
                .isolated
                .lock()
                .reserved()
                .iter()
                .map(|r| HostRange::new(pool.uid.start + r.start, r.size))
                .collect(),
            PoolState::Unusable(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const B: i64 = 1_000_000;

    fn allocator(size: i64) -> IdmapAllocator {
        let range = HostRange::new(B, size);
        IdmapAllocator::new(HostIdmapPool::Ready { uid: range, gid: range })
    }

    fn isolated() -> IdmapConfig {
        IdmapConfig {
            isolated: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_map_is_shared() {
        let alloc = allocator(POSIX_RANGE);
        let a = alloc.allocate(&IdmapConfig::default()).unwrap();
        let b = alloc.allocate(&IdmapConfig::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.set, IdmapSet::for_range(B, POSIX_RANGE));
        assert_eq!(a.base, None);
    }

    #[test]
    fn test_isolated_ranges_follow_default_range() {
        let alloc = allocator(3 * POSIX_RANGE);
        let first = alloc.allocate(&isolated()).unwrap();
        let second = alloc.allocate(&isolated()).unwrap();
        assert_eq!(first.base, Some(B + POSIX_RANGE));
        assert_eq!(second.base, Some(B + 2 * POSIX_RANGE));
        assert!(matches!(
            alloc.allocate(&isolated()),
            Err(IdmapError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_bad_raw_map_releases_reservation() {
        let alloc = allocator(2 * POSIX_RANGE);
        let config = IdmapConfig {
            raw: format!("uid {} 0", B + POSIX_RANGE + 5),
            ..isolated()
        };
        assert_eq!(alloc.allocate(&config), Err(IdmapError::HostIdIsSubId));
        assert!(alloc.reserved().is_empty());
        assert!(alloc.allocate(&isolated()).is_ok());
    }

    #[test]
    fn test_raw_entry_splits_map() {
        let alloc = allocator(POSIX_RANGE);
        let config = IdmapConfig {
            raw: "both 1000 1000".to_string(),
            ..Default::default()
        };
        let allocation = alloc.allocate(&config).unwrap();
        assert_eq!(allocation.set.shift_into_ns(1000, 1000), (Some(1000), Some(1000)));
        assert_eq!(allocation.set.shift_into_ns(0, 0), (Some(B), Some(B)));
        assert_eq!(allocation.set.shift_from_ns(B + 1001, B + 1001), (Some(1001), Some(1001)));
    }

    #[test]
    fn test_explicit_base() {
        let alloc = allocator(4 * POSIX_RANGE);
        let wanted = B + 3 * POSIX_RANGE;
        let config = IdmapConfig {
            base: Some(wanted),
            ..isolated()
        };
        assert_eq!(alloc.allocate(&config).unwrap().base, Some(wanted));
        assert_eq!(
            alloc.allocate(&config),
            Err(IdmapError::BaseOverlap {
                base: wanted,
                size: POSIX_RANGE
            })
        );
        let outside = IdmapConfig {
            base: Some(B),
            ..isolated()
        };
        assert_eq!(
            alloc.allocate(&outside),
            Err(IdmapError::BaseOutOfPool {
                base: B,
                size: POSIX_RANGE
            })
        );
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let alloc = allocator(3 * POSIX_RANGE);
        let huge = IdmapConfig {
            size: Some(i64::MAX),
            ..isolated()
        };
        assert_eq!(
            alloc.allocate(&huge),
            Err(IdmapError::PoolExhausted { size: i64::MAX })
        );
        let negative_base = IdmapConfig {
            base: Some(i64::MIN),
            ..isolated()
        };
        assert!(matches!(
            alloc.allocate(&negative_base),
            Err(IdmapError::BaseOutOfPool { .. })
        ));
        assert!(alloc.reserved().is_empty());
    }

    #[test]
    fn test_unusable_pool_fails_everything() {
        let reason = IdmapError::PoolInconsistent("missing newgidmap".to_string());
        let alloc = IdmapAllocator::new(HostIdmapPool::Unusable(reason.clone()));
        assert_eq!(alloc.allocate(&IdmapConfig::default()), Err(reason.clone()));
        assert_eq!(alloc.check(), Err(reason));
    }

    #[test]
    fn test_restore_and_release() {
        let alloc = allocator(3 * POSIX_RANGE);
        alloc.restore(B + POSIX_RANGE, POSIX_RANGE).unwrap();
        assert_eq!(alloc.allocate(&isolated()).unwrap().base, Some(B + 2 * POSIX_RANGE));
        assert!(alloc.release(B + POSIX_RANGE));
        assert_eq!(alloc.allocate(&isolated()).unwrap().base, Some(B + POSIX_RANGE));
    }
}
