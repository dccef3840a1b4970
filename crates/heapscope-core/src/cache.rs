//! Per-thread block cache with usage accounting.
//!
//! Each cache privately mirrors a subset of the registry. An entry pairs a
//! block handle with this thread's read/write counters for the current
//! epoch. Entries go stale when another thread frees or relocates the block;
//! they are never revoked eagerly, only discarded when this thread trips
//! over them (overlap resolution in the profiler) or during a prune.

use std::collections::BTreeMap;

use crate::block::{release, Addr, BlockRef, BlockState, Usage};
use crate::spanmap::{self, SpanEntry};

#[derive(Debug)]
struct CacheEntry {
    block: BlockRef,
    usage: Usage,
}

impl SpanEntry for CacheEntry {
    fn block(&self) -> &BlockRef {
        &self.block
    }
}

/// Snapshot of one used cache entry, attached to synchronization events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Block start address.
    pub addr: Addr,
    /// Block bookkeeping size at snapshot time.
    pub size: u64,
    /// Block state at snapshot time (dead blocks can still carry usage).
    pub state: BlockState,
    /// This thread's counters for the epoch being reported.
    pub usage: Usage,
}

/// Private interval map from block start address to `(block, usage)`.
#[derive(Debug, Default)]
pub struct ThreadCache {
    entries: BTreeMap<Addr, CacheEntry>,
}

impl ThreadCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Key and state of the entry containing `addr`, if cached.
    pub fn find(&self, addr: Addr) -> Option<(Addr, BlockState)> {
        let entry = spanmap::find_containing(&self.entries, addr)?;
        Some((entry.block.addr(), entry.block.state()))
    }

    /// Key of some entry whose block overlaps `[addr, addr + len)`.
    pub fn find_overlap(&self, addr: Addr, len: u64) -> Option<Addr> {
        spanmap::find_overlap_key(&self.entries, addr, len)
    }

    /// Removes the entry keyed by `key`, handing its block handle and
    /// accumulated usage to the caller.
    pub(crate) fn remove(&mut self, key: Addr) -> Option<(BlockRef, Usage)> {
        self.entries.remove(&key).map(|e| (e.block, e.usage))
    }

    /// Caches a block with fresh zero usage. The caller has already pruned
    /// overlapping stale entries, so a collision here is a bookkeeping bug.
    pub(crate) fn insert(&mut self, block: BlockRef) {
        debug_assert!(self.find_overlap(block.addr(), block.size()).is_none());
        let prev = self.entries.insert(
            block.addr(),
            CacheEntry {
                block,
                usage: Usage::default(),
            },
        );
        assert!(prev.is_none(), "cache entry collision");
    }

    /// Block handle of the entry keyed by `key`.
    pub fn block(&self, key: Addr) -> Option<&BlockRef> {
        self.entries.get(&key).map(|e| &e.block)
    }

    /// Counters of the entry keyed by `key`.
    pub fn usage(&self, key: Addr) -> Usage {
        self.entries
            .get(&key)
            .map(|e| e.usage)
            .expect("usage queried for an uncached block")
    }

    /// Mutable counters of the entry keyed by `key`.
    pub(crate) fn usage_mut(&mut self, key: Addr) -> &mut Usage {
        self.entries
            .get_mut(&key)
            .map(|e| &mut e.usage)
            .expect("usage queried for an uncached block")
    }

    /// Evicts dead entries and, with `drop_unused`, entries whose counters
    /// are all zero. Used before fork-like handoffs to bound cache growth.
    pub fn prune(&mut self, drop_unused: bool) {
        let doomed: Vec<Addr> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.block.is_alive() || (drop_unused && !e.usage.is_used()))
            .map(|(key, _)| *key)
            .collect();
        for key in doomed {
            if let Some((block, _usage)) = self.remove(key) {
                release(block);
            }
        }
    }

    /// Zeroes every entry's counters without evicting, starting a new epoch.
    pub fn reset_usage(&mut self) {
        for entry in self.entries.values_mut() {
            entry.usage.reset();
        }
    }

    /// Used entries in address order, for synchronization event payloads.
    pub fn snapshot_used(&self) -> Vec<UsageSnapshot> {
        self.entries
            .values()
            .filter(|e| e.usage.is_used())
            .map(|e| UsageSnapshot {
                addr: e.block.addr(),
                size: e.block.size(),
                state: e.block.state(),
                usage: e.usage,
            })
            .collect()
    }

    /// Releases every held block handle. Thread teardown only.
    pub(crate) fn release_all(&mut self) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            release(entry.block);
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
