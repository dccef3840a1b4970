//! Interval lookups over start-address-keyed ordered maps.
//!
//! Both the registry and the thread caches map a block's start address to an
//! entry carrying the block handle. Containment and overlap are checked
//! against the block's live `[addr, addr + size)` range. Start keys stay
//! valid for a block's whole lifetime: an interval only ever shrinks in
//! place, and growth relocates to a fresh identity with a new key.
//!
//! Entries within one map never overlap, so a containment probe has exactly
//! one candidate: the entry with the greatest start at or below the probe.

use std::collections::BTreeMap;

use crate::block::{Addr, BlockRef};

/// Map values that carry the block owning the entry's key.
pub(crate) trait SpanEntry {
    fn block(&self) -> &BlockRef;
}

impl SpanEntry for BlockRef {
    fn block(&self) -> &BlockRef {
        self
    }
}

/// Entry whose block contains `addr`, if any.
pub(crate) fn find_containing<V: SpanEntry>(map: &BTreeMap<Addr, V>, addr: Addr) -> Option<&V> {
    let (_, entry) = map.range(..=addr).next_back()?;
    entry.block().contains(addr).then_some(entry)
}

/// Start key of some entry whose block overlaps `[addr, addr + len)`.
pub(crate) fn find_overlap_key<V: SpanEntry>(
    map: &BTreeMap<Addr, V>,
    addr: Addr,
    len: u64,
) -> Option<Addr> {
    if let Some((key, entry)) = map.range(..=addr).next_back() {
        if entry.block().overlaps(addr, len) {
            return Some(*key);
        }
    }
    // Any entry starting inside the probe range overlaps it (sizes are
    // nonzero), and the branch above already covered keys <= addr.
    map.range(addr..addr.saturating_add(len))
        .next()
        .map(|(key, _)| *key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;

    fn map_of(spans: &[(Addr, u64)]) -> BTreeMap<Addr, BlockRef> {
        spans
            .iter()
            .map(|&(addr, size)| (addr, Block::new(addr, size)))
            .collect()
    }

    #[test]
    fn containment_picks_the_covering_entry() {
        let map = map_of(&[(0x1000, 16), (0x2000, 8)]);
        assert_eq!(find_containing(&map, 0x1007).map(|b| b.addr()), Some(0x1000));
        assert_eq!(find_containing(&map, 0x2000).map(|b| b.addr()), Some(0x2000));
        assert!(find_containing(&map, 0x1010).is_none());
        assert!(find_containing(&map, 0x0fff).is_none());
    }

    #[test]
    fn overlap_finds_predecessor_and_successor_entries() {
        let map = map_of(&[(0x1000, 16), (0x2000, 8)]);
        // Probe straddling the tail of the first block.
        assert_eq!(find_overlap_key(&map, 0x100f, 0x10), Some(0x1000));
        // Probe covering the second block from below.
        assert_eq!(find_overlap_key(&map, 0x1ff0, 0x20), Some(0x2000));
        // Gap between the two.
        assert_eq!(find_overlap_key(&map, 0x1800, 8), None);
    }

    #[test]
    fn shrunk_entry_no_longer_matches_its_old_tail() {
        let map = map_of(&[(0x1000, 16)]);
        map[&0x1000].shrink(4);
        assert!(find_containing(&map, 0x1008).is_none());
        assert_eq!(find_overlap_key(&map, 0x1004, 8), None);
        assert_eq!(find_containing(&map, 0x1003).map(|b| b.addr()), Some(0x1000));
    }
}
