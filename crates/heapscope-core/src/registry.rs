//! Global registry of resident heap blocks.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::block::{release, Addr, BlockRef, BlockState};
use crate::spanmap;

/// The single source of truth for which heap regions currently exist, keyed
/// by non-overlapping address intervals.
///
/// Every mutation happens on the registry first; thread caches mirror it
/// lazily and learn about removals through the block's state tag. The
/// registry holds exactly one handle per resident block.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: BTreeMap<Addr, BlockRef>,
}

impl BlockRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly allocated block.
    ///
    /// Returns the block back if it would overlap a resident one; the caller
    /// logs the collision and discards it.
    pub fn insert(&mut self, block: BlockRef) -> Result<(), BlockRef> {
        if spanmap::find_overlap_key(&self.blocks, block.addr(), block.size()).is_some() {
            return Err(block);
        }
        let prev = self.blocks.insert(block.addr(), block);
        debug_assert!(prev.is_none());
        Ok(())
    }

    /// Removes and returns the block containing `addr`.
    pub fn remove(&mut self, addr: Addr) -> Option<BlockRef> {
        let key = spanmap::find_overlap_key(&self.blocks, addr, 1)?;
        self.blocks.remove(&key)
    }

    /// Block containing `addr`, if resident.
    pub fn find(&self, addr: Addr) -> Option<&BlockRef> {
        let block = spanmap::find_containing(&self.blocks, addr)?;
        debug_assert!(block.is_alive());
        Some(block)
    }

    /// Number of resident blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True if no blocks are resident.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Tears the registry down at process end.
    ///
    /// Every surviving block (a client leak) must be held by the registry
    /// alone; a higher strong count means some thread cache still references
    /// it, which the bookkeeping rules do not allow at this point.
    pub fn destroy(mut self) {
        for (_, block) in std::mem::take(&mut self.blocks) {
            assert_eq!(
                Rc::strong_count(&block),
                1,
                "block {:#x} still cached at teardown",
                block.addr()
            );
            if block.is_alive() {
                block.set_state(BlockState::Freed);
            }
            release(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;

    #[test]
    fn insert_find_remove_roundtrip() {
        let mut reg = BlockRegistry::new();
        reg.insert(Block::new(0x1000, 16)).unwrap();
        reg.insert(Block::new(0x2000, 8)).unwrap();
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.find(0x1008).map(|b| b.addr()), Some(0x1000));
        assert!(reg.find(0x1800).is_none());

        let removed = reg.remove(0x2003).expect("interior address removes the block");
        assert_eq!(removed.addr(), 0x2000);
        assert!(reg.remove(0x2000).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut reg = BlockRegistry::new();
        reg.insert(Block::new(0x1000, 16)).unwrap();
        let rejected = reg
            .insert(Block::new(0x1008, 16))
            .expect_err("overlap must be rejected");
        assert_eq!(rejected.addr(), 0x1008);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn adjacent_blocks_do_not_overlap() {
        let mut reg = BlockRegistry::new();
        reg.insert(Block::new(0x1000, 16)).unwrap();
        reg.insert(Block::new(0x1010, 16)).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn destroy_accepts_leaked_blocks_held_only_by_the_registry() {
        let mut reg = BlockRegistry::new();
        reg.insert(Block::new(0x1000, 16)).unwrap();
        reg.destroy();
    }

    #[test]
    #[should_panic(expected = "still cached at teardown")]
    fn destroy_panics_on_leaked_cache_reference() {
        let mut reg = BlockRegistry::new();
        reg.insert(Block::new(0x1000, 16)).unwrap();
        let _stray = reg.find(0x1000).cloned();
        reg.destroy();
    }
}
