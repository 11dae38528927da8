//! Fixed-size block arena.
//!
//! The pool preallocates every block's metadata up front and never grows
//! during steady-state operation. Allocation is O(1) off a free list;
//! freeing a block whose refcount is nonzero is a fatal invariant
//! violation, not a recoverable error.
//!
//! ## Example
//!
//! ```
//! use spindle::core::block_pool::BlockPool;
//!
//! let mut pool = BlockPool::new(1024);
//! let block_id = pool.allocate().unwrap();
//! pool.dec_ref(block_id).unwrap();
//! pool.free(block_id).unwrap();
//! ```

use std::collections::VecDeque;

use tracing::error;

use crate::core::block::{BlockId, BlockTier, KVCacheBlock};
use crate::error::{Error, Result};

/// Arena of KV cache blocks plus the free list over them.
///
/// The pool owns physical slot identity and is the single source of truth
/// for per-block metadata (refcount, content hash, access stamp, tier).
#[derive(Debug)]
pub struct BlockPool {
    /// All blocks, indexed by block id. Contiguous for the pool's lifetime.
    blocks: Vec<KVCacheBlock>,
    /// Free block ids (LIFO for locality).
    free_list: VecDeque<BlockId>,
    /// Logical clock stamped onto blocks on allocation and touch.
    access_clock: u64,
}

impl BlockPool {
    /// Create a pool with `num_blocks` blocks, all free.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: (0..num_blocks).map(KVCacheBlock::new).collect(),
            free_list: (0..num_blocks).collect(),
            access_clock: 0,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }

    pub fn has_free_blocks(&self) -> bool {
        !self.free_list.is_empty()
    }

    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Allocate a single block with refcount 1.
    ///
    /// Fails without blocking when the free list is empty; the caller is
    /// expected to trigger eviction or preemption and retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if no free blocks are available.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let block_id = self.free_list.pop_front().ok_or(Error::OutOfBlocks)?;
        self.access_clock += 1;
        self.blocks[block_id].reset_for_allocation(self.access_clock);
        Ok(block_id)
    }

    /// Return a block to the free list.
    ///
    /// The block's refcount must already be zero. Freeing a referenced or
    /// already-free block is a programming error: it panics in debug
    /// builds and is logged and ignored in release builds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DoubleFree`] on the release-build tolerated path.
    pub fn free(&mut self, block_id: BlockId) -> Result<()> {
        let block = &mut self.blocks[block_id];
        if block.is_free() || block.ref_count() != 0 {
            debug_assert!(
                false,
                "double free of block {block_id} (free={}, refs={})",
                block.is_free(),
                block.ref_count()
            );
            error!(block_id, "double free ignored");
            return Err(Error::DoubleFree(block_id));
        }
        block.mark_free();
        self.free_list.push_front(block_id);
        Ok(())
    }

    /// Update a block's last-access stamp for LRU bookkeeping.
    pub fn touch(&mut self, block_id: BlockId) {
        self.access_clock += 1;
        let stamp = self.access_clock;
        self.blocks[block_id].set_last_access(stamp);
    }

    /// Increment a block's refcount (prefix sharing).
    pub fn inc_ref(&mut self, block_id: BlockId) -> usize {
        self.blocks[block_id].increment_ref()
    }

    /// Decrement a block's refcount, returning the new count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefcountUnderflow`] if the count was already zero
    /// (release builds only; debug builds assert).
    pub fn dec_ref(&mut self, block_id: BlockId) -> Result<usize> {
        self.blocks[block_id].decrement_ref()
    }

    pub fn get(&self, block_id: BlockId) -> &KVCacheBlock {
        &self.blocks[block_id]
    }

    pub(crate) fn get_mut(&mut self, block_id: BlockId) -> &mut KVCacheBlock {
        &mut self.blocks[block_id]
    }

    /// Record a block's finalized content hash.
    pub fn set_content_hash(&mut self, block_id: BlockId, hash: u64) {
        self.blocks[block_id].set_content_hash(hash);
    }

    /// Move a block between tiers.
    pub fn set_tier(&mut self, block_id: BlockId, tier: BlockTier) {
        self.blocks[block_id].set_tier(tier);
    }

    /// Reset the pool to its initial state.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.mark_free();
        }
        self.free_list.clear();
        self.free_list.extend(0..self.blocks.len());
        self.access_clock = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = BlockPool::new(100);
        assert_eq!(pool.num_blocks(), 100);
        assert_eq!(pool.num_free_blocks(), 100);
        assert_eq!(pool.num_used_blocks(), 0);
    }

    #[test]
    fn test_allocate_and_free() {
        let mut pool = BlockPool::new(10);

        let block_id = pool.allocate().unwrap();
        assert_eq!(pool.num_free_blocks(), 9);
        assert_eq!(pool.get(block_id).ref_count(), 1);
        assert!(!pool.get(block_id).is_free());

        pool.dec_ref(block_id).unwrap();
        pool.free(block_id).unwrap();
        assert_eq!(pool.num_free_blocks(), 10);
        assert!(pool.get(block_id).is_free());
    }

    #[test]
    fn test_out_of_blocks() {
        let mut pool = BlockPool::new(2);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(Error::OutOfBlocks)));
    }

    #[test]
    fn test_touch_updates_stamp() {
        let mut pool = BlockPool::new(4);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.get(b).last_access() > pool.get(a).last_access());

        pool.touch(a);
        assert!(pool.get(a).last_access() > pool.get(b).last_access());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_free_tolerated_in_release() {
        let mut pool = BlockPool::new(2);
        let id = pool.allocate().unwrap();
        pool.dec_ref(id).unwrap();
        pool.free(id).unwrap();
        assert!(matches!(pool.free(id), Err(Error::DoubleFree(_))));
        // The free list must not contain the block twice.
        assert_eq!(pool.num_free_blocks(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics_in_debug() {
        let mut pool = BlockPool::new(2);
        let id = pool.allocate().unwrap();
        pool.dec_ref(id).unwrap();
        pool.free(id).unwrap();
        let _ = pool.free(id);
    }

    #[test]
    fn test_reset() {
        let mut pool = BlockPool::new(5);
        pool.allocate().unwrap();
        pool.allocate().unwrap();

        pool.reset();
        assert_eq!(pool.num_free_blocks(), 5);
        assert_eq!(pool.num_used_blocks(), 0);
    }
}
