//! Block abstractions for the paged KV cache.
//!
//! The cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. Blocks are the unit of
//! allocation, sharing, eviction, and tier placement.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Index into the [`BlockPool`](super::block_pool::BlockPool) arena.
///
/// Requests hold plain indices, never pointers, so no ownership cycle
/// exists between a request and its blocks.
pub type BlockId = usize;

/// Default block size (tokens per block).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// Used for prefix sharing. The hash includes the parent block's hash to
/// create a chain, so blocks at the same position with different prefixes
/// hash differently: two requests may share a block if and only if their
/// token sequences are identical up to that block's end.
///
/// # Example
///
/// ```
/// use spindle::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();

    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }

    for &token in token_ids {
        token.hash(&mut hasher);
    }

    hasher.finish()
}

/// Memory tier a block currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockTier {
    /// Device memory, directly usable by the model executor.
    #[default]
    Fast,
    /// Host memory; must be promoted before its owner can use it again.
    Slow,
}

/// Metadata for one fixed-size chunk of KV cache memory.
///
/// Blocks live in the pool's contiguous arena for their whole lifetime;
/// only their metadata changes. A block's content hash, once set, never
/// changes until the block is recycled through the free list.
#[derive(Debug, Clone)]
pub struct KVCacheBlock {
    /// Index of this block in the pool arena.
    block_id: BlockId,
    /// Reference count: number of requests currently pointing at it.
    ref_count: usize,
    /// Chained hash of the token sequence that filled it; None until full.
    content_hash: Option<u64>,
    /// Logical last-access stamp for LRU ordering.
    last_access: u64,
    /// Current memory tier.
    tier: BlockTier,
    /// Whether the block is on the free list.
    is_free: bool,
}

impl KVCacheBlock {
    pub(crate) fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            ref_count: 0,
            content_hash: None,
            last_access: 0,
            tier: BlockTier::Fast,
            is_free: true,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn content_hash(&self) -> Option<u64> {
        self.content_hash
    }

    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub fn tier(&self) -> BlockTier {
        self.tier
    }

    pub fn is_free(&self) -> bool {
        self.is_free
    }

    pub(crate) fn set_content_hash(&mut self, hash: u64) {
        debug_assert!(
            self.content_hash.is_none(),
            "content hash of block {} set twice",
            self.block_id
        );
        self.content_hash = Some(hash);
    }

    pub(crate) fn set_tier(&mut self, tier: BlockTier) {
        self.tier = tier;
    }

    pub(crate) fn set_last_access(&mut self, stamp: u64) {
        self.last_access = stamp;
    }

    /// Reset metadata when the block is handed out from the free list.
    pub(crate) fn reset_for_allocation(&mut self, stamp: u64) {
        self.ref_count = 1;
        self.content_hash = None;
        self.last_access = stamp;
        self.tier = BlockTier::Fast;
        self.is_free = false;
    }

    pub(crate) fn mark_free(&mut self) {
        self.is_free = true;
        self.content_hash = None;
        self.ref_count = 0;
    }

    pub(crate) fn increment_ref(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    /// Decrement the reference count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RefcountUnderflow`] when the count is already zero.
    pub(crate) fn decrement_ref(&mut self) -> Result<usize> {
        if self.ref_count == 0 {
            debug_assert!(false, "refcount underflow on block {}", self.block_id);
            return Err(Error::RefcountUnderflow(self.block_id));
        }
        self.ref_count -= 1;
        Ok(self.ref_count)
    }
}

/// Maps a request's logical positions to physical block ids.
///
/// The table is an ordered sequence of block ids covering the request's
/// context, of which a strict suffix may be *tentative*: allocated for
/// not-yet-verified speculative tokens and trimmed to the accepted length
/// after each verification.
///
/// Token at position `p` lives in logical block `p / block_size`, slot
/// `p % block_size`, physical block `block_ids[p / block_size]`.
///
/// # Example
///
/// ```
/// use spindle::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_committed(5);   // tokens 0-15
/// table.append_committed(12);  // tokens 16-31
/// assert_eq!(table.get_block_id(1).unwrap(), 12);
/// ```
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    /// Physical block ids in logical order.
    block_ids: Vec<BlockId>,
    /// Number of trailing entries that are tentative.
    num_tentative: usize,
    /// Tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            num_tentative: 0,
            block_size,
        }
    }

    /// Create a new block table with default block size.
    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block id for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the logical index is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<BlockId> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or_else(|| {
                Error::Config(format!(
                    "logical block {logical_block_idx} out of bounds ({} allocated)",
                    self.block_ids.len()
                ))
            })
    }

    /// Append a committed block at the end of the table.
    ///
    /// Committed blocks must never land after tentative ones; callers
    /// commit or discard the tentative suffix first.
    pub fn append_committed(&mut self, block_id: BlockId) {
        debug_assert_eq!(self.num_tentative, 0);
        self.block_ids.push(block_id);
    }

    /// Append a tentative block at the end of the table.
    pub fn append_tentative(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
        self.num_tentative += 1;
    }

    /// Total number of blocks, committed and tentative.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Number of committed blocks.
    pub fn num_committed(&self) -> usize {
        self.block_ids.len() - self.num_tentative
    }

    /// Number of tentative suffix blocks.
    pub fn num_tentative(&self) -> usize {
        self.num_tentative
    }

    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// All physical block ids in logical order.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// The committed prefix of the table.
    pub fn committed_ids(&self) -> &[BlockId] {
        &self.block_ids[..self.num_committed()]
    }

    /// The tentative suffix of the table.
    pub fn tentative_ids(&self) -> &[BlockId] {
        &self.block_ids[self.num_committed()..]
    }

    /// Number of token positions the table can hold.
    pub fn capacity_tokens(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    /// Keep the first `keep` tentative blocks, converting them to
    /// committed, and remove the rest. Returns the removed block ids in
    /// logical order.
    pub fn resolve_tentative(&mut self, keep: usize) -> Vec<BlockId> {
        let keep = keep.min(self.num_tentative);
        let first_removed = self.num_committed() + keep;
        let removed = self.block_ids.split_off(first_removed);
        self.num_tentative = 0;
        removed
    }

    /// Remove and return every block id, clearing the table.
    pub fn take_all(&mut self) -> Vec<BlockId> {
        self.num_tentative = 0;
        std::mem::take(&mut self.block_ids)
    }

    /// Get physical slot indices for token positions `0..seq_len`.
    ///
    /// Global slot = `block_id * block_size + slot_within_block`. Used by
    /// the model executor to address the cache.
    pub fn slot_mapping(&self, seq_len: usize) -> Vec<usize> {
        let mut slots = Vec::with_capacity(seq_len);

        for pos in 0..seq_len {
            let logical_block = pos / self.block_size;
            let slot_in_block = pos % self.block_size;

            if let Some(&physical_block) = self.block_ids.get(logical_block) {
                slots.push(physical_block * self.block_size + slot_in_block);
            }
        }

        slots
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// # Example
///
/// ```
/// use spindle::core::block::blocks_needed;
///
/// assert_eq!(blocks_needed(35, 16), 3);
/// assert_eq!(blocks_needed(32, 16), 2);
/// assert_eq!(blocks_needed(0, 16), 0);
/// ```
pub fn blocks_needed(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}
