//! Paged KV cache manager.
//!
//! Translates logical per-request cache needs into physical block
//! assignments on top of the [`BlockPool`]:
//!
//! - **Prefix sharing**: fully-aligned blocks are identified by a chained
//!   content hash; requests with byte-identical prefixes resolve to the
//!   same physical block with a bumped refcount.
//! - **Lazy eviction**: released blocks that still hold reusable content
//!   stay in the hash index at refcount zero; the pool reclaims them only
//!   when allocation pressure demands it, ordered by the configured
//!   eviction policy (LRU or ARC).
//! - **Tentative suffixes**: blocks allocated for unverified speculative
//!   tokens form a strict suffix of a request's table and are trimmed to
//!   the accepted length after each verification.
//! - **Tiered placement**: under the `Tiered` strategy, preemption demotes
//!   full blocks through the [`PrefetchCoordinator`] instead of dropping
//!   them; resuming promotes them back before reuse.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{AllocationStrategy, CacheConfig, EvictionPolicy};
use crate::core::block::{blocks_needed, hash_token_block, BlockId, BlockTier};
use crate::core::block_pool::BlockPool;
use crate::core::request::Request;
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;

/// Coupling point with the asynchronous slow-tier copy engine.
///
/// `begin_demote` starts writing a block's contents back to the slow tier;
/// `await_promote` blocks until those contents are readable again. The
/// actual byte movement is outside the core.
pub trait PrefetchCoordinator: Send {
    /// Start writing the block's contents to the slow tier.
    fn begin_demote(&mut self, block_id: BlockId);

    /// Wait until a previously demoted block's contents are available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PromotionTimeout`] when the deadline elapses first.
    fn await_promote(&mut self, block_id: BlockId, deadline: Duration) -> Result<()>;
}

/// Coordinator whose copies complete instantly. Used when no real copy
/// engine is attached (tests, demo binary, fast-only deployments).
#[derive(Debug, Default)]
pub struct ImmediateCoordinator {
    demoted: HashSet<BlockId>,
}

impl PrefetchCoordinator for ImmediateCoordinator {
    fn begin_demote(&mut self, block_id: BlockId) {
        self.demoted.insert(block_id);
    }

    fn await_promote(&mut self, block_id: BlockId, _deadline: Duration) -> Result<()> {
        if self.demoted.remove(&block_id) {
            Ok(())
        } else {
            Err(Error::PromotionTimeout(block_id))
        }
    }
}

/// Adaptive replacement state: evictable blocks split into a recency list
/// (cached once) and a frequency list (reused), with ghost lists of
/// recently evicted hashes steering the target split.
#[derive(Debug, Default)]
struct ArcState {
    recency: VecDeque<BlockId>,
    frequency: VecDeque<BlockId>,
    ghost_recency: VecDeque<u64>,
    ghost_frequency: VecDeque<u64>,
    target_recency: usize,
    max_ghost: usize,
}

impl ArcState {
    fn new(max_ghost: usize) -> Self {
        Self {
            max_ghost,
            ..Default::default()
        }
    }

    fn on_evictable(&mut self, block_id: BlockId, hot: bool) {
        if hot {
            self.frequency.push_back(block_id);
        } else {
            self.recency.push_back(block_id);
        }
    }

    /// Feedback on a miss for `hash`: a ghost hit means the corresponding
    /// list was too small.
    fn on_miss(&mut self, hash: u64) {
        if let Some(pos) = self.ghost_recency.iter().position(|&h| h == hash) {
            self.ghost_recency.remove(pos);
            self.target_recency += 1;
        } else if let Some(pos) = self.ghost_frequency.iter().position(|&h| h == hash) {
            self.ghost_frequency.remove(pos);
            self.target_recency = self.target_recency.saturating_sub(1);
        }
    }

    /// Purge a block's list entries (revived or evicted out of band).
    fn remove(&mut self, block_id: BlockId) {
        self.recency.retain(|&id| id != block_id);
        self.frequency.retain(|&id| id != block_id);
    }

    fn on_evicted(&mut self, hash: u64, from_recency: bool) {
        let ghost = if from_recency {
            &mut self.ghost_recency
        } else {
            &mut self.ghost_frequency
        };
        ghost.push_back(hash);
        if ghost.len() > self.max_ghost {
            ghost.pop_front();
        }
    }

    /// Pop the next victim, skipping entries that are no longer evictable.
    fn pick_victim(&mut self, evictable: &HashSet<BlockId>) -> Option<(BlockId, bool)> {
        let prefer_recency = self.recency.len() > self.target_recency || self.frequency.is_empty();
        let order: [bool; 2] = if prefer_recency {
            [true, false]
        } else {
            [false, true]
        };
        for from_recency in order {
            let list = if from_recency {
                &mut self.recency
            } else {
                &mut self.frequency
            };
            while let Some(id) = list.pop_front() {
                if evictable.contains(&id) {
                    return Some((id, from_recency));
                }
            }
        }
        None
    }
}

/// Maps logical (request, position-range) state to physical blocks.
///
/// Exclusively owns block reference counts and eviction; request block
/// tables are mutated only through manager calls.
pub struct KVCacheManager {
    pool: BlockPool,
    block_size: usize,
    enable_prefix_caching: bool,
    policy: EvictionPolicy,
    strategy: AllocationStrategy,
    /// Content hash -> fast-resident block holding that content.
    prefix_index: HashMap<u64, BlockId>,
    /// Refcount-zero blocks whose content is still reusable.
    evictable: HashSet<BlockId>,
    /// Hashes that scored at least one sharing hit (ARC frequency signal).
    hot_hashes: HashSet<u64>,
    arc: ArcState,
    coordinator: Box<dyn PrefetchCoordinator>,
    metrics: Arc<CoreMetrics>,
}

impl KVCacheManager {
    /// Create a manager with the default (instant) prefetch coordinator.
    pub fn new(config: &CacheConfig, metrics: Arc<CoreMetrics>) -> Self {
        Self::with_coordinator(config, metrics, Box::new(ImmediateCoordinator::default()))
    }

    /// Create a manager wired to a real slow-tier copy engine.
    pub fn with_coordinator(
        config: &CacheConfig,
        metrics: Arc<CoreMetrics>,
        coordinator: Box<dyn PrefetchCoordinator>,
    ) -> Self {
        Self {
            pool: BlockPool::new(config.num_blocks),
            block_size: config.block_size,
            enable_prefix_caching: config.enable_prefix_caching,
            policy: config.eviction_policy,
            strategy: config.allocation_strategy,
            prefix_index: HashMap::new(),
            evictable: HashSet::new(),
            hot_hashes: HashSet::new(),
            arc: ArcState::new(config.num_blocks),
            coordinator,
            metrics,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.pool.num_blocks()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free_blocks()
    }

    /// Blocks obtainable without preemption: free plus evictable.
    pub fn num_available_blocks(&self) -> usize {
        self.pool.num_free_blocks() + self.evictable.len()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.pool.num_used_blocks()
    }

    /// Pool-level metadata for a block (tests and diagnostics).
    pub fn block(&self, block_id: BlockId) -> &crate::core::block::KVCacheBlock {
        self.pool.get(block_id)
    }

    // ========== Allocation ==========

    /// Allocate blocks so the request can hold `num_new_tokens` more
    /// committed tokens, sharing fully-aligned prefix blocks where the
    /// content-hash index allows.
    ///
    /// Returns the block ids newly appended to the request's table (shared
    /// or fresh), in logical order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`] when the pool is out of blocks
    /// even after eviction; the scheduler preempts or defers in response.
    pub fn allocate_for(&mut self, req: &mut Request, num_new_tokens: usize) -> Result<Vec<BlockId>> {
        debug_assert_eq!(
            req.block_table().num_tentative(),
            0,
            "allocate_for with tentative blocks outstanding"
        );

        let target_tokens = req.num_cached_tokens() + num_new_tokens;
        let have = req.block_table().num_blocks();
        let need = blocks_needed(target_tokens, self.block_size).saturating_sub(have);
        if need == 0 {
            return Ok(Vec::new());
        }

        let known_tokens = req.all_token_ids();
        let mut appended = Vec::with_capacity(need);
        let mut hits = 0u64;
        let mut misses = 0u64;

        for i in 0..need {
            let logical_idx = have + i;
            // A block is shareable only if it is completely filled by known
            // tokens and the hash chain from block 0 is unbroken. The final
            // known token is never covered by a shared block so that at
            // least one position remains for the executor to score.
            let block_tokens = self.shareable_block_tokens(&known_tokens, logical_idx);
            let parent_hash = if logical_idx == 0 {
                None
            } else {
                let prev = req.block_table().block_ids()[logical_idx - 1];
                self.pool.get(prev).content_hash()
            };

            let hash = match (self.enable_prefix_caching, block_tokens) {
                (true, Some(tokens)) if logical_idx == 0 || parent_hash.is_some() => {
                    Some(hash_token_block(tokens, parent_hash))
                }
                _ => None,
            };

            if let Some(hash) = hash {
                if let Some(shared) = self.lookup_shared(hash) {
                    hits += 1;
                    // A hit extending the committed watermark contiguously
                    // lets the request skip recomputing those positions.
                    if req.num_cached_tokens() == logical_idx * self.block_size {
                        req.advance_cached(self.block_size);
                    }
                    req.block_table_mut().append_committed(shared);
                    appended.push(shared);
                    continue;
                }
                misses += 1;
                self.arc.on_miss(hash);
            }

            let block_id = self.allocate_block().map_err(|e| match e {
                Error::OutOfBlocks => Error::CacheExhausted(req.request_id()),
                other => other,
            })?;
            if let Some(hash) = hash {
                self.pool.set_content_hash(block_id, hash);
                self.prefix_index.insert(hash, block_id);
            }
            req.block_table_mut().append_committed(block_id);
            appended.push(block_id);
        }

        if hits + misses > 0 {
            self.metrics.record_cache_query(hits, misses);
        }
        Ok(appended)
    }

    /// Allocate tentative-suffix blocks for up to `num_draft_tokens`
    /// unverified speculative tokens beyond the pending decode input.
    ///
    /// Allocation is best-effort: when the pool runs dry mid-way the draft
    /// is granted only as many tokens as the table can now hold. Returns
    /// the granted draft length (possibly less than requested, never an
    /// error for exhaustion alone).
    pub fn allocate_tentative(&mut self, req: &mut Request, num_draft_tokens: usize) -> usize {
        // The pending decode input occupies one committed slot beyond the
        // watermark; drafts stack after it.
        let base_tokens = req.num_cached_tokens() + 1;
        let target_tokens = base_tokens + num_draft_tokens;
        let have = req.block_table().num_blocks();
        let need = blocks_needed(target_tokens, self.block_size).saturating_sub(have);

        for _ in 0..need {
            match self.allocate_block() {
                Ok(block_id) => req.block_table_mut().append_tentative(block_id),
                Err(_) => break,
            }
        }

        let capacity = req.block_table().capacity_tokens();
        num_draft_tokens.min(capacity.saturating_sub(base_tokens))
    }

    /// Commit a verification result: advance the cache watermark by the
    /// accepted length, keep tentative blocks covering it, free the rest,
    /// and finalize content hashes of newly full committed blocks.
    ///
    /// The caller accounts for the pending decode input (whose KV is
    /// valid regardless of the verification outcome) before calling this.
    pub fn commit_tentative(&mut self, req: &mut Request, accepted_len: usize) -> Result<()> {
        req.advance_cached(accepted_len);
        let required = blocks_needed(req.num_cached_tokens(), self.block_size);
        let committed = req.block_table().num_committed();
        let keep = required.saturating_sub(committed);
        if keep > req.block_table().num_tentative() {
            debug_assert!(
                false,
                "tentative suffix too short for request {}",
                req.request_id()
            );
            return Err(Error::TentativeNotSuffix(req.request_id()));
        }

        let removed = req.block_table_mut().resolve_tentative(keep);
        for block_id in removed {
            self.drop_reference(block_id)?;
        }
        self.finalize_full_blocks(req);
        Ok(())
    }

    /// Release every block owned by a finished or cancelled request.
    ///
    /// Blocks reaching refcount zero become eviction candidates if their
    /// content is reusable; partial blocks return to the pool immediately.
    pub fn release(&mut self, req: &mut Request) -> Result<()> {
        let ids = req.block_table_mut().take_all();
        for block_id in ids {
            self.pool.touch(block_id);
            self.drop_reference(block_id)?;
        }
        req.set_cached(0);
        req.swap_manifest_mut().clear();
        Ok(())
    }

    // ========== Preemption / tiering ==========

    /// Revoke a running request's cache residency without discarding its
    /// token history.
    ///
    /// Under `Tiered`, exclusively-owned full blocks are demoted through
    /// the coordinator and recorded in the request's swap manifest so
    /// [`swap_in`](Self::swap_in) can promote them back. Shared and
    /// partial blocks are released; shared content usually survives in the
    /// prefix index and re-attaches on resume.
    pub fn swap_out(&mut self, req: &mut Request) -> Result<()> {
        // Tentative blocks are never worth preserving.
        let tentative = req.block_table_mut().resolve_tentative(0);
        for block_id in tentative {
            self.drop_reference(block_id)?;
        }

        let ids = req.block_table_mut().take_all();
        let mut demoted = 0u64;
        for block_id in ids {
            let block = self.pool.get(block_id);
            let demote = self.strategy == AllocationStrategy::Tiered
                && block.ref_count() == 1
                && block.content_hash().is_some();
            if demote {
                let hash = block.content_hash().expect("checked above");
                self.coordinator.begin_demote(block_id);
                self.pool.set_tier(block_id, BlockTier::Slow);
                req.swap_manifest_mut().push((hash, block_id));
                // The fast slot is reclaimed; the coordinator owns the
                // slow-tier copy under the original id as its ticket.
                self.remove_from_index(block_id, hash);
                self.pool.dec_ref(block_id)?;
                self.pool.free(block_id)?;
                demoted += 1;
            } else {
                self.drop_reference(block_id)?;
            }
        }
        if demoted > 0 {
            self.metrics.record_demotion(demoted);
        }
        req.set_cached(0);
        debug!(
            request_id = req.request_id(),
            demoted, "swapped out request"
        );
        Ok(())
    }

    /// Restore cache residency for a preempted request.
    ///
    /// Walks the request's full-block prefix chain, re-attaching blocks
    /// still in the prefix index and promoting demoted ones from the slow
    /// tier. Tokens past the restored prefix re-prefill normally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`] when fast blocks cannot be
    /// allocated for promotion; already-restored blocks stay attached (the
    /// request keeps partial residency and re-prefills the remainder).
    pub fn swap_in(&mut self, req: &mut Request, deadline: Duration) -> Result<()> {
        debug_assert!(req.block_table().is_empty());
        let known_tokens = req.all_token_ids();
        let manifest: HashMap<u64, BlockId> = req.swap_manifest().iter().copied().collect();
        let mut parent_hash = None;
        let mut restored_tokens = 0usize;
        let mut promoted = 0u64;

        for logical_idx in 0.. {
            let Some(tokens) = self.shareable_block_tokens(&known_tokens, logical_idx) else {
                break;
            };
            let hash = hash_token_block(tokens, parent_hash);

            if let Some(shared) = self.lookup_shared(hash) {
                req.block_table_mut().append_committed(shared);
            } else if let Some(&ticket) = manifest.get(&hash) {
                let block_id = match self.allocate_block() {
                    Ok(id) => id,
                    Err(Error::OutOfBlocks) => {
                        req.set_cached(restored_tokens);
                        return Err(Error::CacheExhausted(req.request_id()));
                    }
                    Err(other) => return Err(other),
                };
                self.coordinator.await_promote(ticket, deadline)?;
                self.pool.set_content_hash(block_id, hash);
                self.prefix_index.insert(hash, block_id);
                req.block_table_mut().append_committed(block_id);
                promoted += 1;
            } else {
                break;
            }

            parent_hash = Some(hash);
            restored_tokens += self.block_size;
        }

        if promoted > 0 {
            self.metrics.record_promotion(promoted);
        }
        req.set_cached(restored_tokens);
        req.swap_manifest_mut().clear();
        debug!(
            request_id = req.request_id(),
            restored_tokens, "swapped in request"
        );
        Ok(())
    }

    // ========== Internals ==========

    /// Tokens of logical block `idx` when the block is fully covered by
    /// known tokens, leaving the final known token uncovered so the
    /// executor always has at least one position to score.
    fn shareable_block_tokens<'t>(&self, known: &'t [u32], idx: usize) -> Option<&'t [u32]> {
        let start = idx * self.block_size;
        let end = start + self.block_size;
        (end < known.len()).then(|| &known[start..end])
    }

    /// Look up a shareable block by hash, bumping its refcount on a hit.
    fn lookup_shared(&mut self, hash: u64) -> Option<BlockId> {
        let &block_id = self.prefix_index.get(&hash)?;
        if self.evictable.remove(&block_id) {
            // Reviving a lazily-retained block: refcount 0 -> 1.
            debug_assert_eq!(self.pool.get(block_id).ref_count(), 0);
            self.arc.remove(block_id);
        }
        self.pool.inc_ref(block_id);
        self.pool.touch(block_id);
        self.hot_hashes.insert(hash);
        Some(block_id)
    }

    /// Allocate from the pool, falling back to eviction.
    fn allocate_block(&mut self) -> Result<BlockId> {
        match self.pool.allocate() {
            Ok(id) => {
                self.metrics.record_allocation(1);
                Ok(id)
            }
            Err(Error::OutOfBlocks) => {
                if !self.evict_one() {
                    return Err(Error::OutOfBlocks);
                }
                let id = self.pool.allocate()?;
                self.metrics.record_allocation(1);
                Ok(id)
            }
            Err(other) => Err(other),
        }
    }

    /// Evict one refcount-zero block by policy, returning false when no
    /// candidate exists (all memory pinned by active requests).
    fn evict_one(&mut self) -> bool {
        let victim = match self.policy {
            EvictionPolicy::Lru => self
                .evictable
                .iter()
                .copied()
                .min_by_key(|&id| self.pool.get(id).last_access())
                .map(|id| {
                    let hot = self
                        .pool
                        .get(id)
                        .content_hash()
                        .is_some_and(|h| self.hot_hashes.contains(&h));
                    (id, !hot)
                }),
            EvictionPolicy::Arc => self.arc.pick_victim(&self.evictable),
        };

        let Some((block_id, from_recency)) = victim else {
            return false;
        };
        self.evictable.remove(&block_id);
        self.arc.remove(block_id);
        if let Some(hash) = self.pool.get(block_id).content_hash() {
            self.remove_from_index(block_id, hash);
            self.arc.on_evicted(hash, from_recency);
            self.hot_hashes.remove(&hash);
        }
        if self.pool.free(block_id).is_ok() {
            self.metrics.record_eviction(1);
            self.metrics.record_free(1);
            debug!(block_id, "evicted block");
            true
        } else {
            warn!(block_id, "eviction victim was not freeable");
            false
        }
    }

    /// Drop one reference; at zero the block either joins the evictable
    /// set (reusable content) or returns to the pool.
    fn drop_reference(&mut self, block_id: BlockId) -> Result<()> {
        let remaining = self.pool.dec_ref(block_id)?;
        if remaining > 0 {
            return Ok(());
        }
        let hash = self.pool.get(block_id).content_hash();
        match hash {
            Some(h) if self.enable_prefix_caching && self.prefix_index.get(&h) == Some(&block_id) => {
                let hot = self.hot_hashes.contains(&h);
                self.evictable.insert(block_id);
                self.arc.on_evictable(block_id, hot);
            }
            _ => {
                if let Some(h) = hash {
                    self.remove_from_index(block_id, h);
                }
                self.pool.free(block_id)?;
                self.metrics.record_free(1);
            }
        }
        Ok(())
    }

    fn remove_from_index(&mut self, block_id: BlockId, hash: u64) {
        if self.prefix_index.get(&hash) == Some(&block_id) {
            self.prefix_index.remove(&hash);
        }
    }

    /// Set and register content hashes for committed blocks that became
    /// full, chaining from the previous block's hash. Called after every
    /// commit that advances the cache watermark.
    pub(crate) fn finalize_full_blocks(&mut self, req: &mut Request) {
        if !self.enable_prefix_caching {
            return;
        }
        let known_tokens = req.all_token_ids();
        let cached = req.num_cached_tokens();
        let committed_ids: Vec<BlockId> = req.block_table().committed_ids().to_vec();

        let mut parent_hash = None;
        for (idx, &block_id) in committed_ids.iter().enumerate() {
            if let Some(existing) = self.pool.get(block_id).content_hash() {
                parent_hash = Some(existing);
                continue;
            }
            let end = (idx + 1) * self.block_size;
            // Only hash blocks whose every slot holds committed KV state,
            // and keep the last known token unshared.
            if end > cached || end >= known_tokens.len() {
                break;
            }
            if idx > 0 && parent_hash.is_none() {
                break;
            }
            let hash = hash_token_block(&known_tokens[idx * self.block_size..end], parent_hash);
            self.pool.set_content_hash(block_id, hash);
            self.prefix_index.entry(hash).or_insert(block_id);
            parent_hash = Some(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingConfig;

    fn manager(num_blocks: usize, block_size: usize) -> KVCacheManager {
        let config = CacheConfig::new(num_blocks, block_size);
        KVCacheManager::new(&config, Arc::new(CoreMetrics::new()))
    }

    fn request(id: u64, prompt: Vec<u32>) -> Request {
        Request::new(id, prompt, SamplingConfig::default())
    }

    #[test]
    fn test_allocate_for_prompt() {
        let mut kv = manager(8, 16);
        let mut req = request(1, (0..20).collect());

        let blocks = kv.allocate_for(&mut req, 20).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(kv.num_used_blocks(), 2);
        req.advance_cached(20);
        assert_eq!(req.num_cached_tokens(), 20);
    }

    #[test]
    fn test_tentative_grant_capped_by_pool() {
        let mut kv = manager(2, 4);
        let mut req = request(1, vec![1, 2, 3]);

        kv.allocate_for(&mut req, 3).unwrap();
        req.advance_cached(3);
        req.append_token(9);

        // One block left; slot 3 holds the pending input, so a fresh
        // tentative block yields 4 more draft slots.
        let granted = kv.allocate_tentative(&mut req, 6);
        assert_eq!(granted, 4);
        assert_eq!(req.block_table().num_tentative(), 1);
    }

    #[test]
    fn test_commit_tentative_zero_discards_suffix() {
        let mut kv = manager(8, 4);
        let mut req = request(1, vec![1, 2, 3]);

        kv.allocate_for(&mut req, 3).unwrap();
        req.advance_cached(3);
        req.append_token(9);
        kv.allocate_for(&mut req, 1).unwrap();

        let committed_before: Vec<_> = req.block_table().committed_ids().to_vec();
        let used_before = kv.num_used_blocks();

        let granted = kv.allocate_tentative(&mut req, 8);
        assert!(granted > 0);
        assert!(req.block_table().num_tentative() > 0);

        // Pending input token gets cached regardless of the draft outcome.
        req.advance_cached(1);
        kv.commit_tentative(&mut req, 0).unwrap();

        assert_eq!(req.block_table().num_tentative(), 0);
        assert_eq!(req.block_table().committed_ids(), &committed_before[..]);
        assert_eq!(kv.num_used_blocks(), used_before);
    }

    #[test]
    fn test_release_keeps_hashed_blocks_reusable() {
        let mut kv = manager(4, 4);
        let mut req = request(1, (0..9).collect());

        kv.allocate_for(&mut req, 9).unwrap();
        req.advance_cached(9);
        assert_eq!(kv.num_used_blocks(), 3);

        kv.release(&mut req).unwrap();
        // Two full hashed blocks stay evictable; the partial tail is freed.
        assert_eq!(kv.num_available_blocks(), 4);
        assert_eq!(kv.num_free_blocks(), 2);
    }

    #[test]
    fn test_eviction_reclaims_lazy_blocks() {
        let mut kv = manager(2, 4);
        let mut a = request(1, (0..5).collect());
        kv.allocate_for(&mut a, 5).unwrap();
        a.advance_cached(5);
        kv.release(&mut a).unwrap();
        assert_eq!(kv.num_free_blocks(), 1);

        // Unrelated content must evict the retained block to fit.
        let mut b = request(2, (100..108).collect());
        kv.allocate_for(&mut b, 8).unwrap();
        assert_eq!(kv.num_used_blocks(), 2);
    }

    #[test]
    fn test_swap_out_fast_only_retains_tokens() {
        let mut kv = manager(4, 4);
        let mut req = request(1, (0..8).collect());
        kv.allocate_for(&mut req, 8).unwrap();
        req.advance_cached(8);
        req.set_running().unwrap();

        kv.swap_out(&mut req).unwrap();
        assert!(req.block_table().is_empty());
        assert_eq!(req.num_cached_tokens(), 0);
        assert_eq!(req.total_len(), 8);
    }

    #[test]
    fn test_tiered_swap_roundtrip() {
        let config = CacheConfig::new(4, 4).allocation_strategy(AllocationStrategy::Tiered);
        let mut kv = KVCacheManager::new(&config, Arc::new(CoreMetrics::new()));
        let mut req = request(1, (0..9).collect());

        kv.allocate_for(&mut req, 9).unwrap();
        req.advance_cached(9);

        kv.swap_out(&mut req).unwrap();
        assert_eq!(req.swap_manifest().len(), 2);
        assert_eq!(kv.num_used_blocks(), 0);

        kv.swap_in(&mut req, Duration::from_millis(10)).unwrap();
        // Both full blocks restored; the partial tail re-prefills.
        assert_eq!(req.num_cached_tokens(), 8);
        assert_eq!(req.block_table().num_blocks(), 2);
        assert!(req.swap_manifest().is_empty());
    }
}
