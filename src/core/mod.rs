//! Core infrastructure for spindle.
//!
//! This module contains the fundamental building blocks:
//! - Block, BlockTable and BlockPool for the paged KV cache
//! - KVCacheManager for prefix sharing, eviction and tiering
//! - Request for per-job state tracking

pub mod block;
pub mod block_pool;
pub mod kv_cache;
pub mod request;

pub use block::{blocks_needed, hash_token_block, BlockId, BlockTable, BlockTier, KVCacheBlock};
pub use block_pool::BlockPool;
pub use kv_cache::{ImmediateCoordinator, KVCacheManager, PrefetchCoordinator};
pub use request::{FinishReason, Priority, Request, RequestId, RequestStatus};
