//! Configuration types for spindle.
//!
//! All configuration is supplied at construction time and treated as
//! immutable for the lifetime of the engine; there is no hot-reload path.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Policy used to pick eviction victims among refcount-zero blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Evict the block with the oldest last-access stamp.
    #[default]
    Lru,
    /// Adaptive replacement: recency and frequency lists with ghost-list
    /// feedback steering the split between them.
    Arc,
}

/// Where evicted-but-live cache content may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationStrategy {
    /// Single fast tier; preemption releases blocks and the request
    /// re-prefills from its retained token history.
    #[default]
    FastOnly,
    /// Preemption demotes full blocks to a slow tier through the prefetch
    /// coordinator instead of discarding them.
    Tiered,
}

/// KV cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tokens per block.
    pub block_size: usize,
    /// Total number of blocks in the pool.
    pub num_blocks: usize,
    /// Enable content-hash prefix sharing between requests.
    pub enable_prefix_caching: bool,
    /// Eviction victim selection policy.
    pub eviction_policy: EvictionPolicy,
    /// Fast-only or tiered placement.
    pub allocation_strategy: AllocationStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 1024,
            enable_prefix_caching: true,
            eviction_policy: EvictionPolicy::Lru,
            allocation_strategy: AllocationStrategy::FastOnly,
        }
    }
}

impl CacheConfig {
    /// Create a config with explicit pool geometry.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            num_blocks,
            block_size,
            ..Default::default()
        }
    }

    /// Set the eviction policy.
    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Set the allocation strategy.
    pub fn allocation_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation_strategy = strategy;
        self
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of requests scheduled per step.
    pub max_num_seqs: usize,
    /// Cap on total tokens resident across all running requests.
    pub max_tokens_in_flight: usize,
    /// Maximum tokens processed for prefill per step.
    pub max_prefill_tokens: usize,
    /// Enable chunked prefill for long prompts.
    pub enable_chunked_prefill: bool,
    /// Chunk size for chunked prefill.
    pub chunk_size: usize,
    /// Enable preemption of lower-priority running requests under
    /// memory pressure.
    pub enable_preemption: bool,
    /// A request deferred more than this many consecutive steps fails
    /// with `ResourceExhausted`.
    pub max_deferrals: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_tokens_in_flight: 65_536,
            max_prefill_tokens: 4096,
            enable_chunked_prefill: true,
            chunk_size: 512,
            enable_preemption: true,
            max_deferrals: 64,
        }
    }
}

/// Speculative decoding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Default per-request speculative budget (max draft tokens per step).
    pub num_speculative_tokens: usize,
    /// Pattern-matcher proposals shorter than this fall through to the
    /// model-based proposer, when one is configured.
    pub min_pattern_tokens: usize,
    /// Disable speculation entirely (every step decodes one token).
    pub enabled: bool,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 4,
            min_pattern_tokens: 2,
            enabled: true,
        }
    }
}

impl SpeculativeConfig {
    /// Set the speculative budget.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }

    /// Disable speculation.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Per-request sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy, 1.0 = no change).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Token ids that terminate generation.
    pub stop_token_ids: Vec<u32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            stop_token_ids: Vec::new(),
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding config.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the stop token ids.
    pub fn stop_tokens(mut self, stop_token_ids: Vec<u32>) -> Self {
        self.stop_token_ids = stop_token_ids;
        self
    }

    /// Whether this config selects the argmax token deterministically.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    /// Validate parameters at submission time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSamplingParams`] for out-of-range values.
    /// Rejected requests never enter the scheduler.
    pub fn validate(&self) -> Result<()> {
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(Error::InvalidSamplingParams(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::InvalidSamplingParams(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::InvalidSamplingParams(
                "max_tokens must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
    /// KV cache configuration.
    pub cache: CacheConfig,
    /// Speculative decoding configuration.
    pub speculative: SpeculativeConfig,
    /// Wall-clock bound on a single model-executor call, in milliseconds.
    pub step_deadline_ms: u64,
    /// Optional wall-clock bound on a whole request since arrival,
    /// in milliseconds. Zero disables the timeout.
    pub request_timeout_ms: u64,
}

impl EngineConfig {
    /// Deadline for one executor call.
    pub fn step_deadline(&self) -> std::time::Duration {
        let ms = if self.step_deadline_ms == 0 {
            30_000
        } else {
            self.step_deadline_ms
        };
        std::time::Duration::from_millis(ms)
    }

    /// Per-request timeout, if configured.
    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        (self.request_timeout_ms > 0)
            .then(|| std::time::Duration::from_millis(self.request_timeout_ms))
    }
}
