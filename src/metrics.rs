//! Engine counters for monitoring.
//!
//! The core exposes read-only counters polled by an external collector;
//! nothing here pushes metrics anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe counters for the execution core.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    /// Prefix-cache hits (blocks reused).
    cache_hits: AtomicU64,
    /// Prefix-cache misses (blocks freshly allocated at a shareable boundary).
    cache_misses: AtomicU64,
    /// Blocks evicted from the reusable set.
    evictions: AtomicU64,
    /// Blocks allocated from the pool.
    blocks_allocated: AtomicU64,
    /// Blocks returned to the pool.
    blocks_freed: AtomicU64,
    /// Blocks demoted to the slow tier.
    demotions: AtomicU64,
    /// Blocks promoted back to the fast tier.
    promotions: AtomicU64,
    /// Draft tokens proposed across all steps.
    draft_proposed: AtomicU64,
    /// Draft tokens accepted by verification.
    draft_accepted: AtomicU64,
    /// Engine steps executed.
    steps: AtomicU64,
    /// Requests preempted under memory pressure.
    preemptions: AtomicU64,
    /// Scheduling deferrals.
    deferrals: AtomicU64,
    /// Requests finished (any reason).
    requests_finished: AtomicU64,
    /// Summed wall-clock latency of finished requests, in microseconds.
    total_latency_us: AtomicU64,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_query(&self, hits: u64, misses: u64) {
        self.cache_hits.fetch_add(hits, Ordering::Relaxed);
        self.cache_misses.fetch_add(misses, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, blocks: u64) {
        self.evictions.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_allocation(&self, blocks: u64) {
        self.blocks_allocated.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_free(&self, blocks: u64) {
        self.blocks_freed.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_demotion(&self, blocks: u64) {
        self.demotions.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_promotion(&self, blocks: u64) {
        self.promotions.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_draft(&self, proposed: u64, accepted: u64) {
        self.draft_proposed.fetch_add(proposed, Ordering::Relaxed);
        self.draft_accepted.fetch_add(accepted, Ordering::Relaxed);
    }

    pub fn record_step(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferral(&self) {
        self.deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_finished(&self, latency: std::time::Duration) {
        self.requests_finished.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Fraction of shareable-boundary allocations served from the prefix
    /// cache, or 0.0 before any query.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let total = hits + self.cache_misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Fraction of proposed draft tokens that survived verification.
    pub fn acceptance_rate(&self) -> f64 {
        let proposed = self.draft_proposed.load(Ordering::Relaxed);
        if proposed == 0 {
            0.0
        } else {
            self.draft_accepted.load(Ordering::Relaxed) as f64 / proposed as f64
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_finished = self.requests_finished.load(Ordering::Relaxed);
        let total_latency_us = self.total_latency_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_hit_rate: self.cache_hit_rate(),
            evictions: self.evictions.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            blocks_freed: self.blocks_freed.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            draft_proposed: self.draft_proposed.load(Ordering::Relaxed),
            draft_accepted: self.draft_accepted.load(Ordering::Relaxed),
            acceptance_rate: self.acceptance_rate(),
            steps: self.steps.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            requests_finished,
            mean_latency_us: if requests_finished == 0 {
                0
            } else {
                total_latency_us / requests_finished
            },
        }
    }
}

/// Serializable point-in-time view of [`CoreMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub evictions: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub demotions: u64,
    pub promotions: u64,
    pub draft_proposed: u64,
    pub draft_accepted: u64,
    pub acceptance_rate: f64,
    pub steps: u64,
    pub preemptions: u64,
    pub deferrals: u64,
    pub requests_finished: u64,
    pub mean_latency_us: u64,
}
