//! Continuous batching scheduler.
//!
//! The scheduler owns the request lifecycle and builds one batch
//! descriptor per engine step:
//!
//! ```text
//!   add_request()                                   schedule()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐                                   ┌───────────┐
//!   │ Waiting │ ────────────────────────────────► │  Running  │
//!   │  queue  │      (admission, cache granted)   │    set    │
//!   └─────────┘                                   └───────────┘
//!        ▲                 swap out                     │
//!        └───────────── Preempted ◄─────────────────────┘
//!                  (memory pressure, resumed later)
//! ```
//!
//! Each step schedules existing running requests first (decode, with
//! speculative headroom sized by the drafter's proposals), then resumes
//! preempted requests, then admits from the waiting queue in priority
//! order (lower value first, FIFO within a class). Cache exhaustion
//! preempts strictly-lower-priority running requests through the swap-out
//! path; requests that still cannot be placed are deferred, and a bounded
//! number of deferrals fails the request rather than retrying forever.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{CacheConfig, SchedulerConfig};
use crate::core::block::BlockId;
use crate::core::kv_cache::KVCacheManager;
use crate::core::request::{FinishReason, Priority, Request, RequestId, RequestStatus};
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use crate::speculative::verifier::VerificationResult;

/// One prefill entry in a step's batch: process `input_tokens` starting at
/// position `chunk_start`.
#[derive(Debug, Clone)]
pub struct ScheduledPrefill {
    pub request_id: RequestId,
    pub chunk_start: usize,
    pub input_tokens: Vec<u32>,
}

/// One decode entry in a step's batch. `input_tokens` is the pending token
/// followed by the granted draft tokens; the executor returns one logits
/// row per input.
#[derive(Debug, Clone)]
pub struct ScheduledDecode {
    pub request_id: RequestId,
    pub input_tokens: Vec<u32>,
    pub draft_tokens: Vec<u32>,
}

/// Batch descriptor for one step. Produced fresh each step, not persisted.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    /// Requests processing prompt (or re-prefill) tokens this step.
    pub prefill: Vec<ScheduledPrefill>,
    /// Requests in decode phase, with optional speculative inputs.
    pub decode: Vec<ScheduledDecode>,
    /// Requests preempted while building this batch.
    pub preempted: Vec<RequestId>,
    /// Physical block mapping per scheduled request.
    pub block_tables: HashMap<RequestId, Vec<BlockId>>,
    /// Optional per-request conditioning tensors (draft-model batches).
    pub hidden_states: HashMap<RequestId, candle_core::Tensor>,
    /// Total prefill tokens this step.
    pub num_prefill_tokens: usize,
    /// Total decode input tokens this step (including drafts).
    pub num_decode_tokens: usize,
}

impl SchedulerOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.prefill.is_empty() && self.decode.is_empty()
    }

    pub fn num_requests(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }

    /// All scheduled request ids, prefill first.
    pub fn all_request_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.prefill.iter().map(|p| p.request_id).collect();
        ids.extend(self.decode.iter().map(|d| d.request_id));
        ids
    }

    /// Drop a request's entries (used when it is preempted after being
    /// scheduled earlier in the same step).
    fn remove_request(&mut self, request_id: RequestId) {
        if let Some(pos) = self.prefill.iter().position(|p| p.request_id == request_id) {
            let entry = self.prefill.remove(pos);
            self.num_prefill_tokens -= entry.input_tokens.len();
        }
        if let Some(pos) = self.decode.iter().position(|d| d.request_id == request_id) {
            let entry = self.decode.remove(pos);
            self.num_decode_tokens -= entry.input_tokens.len();
        }
        self.block_tables.remove(&request_id);
    }
}

/// Waiting-queue entry ordered by (priority ASC, arrival ASC).
#[derive(Debug, Clone)]
struct QueueEntry {
    request_id: RequestId,
    priority: Priority,
    arrival_order: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the max; the most urgent entry (lowest priority
        // value, earliest arrival) must compare greatest.
        match other.priority.cmp(&self.priority) {
            std::cmp::Ordering::Equal => other.arrival_order.cmp(&self.arrival_order),
            ord => ord,
        }
    }
}

/// Continuous batching scheduler with speculative headroom.
///
/// Single-writer: all request state and cache metadata mutations funnel
/// through this type on the control thread, so refcounts and statuses stay
/// mutually consistent without locks.
pub struct Scheduler {
    config: SchedulerConfig,
    /// Cache manager; request block tables are mutated only through it.
    kv: KVCacheManager,
    /// All live requests (waiting, running, preempted, finished-unflushed).
    requests: HashMap<RequestId, Request>,
    /// Priority queue of waiting requests.
    waiting: BinaryHeap<QueueEntry>,
    /// Running request ids in admission order.
    running: Vec<RequestId>,
    /// Preempted request ids awaiting resumption.
    preempted: Vec<RequestId>,
    /// Counter for arrival ordering.
    arrival_counter: u64,
    /// Deadline for slow-tier promotions during resume.
    promote_deadline: Duration,
    metrics: Arc<CoreMetrics>,
}

impl Scheduler {
    /// Create a scheduler owning a fresh cache manager.
    pub fn new(config: SchedulerConfig, cache_config: &CacheConfig, metrics: Arc<CoreMetrics>) -> Self {
        let kv = KVCacheManager::new(cache_config, Arc::clone(&metrics));
        Self::with_cache(config, kv, metrics)
    }

    /// Create a scheduler around an existing cache manager (custom
    /// prefetch coordinator).
    pub fn with_cache(config: SchedulerConfig, kv: KVCacheManager, metrics: Arc<CoreMetrics>) -> Self {
        Self {
            config,
            kv,
            requests: HashMap::new(),
            waiting: BinaryHeap::new(),
            running: Vec::new(),
            preempted: Vec::new(),
            arrival_counter: 0,
            promote_deadline: Duration::from_secs(5),
            metrics,
        }
    }

    // ========== Request lifecycle ==========

    /// Add a new request; it starts Waiting in the priority queue.
    pub fn add_request(&mut self, mut req: Request) {
        req.set_arrival_order(self.arrival_counter);
        self.arrival_counter += 1;

        self.waiting.push(QueueEntry {
            request_id: req.request_id(),
            priority: req.priority(),
            arrival_order: req.arrival_order(),
        });
        self.requests.insert(req.request_id(), req);
    }

    /// Record a caller-initiated cancel; honored at the next step start.
    pub fn cancel(&mut self, request_id: RequestId) -> Result<()> {
        let req = self
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        req.request_cancel();
        Ok(())
    }

    pub fn get_request(&self, request_id: RequestId) -> Option<&Request> {
        self.requests.get(&request_id)
    }

    pub fn get_request_mut(&mut self, request_id: RequestId) -> Option<&mut Request> {
        self.requests.get_mut(&request_id)
    }

    /// Remove a finished request after its output has been flushed.
    pub fn remove_request(&mut self, request_id: RequestId) -> Option<Request> {
        let mut req = self.requests.remove(&request_id)?;
        if !req.block_table().is_empty() {
            let _ = self.kv.release(&mut req);
        }
        self.running.retain(|&id| id != request_id);
        self.preempted.retain(|&id| id != request_id);
        Some(req)
    }

    /// Finish a request: release its cache and record latency. The request
    /// stays in the map until the caller flushes and removes it.
    pub fn finish_request(&mut self, request_id: RequestId, reason: FinishReason) {
        let Some(req) = self.requests.get_mut(&request_id) else {
            return;
        };
        req.set_finished(reason);
        let latency = req.arrival_time().elapsed();
        if let Err(e) = self.kv.release(req) {
            warn!(request_id, error = %e, "release failed on finish");
        }
        self.running.retain(|&id| id != request_id);
        self.preempted.retain(|&id| id != request_id);
        self.metrics.record_request_finished(latency);
        debug!(request_id, ?reason, "request finished");
    }

    /// Check cancellation flags and deadlines for every active request.
    /// Returns the requests finished by this sweep. Called at the start of
    /// each step, before any in-flight result for them would be applied.
    pub fn sweep_expired(&mut self) -> Vec<(RequestId, FinishReason)> {
        let now = Instant::now();
        let expired: Vec<(RequestId, FinishReason)> = self
            .requests
            .values()
            .filter(|r| r.status().is_active())
            .filter_map(|r| {
                if r.cancel_requested() {
                    Some((r.request_id(), FinishReason::Cancelled))
                } else if r.deadline().is_some_and(|d| now >= d) {
                    Some((r.request_id(), FinishReason::TimedOut))
                } else {
                    None
                }
            })
            .collect();
        for &(id, reason) in &expired {
            self.finish_request(id, reason);
        }
        expired
    }

    // ========== Step scheduling ==========

    /// Build the batch for one step.
    ///
    /// `proposals` carries the drafter's proposed tokens per decode-ready
    /// request; tentative cache headroom is sized from them and the
    /// granted portion is echoed in each decode entry.
    pub fn schedule(&mut self, proposals: &HashMap<RequestId, Vec<u32>>) -> SchedulerOutput {
        let mut output = SchedulerOutput::new();
        let mut prefill_budget = self.config.max_prefill_tokens;

        // Phase 1: existing running requests — decode or prefill chunks.
        for request_id in self.running.clone() {
            if output.num_requests() >= self.config.max_num_seqs {
                break;
            }
            // May have been preempted by an earlier iteration of this loop.
            if self.requests.get(&request_id).map(|r| r.status()) != Some(RequestStatus::Running) {
                continue;
            }
            let decode_phase = self.requests[&request_id].is_decode_phase();
            if decode_phase {
                self.schedule_decode(request_id, proposals, &mut output);
            } else {
                self.schedule_prefill_chunk(request_id, &mut output, &mut prefill_budget);
            }
        }

        // Phase 2: resume preempted requests, most urgent first.
        let mut resumable = self.preempted.clone();
        resumable.sort_by_key(|id| {
            let r = &self.requests[id];
            (r.priority(), r.arrival_order())
        });
        for request_id in resumable {
            if output.num_requests() >= self.config.max_num_seqs {
                break;
            }
            self.try_resume(request_id, &mut output, &mut prefill_budget);
        }

        // Phase 3: admit waiting requests.
        self.schedule_admission(&mut output, &mut prefill_budget);

        debug_assert!(
            {
                let ids = output.all_request_ids();
                let unique: std::collections::HashSet<_> = ids.iter().collect();
                unique.len() == ids.len()
            },
            "request scheduled twice in one step"
        );
        output
    }

    /// Decode scheduling for one running request, including speculative
    /// headroom. Falls back to preemption of lower-priority requests on
    /// cache exhaustion, then to deferral.
    fn schedule_decode(
        &mut self,
        request_id: RequestId,
        proposals: &HashMap<RequestId, Vec<u32>>,
        output: &mut SchedulerOutput,
    ) {
        loop {
            let Some(req) = self.requests.get_mut(&request_id) else {
                return;
            };
            match self.kv.allocate_for(req, 1) {
                Ok(_) => break,
                Err(Error::CacheExhausted(_)) => {
                    let priority = self.requests[&request_id].priority();
                    if !self.preempt_lower_priority(priority, request_id, output) {
                        self.defer(request_id);
                        return;
                    }
                }
                Err(e) => {
                    warn!(request_id, error = %e, "decode allocation failed");
                    return;
                }
            }
        }

        let proposal = proposals.get(&request_id).map(Vec::as_slice).unwrap_or(&[]);
        let budget = self.requests[&request_id].speculative_budget();
        let wanted = proposal.len().min(budget);
        let granted = match self.requests.get_mut(&request_id) {
            Some(req) if wanted > 0 => self.kv.allocate_tentative(req, wanted),
            _ => 0,
        };

        let req = &self.requests[&request_id];
        let pending = req.all_token_ids()[req.num_cached_tokens()];
        let draft_tokens: Vec<u32> = proposal[..granted].to_vec();
        let mut input_tokens = Vec::with_capacity(1 + granted);
        input_tokens.push(pending);
        input_tokens.extend_from_slice(&draft_tokens);

        output.num_decode_tokens += input_tokens.len();
        output
            .block_tables
            .insert(request_id, req.block_table().block_ids().to_vec());
        output.decode.push(ScheduledDecode {
            request_id,
            input_tokens,
            draft_tokens,
        });
        if let Some(req) = self.requests.get_mut(&request_id) {
            req.clear_deferrals();
        }
    }

    /// Prefill-chunk scheduling for a running request (initial prompt,
    /// chunked continuation, or post-preemption re-prefill).
    fn schedule_prefill_chunk(
        &mut self,
        request_id: RequestId,
        output: &mut SchedulerOutput,
        prefill_budget: &mut usize,
    ) {
        let req = &self.requests[&request_id];
        let cached_before = req.num_cached_tokens();
        let uncached = req.num_uncached_tokens();
        let mut chunk = uncached.min(*prefill_budget);
        if self.config.enable_chunked_prefill {
            chunk = chunk.min(self.config.chunk_size);
        }
        if chunk == 0 {
            return;
        }

        loop {
            let Some(req) = self.requests.get_mut(&request_id) else {
                return;
            };
            match self.kv.allocate_for(req, chunk) {
                Ok(_) => break,
                Err(Error::CacheExhausted(_)) => {
                    let priority = self.requests[&request_id].priority();
                    if !self.preempt_lower_priority(priority, request_id, output) {
                        self.defer(request_id);
                        return;
                    }
                }
                Err(e) => {
                    warn!(request_id, error = %e, "prefill allocation failed");
                    return;
                }
            }
        }

        let Some(req) = self.requests.get_mut(&request_id) else {
            return;
        };
        req.clear_deferrals();
        // Prefix-cache hits may have advanced the watermark past part (or
        // all) of the planned chunk; only the remainder is computed.
        let start = req.num_cached_tokens();
        let end = (cached_before + chunk).max(start);
        let chunk = end - start;
        if chunk == 0 {
            return;
        }
        let input_tokens = req.all_token_ids()[start..end].to_vec();
        *prefill_budget -= chunk;
        output.num_prefill_tokens += chunk;
        output
            .block_tables
            .insert(request_id, req.block_table().block_ids().to_vec());
        output.prefill.push(ScheduledPrefill {
            request_id,
            chunk_start: start,
            input_tokens,
        });
    }

    /// Try to restore a preempted request's cache residency and schedule
    /// its re-prefill chunk.
    fn try_resume(
        &mut self,
        request_id: RequestId,
        output: &mut SchedulerOutput,
        prefill_budget: &mut usize,
    ) {
        if *prefill_budget == 0 {
            return;
        }
        let deadline = self.promote_deadline;
        let Some(req) = self.requests.get_mut(&request_id) else {
            return;
        };
        match self.kv.swap_in(req, deadline) {
            Ok(()) => {}
            Err(Error::CacheExhausted(_)) => {
                self.defer(request_id);
                return;
            }
            Err(e) => {
                warn!(request_id, error = %e, "swap-in failed");
                self.finish_request(request_id, FinishReason::Failed);
                return;
            }
        }
        let Some(req) = self.requests.get_mut(&request_id) else {
            return;
        };
        if req.set_running().is_err() {
            return;
        }
        self.preempted.retain(|&id| id != request_id);
        self.running.push(request_id);
        debug!(request_id, "resumed preempted request");
        self.schedule_prefill_chunk(request_id, output, prefill_budget);
    }

    /// Admit waiting requests in priority order under the concurrency and
    /// token-in-flight budgets.
    fn schedule_admission(&mut self, output: &mut SchedulerOutput, prefill_budget: &mut usize) {
        let mut tokens_in_flight: usize = self
            .running
            .iter()
            .chain(self.preempted.iter())
            .map(|id| self.requests[id].total_len())
            .sum();

        while output.num_requests() < self.config.max_num_seqs && *prefill_budget > 0 {
            let Some(entry) = self.waiting.pop() else {
                break;
            };
            let request_id = entry.request_id;

            // Stale entries for cancelled/removed requests are dropped.
            let Some(req) = self.requests.get(&request_id) else {
                continue;
            };
            if req.status() != RequestStatus::Waiting {
                continue;
            }

            if tokens_in_flight + req.total_len() > self.config.max_tokens_in_flight {
                self.waiting.push(entry);
                break;
            }

            let prompt_len = req.prompt_len();
            let needed = crate::core::block::blocks_needed(prompt_len, self.kv.block_size());
            let obtainable = self.kv.num_available_blocks() >= needed
                || (self.config.enable_preemption
                    && self.has_lower_priority_running(req.priority()));
            if !obtainable {
                // Strict fairness: one deferral per step, and nothing
                // behind the blocked head is admitted past it.
                self.waiting.push(entry);
                self.defer(request_id);
                break;
            }

            let Some(req) = self.requests.get_mut(&request_id) else {
                continue;
            };
            if req.set_running().is_err() {
                continue;
            }
            tokens_in_flight += prompt_len;
            self.running.push(request_id);
            self.schedule_prefill_chunk(request_id, output, prefill_budget);
        }
    }

    fn has_lower_priority_running(&self, than: Priority) -> bool {
        self.running
            .iter()
            .any(|id| self.requests[id].priority() > than)
    }

    /// Preempt the lowest-priority running request whose priority value is
    /// strictly greater than `than`, excluding `exclude`. Returns false
    /// when no eligible victim exists.
    fn preempt_lower_priority(
        &mut self,
        than: Priority,
        exclude: RequestId,
        output: &mut SchedulerOutput,
    ) -> bool {
        if !self.config.enable_preemption {
            return false;
        }
        let victim = self
            .running
            .iter()
            .copied()
            .filter(|&id| id != exclude)
            .filter(|id| self.requests[id].priority() > than)
            .max_by_key(|id| {
                let r = &self.requests[id];
                (r.priority(), r.arrival_order())
            });
        let Some(victim_id) = victim else {
            return false;
        };

        let Some(req) = self.requests.get_mut(&victim_id) else {
            return false;
        };
        if let Err(e) = self.kv.swap_out(req) {
            warn!(request_id = victim_id, error = %e, "swap-out failed");
        }
        let Some(req) = self.requests.get_mut(&victim_id) else {
            return false;
        };
        if req.set_preempted().is_err() {
            return false;
        }
        self.running.retain(|&id| id != victim_id);
        self.preempted.push(victim_id);
        output.remove_request(victim_id);
        output.preempted.push(victim_id);
        self.metrics.record_preemption();
        warn!(request_id = victim_id, "preempted request under memory pressure");
        true
    }

    /// Record a deferral; fails the request once the configured bound is
    /// exceeded. Returns false in that case.
    fn defer(&mut self, request_id: RequestId) -> bool {
        self.metrics.record_deferral();
        let Some(req) = self.requests.get_mut(&request_id) else {
            return false;
        };
        let count = req.note_deferral();
        if count > self.config.max_deferrals {
            warn!(request_id, count, "deferral bound exceeded, failing request");
            self.finish_request(request_id, FinishReason::Failed);
            false
        } else {
            true
        }
    }

    // ========== Result application ==========

    /// Apply a verification result: commit accepted tokens and tentative
    /// blocks, append the extension, and check stop conditions.
    ///
    /// Returns the finish reason if the request completed.
    pub fn apply_verification(
        &mut self,
        result: &VerificationResult,
    ) -> Result<Option<FinishReason>> {
        let request_id = result.request_id;
        let req = self
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;

        // The pending decode input's KV is valid regardless of outcome.
        req.advance_cached(1);

        let mut finish = None;
        for &token in &result.tokens {
            req.append_token(token);
            if let Some(reason) = check_stop(req) {
                finish = Some(reason);
                break;
            }
        }

        let Some(req) = self.requests.get_mut(&request_id) else {
            return Err(Error::RequestNotFound(request_id));
        };
        self.kv.commit_tentative(req, result.accepted_len)?;

        if let Some(reason) = finish {
            self.finish_request(request_id, reason);
        }
        Ok(finish)
    }

    /// Discard a request's tentative suffix without committing anything
    /// (used when a step's executor call fails after allocation).
    pub fn discard_tentative(&mut self, request_id: RequestId) -> Result<()> {
        let req = self
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        self.kv.commit_tentative(req, 0)
    }

    /// Apply a plain (non-speculative) decode token.
    pub fn apply_decode_token(
        &mut self,
        request_id: RequestId,
        token: u32,
    ) -> Result<Option<FinishReason>> {
        let req = self
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        req.advance_cached(1);
        req.append_token(token);
        let finish = check_stop(req);
        if let Some(req) = self.requests.get_mut(&request_id) {
            self.kv.finalize_full_blocks(req);
        }
        if let Some(reason) = finish {
            self.finish_request(request_id, reason);
        }
        Ok(finish)
    }

    /// Apply prefill progress; `sampled` carries the first generated token
    /// when the chunk completed the uncached context.
    pub fn apply_prefill(
        &mut self,
        request_id: RequestId,
        chunk_len: usize,
        sampled: Option<u32>,
    ) -> Result<Option<FinishReason>> {
        let req = self
            .requests
            .get_mut(&request_id)
            .ok_or(Error::RequestNotFound(request_id))?;
        req.advance_cached(chunk_len);
        let mut finish = None;
        if let Some(token) = sampled {
            req.append_token(token);
            finish = check_stop(req);
        }
        if let Some(req) = self.requests.get_mut(&request_id) {
            self.kv.finalize_full_blocks(req);
        }
        if let Some(reason) = finish {
            self.finish_request(request_id, reason);
        }
        Ok(finish)
    }

    // ========== Introspection ==========

    pub fn num_waiting(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.status() == RequestStatus::Waiting)
            .count()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn num_preempted(&self) -> usize {
        self.preempted.len()
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.requests.values().any(|r| r.status().is_active())
    }

    pub fn running_request_ids(&self) -> &[RequestId] {
        &self.running
    }

    pub fn kv_cache(&self) -> &KVCacheManager {
        &self.kv
    }

    pub fn kv_cache_mut(&mut self) -> &mut KVCacheManager {
        &mut self.kv
    }
}

/// Stop-condition check after appending a token.
fn check_stop(req: &Request) -> Option<FinishReason> {
    let last = req.output_token_ids().last().copied()?;
    if req.sampling().stop_token_ids.contains(&last) {
        Some(FinishReason::StopToken)
    } else if req.output_len() >= req.sampling().max_tokens {
        Some(FinishReason::MaxTokens)
    } else {
        None
    }
}
