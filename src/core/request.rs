//! Request tracking.
//!
//! A request represents a single inference job: its prompt, the tokens
//! generated so far, its KV cache residency, and its scheduling state.
//! The scheduler is the only writer of request state; the cache manager
//! mutates the block table exclusively through its own calls so refcounts
//! stay consistent.

use std::time::Instant;

use crate::config::SamplingConfig;
use crate::core::block::{BlockId, BlockTable};
use crate::error::{Error, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Scheduling priority. Lower value means higher priority.
pub type Priority = i32;

/// Default priority for new requests.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Status of a request in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Waiting in queue to be scheduled.
    Waiting,
    /// Currently running (prefill or decode).
    Running,
    /// Cache residency revoked under memory pressure; progress retained.
    Preempted,
    /// Finished generation.
    Finished,
}

impl RequestStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running | Self::Preempted)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Preempted => "Preempted",
            Self::Finished => "Finished",
        }
    }
}

/// Reason for request completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop token was generated.
    StopToken,
    /// Maximum token limit reached.
    MaxTokens,
    /// Cancelled by the caller.
    Cancelled,
    /// Request deadline elapsed.
    TimedOut,
    /// Failed with an error (e.g. resource exhaustion after deferral).
    Failed,
}

/// A single inference request.
///
/// Tracks prompt tokens (immutable after admission), generated tokens
/// (append-only, scheduler-owned), KV cache residency via [`BlockTable`],
/// and scheduling state.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique request identifier.
    request_id: RequestId,
    /// Prompt token ids, immutable after admission.
    prompt_token_ids: Vec<u32>,
    /// Generated token ids, append-only.
    output_token_ids: Vec<u32>,
    /// Per-request sampling parameters.
    sampling: SamplingConfig,
    /// Block table mapping logical positions to physical blocks.
    block_table: BlockTable,
    /// Number of token positions whose KV state is committed in cache.
    num_cached_tokens: usize,
    /// Current status.
    status: RequestStatus,
    /// Scheduling priority (lower = more urgent).
    priority: Priority,
    /// Arrival time, for latency accounting and timeouts.
    arrival_time: Instant,
    /// Arrival order for FIFO tie-breaking within a priority class.
    arrival_order: u64,
    /// Max draft tokens to propose for this request per step.
    speculative_budget: usize,
    /// Consecutive steps this request failed admission.
    deferrals: u32,
    /// Caller-initiated cancel, checked at the start of each step.
    cancel_requested: bool,
    /// Absolute deadline, if a request timeout is configured.
    deadline: Option<Instant>,
    /// Content hashes of blocks demoted to the slow tier at preemption,
    /// paired with their coordinator tickets (original block ids).
    swap_manifest: Vec<(u64, BlockId)>,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
}

impl Request {
    /// Create a new request with the given prompt tokens.
    pub fn new(request_id: RequestId, prompt_token_ids: Vec<u32>, sampling: SamplingConfig) -> Self {
        Self {
            request_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            sampling,
            block_table: BlockTable::with_default_size(),
            num_cached_tokens: 0,
            status: RequestStatus::Waiting,
            priority: DEFAULT_PRIORITY,
            arrival_time: Instant::now(),
            arrival_order: 0,
            speculative_budget: 0,
            deferrals: 0,
            cancel_requested: false,
            deadline: None,
            swap_manifest: Vec::new(),
            finish_reason: None,
        }
    }

    /// Create a new request with a priority.
    pub fn with_priority(
        request_id: RequestId,
        prompt_token_ids: Vec<u32>,
        sampling: SamplingConfig,
        priority: Priority,
    ) -> Self {
        let mut req = Self::new(request_id, prompt_token_ids, sampling);
        req.priority = priority;
        req
    }

    // ========== Getters ==========

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// All token ids (prompt + output).
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn block_table(&self) -> &BlockTable {
        &self.block_table
    }

    pub(crate) fn block_table_mut(&mut self) -> &mut BlockTable {
        &mut self.block_table
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn arrival_order(&self) -> u64 {
        self.arrival_order
    }

    pub fn speculative_budget(&self) -> usize {
        self.speculative_budget
    }

    pub fn deferrals(&self) -> u32 {
        self.deferrals
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Demoted-block manifest from the last swap-out (hash, ticket pairs).
    pub fn swap_manifest(&self) -> &[(u64, BlockId)] {
        &self.swap_manifest
    }

    pub(crate) fn swap_manifest_mut(&mut self) -> &mut Vec<(u64, BlockId)> {
        &mut self.swap_manifest
    }

    // ========== Length queries ==========

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    /// Number of token positions with committed KV state.
    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    /// Tokens not yet covered by committed cache state.
    pub fn num_uncached_tokens(&self) -> usize {
        self.total_len().saturating_sub(self.num_cached_tokens)
    }

    /// A request is in the decode phase once exactly one token (the most
    /// recently appended one) lacks cache state.
    pub fn is_decode_phase(&self) -> bool {
        self.output_len() > 0 && self.num_uncached_tokens() == 1
    }

    /// Last token id (generated if any, else last prompt token).
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    // ========== Mutators (scheduler only) ==========

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    /// Advance the committed-cache watermark.
    pub fn advance_cached(&mut self, num_tokens: usize) {
        self.num_cached_tokens = (self.num_cached_tokens + num_tokens).min(self.total_len());
    }

    /// Reset the committed-cache watermark (after swap-out/in).
    pub fn set_cached(&mut self, num_tokens: usize) {
        self.num_cached_tokens = num_tokens;
    }

    pub(crate) fn set_arrival_order(&mut self, order: u64) {
        self.arrival_order = order;
    }

    pub fn set_speculative_budget(&mut self, budget: usize) {
        self.speculative_budget = budget;
    }

    pub(crate) fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    pub(crate) fn note_deferral(&mut self) -> u32 {
        self.deferrals += 1;
        self.deferrals
    }

    pub(crate) fn clear_deferrals(&mut self) {
        self.deferrals = 0;
    }

    // ========== State transitions ==========

    /// Transition to running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if not currently waiting
    /// or preempted.
    pub fn set_running(&mut self) -> Result<()> {
        match self.status {
            RequestStatus::Waiting | RequestStatus::Preempted => {
                self.status = RequestStatus::Running;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Running",
            }),
        }
    }

    /// Transition to preempted. Generated tokens are retained; only cache
    /// residency is revoked.
    pub fn set_preempted(&mut self) -> Result<()> {
        match self.status {
            RequestStatus::Running => {
                self.status = RequestStatus::Preempted;
                Ok(())
            }
            _ => Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Preempted",
            }),
        }
    }

    /// Mark the request as finished.
    pub fn set_finished(&mut self, reason: FinishReason) {
        self.status = RequestStatus::Finished;
        self.finish_reason = Some(reason);
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for Request {}

impl std::hash::Hash for Request {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.request_id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: RequestId, prompt: Vec<u32>) -> Request {
        Request::new(id, prompt, SamplingConfig::default())
    }

    #[test]
    fn test_request_creation() {
        let r = req(1, vec![10, 20, 30, 40]);

        assert_eq!(r.request_id(), 1);
        assert_eq!(r.prompt_len(), 4);
        assert_eq!(r.output_len(), 0);
        assert_eq!(r.total_len(), 4);
        assert_eq!(r.status(), RequestStatus::Waiting);
        assert_eq!(r.priority(), DEFAULT_PRIORITY);
        assert_eq!(r.num_cached_tokens(), 0);
        assert!(!r.is_decode_phase());
    }

    #[test]
    fn test_phase_tracking() {
        let mut r = req(1, vec![1, 2, 3, 4]);
        assert_eq!(r.num_uncached_tokens(), 4);

        // Prompt fully cached, first token sampled.
        r.advance_cached(4);
        r.append_token(100);
        assert_eq!(r.num_uncached_tokens(), 1);
        assert!(r.is_decode_phase());

        // Decode step caches the pending token and appends the next.
        r.advance_cached(1);
        r.append_token(101);
        assert!(r.is_decode_phase());
        assert_eq!(r.total_len(), 6);
    }

    #[test]
    fn test_state_transitions() {
        let mut r = req(1, vec![1, 2, 3]);

        assert!(r.set_running().is_ok());
        assert_eq!(r.status(), RequestStatus::Running);

        assert!(r.set_preempted().is_ok());
        assert_eq!(r.status(), RequestStatus::Preempted);

        assert!(r.set_running().is_ok());

        r.set_finished(FinishReason::StopToken);
        assert_eq!(r.status(), RequestStatus::Finished);
        assert_eq!(r.finish_reason(), Some(FinishReason::StopToken));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut r = req(1, vec![1, 2, 3]);

        // Waiting -> Preempted is invalid.
        assert!(r.set_preempted().is_err());

        r.set_running().unwrap();
        // Running -> Running is invalid.
        assert!(r.set_running().is_err());
    }

    #[test]
    fn test_deferral_counting() {
        let mut r = req(1, vec![1]);
        assert_eq!(r.note_deferral(), 1);
        assert_eq!(r.note_deferral(), 2);
        r.clear_deferrals();
        assert_eq!(r.deferrals(), 0);
    }

    #[test]
    fn test_cancel_flag() {
        let mut r = req(1, vec![1]);
        assert!(!r.cancel_requested());
        r.request_cancel();
        assert!(r.cancel_requested());
    }
}
