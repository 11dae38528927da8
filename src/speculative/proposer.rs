//! Draft token proposer abstractions.

use candle_core::Tensor;

use crate::core::request::{Request, RequestId};
use crate::error::Result;

/// Candidate continuation proposed for one request.
#[derive(Debug, Clone, Default)]
pub struct DraftProposal {
    pub request_id: RequestId,
    /// Proposed token ids, in order.
    pub tokens: Vec<u32>,
    /// Per-token confidence scores. Used only for tie-breaking between
    /// proposers, never for correctness; pattern matchers report 1.0.
    pub scores: Vec<f32>,
    /// Draft-model probability rows `[len, vocab]` when the proposer is
    /// model-based. Pattern matchers leave this None (implicit probability
    /// of 1.0 per token for rejection sampling).
    pub probs: Option<Tensor>,
}

impl DraftProposal {
    /// Empty proposal: fall back to plain decoding for this step.
    pub fn empty(request_id: RequestId) -> Self {
        Self {
            request_id,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Mean confidence score, for tie-breaking.
    pub fn mean_score(&self) -> f32 {
        if self.scores.is_empty() {
            0.0
        } else {
            self.scores.iter().sum::<f32>() / self.scores.len() as f32
        }
    }
}

/// A source of draft tokens for speculative decoding.
///
/// Proposers are side-effect-free with respect to cache state: they may
/// read a request's token history but never touch its blocks. An empty
/// proposal is a normal outcome (fall back to plain decoding), not an
/// error.
pub trait DraftProposer: Send {
    /// Propose up to `max_tokens` draft tokens for the request.
    fn propose(&mut self, req: &Request, max_tokens: usize) -> Result<DraftProposal>;

    /// Observe the target model's hidden state for a request after a step.
    /// Only model-based proposers that condition on target features use
    /// this.
    fn observe_hidden(&mut self, _request_id: RequestId, _hidden: &Tensor) {}

    /// Drop any per-request state for a finished request.
    fn on_request_finished(&mut self, _request_id: RequestId) {}

    /// Name for logging and diagnostics.
    fn name(&self) -> &'static str;
}
