//! Proposer arbitration.
//!
//! Runs cheap pattern matchers first and falls through to the model-based
//! proposer only when they come back too short. Exactly one proposal per
//! request survives; ties break by proposer priority order (pattern
//! matchers before model-based, since they are cheaper), then by proposal
//! length, then by score.

use candle_core::Tensor;

use crate::core::request::{Request, RequestId};
use crate::error::Result;

use super::proposer::{DraftProposal, DraftProposer};

/// Combines a prioritized list of pattern matchers with an optional
/// model-based fallback.
pub struct HybridDrafter {
    /// Pattern matchers, highest priority first.
    pattern_proposers: Vec<Box<dyn DraftProposer>>,
    /// Model-based fallback (e.g. a draft model).
    model_proposer: Option<Box<dyn DraftProposer>>,
    /// Pattern proposals shorter than this trigger the fallback.
    min_pattern_tokens: usize,
}

impl HybridDrafter {
    pub fn new(
        pattern_proposers: Vec<Box<dyn DraftProposer>>,
        model_proposer: Option<Box<dyn DraftProposer>>,
        min_pattern_tokens: usize,
    ) -> Self {
        Self {
            pattern_proposers,
            model_proposer,
            min_pattern_tokens,
        }
    }

    /// Drafter with a single proposer and no fallback.
    pub fn single(proposer: Box<dyn DraftProposer>) -> Self {
        Self::new(vec![proposer], None, 1)
    }

    /// Produce the single best proposal for a request.
    ///
    /// Pattern matchers run in priority order; the best pattern proposal
    /// of at least `min_pattern_tokens` wins outright. Otherwise the
    /// model-based proposer (when configured) gets its turn, and its
    /// proposal wins only by strictly beating the best pattern length.
    pub fn propose(&mut self, req: &Request, max_tokens: usize) -> Result<DraftProposal> {
        if max_tokens == 0 {
            return Ok(DraftProposal::empty(req.request_id()));
        }

        let mut best = DraftProposal::empty(req.request_id());
        for proposer in &mut self.pattern_proposers {
            let proposal = proposer.propose(req, max_tokens)?;
            // Earlier proposers win ties: replace only on strictly better.
            if proposal.len() > best.len()
                || (proposal.len() == best.len() && proposal.mean_score() > best.mean_score())
            {
                best = proposal;
            }
        }

        if best.len() >= self.min_pattern_tokens {
            return Ok(best);
        }

        if let Some(model) = &mut self.model_proposer {
            let proposal = model.propose(req, max_tokens)?;
            if proposal.len() > best.len() {
                return Ok(proposal);
            }
        }
        Ok(best)
    }

    /// Forward target hidden states to proposers that condition on them.
    pub fn observe_hidden(&mut self, request_id: RequestId, hidden: &Tensor) {
        for proposer in &mut self.pattern_proposers {
            proposer.observe_hidden(request_id, hidden);
        }
        if let Some(model) = &mut self.model_proposer {
            model.observe_hidden(request_id, hidden);
        }
    }

    /// Drop per-request state everywhere.
    pub fn on_request_finished(&mut self, request_id: RequestId) {
        for proposer in &mut self.pattern_proposers {
            proposer.on_request_finished(request_id);
        }
        if let Some(model) = &mut self.model_proposer {
            model.on_request_finished(request_id);
        }
    }
}
