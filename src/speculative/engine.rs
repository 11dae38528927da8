//! Per-step speculative orchestration.
//!
//! One engine step runs: cancellation sweep → draft proposals → batch
//! scheduling (which sizes tentative cache headroom from the proposals) →
//! one model-executor call → verification or sampling per request →
//! atomic commit through the scheduler. Verification results of a step
//! are always applied before the next step's allocation phase begins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SpeculativeConfig;
use crate::core::request::{FinishReason, RequestId};
use crate::engine::executor::{ExecutorHandle, StepOutput};
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use crate::scheduler::Scheduler;

use super::hybrid::HybridDrafter;
use super::proposer::DraftProposal;
use super::verifier::{tensor_rows, DraftProbs, TokenVerifier, VerificationResult};

/// Summary of one engine step.
#[derive(Debug, Default)]
pub struct StepReport {
    /// Requests that finished this step, with their reasons.
    pub finished: Vec<(RequestId, FinishReason)>,
    /// Requests scheduled in the batch.
    pub scheduled: usize,
    /// Draft tokens sent for verification.
    pub proposed_tokens: usize,
    /// Draft tokens that survived verification.
    pub accepted_tokens: usize,
}

/// Drives propose → execute → verify → commit, once per step.
pub struct SpeculativeEngine {
    drafter: HybridDrafter,
    verifier: TokenVerifier,
    config: SpeculativeConfig,
    /// Per-request samplers for the non-speculative paths.
    samplers: HashMap<RequestId, Sampler>,
    /// Current step's full proposals (tokens echoed to the scheduler,
    /// probability rows kept here for verification).
    proposals: HashMap<RequestId, DraftProposal>,
    step_deadline: Duration,
    metrics: Arc<CoreMetrics>,
}

impl SpeculativeEngine {
    pub fn new(
        drafter: HybridDrafter,
        config: SpeculativeConfig,
        step_deadline: Duration,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            drafter,
            verifier: TokenVerifier::new(),
            config,
            samplers: HashMap::new(),
            proposals: HashMap::new(),
            step_deadline,
            metrics,
        }
    }

    /// Seed the verifier and per-request samplers deterministically.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.verifier = TokenVerifier::with_seed(seed);
        self
    }

    /// Register sampling state for a newly submitted request.
    pub fn register_request(&mut self, request_id: RequestId, sampling: &crate::config::SamplingConfig) {
        self.samplers.insert(request_id, Sampler::new(sampling));
    }

    /// Drop all per-request state.
    pub fn drop_request(&mut self, request_id: RequestId) {
        self.samplers.remove(&request_id);
        self.proposals.remove(&request_id);
        self.drafter.on_request_finished(request_id);
    }

    /// Run one step of the engine.
    pub fn step(
        &mut self,
        scheduler: &mut Scheduler,
        executor: &ExecutorHandle,
    ) -> Result<StepReport> {
        let mut report = StepReport::default();

        // Cancellations and deadlines are honored before anything else;
        // any in-flight work for swept requests is simply never applied.
        for (id, reason) in scheduler.sweep_expired() {
            self.drop_request(id);
            report.finished.push((id, reason));
        }

        // Draft proposals for decode-ready requests. Proposers never touch
        // cache state, so drafting before allocation is safe.
        self.proposals.clear();
        let mut proposal_tokens: HashMap<RequestId, Vec<u32>> = HashMap::new();
        if self.config.enabled {
            for id in scheduler.running_request_ids().to_vec() {
                let Some(req) = scheduler.get_request(id) else {
                    continue;
                };
                let budget = req
                    .speculative_budget()
                    .min(self.config.num_speculative_tokens);
                if budget == 0 || !req.is_decode_phase() {
                    continue;
                }
                // A failed proposal costs this request its speculation for
                // the step, nothing more.
                let proposal = match self.drafter.propose(req, budget) {
                    Ok(proposal) => proposal,
                    Err(e) => {
                        warn!(request_id = id, error = %e, "draft proposal failed");
                        continue;
                    }
                };
                if !proposal.is_empty() {
                    proposal_tokens.insert(id, proposal.tokens.clone());
                    self.proposals.insert(id, proposal);
                }
            }
        }

        let batch = scheduler.schedule(&proposal_tokens);
        if batch.is_empty() {
            return Ok(report);
        }
        report.scheduled = batch.num_requests();

        // The shape of the batch, kept for applying results after the
        // descriptor itself moves to the executor.
        let prefill_info: Vec<(RequestId, usize)> = batch
            .prefill
            .iter()
            .map(|p| (p.request_id, p.input_tokens.len()))
            .collect();
        let decode_info: Vec<(RequestId, Vec<u32>)> = batch
            .decode
            .iter()
            .map(|d| (d.request_id, d.draft_tokens.clone()))
            .collect();

        // The control loop's one executor suspension point.
        let output = match executor.execute(batch, self.step_deadline) {
            Ok(output) => output,
            Err(e) => {
                // Nothing to commit: roll tentative allocations back so
                // the next step starts from a clean table.
                for (id, _) in &decode_info {
                    let _ = scheduler.discard_tentative(*id);
                }
                return Err(e);
            }
        };

        for (id, chunk_len) in prefill_info {
            if let Err(e) = self.apply_prefill(scheduler, &output, id, chunk_len, &mut report) {
                warn!(request_id = id, error = %e, "prefill result failed; failing request");
                scheduler.finish_request(id, FinishReason::Failed);
                self.drop_request(id);
                report.finished.push((id, FinishReason::Failed));
            }
        }

        for (id, draft) in decode_info {
            if let Err(e) = self.apply_decode(scheduler, &output, id, &draft, &mut report) {
                warn!(request_id = id, error = %e, "decode result failed; failing request");
                scheduler.finish_request(id, FinishReason::Failed);
                self.drop_request(id);
                report.finished.push((id, FinishReason::Failed));
            }
        }

        self.metrics.record_step();
        debug!(
            scheduled = report.scheduled,
            proposed = report.proposed_tokens,
            accepted = report.accepted_tokens,
            "step complete"
        );
        Ok(report)
    }

    fn apply_prefill(
        &mut self,
        scheduler: &mut Scheduler,
        output: &StepOutput,
        request_id: RequestId,
        chunk_len: usize,
        report: &mut StepReport,
    ) -> Result<()> {
        let Some(req) = scheduler.get_request(request_id) else {
            return Ok(());
        };
        if req.status().is_finished() {
            return Ok(());
        }

        let completes = req.num_uncached_tokens() == chunk_len;
        let sampled = if completes {
            let logits = output
                .logits
                .get(&request_id)
                .ok_or_else(|| Error::Config(format!("no logits for request {request_id}")))?;
            let rows = tensor_rows(logits)?;
            let last = rows
                .last()
                .ok_or_else(|| Error::Config("empty logits".to_string()))?;
            let sampler = self
                .samplers
                .get_mut(&request_id)
                .ok_or(Error::RequestNotFound(request_id))?;
            Some(sampler.sample(last))
        } else {
            None
        };

        if let Some(hidden) = output.hidden_states.get(&request_id) {
            self.drafter.observe_hidden(request_id, hidden);
        }
        if let Some(reason) = scheduler.apply_prefill(request_id, chunk_len, sampled)? {
            self.drop_request(request_id);
            report.finished.push((request_id, reason));
        }
        Ok(())
    }

    fn apply_decode(
        &mut self,
        scheduler: &mut Scheduler,
        output: &StepOutput,
        request_id: RequestId,
        draft: &[u32],
        report: &mut StepReport,
    ) -> Result<()> {
        let Some(req) = scheduler.get_request(request_id) else {
            return Ok(());
        };
        if req.status().is_finished() {
            return Ok(());
        }
        let sampling = req.sampling().clone();

        let logits = output
            .logits
            .get(&request_id)
            .ok_or_else(|| Error::Config(format!("no logits for request {request_id}")))?;

        let finish = if draft.is_empty() {
            let rows = tensor_rows(logits)?;
            let last = rows
                .last()
                .ok_or_else(|| Error::Config("empty logits".to_string()))?;
            let sampler = self
                .samplers
                .get_mut(&request_id)
                .ok_or(Error::RequestNotFound(request_id))?;
            let token = sampler.sample(last);
            scheduler.apply_decode_token(request_id, token)?
        } else {
            // The scheduler may have granted fewer tentative slots than
            // proposed; probability rows narrow to match.
            let narrowed = match self
                .proposals
                .get(&request_id)
                .and_then(|p| p.probs.as_ref())
            {
                Some(probs) => Some(probs.narrow(0, 0, draft.len())?),
                None => None,
            };
            let draft_probs = match &narrowed {
                Some(t) => DraftProbs::Model(t),
                None => DraftProbs::Implicit,
            };

            let result: VerificationResult =
                self.verifier
                    .verify(request_id, draft, draft_probs, logits, &sampling)?;
            report.proposed_tokens += draft.len();
            report.accepted_tokens += result.accepted_len;
            self.metrics
                .record_draft(draft.len() as u64, result.accepted_len as u64);
            scheduler.apply_verification(&result)?
        };

        if let Some(hidden) = output.hidden_states.get(&request_id) {
            self.drafter.observe_hidden(request_id, hidden);
        }
        if let Some(reason) = finish {
            self.drop_request(request_id);
            report.finished.push((request_id, reason));
        }
        Ok(())
    }
}
