//! Draft-model proposer.
//!
//! Wraps a small auxiliary draft model behind the same [`ModelExecutor`]
//! interface as the target model, with its own weight set and worker.
//! Tokens are drafted autoregressively, one forward pass per draft
//! position, conditioned on the target model's hidden states observed
//! after the previous step. The draft model's own softmax rows ride along
//! in the proposal so the verifier can run exact rejection sampling.
//!
//! This is the only proposer whose `propose` suspends (it waits on the
//! draft executor); pattern matchers never block.

use std::collections::HashMap;
use std::time::Duration;

use candle_core::{Device, Tensor};

use crate::core::request::{Request, RequestId};
use crate::engine::executor::ExecutorHandle;
use crate::error::{Error, Result};
use crate::scheduler::{ScheduledDecode, SchedulerOutput};

use super::proposer::{DraftProposal, DraftProposer};
use super::verifier::{argmax, softmax, tensor_rows};

/// Configuration for the draft-model proposer.
#[derive(Debug, Clone)]
pub struct EagleConfig {
    /// Tokens drafted per proposal (upper bound; the per-request budget
    /// may grant fewer).
    pub num_tokens: usize,
    /// Deadline for each draft-model forward pass.
    pub step_deadline: Duration,
}

impl Default for EagleConfig {
    fn default() -> Self {
        Self {
            num_tokens: 4,
            step_deadline: Duration::from_secs(10),
        }
    }
}

/// Autoregressive draft proposer backed by a separate-weight model.
pub struct EagleProposer {
    executor: ExecutorHandle,
    config: EagleConfig,
    /// Target hidden states per request, from the previous step.
    hidden: HashMap<RequestId, Tensor>,
}

impl EagleProposer {
    /// Create a proposer around a spawned draft-model executor.
    pub fn new(executor: ExecutorHandle, config: EagleConfig) -> Self {
        Self {
            executor,
            config,
            hidden: HashMap::new(),
        }
    }

    /// Score `context` with the draft model, returning the next-token
    /// distribution at the final position.
    fn score(&self, request_id: RequestId, context: &[u32]) -> Result<Vec<f32>> {
        let mut batch = SchedulerOutput::new();
        batch.num_decode_tokens = context.len();
        batch.decode.push(ScheduledDecode {
            request_id,
            input_tokens: context.to_vec(),
            draft_tokens: Vec::new(),
        });
        if let Some(hidden) = self.hidden.get(&request_id) {
            batch.hidden_states.insert(request_id, hidden.clone());
        }

        let output = self.executor.execute(batch, self.config.step_deadline)?;
        let logits = output
            .logits
            .get(&request_id)
            .ok_or_else(|| Error::Config(format!("draft executor returned no logits for request {request_id}")))?;
        let rows = tensor_rows(logits)?;
        let last = rows
            .last()
            .ok_or_else(|| Error::Config("draft executor returned empty logits".to_string()))?;
        Ok(softmax(last))
    }
}

impl DraftProposer for EagleProposer {
    fn propose(&mut self, req: &Request, max_tokens: usize) -> Result<DraftProposal> {
        let k = max_tokens.min(self.config.num_tokens);
        if k == 0 {
            return Ok(DraftProposal::empty(req.request_id()));
        }

        let mut context = req.all_token_ids();
        let mut tokens = Vec::with_capacity(k);
        let mut scores = Vec::with_capacity(k);
        let mut prob_rows = Vec::with_capacity(k);

        for _ in 0..k {
            let probs = self.score(req.request_id(), &context)?;
            // Greedy draft pick; the full distribution is kept for the
            // verifier's acceptance test.
            let token = argmax(&probs) as u32;
            scores.push(probs[token as usize]);
            tokens.push(token);
            context.push(token);

            let vocab = probs.len();
            prob_rows.push(Tensor::from_vec(probs, vocab, &Device::Cpu)?);
        }

        let probs = Tensor::stack(&prob_rows, 0)?;
        Ok(DraftProposal {
            request_id: req.request_id(),
            tokens,
            scores,
            probs: Some(probs),
        })
    }

    fn observe_hidden(&mut self, request_id: RequestId, hidden: &Tensor) {
        self.hidden.insert(request_id, hidden.clone());
    }

    fn on_request_finished(&mut self, request_id: RequestId) {
        self.hidden.remove(&request_id);
    }

    fn name(&self) -> &'static str {
        "eagle"
    }
}
