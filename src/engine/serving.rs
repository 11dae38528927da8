//! Serving engine.
//!
//! Owns the control loop and the front-end surface consumed by an API
//! layer: `submit` / `cancel` / `poll` / `step`. A single control thread
//! drives the scheduler, speculative engine, and cache manager — it is
//! the only writer of request state and cache metadata, so refcounts and
//! statuses always change together. The model executor runs behind its
//! worker-thread boundary; the loop suspends only while waiting on it
//! (and, transitively, on slow-tier promotions during resume).
//!
//! ```text
//!  submit() ──► Scheduler queue ──► step():
//!                                    sweep cancels/timeouts
//!                                    propose drafts
//!                                    schedule + allocate cache
//!                                    execute batch   (suspension point)
//!                                    verify / sample
//!                                    commit + finish
//!  poll()  ◄── incremental tokens ◄──┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::config::{EngineConfig, SamplingConfig};
use crate::core::request::{FinishReason, Priority, Request, RequestId};
use crate::engine::executor::{ExecutorHandle, ModelExecutor};
use crate::error::{Error, Result};
use crate::metrics::{CoreMetrics, MetricsSnapshot};
use crate::scheduler::Scheduler;
use crate::speculative::{
    HybridDrafter, NgramConfig, NgramProposer, SpeculativeEngine, StepReport, SuffixConfig,
    SuffixProposer,
};

/// Answer to a `poll` call.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResponse {
    /// Still generating; carries tokens produced since the last poll.
    Pending { new_tokens: Vec<u32> },
    /// Generation complete; the request is removed after this flush.
    Finished {
        output_tokens: Vec<u32>,
        reason: FinishReason,
    },
    /// The request failed (e.g. resources exhausted after deferral).
    Failed { message: String },
}

/// The execution core's top-level facade.
pub struct ServingEngine {
    config: EngineConfig,
    scheduler: Scheduler,
    spec: SpeculativeEngine,
    executor: ExecutorHandle,
    metrics: Arc<CoreMetrics>,
    /// Tokens already handed out per request.
    emitted: HashMap<RequestId, usize>,
    next_request_id: RequestId,
}

impl ServingEngine {
    /// Build an engine with the default pattern-matcher drafter (n-gram,
    /// then suffix automaton; no model-based fallback).
    pub fn new(config: EngineConfig, executor: Box<dyn ModelExecutor>) -> Result<Self> {
        let drafter = HybridDrafter::new(
            vec![
                Box::new(NgramProposer::new(NgramConfig::default())),
                Box::new(SuffixProposer::new(SuffixConfig::default())),
            ],
            None,
            config.speculative.min_pattern_tokens,
        );
        Self::with_drafter(config, executor, drafter)
    }

    /// Build an engine with a caller-assembled drafter (e.g. including an
    /// EAGLE draft model).
    pub fn with_drafter(
        config: EngineConfig,
        executor: Box<dyn ModelExecutor>,
        drafter: HybridDrafter,
    ) -> Result<Self> {
        let metrics = Arc::new(CoreMetrics::new());
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            &config.cache,
            Arc::clone(&metrics),
        );
        let spec = SpeculativeEngine::new(
            drafter,
            config.speculative.clone(),
            config.step_deadline(),
            Arc::clone(&metrics),
        );
        let executor = ExecutorHandle::spawn(executor)?;

        info!(
            block_size = config.cache.block_size,
            num_blocks = config.cache.num_blocks,
            speculative = config.speculative.enabled,
            "serving engine ready"
        );
        Ok(Self {
            config,
            scheduler,
            spec,
            executor,
            metrics,
            emitted: HashMap::new(),
            next_request_id: 1,
        })
    }

    /// Seed the verifier for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.spec = self.spec.with_seed(seed);
        self
    }

    // ========== Front-end surface ==========

    /// Submit a request. Sampling parameters are validated immediately;
    /// rejected requests never enter the scheduler.
    pub fn submit(
        &mut self,
        prompt_tokens: Vec<u32>,
        sampling: SamplingConfig,
        priority: Priority,
    ) -> Result<RequestId> {
        sampling.validate()?;
        if prompt_tokens.is_empty() {
            return Err(Error::InvalidSamplingParams(
                "prompt must contain at least one token".to_string(),
            ));
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut req = Request::with_priority(request_id, prompt_tokens, sampling.clone(), priority);
        if self.config.speculative.enabled {
            req.set_speculative_budget(self.config.speculative.num_speculative_tokens);
        }
        if let Some(timeout) = self.config.request_timeout() {
            req.set_deadline(Some(Instant::now() + timeout));
        }

        self.spec.register_request(request_id, &sampling);
        self.scheduler.add_request(req);
        self.emitted.insert(request_id, 0);
        Ok(request_id)
    }

    /// Record a cancellation; honored at the start of the next step, and
    /// any in-flight result for the request is discarded.
    pub fn cancel(&mut self, request_id: RequestId) -> Result<()> {
        self.scheduler.cancel(request_id)
    }

    /// Poll a request's progress. Finished requests are flushed and
    /// removed from the active set by this call.
    pub fn poll(&mut self, request_id: RequestId) -> Result<PollResponse> {
        let req = self
            .scheduler
            .get_request(request_id)
            .ok_or(Error::RequestNotFound(request_id))?;

        if req.status().is_finished() {
            let reason = req.finish_reason().unwrap_or(FinishReason::Failed);
            let output_tokens = req.output_token_ids().to_vec();
            let deferrals = req.deferrals();
            self.scheduler.remove_request(request_id);
            self.spec.drop_request(request_id);
            self.emitted.remove(&request_id);

            return Ok(match reason {
                FinishReason::Failed if deferrals > 0 => PollResponse::Failed {
                    message: Error::ResourceExhausted(request_id, deferrals).to_string(),
                },
                FinishReason::Failed => PollResponse::Failed {
                    message: "request failed: internal error".to_string(),
                },
                reason => PollResponse::Finished {
                    output_tokens,
                    reason,
                },
            });
        }

        let emitted = self.emitted.entry(request_id).or_insert(0);
        let output = req.output_token_ids();
        let new_tokens = output[(*emitted).min(output.len())..].to_vec();
        *emitted = output.len();
        Ok(PollResponse::Pending { new_tokens })
    }

    // ========== Control loop ==========

    /// Run one engine step. A single request's failure never aborts the
    /// loop; errors returned here are boundary failures (executor death
    /// or timeout).
    pub fn step(&mut self) -> Result<StepReport> {
        self.spec.step(&mut self.scheduler, &self.executor)
    }

    /// Whether any request is still waiting, running, or preempted.
    pub fn has_unfinished(&self) -> bool {
        self.scheduler.has_unfinished_requests()
    }

    /// Step until every submitted request finishes or `max_steps` is hit.
    pub fn run_to_completion(&mut self, max_steps: usize) -> Result<()> {
        for _ in 0..max_steps {
            if !self.has_unfinished() {
                return Ok(());
            }
            self.step()?;
        }
        if self.has_unfinished() {
            return Err(Error::Config(format!(
                "requests still unfinished after {max_steps} steps"
            )));
        }
        Ok(())
    }

    /// Read-only counters for an external collector.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}
