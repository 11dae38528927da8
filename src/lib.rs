//! spindle: the execution core of an LLM inference serving engine.
//!
//! This crate implements the three tightly-coupled pieces at the heart of
//! a serving engine:
//! - a paged KV cache with prefix sharing, lazy eviction, and tiered
//!   placement
//! - a continuous batching scheduler with priorities, preemption, and
//!   chunked prefill
//! - a speculative decoding subsystem (pattern and draft-model proposers,
//!   rejection-sampling verification, tree speculation)
//!
//! The neural forward pass, tokenization, and the wire API are external
//! collaborators; the core talks to the model through the
//! [`ModelExecutor`] interface alone.

pub mod config;
pub mod error;
pub mod metrics;

pub mod core;
pub mod engine;
pub mod scheduler;
pub mod speculative;

pub use config::{
    AllocationStrategy, CacheConfig, EngineConfig, EvictionPolicy, SamplingConfig,
    SchedulerConfig, SpeculativeConfig,
};
pub use engine::{ExecutorHandle, ModelExecutor, PollResponse, Sampler, ServingEngine, StepOutput};
pub use error::{Error, Result};
pub use metrics::{CoreMetrics, MetricsSnapshot};
pub use scheduler::{ScheduledDecode, ScheduledPrefill, Scheduler, SchedulerOutput};
pub use speculative::{
    DraftProbs, DraftProposal, DraftProposer, HybridDrafter, NgramProposer, SpeculativeEngine,
    SpeculativeTree, SuffixProposer, TokenVerifier, VerificationResult,
};
