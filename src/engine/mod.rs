//! Engine layer.
//!
//! This module contains:
//! - ServingEngine: the front-end facade and control loop
//! - ModelExecutor / ExecutorHandle: the forward-pass boundary
//! - Sampler: token selection for non-speculative steps

pub mod executor;
pub mod sampler;
pub mod serving;

pub use executor::{ExecutorHandle, ModelExecutor, StepOutput};
pub use sampler::Sampler;
pub use serving::{PollResponse, ServingEngine};
