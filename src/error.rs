//! Error types for spindle.

use thiserror::Error;

/// Result type alias for spindle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for spindle.
///
/// Variants fall into three groups the control loop treats differently:
/// recoverable resource pressure (`OutOfBlocks`, `CacheExhausted`) is retried
/// or deferred; caller mistakes (`InvalidSamplingParams`, `RequestNotFound`)
/// are surfaced immediately; invariant violations (`DoubleFree`,
/// `RefcountUnderflow`, `TentativeNotSuffix`) indicate a bug in the core
/// itself and panic in debug builds.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// Allocation failed even after eviction; the request cannot be
    /// scheduled this step.
    #[error("KV cache exhausted for request {0}")]
    CacheExhausted(u64),

    /// A request was deferred more times than the configured bound.
    #[error("request {0} failed after {1} deferrals: resources exhausted")]
    ResourceExhausted(u64, u32),

    /// A block was freed while still referenced, or freed twice.
    #[error("double free of block {0}")]
    DoubleFree(usize),

    /// A block's reference count was decremented below zero.
    #[error("refcount underflow on block {0}")]
    RefcountUnderflow(usize),

    /// The tentative region of a block table was not a strict suffix.
    #[error("tentative blocks of request {0} are not a suffix of its allocation")]
    TentativeNotSuffix(u64),

    /// Request not found in scheduler.
    #[error("request {0} not found")]
    RequestNotFound(u64),

    /// Invalid request state transition.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// Sampling parameters rejected at submission time.
    #[error("invalid sampling params: {0}")]
    InvalidSamplingParams(String),

    /// The model executor did not answer within the step deadline.
    #[error("model executor timed out after {0:?}")]
    ExecutorTimeout(std::time::Duration),

    /// The model executor worker thread is gone.
    #[error("model executor disconnected")]
    ExecutorDisconnected,

    /// A demoted block could not be promoted back to the fast tier in time.
    #[error("promotion of block {0} timed out")]
    PromotionTimeout(usize),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
