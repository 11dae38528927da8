//! Speculative decoding.
//!
//! Draft-verify speculation for faster generation:
//!
//! 1. **Draft**: a cheap proposer (pattern matcher or small draft model)
//!    suggests up to K continuation tokens.
//! 2. **Verify**: the target model scores the pending token and all K
//!    drafts in one batched forward pass.
//! 3. **Rejection sampling**: each draft is accepted or rejected against
//!    the target distribution; the output distribution stays exactly the
//!    target model's.
//!
//! ```text
//! Draft (K=4):     [context] -> d1 -> d2 -> d3 -> d4
//! Target verify:   one forward pass over K+1 positions
//! Commit:          accept d1, d2; reject d3; resample -> d1, d2, r
//! ```

pub mod eagle;
pub mod engine;
pub mod hybrid;
pub mod ngram;
pub mod proposer;
pub mod suffix;
pub mod tree;
pub mod verifier;

pub use eagle::{EagleConfig, EagleProposer};
pub use engine::{SpeculativeEngine, StepReport};
pub use hybrid::HybridDrafter;
pub use ngram::{NgramConfig, NgramProposer};
pub use proposer::{DraftProposal, DraftProposer};
pub use suffix::{SuffixConfig, SuffixProposer};
pub use tree::{SpeculativeTree, TreeNode};
pub use verifier::{DraftProbs, TokenVerifier, VerificationResult};
