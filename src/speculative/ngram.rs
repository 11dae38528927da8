//! N-gram draft proposer.
//!
//! Finds the longest suffix of the request's token history that also
//! appears earlier in the same sequence, and proposes the tokens that
//! followed that earlier occurrence. Pure CPU, no model involved.
//!
//! The match uses a KMP-style failure function over the reversed token
//! sequence: reversing turns suffix matching into prefix matching, which
//! the failure function solves in one pass.

use crate::core::request::Request;
use crate::error::Result;

use super::proposer::{DraftProposal, DraftProposer};

/// Configuration for the n-gram proposer.
#[derive(Debug, Clone)]
pub struct NgramConfig {
    /// Minimum n-gram length for a valid match (inclusive).
    pub min_n: usize,
    /// Maximum n-gram length to consider (inclusive).
    pub max_n: usize,
}

impl Default for NgramConfig {
    fn default() -> Self {
        Self { min_n: 2, max_n: 5 }
    }
}

/// N-gram matcher over the request's own generated history.
///
/// Degrades to an empty proposal when no match of at least `min_n` tokens
/// exists; the step then decodes normally.
#[derive(Debug, Default)]
pub struct NgramProposer {
    config: NgramConfig,
}

impl NgramProposer {
    pub fn new(config: NgramConfig) -> Self {
        Self { config }
    }
}

impl DraftProposer for NgramProposer {
    fn propose(&mut self, req: &Request, max_tokens: usize) -> Result<DraftProposal> {
        let tokens = req.all_token_ids();
        let proposed =
            find_ngram_continuation(&tokens, self.config.min_n, self.config.max_n, max_tokens);
        let scores = vec![1.0; proposed.len()];
        Ok(DraftProposal {
            request_id: req.request_id(),
            tokens: proposed,
            scores,
            probs: None,
        })
    }

    fn name(&self) -> &'static str {
        "ngram"
    }
}

/// Find the longest suffix of `token_ids` (length within `[min_n, max_n]`)
/// that also occurs earlier, and return up to `k` tokens following its
/// earliest occurrence. Empty when no match exists.
pub fn find_ngram_continuation(token_ids: &[u32], min_n: usize, max_n: usize, k: usize) -> Vec<u32> {
    let total = token_ids.len();
    if total < min_n || k == 0 || max_n == 0 {
        return Vec::new();
    }

    // Work on the reversed sequence without materializing it.
    let reversed = |i: usize| -> u32 { token_ids[total - 1 - i] };

    // Bounded KMP failure function: lps[i] = longest proper prefix of
    // reversed[0..=i] that is also its suffix, capped at max_n.
    let mut lps = vec![0usize; max_n];
    let mut longest = 0usize;
    let mut best_position = 0usize;
    let mut prev = 0usize;
    let mut i = 1usize;

    while i < total {
        if reversed(prev) == reversed(i) {
            prev += 1;

            // >= keeps the latest reversed position, which maps to the
            // earliest occurrence in the original order and so maximizes
            // the tokens available after the match.
            if prev >= longest {
                longest = prev;
                best_position = i;
            }

            if i < max_n {
                lps[i] = prev;
            }
            if prev == max_n {
                prev = lps[max_n - 1];
            }
            i += 1;
        } else if prev != 0 {
            prev = lps[prev - 1];
        } else {
            i += 1;
        }
    }

    if longest < min_n {
        return Vec::new();
    }

    // Map the reversed match position back: the matched n-gram starts at
    // total - 1 - best_position, proposals start right after it.
    let start = total - 1 - best_position + longest;
    let take = k.min(total - start);
    token_ids[start..start + take].to_vec()
}
