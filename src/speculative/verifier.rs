//! Draft token verification by rejection sampling.
//!
//! The verifier guarantees that the accepted output distribution is
//! statistically identical to sampling from the target model alone, even
//! though draft tokens come from a cheaper approximation:
//!
//! - each draft token is accepted with probability
//!   `min(1, p_target / p_draft)`;
//! - the first rejection resamples one token from the renormalized
//!   residual `max(0, p_target - p_draft)` and terminates verification
//!   (later draft tokens are no longer correctly conditioned);
//! - full acceptance earns one bonus token sampled from the target's
//!   final-position distribution.
//!
//! Pattern-matched proposals carry an implicit draft probability of 1.0,
//! so their acceptance test reduces to `u < p_target`. Comparisons run in
//! log-space to stay stable for long drafts; a zero-probability target
//! entry rejects immediately rather than erroring.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SamplingConfig;
use crate::core::request::RequestId;
use crate::error::{Error, Result};

use super::tree::SpeculativeTree;

/// Outcome of verifying one request's draft.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    pub request_id: RequestId,
    /// Number of draft tokens accepted, `0..=len(draft)`.
    pub accepted_len: usize,
    /// The resampled token at the first rejection, or the bonus token
    /// when everything was accepted.
    pub resampled: u32,
    /// The full extension to append: accepted tokens plus `resampled`.
    pub tokens: Vec<u32>,
}

/// Draft-side probabilities for the acceptance test.
#[derive(Debug, Clone, Copy)]
pub enum DraftProbs<'a> {
    /// Pattern-matched proposal: implicit probability 1.0 per token.
    Implicit,
    /// Model-based proposal: probability rows `[len(draft), vocab]`.
    Model(&'a Tensor),
}

/// Rejection sampler over target logits.
#[derive(Debug)]
pub struct TokenVerifier {
    rng: StdRng,
}

impl Default for TokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenVerifier {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded variant for reproducible tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Verify a chain draft against target logits.
    ///
    /// `target_logits` must have `len(draft) + 1` rows: row `i` is the
    /// target distribution at draft position `i`, and the final row is
    /// the bonus-token distribution after the full draft.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on shape mismatches.
    pub fn verify(
        &mut self,
        request_id: RequestId,
        draft_tokens: &[u32],
        draft_probs: DraftProbs,
        target_logits: &Tensor,
        sampling: &SamplingConfig,
    ) -> Result<VerificationResult> {
        let target_rows = tensor_rows(target_logits)?;
        if target_rows.len() != draft_tokens.len() + 1 {
            return Err(Error::Config(format!(
                "expected {} target logit rows for a {}-token draft, got {}",
                draft_tokens.len() + 1,
                draft_tokens.len(),
                target_rows.len()
            )));
        }
        let draft_rows = match draft_probs {
            DraftProbs::Implicit => None,
            DraftProbs::Model(t) => {
                let rows = tensor_rows(t)?;
                if rows.len() != draft_tokens.len() {
                    return Err(Error::Config(format!(
                        "expected {} draft probability rows, got {}",
                        draft_tokens.len(),
                        rows.len()
                    )));
                }
                Some(rows)
            }
        };

        let mut tokens = Vec::with_capacity(draft_tokens.len() + 1);
        let mut accepted_len = 0usize;

        for (i, &draft_token) in draft_tokens.iter().enumerate() {
            let target_probs = target_distribution(&target_rows[i], sampling);

            if sampling.is_greedy() {
                let argmax = argmax(&target_probs) as u32;
                if argmax == draft_token {
                    tokens.push(draft_token);
                    accepted_len += 1;
                    continue;
                }
                tokens.push(argmax);
                return Ok(VerificationResult {
                    request_id,
                    accepted_len,
                    resampled: argmax,
                    tokens,
                });
            }

            let p_target = target_probs[draft_token as usize];
            let p_draft = draft_rows
                .as_ref()
                .map_or(1.0, |rows| rows[i][draft_token as usize]);

            if self.accepts(p_target, p_draft) {
                tokens.push(draft_token);
                accepted_len += 1;
                continue;
            }

            let resampled = self.sample_residual(&target_probs, draft_rows.as_deref(), i, draft_token);
            tokens.push(resampled);
            return Ok(VerificationResult {
                request_id,
                accepted_len,
                resampled,
                tokens,
            });
        }

        // Every draft token accepted: bonus from the final position.
        let bonus_probs = target_distribution(&target_rows[draft_tokens.len()], sampling);
        let bonus = if sampling.is_greedy() {
            argmax(&bonus_probs) as u32
        } else {
            self.sample_categorical(&bonus_probs) as u32
        };
        tokens.push(bonus);
        Ok(VerificationResult {
            request_id,
            accepted_len,
            resampled: bonus,
            tokens,
        })
    }

    /// Verify a speculation tree against per-node target logits.
    ///
    /// `target_logits` has `tree.len() + 1` rows: row 0 is the target
    /// distribution at the root (current context), and row `i + 1` the
    /// distribution computed at node `i`'s position. Verification walks
    /// depth-first: a rejected node discards its entire unverified
    /// subtree, its draft mass is removed from the level's residual, and
    /// the next sibling is tried. The result is the longest verified
    /// root-to-node chain plus a resampled (or bonus) token.
    pub fn verify_tree(
        &mut self,
        request_id: RequestId,
        tree: &SpeculativeTree,
        target_logits: &Tensor,
        sampling: &SamplingConfig,
    ) -> Result<VerificationResult> {
        let target_rows = tensor_rows(target_logits)?;
        if target_rows.len() != tree.len() + 1 {
            return Err(Error::Config(format!(
                "expected {} target logit rows for a {}-node tree, got {}",
                tree.len() + 1,
                tree.len(),
                target_rows.len()
            )));
        }

        let mut tokens = Vec::new();
        let mut accepted_len = 0usize;
        let mut cursor: Option<usize> = None;

        loop {
            let row_idx = cursor.map_or(0, |i| i + 1);
            let mut residual = target_distribution(&target_rows[row_idx], sampling);
            let children = tree.children(cursor);

            if children.is_empty() {
                // Verified down to a leaf: bonus token from this position.
                let bonus = if sampling.is_greedy() {
                    argmax(&residual) as u32
                } else {
                    self.sample_categorical(&residual) as u32
                };
                tokens.push(bonus);
                return Ok(VerificationResult {
                    request_id,
                    accepted_len,
                    resampled: bonus,
                    tokens,
                });
            }

            let mut accepted_child = None;
            for child_idx in children {
                let node = tree.node(child_idx);
                let p_target = residual[node.token as usize];

                let accept = if sampling.is_greedy() {
                    argmax(&residual) as u32 == node.token
                } else {
                    self.accepts(p_target, node.draft_prob)
                };
                if accept {
                    accepted_child = Some(child_idx);
                    break;
                }

                // Discard the subtree and fold the rejected candidate out
                // of the residual before trying the next sibling.
                residual[node.token as usize] =
                    (residual[node.token as usize] - node.draft_prob).max(0.0);
                renormalize(&mut residual);
            }

            match accepted_child {
                Some(child_idx) => {
                    tokens.push(tree.node(child_idx).token);
                    accepted_len += 1;
                    cursor = Some(child_idx);
                }
                None => {
                    let resampled = if sampling.is_greedy() {
                        argmax(&residual) as u32
                    } else {
                        self.sample_categorical(&residual) as u32
                    };
                    tokens.push(resampled);
                    return Ok(VerificationResult {
                        request_id,
                        accepted_len,
                        resampled,
                        tokens,
                    });
                }
            }
        }
    }

    /// Log-space acceptance test: accept with probability
    /// `min(1, p_target / p_draft)`.
    fn accepts(&mut self, p_target: f32, p_draft: f32) -> bool {
        if p_target <= 0.0 {
            // Zero-probability target entries reject immediately.
            return false;
        }
        if p_draft <= 0.0 {
            return true;
        }
        let log_ratio = (p_target as f64).ln() - (p_draft as f64).ln();
        if log_ratio >= 0.0 {
            return true;
        }
        let u: f64 = self.rng.gen();
        u.ln() < log_ratio
    }

    /// Sample from the renormalized residual `max(0, p_target - p_draft)`
    /// at the rejection point.
    fn sample_residual(
        &mut self,
        target_probs: &[f32],
        draft_rows: Option<&[Vec<f32>]>,
        position: usize,
        draft_token: u32,
    ) -> u32 {
        let mut residual: Vec<f32> = match draft_rows {
            Some(rows) => target_probs
                .iter()
                .zip(rows[position].iter())
                .map(|(&t, &d)| (t - d).max(0.0))
                .collect(),
            // Implicit one-hot draft: the residual is the target with the
            // draft token zeroed.
            None => {
                let mut probs = target_probs.to_vec();
                probs[draft_token as usize] = 0.0;
                probs
            }
        };

        if !renormalize(&mut residual) {
            // Degenerate residual: fall back to the target distribution
            // minus the rejected token.
            residual = target_probs.to_vec();
            residual[draft_token as usize] = 0.0;
            if !renormalize(&mut residual) {
                return argmax(target_probs) as u32;
            }
        }
        self.sample_categorical(&residual) as u32
    }

    fn sample_categorical(&mut self, probs: &[f32]) -> usize {
        let r: f64 = self.rng.gen();
        let mut cumulative = 0.0f64;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p as f64;
            if r < cumulative {
                return i;
            }
        }
        // Floating point slack: fall back to the heaviest entry.
        argmax(probs)
    }
}

/// Temperature-scaled softmax of one logits row. Greedy configs skip the
/// scaling entirely (the caller takes the argmax).
fn target_distribution(logits: &[f32], sampling: &SamplingConfig) -> Vec<f32> {
    if sampling.is_greedy() || sampling.temperature == 1.0 {
        softmax(logits)
    } else {
        let inv = 1.0 / sampling.temperature;
        let scaled: Vec<f32> = logits.iter().map(|&x| x * inv).collect();
        softmax(&scaled)
    }
}

/// Numerically stable softmax.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        // All -inf: degenerate uniform.
        return vec![1.0 / logits.len() as f32; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// Index of the largest entry.
pub(crate) fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Scale `probs` to sum to 1; false when the mass is (near) zero.
fn renormalize(probs: &mut [f32]) -> bool {
    let sum: f32 = probs.iter().sum();
    if sum <= f32::EPSILON {
        return false;
    }
    let inv = 1.0 / sum;
    for p in probs.iter_mut() {
        *p *= inv;
    }
    true
}

/// Extract a rank-2 tensor as f32 rows.
pub(crate) fn tensor_rows(t: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(t.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(rows: &[Vec<f32>]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    /// One row with all mass on `token`.
    fn peaked(vocab: usize, token: usize) -> Vec<f32> {
        let mut row = vec![0.0f32; vocab];
        row[token] = 50.0;
        row
    }

    #[test]
    fn test_accept_all_with_matching_peaks() {
        let mut verifier = TokenVerifier::with_seed(42);
        let target = logits(&[peaked(10, 5), peaked(10, 7), peaked(10, 2)]);

        let result = verifier
            .verify(
                1,
                &[5, 7],
                DraftProbs::Implicit,
                &target,
                &SamplingConfig::default(),
            )
            .unwrap();

        assert_eq!(result.accepted_len, 2);
        assert_eq!(result.resampled, 2);
        assert_eq!(result.tokens, vec![5, 7, 2]);
    }

    #[test]
    fn test_zero_probability_rejects_immediately() {
        let mut verifier = TokenVerifier::with_seed(7);
        let mut row = peaked(10, 3);
        row[5] = f32::NEG_INFINITY;
        let target = logits(&[row, peaked(10, 0)]);

        // Draft proposes token 5, which the target gives zero probability.
        let result = verifier
            .verify(
                1,
                &[5],
                DraftProbs::Implicit,
                &target,
                &SamplingConfig::default(),
            )
            .unwrap();

        assert_eq!(result.accepted_len, 0);
        assert_eq!(result.resampled, 3);
        assert_eq!(result.tokens, vec![3]);
    }

    #[test]
    fn test_shape_validation() {
        let mut verifier = TokenVerifier::new();
        let target = logits(&[peaked(10, 1), peaked(10, 2)]);
        // Three draft tokens require four rows.
        let result = verifier.verify(
            1,
            &[1, 2, 3],
            DraftProbs::Implicit,
            &target,
            &SamplingConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_greedy_accepts_on_argmax_match() {
        let mut verifier = TokenVerifier::with_seed(1);
        let target = logits(&[peaked(10, 4), peaked(10, 9), peaked(10, 6)]);

        let result = verifier
            .verify(
                1,
                &[4, 1],
                DraftProbs::Implicit,
                &target,
                &SamplingConfig::greedy(),
            )
            .unwrap();

        // Position 0 matches the argmax; position 1 does not.
        assert_eq!(result.accepted_len, 1);
        assert_eq!(result.tokens, vec![4, 9]);
    }

    #[test]
    fn test_reproducible_with_seed() {
        let target = logits(&[
            vec![0.5, 0.2, 0.1, 0.8],
            vec![0.1, 0.9, 0.3, 0.2],
            vec![0.4, 0.4, 0.4, 0.4],
        ]);
        let sampling = SamplingConfig::default();

        let mut a = TokenVerifier::with_seed(99);
        let mut b = TokenVerifier::with_seed(99);
        let ra = a.verify(1, &[3, 1], DraftProbs::Implicit, &target, &sampling).unwrap();
        let rb = b.verify(1, &[3, 1], DraftProbs::Implicit, &target, &sampling).unwrap();
        assert_eq!(ra, rb);
    }

    #[test]
    fn test_tree_walk_accepts_longest_chain() {
        let mut verifier = TokenVerifier::with_seed(5);
        // Chain tree 5 -> 7; target agrees with both then puts mass on 2.
        let tree = SpeculativeTree::from_chain(&[5, 7], None);
        let target = logits(&[peaked(10, 5), peaked(10, 7), peaked(10, 2)]);

        let result = verifier
            .verify_tree(1, &tree, &target, &SamplingConfig::default())
            .unwrap();
        assert_eq!(result.accepted_len, 2);
        assert_eq!(result.tokens, vec![5, 7, 2]);
    }

    #[test]
    fn test_tree_sibling_fallback() {
        let mut verifier = TokenVerifier::with_seed(5);
        // Two first-level candidates; the target only likes the second.
        let mut tree = SpeculativeTree::new();
        let a = tree.add_node(3, None, 1.0);
        let _a_child = tree.add_node(8, Some(a), 1.0);
        let b = tree.add_node(6, None, 1.0);
        let _ = b;

        let mut root_row = vec![f32::NEG_INFINITY; 10];
        root_row[6] = 50.0;
        let target = logits(&[
            root_row,
            peaked(10, 0),
            peaked(10, 0),
            peaked(10, 1),
        ]);

        let result = verifier
            .verify_tree(1, &tree, &target, &SamplingConfig::default())
            .unwrap();
        // Node a (token 3) rejects with zero target mass, discarding its
        // subtree; sibling b (token 6) accepts; b is a leaf, so the bonus
        // comes from b's row.
        assert_eq!(result.accepted_len, 1);
        assert_eq!(result.tokens[0], 6);
        assert_eq!(result.tokens.len(), 2);
    }
}
