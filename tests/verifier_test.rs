//! Integration tests for the TokenVerifier: rejection-sampling contract,
//! distribution soundness, and tree verification.

use candle_core::{Device, Tensor};
use spindle::config::SamplingConfig;
use spindle::{DraftProbs, SpeculativeTree, TokenVerifier};

fn logits(rows: &[Vec<f32>]) -> Tensor {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
}

fn peaked(vocab: usize, token: usize) -> Vec<f32> {
    let mut row = vec![0.0f32; vocab];
    row[token] = 50.0;
    row
}

fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// The worked scenario: draft [5, 7, 2, 9]; the target agrees with 5 and
/// 7, assigns zero probability to 2 (immediate rejection), and resamples
/// 3. Tokens after the rejection point are discarded no matter what.
#[test]
fn test_rejection_scenario() {
    let mut verifier = TokenVerifier::with_seed(42);

    let mut rejected_row = peaked(16, 3);
    rejected_row[2] = f32::NEG_INFINITY;
    let target = logits(&[
        peaked(16, 5),
        peaked(16, 7),
        rejected_row,
        peaked(16, 9), // never reached
        peaked(16, 1), // bonus row, never reached
    ]);

    let result = verifier
        .verify(
            1,
            &[5, 7, 2, 9],
            DraftProbs::Implicit,
            &target,
            &SamplingConfig::default(),
        )
        .unwrap();

    assert_eq!(result.accepted_len, 2);
    assert_eq!(result.resampled, 3);
    assert_eq!(result.tokens, vec![5, 7, 3]);
}

/// Full acceptance earns exactly one bonus token from the final position.
#[test]
fn test_full_acceptance_bonus() {
    let mut verifier = TokenVerifier::with_seed(7);
    let target = logits(&[peaked(8, 1), peaked(8, 2), peaked(8, 6)]);

    let result = verifier
        .verify(
            1,
            &[1, 2],
            DraftProbs::Implicit,
            &target,
            &SamplingConfig::default(),
        )
        .unwrap();

    assert_eq!(result.accepted_len, 2);
    assert_eq!(result.resampled, 6);
    assert_eq!(result.tokens, vec![1, 2, 6]);
}

/// Model-based draft probabilities participate in the acceptance ratio:
/// a draft that overclaims a token the target dislikes gets rejected.
#[test]
fn test_model_draft_probs_rejection() {
    let mut verifier = TokenVerifier::with_seed(11);

    // Draft model claimed token 0 with probability ~1; the target
    // assigns it ~0 and prefers token 4.
    let draft_probs = Tensor::from_vec(
        {
            let mut row = vec![0.001f32; 8];
            row[0] = 0.993;
            row
        },
        (1, 8),
        &Device::Cpu,
    )
    .unwrap();
    let mut target_row = peaked(8, 4);
    target_row[0] = f32::NEG_INFINITY;
    let target = logits(&[target_row, peaked(8, 5)]);

    let result = verifier
        .verify(
            1,
            &[0],
            DraftProbs::Model(&draft_probs),
            &target,
            &SamplingConfig::default(),
        )
        .unwrap();

    assert_eq!(result.accepted_len, 0);
    assert_eq!(result.resampled, 4);
}

/// Greedy sampling accepts a draft token exactly when it is the argmax.
#[test]
fn test_greedy_verification() {
    let mut verifier = TokenVerifier::with_seed(0);
    let target = logits(&[peaked(8, 3), peaked(8, 5), peaked(8, 7)]);

    let result = verifier
        .verify(
            1,
            &[3, 1],
            DraftProbs::Implicit,
            &target,
            &SamplingConfig::greedy(),
        )
        .unwrap();

    assert_eq!(result.accepted_len, 1);
    assert_eq!(result.tokens, vec![3, 5]);
}

/// Statistical soundness: the accepted token at position 0 follows the
/// target marginal exactly, regardless of the draft. Chi-squared over a
/// small vocabulary with a seeded RNG.
#[test]
fn test_acceptance_marginal_matches_target() {
    let vocab = 8;
    let row = vec![2.0f32, 1.0, 0.0, 1.5, 0.5, 1.0, 0.0, 0.5];
    let expected = softmax(&row);
    let trials = 20_000usize;

    let mut verifier = TokenVerifier::with_seed(12345);
    let mut counts = vec![0usize; vocab];
    let sampling = SamplingConfig::default();

    for _ in 0..trials {
        let target = logits(&[row.clone(), vec![0.0; vocab]]);
        let result = verifier
            .verify(1, &[2], DraftProbs::Implicit, &target, &sampling)
            .unwrap();
        counts[result.tokens[0] as usize] += 1;
    }

    let mut chi2 = 0.0f64;
    for i in 0..vocab {
        let exp = expected[i] as f64 * trials as f64;
        if exp > 0.0 {
            let diff = counts[i] as f64 - exp;
            chi2 += diff * diff / exp;
        }
    }
    // 7 degrees of freedom; 35 is far beyond the 0.1% critical value.
    assert!(chi2 < 35.0, "chi2 = {chi2}, counts = {counts:?}");
}

/// Tree verification accepts the longest verified root-to-node chain and
/// discards a rejected node's whole subtree.
#[test]
fn test_tree_verification_longest_chain() {
    let mut verifier = TokenVerifier::with_seed(3);

    // Two candidate chains from the root: [4, 5] and [9].
    let mut tree = SpeculativeTree::new();
    let a = tree.add_node(4, None, 1.0);
    let a_child = tree.add_node(5, Some(a), 1.0);
    let _b = tree.add_node(9, None, 1.0);

    // Root row likes 4; node-a row likes 5; deeper rows give the bonus.
    let target = logits(&[
        peaked(16, 4),      // root position
        peaked(16, 5),      // at node a
        peaked(16, 11),     // at node a_child (bonus row)
        peaked(16, 0),      // at node b, unused
    ]);

    let result = verifier
        .verify_tree(1, &tree, &target, &SamplingConfig::default())
        .unwrap();

    assert_eq!(result.accepted_len, 2);
    assert_eq!(result.tokens, vec![4, 5, 11]);
    let _ = a_child;
}

/// A rejection at the root falls through to the sibling candidate.
#[test]
fn test_tree_sibling_survives_rejection() {
    let mut verifier = TokenVerifier::with_seed(3);

    let mut tree = SpeculativeTree::new();
    let a = tree.add_node(2, None, 1.0);
    let _deep = tree.add_node(3, Some(a), 1.0);
    let _b = tree.add_node(6, None, 1.0);

    let mut root = peaked(16, 6);
    root[2] = f32::NEG_INFINITY;
    let target = logits(&[
        root,
        peaked(16, 0), // at rejected node a: unreachable
        peaked(16, 0), // at its child: unreachable
        peaked(16, 9), // at node b: bonus row
    ]);

    let result = verifier
        .verify_tree(1, &tree, &target, &SamplingConfig::default())
        .unwrap();

    assert_eq!(result.accepted_len, 1);
    assert_eq!(result.tokens, vec![6, 9]);
}

/// Shape mismatches are caller errors, not panics.
#[test]
fn test_row_count_mismatch_is_error() {
    let mut verifier = TokenVerifier::new();
    let target = logits(&[peaked(8, 0), peaked(8, 1)]);
    assert!(verifier
        .verify(
            1,
            &[0, 1, 2],
            DraftProbs::Implicit,
            &target,
            &SamplingConfig::default(),
        )
        .is_err());
}
