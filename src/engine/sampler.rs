//! Token sampling strategies.
//!
//! Selects the next token from a logits row:
//!
//! - **Temperature**: controls randomness (0 = greedy argmax)
//! - **Top-k**: limits choices to the k most likely tokens
//! - **Top-p (nucleus)**: limits choices to tokens covering p probability
//!   mass

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SamplingConfig;
use crate::speculative::verifier::{argmax, softmax};

/// Token sampler with configurable filtering.
#[derive(Debug)]
pub struct Sampler {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler from a request's sampling configuration.
    pub fn new(config: &SamplingConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded variant for reproducibility.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample one token from a logits row.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        if self.temperature == 0.0 {
            return argmax(logits) as u32;
        }

        let mut scaled: Vec<f32> = if self.temperature != 1.0 {
            let inv = 1.0 / self.temperature;
            logits.iter().map(|&x| x * inv).collect()
        } else {
            logits.to_vec()
        };

        if self.top_k > 0 && self.top_k < scaled.len() {
            apply_top_k(&mut scaled, self.top_k);
        }

        let mut probs = softmax(&scaled);
        if self.top_p < 1.0 {
            apply_top_p(&mut probs, self.top_p);
        }

        let r: f64 = self.rng.gen();
        let mut cumulative = 0.0f64;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p as f64;
            if r < cumulative {
                return i as u32;
            }
        }
        argmax(&probs) as u32
    }
}

/// Mask every logit outside the k largest.
fn apply_top_k(logits: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    for x in logits.iter_mut() {
        if *x < threshold {
            *x = f32::NEG_INFINITY;
        }
    }
}

/// Zero out the tail of the distribution past cumulative mass `p` and
/// renormalize. The most likely token always survives.
fn apply_top_p(probs: &mut [f32], p: f32) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut keep = vec![false; probs.len()];
    for &idx in &order {
        keep[idx] = true;
        cumulative += probs[idx];
        if cumulative >= p {
            break;
        }
    }

    let mut sum = 0.0f32;
    for (i, x) in probs.iter_mut().enumerate() {
        if !keep[i] {
            *x = 0.0;
        }
        sum += *x;
    }
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for x in probs.iter_mut() {
            *x *= inv;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_sampling() {
        let mut sampler = Sampler::new(&SamplingConfig::greedy());
        let logits = vec![0.1, 2.5, 0.3, 1.0];
        assert_eq!(sampler.sample(&logits), 1);
    }

    #[test]
    fn test_top_k_restricts_support() {
        let config = SamplingConfig {
            top_k: 2,
            ..Default::default()
        };
        let mut sampler = Sampler::with_seed(&config, 42);
        let logits = vec![5.0, 4.0, -10.0, -10.0];
        for _ in 0..50 {
            let token = sampler.sample(&logits);
            assert!(token == 0 || token == 1);
        }
    }

    #[test]
    fn test_top_p_keeps_head() {
        let config = SamplingConfig {
            top_p: 0.5,
            ..Default::default()
        };
        let mut sampler = Sampler::with_seed(&config, 7);
        // Token 0 holds well over half the mass.
        let logits = vec![10.0, 0.0, 0.0, 0.0];
        for _ in 0..50 {
            assert_eq!(sampler.sample(&logits), 0);
        }
    }

    #[test]
    fn test_seeded_reproducibility() {
        let config = SamplingConfig::default();
        let logits = vec![1.0, 1.1, 0.9, 1.05];
        let mut a = Sampler::with_seed(&config, 99);
        let mut b = Sampler::with_seed(&config, 99);
        for _ in 0..20 {
            assert_eq!(a.sample(&logits), b.sample(&logits));
        }
    }
}
