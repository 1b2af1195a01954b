//! Next-token selection from logits
//!
//! One decoding step turns a row of logits into a token:
//!
//! ```text
//! logits → ÷ temperature → top-k filter → softmax → categorical draw
//! ```
//!
//! ## Temperature
//!
//! Dividing logits by `T` sharpens (`T < 1`) or flattens (`T > 1`) the
//! distribution. `T = 1` samples from the model as trained.
//!
//! ## Top-k
//!
//! Only the `k` largest logits stay eligible; the rest are pushed down to
//! [`FILTERED_LOGIT`], whose softmax weight underflows to zero. The cutoff is
//! the k-th largest *value*, so logits tied with it all survive and slightly
//! more than `k` candidates may remain.

use crate::config::DecodeParams;
use crate::error::{Error, Result};
use crate::TokenId;
use rand::Rng;
use rand_distr::weighted::WeightedIndex;
use rand_distr::Distribution;

/// Stand-in for negative infinity that keeps the arithmetic finite
pub const FILTERED_LOGIT: f32 = -1e10;

/// Divide every logit by `temperature`
pub fn apply_temperature(logits: &mut [f32], temperature: f32) {
    for logit in logits.iter_mut() {
        *logit /= temperature;
    }
}

/// Keep the `k` largest logits (plus ties), filter the rest
///
/// `k == 0` disables filtering, as does `k >= logits.len()`.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }

    let mut sorted = logits.to_vec();
    let (_, kth, _) = sorted.select_nth_unstable_by(k - 1, |a, b| b.total_cmp(a));
    let threshold = *kth;

    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = FILTERED_LOGIT;
        }
    }
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Shannon entropy in nats
pub fn entropy(probs: &[f32]) -> f32 {
    probs
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.ln())
        .sum()
}

/// Draw an index with probability proportional to its weight
pub fn sample_categorical<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> Result<TokenId> {
    let dist = WeightedIndex::new(probs)
        .map_err(|e| Error::InvalidInput(format!("cannot sample from distribution: {e}")))?;
    Ok(dist.sample(rng) as TokenId)
}

/// Pick the next token from one row of logits
pub fn sample_next_token<R: Rng + ?Sized>(
    logits: &[f32],
    params: &DecodeParams,
    rng: &mut R,
) -> Result<TokenId> {
    if logits.is_empty() {
        return Err(Error::InvalidInput("empty logits row".into()));
    }

    let mut scaled = logits.to_vec();
    apply_temperature(&mut scaled, params.temperature);
    top_k_filter(&mut scaled, params.top_k);
    sample_categorical(&softmax(&scaled), rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn surviving(logits: &[f32]) -> usize {
        logits.iter().filter(|&&x| x > FILTERED_LOGIT).count()
    }

    #[test]
    fn test_top_k_keeps_k_largest() {
        let mut logits = vec![0.5, 3.0, -1.0, 2.0, 1.0];
        top_k_filter(&mut logits, 2);
        assert_eq!(logits, vec![FILTERED_LOGIT, 3.0, FILTERED_LOGIT, 2.0, FILTERED_LOGIT]);
        assert_eq!(surviving(&logits), 2);
    }

    #[test]
    fn test_top_k_admits_ties_at_cutoff() {
        let mut logits = vec![1.0, 2.0, 2.0, 2.0, 0.0];
        top_k_filter(&mut logits, 2);
        assert_eq!(surviving(&logits), 3);
        assert_eq!(logits[0], FILTERED_LOGIT);
        assert_eq!(logits[4], FILTERED_LOGIT);
    }

    #[test]
    fn test_top_k_disabled() {
        let original = vec![0.1, 0.2, 0.3];
        let mut logits = original.clone();
        top_k_filter(&mut logits, 0);
        assert_eq!(logits, original);
        top_k_filter(&mut logits, 3);
        assert_eq!(logits, original);
    }

    #[test]
    fn test_top_k_count_over_random_rows() {
        let mut rng = StdRng::seed_from_u64(7);
        for k in [1, 5, 40] {
            let mut logits: Vec<f32> = (0..100).map(|_| rng.random_range(-5.0..5.0)).collect();
            top_k_filter(&mut logits, k);
            assert!(surviving(&logits) >= k);
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0, FILTERED_LOGIT]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(probs[3], 0.0);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_lower_temperature_lowers_entropy() {
        let logits = vec![2.0, 1.0, 0.5, -1.0, 0.0];
        let mut previous = f32::INFINITY;
        for temperature in [2.0, 1.0, 0.5, 0.25] {
            let mut scaled = logits.clone();
            apply_temperature(&mut scaled, temperature);
            let h = entropy(&softmax(&scaled));
            assert!(h < previous, "entropy did not drop at T={temperature}");
            previous = h;
        }
    }

    #[test]
    fn test_sample_never_picks_filtered_token() {
        let mut rng = StdRng::seed_from_u64(42);
        let params = DecodeParams::new(1, 1.0, 2);
        let logits = [0.0, 5.0, 4.9, 0.1, 0.2];
        for _ in 0..1000 {
            let token = sample_next_token(&logits, &params, &mut rng).unwrap();
            assert!(token == 1 || token == 2, "sampled filtered token {token}");
        }
    }

    #[test]
    fn test_sample_follows_distribution() {
        let mut rng = StdRng::seed_from_u64(3);
        let probs = [0.8, 0.2];
        let mut zeros = 0;
        for _ in 0..10_000 {
            if sample_categorical(&probs, &mut rng).unwrap() == 0 {
                zeros += 1;
            }
        }
        assert!((7_500..8_500).contains(&zeros), "got {zeros}");
    }

    #[test]
    fn test_empty_logits_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = DecodeParams::new(1, 1.0, 0);
        assert!(sample_next_token(&[], &params, &mut rng).is_err());
    }
}
