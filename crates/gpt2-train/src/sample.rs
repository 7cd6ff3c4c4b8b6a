//! Autoregressive top-k sampling.

use candle_core::{Device, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{config_error, TrainError, TrainResult};
use crate::model::LanguageModel;

#[derive(Debug, Clone, Copy)]
pub struct SampleConfig {
    pub num_return_sequences: usize,
    /// Total sequence length including the prompt.
    pub max_length: usize,
    pub top_k: usize,
    /// Base seed; each rank samples with `seed + rank`.
    pub seed: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            num_return_sequences: 4,
            max_length: 32,
            top_k: 50,
            seed: 42,
        }
    }
}

/// Indices of the `k` largest probabilities (ties broken by lower index) and
/// the probabilities themselves.
fn top_k(probs: &[f32], k: usize) -> (Vec<usize>, Vec<f32>) {
    let k = k.min(probs.len());
    let by_prob = |a: &usize, b: &usize| probs[*b].total_cmp(&probs[*a]).then(a.cmp(b));
    let mut order: Vec<usize> = (0..probs.len()).collect();
    if k > 0 && k < order.len() {
        order.select_nth_unstable_by(k - 1, by_prob);
    }
    order.truncate(k);
    order.sort_unstable_by(by_prob);
    let weights = order.iter().map(|&i| probs[i]).collect();
    (order, weights)
}

/// Extend `prompt` into `num_return_sequences` sequences of `max_length`.
///
/// The context fed to the model is cropped to its block size. A prompt
/// longer than `max_length` is truncated.
pub fn generate(
    model: &dyn LanguageModel,
    prompt: &[u32],
    config: &SampleConfig,
    rank: usize,
    device: &Device,
) -> TrainResult<Vec<Vec<u32>>> {
    if prompt.is_empty() {
        return Err(config_error("sampling prompt must not be empty"));
    }
    if config.top_k == 0 {
        return Err(config_error("top_k must be greater than 0"));
    }
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(rank as u64));
    let mut seqs: Vec<Vec<u32>> = vec![prompt.to_vec(); config.num_return_sequences];
    let block = model.block_size();

    while seqs.first().is_some_and(|s| s.len() < config.max_length) {
        let len = seqs[0].len();
        let start = len.saturating_sub(block);
        let ctx: Vec<u32> = seqs.iter().flat_map(|s| s[start..].iter().copied()).collect();
        let input = Tensor::from_vec(ctx, (seqs.len(), len - start), device)?;

        let logits = model.forward(&input)?;
        let last = logits.narrow(1, len - start - 1, 1)?.squeeze(1)?;
        let probs = candle_nn::ops::softmax(&last, D::Minus1)?.to_vec2::<f32>()?;

        for (seq, row) in seqs.iter_mut().zip(probs) {
            let (indices, weights) = top_k(&row, config.top_k);
            let dist = WeightedIndex::new(&weights)
                .map_err(|e| TrainError::Candle(format!("sampling distribution: {}", e)))?;
            seq.push(indices[dist.sample(&mut rng)] as u32);
        }
    }
    for seq in &mut seqs {
        seq.truncate(config.max_length);
    }
    Ok(seqs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_gpt_config;
    use crate::model::Gpt;
    use candle_core::Result;

    /// Logits favour `last token + 1`.
    struct Counter {
        vocab: usize,
        block: usize,
    }

    impl LanguageModel for Counter {
        fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
            let (b, t) = tokens.dims2()?;
            if t > self.block {
                candle_core::bail!("context {} exceeds block {}", t, self.block);
            }
            let ids = tokens.to_vec2::<u32>()?;
            let mut data = Vec::with_capacity(b * t * self.vocab);
            for row in ids {
                for tok in row {
                    let mut logits = vec![-30f32; self.vocab];
                    logits[(tok as usize + 1) % self.vocab] = 30.0;
                    data.extend(logits);
                }
            }
            Tensor::from_vec(data, (b, t, self.vocab), tokens.device())
        }

        fn block_size(&self) -> usize {
            self.block
        }
    }

    #[test]
    fn test_top_k_orders_and_truncates() {
        let (idx, w) = top_k(&[0.1, 0.4, 0.1, 0.4], 3);
        assert_eq!(idx, vec![1, 3, 0]);
        assert_eq!(w, vec![0.4, 0.4, 0.1]);
    }

    #[test]
    fn test_top_k_matches_full_sort_on_wide_rows() {
        let probs: Vec<f32> = (0..1000).map(|i| ((i * 7919) % 997) as f32 / 997.0).collect();
        let mut sorted: Vec<usize> = (0..probs.len()).collect();
        sorted.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));
        for k in [1, 50, 999, 1000, 2000] {
            let (idx, w) = top_k(&probs, k);
            let expected = &sorted[..k.min(probs.len())];
            assert_eq!(idx, expected);
            assert_eq!(w, expected.iter().map(|&i| probs[i]).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_generate_lengths_and_crop() -> TrainResult<()> {
        let model = Counter { vocab: 10, block: 4 };
        let cfg = SampleConfig {
            num_return_sequences: 3,
            max_length: 12,
            top_k: 1,
            seed: 0,
        };
        let out = generate(&model, &[5, 6], &cfg, 0, &Device::Cpu)?;
        assert_eq!(out.len(), 3);
        for seq in out {
            assert_eq!(seq, vec![5, 6, 7, 8, 9, 0, 1, 2, 3, 4, 5, 6]);
        }
        Ok(())
    }

    #[test]
    fn test_seed_is_per_rank_and_reproducible() -> TrainResult<()> {
        let (model, _varmap) = Gpt::build(&tiny_gpt_config(), &Device::Cpu, 3)?;
        let cfg = SampleConfig {
            num_return_sequences: 2,
            max_length: 16,
            top_k: 50,
            seed: 42,
        };
        let a = generate(&model, &[1, 2, 3], &cfg, 0, &Device::Cpu)?;
        let b = generate(&model, &[1, 2, 3], &cfg, 0, &Device::Cpu)?;
        let c = generate(&model, &[1, 2, 3], &cfg, 1, &Device::Cpu)?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().flatten().all(|&t| (t as usize) < 64));
        Ok(())
    }

    #[test]
    fn test_prompt_longer_than_max_length_is_truncated() -> TrainResult<()> {
        let model = Counter { vocab: 10, block: 8 };
        let cfg = SampleConfig {
            max_length: 2,
            ..Default::default()
        };
        let out = generate(&model, &[1, 2, 3], &cfg, 0, &Device::Cpu)?;
        assert_eq!(out, vec![vec![1, 2]; 4]);

        let exact = SampleConfig { max_length: 3, ..cfg };
        let out = generate(&model, &[1, 2, 3], &exact, 0, &Device::Cpu)?;
        assert_eq!(out, vec![vec![1, 2, 3]; 4]);
        Ok(())
    }
}
