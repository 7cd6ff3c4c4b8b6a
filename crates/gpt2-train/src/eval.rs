//! Periodic evaluation: held-out loss and HellaSwag accuracy.
//!
//! Both run on every rank and reduce across the group; only the master
//! reports.

use candle_core::Device;

use crate::data::{RenderedExample, ShardedLoader};
use crate::dist::{Collective, ReduceOp};
use crate::error::{config_error, TrainResult};
use crate::model::{most_likely_row, LanguageModel};

/// Mean loss over `steps` validation batches, averaged across ranks.
///
/// The loader is reset first so every evaluation sees the same batches.
pub fn validation_loss(
    model: &dyn LanguageModel,
    loader: &mut ShardedLoader,
    steps: usize,
    collective: &dyn Collective,
) -> TrainResult<f64> {
    if steps == 0 {
        return Err(config_error("val_loss_steps must be greater than 0"));
    }
    loader.reset()?;
    let mut accum = 0.0f64;
    for _ in 0..steps {
        let (x, y) = loader.next_batch()?;
        let (_logits, loss) = model.forward_with_loss(&x, &y)?;
        accum += loss.to_scalar::<f32>()? as f64 / steps as f64;
    }
    collective.all_reduce_scalar(accum, ReduceOp::Avg)
}

/// Correct/total counts summed over all ranks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkResult {
    pub correct: usize,
    pub total: usize,
}

impl BenchmarkResult {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Every candidate row must fit in the model context.
pub fn check_examples_fit(examples: &[RenderedExample], block_size: usize) -> TrainResult<()> {
    match examples.iter().enumerate().find(|(_, ex)| ex.width() > block_size) {
        Some((i, ex)) => Err(config_error(format!(
            "HellaSwag example {} is {} tokens wide, block size is only {}",
            i,
            ex.width(),
            block_size
        ))),
        None => Ok(()),
    }
}

/// Score examples `i` with `i % world_size == rank` and reduce the counts.
pub fn hellaswag_accuracy(
    model: &dyn LanguageModel,
    examples: &[RenderedExample],
    device: &Device,
    collective: &dyn Collective,
) -> TrainResult<BenchmarkResult> {
    let (rank, world) = (collective.rank(), collective.world_size());
    let mut correct = 0usize;
    let mut total = 0usize;
    for (i, example) in examples.iter().enumerate() {
        if i % world != rank {
            continue;
        }
        let (tokens, mask) = example.to_tensors(device)?;
        let logits = model.forward(&tokens)?;
        let pred = most_likely_row(&tokens, &mask, &logits)?;
        total += 1;
        if pred == example.label {
            correct += 1;
        }
    }

    let mut counts = [correct as f64, total as f64];
    collective.all_reduce_f64(&mut counts, ReduceOp::Sum)?;
    let result = BenchmarkResult {
        correct: counts[0].round() as usize,
        total: counts[1].round() as usize,
    };
    if result.total == 0 {
        tracing::warn!("HellaSwag evaluation saw no examples");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::{LocalGroup, SingleProcess};
    use candle_core::{Result, Tensor};

    /// Always predicts token `target` with high confidence.
    struct Constant {
        vocab: usize,
        target: u32,
    }

    impl LanguageModel for Constant {
        fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
            let (b, t) = tokens.dims2()?;
            let mut row = vec![0f32; self.vocab];
            row[self.target as usize] = 8.0;
            let data: Vec<f32> = (0..b * t).flat_map(|_| row.clone()).collect();
            Tensor::from_vec(data, (b, t, self.vocab), tokens.device())
        }

        fn block_size(&self) -> usize {
            64
        }
    }

    fn example(label: usize) -> RenderedExample {
        // candidate `label` continues with token 3, the others with token 1
        let tokens = (0..4)
            .map(|i| vec![2, if i == label { 3 } else { 1 }, 0])
            .collect();
        let mask = (0..4).map(|_| vec![0, 1, 0]).collect();
        RenderedExample {
            tokens,
            mask,
            label,
        }
    }

    #[test]
    fn test_constant_model_scores_designed_examples() -> TrainResult<()> {
        let model = Constant { vocab: 5, target: 3 };
        let examples: Vec<_> = (0..8).map(|i| example(i % 4)).collect();
        let r = hellaswag_accuracy(&model, &examples, &Device::Cpu, &SingleProcess)?;
        assert_eq!(r, BenchmarkResult { correct: 8, total: 8 });
        assert_eq!(r.accuracy(), 1.0);

        let wrong = Constant { vocab: 5, target: 4 };
        let r = hellaswag_accuracy(&wrong, &examples, &Device::Cpu, &SingleProcess)?;
        assert_eq!(r.total, 8);
        // all rows tie, so row 0 wins: correct only where label == 0
        assert_eq!(r.correct, 2);
        Ok(())
    }

    #[test]
    fn test_striped_across_ranks() {
        let handles: Vec<_> = LocalGroup::create(3)
            .into_iter()
            .map(|g| {
                std::thread::spawn(move || {
                    let model = Constant { vocab: 5, target: 3 };
                    let examples: Vec<_> = (0..10).map(|i| example(i % 4)).collect();
                    hellaswag_accuracy(&model, &examples, &Device::Cpu, &g).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), BenchmarkResult { correct: 10, total: 10 });
        }
    }

    #[test]
    fn test_examples_wider_than_block_are_rejected() {
        let examples = vec![example(0), example(1)];
        assert!(check_examples_fit(&examples, 3).is_ok());
        let err = check_examples_fit(&examples, 2).unwrap_err();
        assert!(matches!(err, crate::error::TrainError::Config(_)));
        assert!(err.to_string().contains("example 0"));
    }

    #[test]
    fn test_empty_benchmark_has_zero_accuracy() -> TrainResult<()> {
        let model = Constant { vocab: 5, target: 3 };
        let r = hellaswag_accuracy(&model, &[], &Device::Cpu, &SingleProcess)?;
        assert_eq!(r.accuracy(), 0.0);
        Ok(())
    }
}
