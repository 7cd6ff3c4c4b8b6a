//! Warmup + cosine learning rate schedule with a floor.

use crate::error::{config_error, TrainResult};

/// Learning rate as a function of the optimizer step.
///
/// - Warmup (`step < warmup_steps`): `max_lr * (step + 1) / warmup_steps`
/// - Past the horizon (`step > max_steps`): `min_lr`
/// - Otherwise: cosine anneal from `max_lr` at `warmup_steps` to `min_lr` at
///   `max_steps`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineSchedule {
    max_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    max_steps: usize,
}

impl CosineSchedule {
    pub fn new(max_lr: f64, min_lr: f64, warmup_steps: usize, max_steps: usize) -> TrainResult<Self> {
        if max_lr <= 0.0 {
            return Err(config_error(format!("max_lr ({}) must be positive", max_lr)));
        }
        if !(0.0..=max_lr).contains(&min_lr) {
            return Err(config_error(format!(
                "min_lr ({}) must be in [0, max_lr]",
                min_lr
            )));
        }
        if warmup_steps >= max_steps {
            return Err(config_error(format!(
                "warmup_steps ({}) must be < max_steps ({})",
                warmup_steps, max_steps
            )));
        }
        Ok(Self {
            max_lr,
            min_lr,
            warmup_steps,
            max_steps,
        })
    }

    /// Floor at one tenth of the peak.
    pub fn with_default_floor(max_lr: f64, warmup_steps: usize, max_steps: usize) -> TrainResult<Self> {
        Self::new(max_lr, max_lr * 0.1, warmup_steps, max_steps)
    }

    pub fn max_lr(&self) -> f64 {
        self.max_lr
    }

    pub fn min_lr(&self) -> f64 {
        self.min_lr
    }

    pub fn lr(&self, step: usize) -> TrainResult<f64> {
        if step < self.warmup_steps {
            return Ok(self.max_lr * (step + 1) as f64 / self.warmup_steps as f64);
        }
        if step > self.max_steps {
            return Ok(self.min_lr);
        }
        let decay_ratio =
            (step - self.warmup_steps) as f64 / (self.max_steps - self.warmup_steps) as f64;
        if !(0.0..=1.0).contains(&decay_ratio) {
            return Err(config_error(format!(
                "decay ratio {} out of [0, 1] at step {}",
                decay_ratio, step
            )));
        }
        let coeff = 0.5 * (1.0 + (std::f64::consts::PI * decay_ratio).cos());
        Ok(self.min_lr + coeff * (self.max_lr - self.min_lr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> CosineSchedule {
        CosineSchedule::with_default_floor(6e-4, 715, 76292).unwrap()
    }

    #[test]
    fn test_warmup_phase() -> TrainResult<()> {
        let s = reference();
        assert!((s.lr(0)? - 6e-4 / 715.0).abs() < 1e-15);
        let mut prev = 0.0;
        for step in 0..715 {
            let lr = s.lr(step)?;
            assert!(lr > prev, "warmup not increasing at {}", step);
            prev = lr;
        }
        // the (step + 1) numerator reaches the peak one step early
        assert!((s.lr(714)? - 6e-4).abs() < 1e-15);
        Ok(())
    }

    #[test]
    fn test_cosine_endpoints() -> TrainResult<()> {
        let s = reference();
        assert!((s.lr(715)? - 6e-4).abs() < 1e-15);
        assert!((s.lr(76292)? - 6e-5).abs() < 1e-15);
        assert_eq!(s.lr(76293)?, 6e-5);
        assert_eq!(s.lr(1_000_000)?, 6e-5);

        let mid = (715 + 76292) / 2;
        let lr_mid = s.lr(mid)?;
        assert!((lr_mid - 3.3e-4).abs() < 1e-6, "{}", lr_mid);
        Ok(())
    }

    #[test]
    fn test_decay_is_monotone_and_continuous() -> TrainResult<()> {
        let s = CosineSchedule::with_default_floor(1.0, 10, 110)?;
        let mut prev = s.lr(10)?;
        for step in 11..=110 {
            let lr = s.lr(step)?;
            assert!(lr <= prev);
            assert!(prev - lr < 0.02, "jump at {}", step);
            prev = lr;
        }
        assert!((s.lr(9)? - s.lr(10)?).abs() < 1e-12);
        assert!((s.lr(110)? - s.lr(111)?).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_invalid_construction() {
        assert!(CosineSchedule::new(0.0, 0.0, 1, 10).is_err());
        assert!(CosineSchedule::new(1.0, 2.0, 1, 10).is_err());
        assert!(matches!(
            CosineSchedule::new(1.0, 0.1, 10, 10),
            Err(crate::error::TrainError::Config(_))
        ));
    }
}
