//! AdamW over two parameter groups: decayed matrices and undecayed vectors.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use crate::error::TrainResult;

/// Hyperparameters shared by both groups.
#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub lr: f64,
    pub weight_decay: f64,
    pub betas: (f64, f64),
    pub eps: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 6e-4,
            weight_decay: 0.1,
            betas: (0.9, 0.95),
            eps: 1e-8,
        }
    }
}

/// Tensor and element counts of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupStats {
    pub num_tensors: usize,
    pub num_params: usize,
}

impl GroupStats {
    fn of(vars: &[Var]) -> Self {
        Self {
            num_tensors: vars.len(),
            num_params: vars.iter().map(|v| v.elem_count()).sum(),
        }
    }
}

/// Split vars by rank: 2-D and up decay, biases and norm parameters do not.
///
/// Sorted by name so both groups are built in the same order on every rank.
pub fn split_decay_groups(varmap: &VarMap) -> (Vec<(String, Var)>, Vec<(String, Var)>) {
    let data = varmap.data().lock().unwrap_or_else(|p| p.into_inner());
    let mut named: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    drop(data);
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named.into_iter().partition(|(_, v)| v.rank() >= 2)
}

/// Two candle AdamW instances stepped together with one learning rate.
pub struct GroupedAdamW {
    decay: AdamW,
    no_decay: AdamW,
    decay_stats: GroupStats,
    no_decay_stats: GroupStats,
}

impl GroupedAdamW {
    pub fn new(varmap: &VarMap, config: AdamWConfig) -> TrainResult<Self> {
        let (decay, no_decay) = split_decay_groups(varmap);
        let decay: Vec<Var> = decay.into_iter().map(|(_, v)| v).collect();
        let no_decay: Vec<Var> = no_decay.into_iter().map(|(_, v)| v).collect();
        let decay_stats = GroupStats::of(&decay);
        let no_decay_stats = GroupStats::of(&no_decay);

        let params = |weight_decay: f64| ParamsAdamW {
            lr: config.lr,
            beta1: config.betas.0,
            beta2: config.betas.1,
            eps: config.eps,
            weight_decay,
        };

        tracing::info!(
            num_tensors = decay_stats.num_tensors,
            num_params = decay_stats.num_params,
            weight_decay = config.weight_decay,
            "Decayed parameter group"
        );
        tracing::info!(
            num_tensors = no_decay_stats.num_tensors,
            num_params = no_decay_stats.num_params,
            "Non-decayed parameter group"
        );
        // candle has one AdamW update path, there is no fused kernel to select
        tracing::info!(fused = false, "AdamW update path");

        Ok(Self {
            decay: AdamW::new(decay, params(config.weight_decay))?,
            no_decay: AdamW::new(no_decay, params(0.0))?,
            decay_stats,
            no_decay_stats,
        })
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);
    }

    pub fn lr(&self) -> f64 {
        self.decay.learning_rate()
    }

    pub fn step(&mut self, grads: &GradStore) -> TrainResult<()> {
        self.decay.step(grads)?;
        self.no_decay.step(grads)?;
        Ok(())
    }

    pub fn decay_stats(&self) -> GroupStats {
        self.decay_stats
    }

    pub fn no_decay_stats(&self) -> GroupStats {
        self.no_decay_stats
    }
}
