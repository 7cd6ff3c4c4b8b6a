//! Training loop: gradient accumulation, deferred gradient sync, clipping and
//! the AdamW step, driven by the periodic-task cadence.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;

use crate::checkpoint::{
    format_bytes, load_checkpoint, prune_checkpoints, restore_vars, save_checkpoint,
    CheckpointMeta,
};
use crate::config::TrainConfig;
use crate::data::{RenderedExample, ShardedLoader, TextCodec};
use crate::dist::{Collective, ReduceOp, RunContext};
use crate::error::{checkpoint_error, sync_error, TrainResult};
use crate::eval::{check_examples_fit, hellaswag_accuracy, validation_loss};
use crate::logging::{
    log_benchmark, log_checkpoint_save, log_evaluation, log_sample, log_training_step,
    MetricsLog, TrainingMetrics,
};
use crate::model::{Gpt, LanguageModel};
use crate::optim::{AdamWConfig, CosineSchedule, GroupedAdamW};
use crate::sample::{generate, SampleConfig};
use crate::schedule::{Cadence, TaskKind};

/// Phases of one optimizer step, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Accumulating(usize),
    Syncing,
    Clipping,
    Stepping,
    Measuring,
}

/// All vars of a map, sorted by name so every rank flattens them identically.
fn sorted_vars(varmap: &VarMap) -> Vec<Var> {
    let data = varmap.data().lock().unwrap_or_else(|p| p.into_inner());
    let mut named: Vec<(&String, &Var)> = data.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    named.into_iter().map(|(_, v)| v.clone()).collect()
}

/// Sums gradients over micro-steps and averages them across ranks only when
/// asked to sync.
pub struct GradAccumulator {
    vars: Vec<Var>,
    sums: Vec<Option<Tensor>>,
    sync_count: usize,
}

impl GradAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        let sums = vec![None; vars.len()];
        Self {
            vars,
            sums,
            sync_count: 0,
        }
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Number of completed syncs, one per optimizer step.
    pub fn sync_count(&self) -> usize {
        self.sync_count
    }

    /// Backpropagate `loss` and add its gradients to the running sums.
    ///
    /// With `require_sync` the sums are averaged across ranks (one flat
    /// all-reduce), written into the returned store and cleared.
    pub fn backward(
        &mut self,
        loss: &Tensor,
        require_sync: bool,
        collective: &dyn Collective,
    ) -> TrainResult<Option<GradStore>> {
        let mut grads = loss.backward()?;
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            if let Some(g) = grads.remove(var.as_tensor()) {
                let g = g.detach();
                *sum = Some(match sum.take() {
                    Some(acc) => (acc + g)?,
                    None => g,
                });
            }
        }
        if !require_sync {
            return Ok(None);
        }

        let mut summed = Vec::with_capacity(self.vars.len());
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            summed.push(match sum.take() {
                Some(g) => g,
                None => var.zeros_like()?,
            });
        }
        let summed = if collective.world_size() > 1 {
            all_reduce_avg(summed, collective)?
        } else {
            summed
        };
        for (var, g) in self.vars.iter().zip(summed) {
            grads.insert(var.as_tensor(), g);
        }
        self.sync_count += 1;
        Ok(Some(grads))
    }
}

fn all_reduce_avg(grads: Vec<Tensor>, collective: &dyn Collective) -> TrainResult<Vec<Tensor>> {
    let Some(first) = grads.first() else {
        return Ok(grads);
    };
    let device = first.device().clone();
    let flat = grads
        .iter()
        .map(|g| g.flatten_all())
        .collect::<candle_core::Result<Vec<_>>>()?;
    let mut buffer = Tensor::cat(&flat, 0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    collective.all_reduce_f32(&mut buffer, ReduceOp::Avg)?;

    let total = buffer.len();
    let all = Tensor::from_vec(buffer, total, &device)?;
    let mut offset = 0;
    let mut out = Vec::with_capacity(grads.len());
    for g in &grads {
        let n = g.elem_count();
        out.push(all.narrow(0, offset, n)?.reshape(g.dims())?.to_dtype(g.dtype())?);
        offset += n;
    }
    Ok(out)
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> TrainResult<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    let scale = max_norm / (norm + 1e-6);
    if scale < 1.0 {
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (g * scale)?);
            }
        }
    }
    Ok(norm)
}

/// Training step statistics
#[derive(Debug, Clone)]
pub struct StepStats {
    pub step: usize,
    /// Mean loss over micro-steps, averaged across ranks.
    pub loss: f64,
    pub grad_norm: f64,
    pub lr: f64,
    pub tokens_per_sec: f64,
    pub dt_ms: f64,
}

/// What a finished run reports back.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub steps: usize,
    pub final_train_loss: Option<f64>,
    pub final_val_loss: Option<f64>,
    pub final_accuracy: Option<f64>,
    pub checkpoints: Vec<PathBuf>,
}

/// Optional inputs of the periodic tasks; a task without its input is skipped.
#[derive(Default)]
pub struct EvalInputs<'a> {
    pub val_loader: Option<&'a mut ShardedLoader>,
    pub hellaswag: &'a [RenderedExample],
    pub codec: Option<&'a dyn TextCodec>,
}

pub struct Trainer<M = Gpt> {
    model: M,
    varmap: VarMap,
    config: TrainConfig,
    device: Device,
    collective: Box<dyn Collective>,
    optimizer: GroupedAdamW,
    schedule: CosineSchedule,
    accumulator: GradAccumulator,
    grad_accum_steps: usize,
}

impl Trainer<Gpt> {
    /// Build a seeded GPT and its trainer.
    ///
    /// Every rank builds the same weights from `config.seed`; rank 0's copy
    /// is then broadcast so the replicas agree exactly.
    pub fn new(
        config: TrainConfig,
        ctx: &RunContext,
        collective: Box<dyn Collective>,
    ) -> TrainResult<Self> {
        config.ensure_valid()?;
        let (model, varmap) = Gpt::build(&config.model, &ctx.device, config.seed)?;
        tracing::info!(
            num_params = config.model.param_count(),
            n_layer = config.model.n_layer,
            n_embd = config.model.n_embd,
            "Model built"
        );
        Self::with_model(model, varmap, config, ctx, collective)
    }
}

impl<M: LanguageModel> Trainer<M> {
    pub fn with_model(
        model: M,
        varmap: VarMap,
        config: TrainConfig,
        ctx: &RunContext,
        collective: Box<dyn Collective>,
    ) -> TrainResult<Self> {
        if collective.rank() != ctx.rank || collective.world_size() != ctx.world_size {
            return Err(sync_error(format!(
                "collective is rank {} of {}, run context is rank {} of {}",
                collective.rank(),
                collective.world_size(),
                ctx.rank,
                ctx.world_size
            )));
        }
        let grad_accum_steps = config.grad_accum_steps(collective.world_size())?;
        let schedule = CosineSchedule::new(
            config.max_lr,
            config.min_lr(),
            config.warmup_steps,
            config.max_steps,
        )?;
        let optimizer = GroupedAdamW::new(
            &varmap,
            AdamWConfig {
                lr: config.max_lr,
                weight_decay: config.weight_decay,
                betas: config.betas,
                eps: config.eps,
            },
        )?;
        let accumulator = GradAccumulator::new(sorted_vars(&varmap));

        if collective.world_size() > 1 {
            broadcast_vars(accumulator.vars(), collective.as_ref())?;
        }
        if collective.is_master() {
            tracing::info!(
                total_batch_size = config.total_batch_size,
                micro_batch_size = config.micro_batch_size,
                seq_len = config.seq_len,
                world_size = collective.world_size(),
                grad_accum_steps,
                "Batch geometry"
            );
        }

        Ok(Self {
            model,
            varmap,
            config,
            device: ctx.device.clone(),
            collective,
            optimizer,
            schedule,
            accumulator,
            grad_accum_steps,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    pub fn grad_accum_steps(&self) -> usize {
        self.grad_accum_steps
    }

    pub fn sync_count(&self) -> usize {
        self.accumulator.sync_count()
    }

    /// Load weights from a checkpoint of the same architecture.
    pub fn restore(&self, path: &Path) -> TrainResult<CheckpointMeta> {
        let loaded = load_checkpoint(path, &self.device)?;
        if loaded.meta.config != self.config.model {
            return Err(checkpoint_error(
                format!(
                    "checkpoint model {:?} does not match configured {:?}",
                    loaded.meta.config, self.config.model
                ),
                path,
            ));
        }
        restore_vars(&self.varmap, &loaded.tensors, path)?;
        tracing::info!(path = %path.display(), step = loaded.meta.step, "Weights restored");
        Ok(loaded.meta)
    }

    /// One optimizer step over `grad_accum_steps` micro-batches.
    pub fn train_step(&mut self, step: usize, loader: &mut ShardedLoader) -> TrainResult<StepStats> {
        let start = Instant::now();
        let mut loss_accum = 0.0f64;
        let mut grads = None;

        for micro_step in 0..self.grad_accum_steps {
            tracing::trace!(step, phase = ?StepPhase::Accumulating(micro_step));
            let (x, y) = loader.next_batch()?;
            let (_logits, loss) = self.model.forward_with_loss(&x, &y)?;
            // each micro-batch loss is a mean; scale so the sum is the full-batch mean
            let loss = (loss / self.grad_accum_steps as f64)?;
            loss_accum += loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;

            let last = micro_step + 1 == self.grad_accum_steps;
            if last {
                tracing::trace!(step, phase = ?StepPhase::Syncing);
            }
            grads = self
                .accumulator
                .backward(&loss, last, self.collective.as_ref())?;
        }
        let mut grads = grads.ok_or_else(|| sync_error("no gradients after accumulation"))?;
        let loss = self
            .collective
            .all_reduce_scalar(loss_accum, ReduceOp::Avg)?;

        tracing::trace!(step, phase = ?StepPhase::Clipping);
        let grad_norm = clip_grad_norm(&mut grads, self.accumulator.vars(), self.config.grad_clip)?;

        tracing::trace!(step, phase = ?StepPhase::Stepping);
        let lr = self.schedule.lr(step)?;
        self.optimizer.set_lr(lr);
        self.optimizer.step(&grads)?;

        tracing::trace!(step, phase = ?StepPhase::Measuring);
        self.device.synchronize()?;
        let elapsed = start.elapsed().as_secs_f64();
        let tokens = self.config.tokens_per_micro_batch()
            * self.grad_accum_steps
            * self.collective.world_size();
        let tokens_per_sec = if elapsed > 0.0 {
            tokens as f64 / elapsed
        } else {
            0.0
        };

        Ok(StepStats {
            step,
            loss,
            grad_norm,
            lr,
            tokens_per_sec,
            dt_ms: elapsed * 1000.0,
        })
    }

    /// Run `max_steps` optimizer steps with periodic evaluation, sampling
    /// and checkpointing.
    ///
    /// Every rank must call this; only the master writes logs and files.
    pub fn run(
        &mut self,
        train_loader: &mut ShardedLoader,
        mut inputs: EvalInputs<'_>,
    ) -> TrainResult<RunSummary> {
        check_examples_fit(inputs.hellaswag, self.config.model.block_size)?;
        let is_master = self.collective.is_master();
        let log_dir = PathBuf::from(&self.config.log_dir);
        let mut metrics = if is_master {
            Some(MetricsLog::create(&log_dir)?)
        } else {
            None
        };
        let cadence = Cadence::from_config(&self.config);
        let sample_config = SampleConfig {
            num_return_sequences: self.config.num_return_sequences,
            max_length: self.config.sample_max_length,
            top_k: self.config.top_k,
            seed: self.config.sample_seed,
        };
        let mut summary = RunSummary::default();
        let run_start = Instant::now();

        for step in 0..self.config.max_steps {
            let last_step = step + 1 == self.config.max_steps;

            for task in cadence.due(step, last_step) {
                match task {
                    TaskKind::Validate => {
                        let Some(loader) = inputs.val_loader.as_deref_mut() else {
                            continue;
                        };
                        let val_loss = validation_loss(
                            &self.model,
                            loader,
                            self.config.val_loss_steps,
                            self.collective.as_ref(),
                        )?;
                        if let Some(log) = metrics.as_mut() {
                            log_evaluation(step, val_loss);
                            log.val(step, val_loss)?;
                        }
                        summary.final_val_loss = Some(val_loss);
                    }
                    TaskKind::Checkpoint => {
                        if is_master {
                            let path = self.save(step, summary.final_val_loss, &log_dir)?;
                            summary.checkpoints.push(path);
                        }
                    }
                    TaskKind::HellaSwag => {
                        if inputs.hellaswag.is_empty() {
                            continue;
                        }
                        let result = hellaswag_accuracy(
                            &self.model,
                            inputs.hellaswag,
                            &self.device,
                            self.collective.as_ref(),
                        )?;
                        if let Some(log) = metrics.as_mut() {
                            log_benchmark(step, result.correct, result.total, result.accuracy());
                            log.hella(step, result.accuracy())?;
                        }
                        summary.final_accuracy = Some(result.accuracy());
                    }
                    TaskKind::Sample => {
                        let Some(codec) = inputs.codec else {
                            continue;
                        };
                        let prompt = codec.encode(&self.config.sample_prompt)?;
                        let rank = self.collective.rank();
                        let sequences =
                            generate(&self.model, &prompt, &sample_config, rank, &self.device)?;
                        for (i, tokens) in sequences.iter().enumerate() {
                            log_sample(rank, i, &codec.decode(tokens)?);
                        }
                    }
                }
            }

            let stats = self.train_step(step, train_loader)?;
            if let Some(log) = metrics.as_mut() {
                log_training_step(
                    step,
                    &TrainingMetrics {
                        loss: stats.loss,
                        learning_rate: stats.lr,
                        grad_norm: stats.grad_norm,
                        tokens_per_sec: stats.tokens_per_sec,
                        step_ms: stats.dt_ms,
                    },
                );
                log.train(step, stats.loss)?;
            }
            summary.steps = step + 1;
            summary.final_train_loss = Some(stats.loss);
        }

        if is_master {
            tracing::info!(
                steps = summary.steps,
                elapsed_s = format!("{:.1}", run_start.elapsed().as_secs_f64()),
                "Training complete"
            );
        }
        Ok(summary)
    }

    fn save(&self, step: usize, val_loss: Option<f64>, log_dir: &Path) -> TrainResult<PathBuf> {
        let meta = CheckpointMeta {
            config: self.config.model.clone(),
            step,
            val_loss,
        };
        let path = save_checkpoint(&self.varmap, &meta, log_dir).inspect_err(|e| {
            tracing::error!(step, error = %e, "Checkpoint save failed");
        })?;
        let size = std::fs::metadata(&path)
            .map(|m| format_bytes(m.len()))
            .unwrap_or_else(|_| "unknown".to_string());
        log_checkpoint_save(step, &path, val_loss, &size);

        let removed = prune_checkpoints(log_dir, self.config.keep_last_checkpoints)?;
        if removed > 0 {
            tracing::info!(
                removed,
                keep_last = self.config.keep_last_checkpoints,
                "Cleaned old checkpoints"
            );
        }
        Ok(path)
    }
}

/// Overwrite every var with rank 0's values.
fn broadcast_vars(vars: &[Var], collective: &dyn Collective) -> TrainResult<()> {
    let Some(first) = vars.first() else {
        return Ok(());
    };
    let device = first.device().clone();
    let flat = vars
        .iter()
        .map(|v| v.as_tensor().flatten_all())
        .collect::<candle_core::Result<Vec<_>>>()?;
    let mut buffer = Tensor::cat(&flat, 0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    collective.broadcast_from_master(&mut buffer)?;

    let total = buffer.len();
    let all = Tensor::from_vec(buffer, total, &device)?;
    let mut offset = 0;
    for var in vars {
        let n = var.elem_count();
        var.set(&all.narrow(0, offset, n)?.reshape(var.dims())?.to_dtype(var.dtype())?)?;
        offset += n;
    }
    tracing::debug!(num_params = total, "Parameters broadcast from rank 0");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{write_shard, Split};
    use crate::dist::{LaunchMode, SingleProcess};
    use crate::model::tests::tiny_gpt_config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Pretends to be rank 0 of two; reductions are the identity.
    struct CountingPair {
        f32_calls: Arc<AtomicUsize>,
    }

    impl Collective for CountingPair {
        fn rank(&self) -> usize {
            0
        }

        fn world_size(&self) -> usize {
            2
        }

        fn all_reduce_f32(&self, _values: &mut [f32], _op: ReduceOp) -> TrainResult<()> {
            self.f32_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn all_reduce_f64(&self, _values: &mut [f64], _op: ReduceOp) -> TrainResult<()> {
            Ok(())
        }
    }

    fn ctx(rank: usize, world_size: usize) -> RunContext {
        RunContext {
            rank,
            local_rank: rank,
            world_size,
            is_master: rank == 0,
            device: Device::Cpu,
            launch: if world_size == 1 {
                LaunchMode::SingleProcess
            } else {
                LaunchMode::MultiProcess {
                    master_addr: "127.0.0.1".to_string(),
                    master_port: 29500,
                }
            },
        }
    }

    fn tiny_train_config(log_dir: &Path) -> TrainConfig {
        TrainConfig {
            model: tiny_gpt_config(),
            total_batch_size: 64,
            micro_batch_size: 2,
            seq_len: 8,
            max_lr: 1e-2,
            warmup_steps: 2,
            max_steps: 30,
            weight_decay: 0.0,
            eval_interval: 0,
            checkpoint_interval: 0,
            sample_interval: 0,
            log_dir: log_dir.display().to_string(),
            ..TrainConfig::tiny_cpu()
        }
    }

    fn periodic_loader(dir: &Path, b: usize, t: usize, rank: usize, world: usize) -> ShardedLoader {
        let tokens: Vec<u32> = (0..4000).map(|i| (i % 16) as u32).collect();
        let path = dir.join("toy_train_000000.npy");
        write_shard(&path, &tokens).unwrap();
        ShardedLoader::from_shards(vec![path], Split::Train, b, t, rank, world, &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_accumulation_matches_full_batch_gradient() -> TrainResult<()> {
        let cfg = tiny_gpt_config();
        let (model, varmap) = Gpt::build(&cfg, &Device::Cpu, 5)?;
        let x = Tensor::arange(0u32, 16, &Device::Cpu)?.reshape((2, 8))?;
        let y = Tensor::arange(1u32, 17, &Device::Cpu)?.reshape((2, 8))?;

        let mut full = GradAccumulator::new(sorted_vars(&varmap));
        let (_l, loss) = model.forward_with_loss(&x, &y)?;
        let full_grads = full.backward(&loss, true, &SingleProcess)?.unwrap();

        let mut split = GradAccumulator::new(sorted_vars(&varmap));
        let mut split_grads = None;
        for row in 0..2 {
            let (_l, loss) =
                model.forward_with_loss(&x.narrow(0, row, 1)?, &y.narrow(0, row, 1)?)?;
            let loss = (loss / 2.0)?;
            split_grads = split.backward(&loss, row == 1, &SingleProcess)?;
        }
        let split_grads = split_grads.unwrap();

        for var in full.vars() {
            let a = full_grads.get(var.as_tensor()).unwrap();
            let b = split_grads.get(var.as_tensor()).unwrap();
            let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-5, "gradient mismatch {}", diff);
        }
        assert_eq!(split.sync_count(), 1);
        Ok(())
    }

    #[test]
    fn test_no_store_until_sync() -> TrainResult<()> {
        let (model, varmap) = Gpt::build(&tiny_gpt_config(), &Device::Cpu, 0)?;
        let mut acc = GradAccumulator::new(sorted_vars(&varmap));
        let x = Tensor::zeros((1, 4), DType::U32, &Device::Cpu)?;
        let (_l, loss) = model.forward_with_loss(&x, &x)?;
        assert!(acc.backward(&loss, false, &SingleProcess)?.is_none());
        assert_eq!(acc.sync_count(), 0);
        Ok(())
    }

    #[test]
    fn test_clip_grad_norm_scales_down() -> TrainResult<()> {
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(2, "w", candle_nn::Init::Const(0.0))?;
        // d/dw of 3*w0 + 4*w1 is (3, 4), norm 5
        let coeffs = Tensor::new(&[3f32, 4.0], &Device::Cpu)?;
        let mut grads = (w * coeffs)?.sum_all()?.backward()?;
        let vars = sorted_vars(&varmap);

        let norm = clip_grad_norm(&mut grads, &vars, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5);
        let g = grads.get(vars[0].as_tensor()).unwrap().to_vec1::<f32>()?;
        assert!((g[0] - 0.6).abs() < 1e-5 && (g[1] - 0.8).abs() < 1e-5, "{:?}", g);

        let norm = clip_grad_norm(&mut grads, &vars, 10.0)?;
        assert!((norm - 1.0).abs() < 1e-4);
        let g = grads.get(vars[0].as_tensor()).unwrap().to_vec1::<f32>()?;
        assert!((g[0] - 0.6).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_indivisible_batch_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TrainConfig {
            total_batch_size: 100,
            ..tiny_train_config(dir.path())
        };
        let err = Trainer::new(cfg, &ctx(0, 1), Box::new(SingleProcess))
            .err()
            .unwrap();
        assert!(matches!(err, crate::error::TrainError::Config(_)));
    }

    #[test]
    fn test_one_gradient_sync_per_step() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cfg = tiny_train_config(dir.path());
        let mut trainer = Trainer::new(
            cfg,
            &ctx(0, 2),
            Box::new(CountingPair {
                f32_calls: calls.clone(),
            }),
        )?;
        // 64 / (2 * 8 * 2)
        assert_eq!(trainer.grad_accum_steps(), 2);
        // the startup broadcast
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut loader = periodic_loader(dir.path(), 2, 8, 0, 2);
        for step in 0..3 {
            trainer.train_step(step, &mut loader)?;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(trainer.sync_count(), 3);
        Ok(())
    }

    #[test]
    fn test_train_loss_decreases() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(
            tiny_train_config(dir.path()),
            &ctx(0, 1),
            Box::new(SingleProcess),
        )?;
        assert_eq!(trainer.grad_accum_steps(), 4);
        let mut loader = periodic_loader(dir.path(), 2, 8, 0, 1);

        let mut losses = Vec::new();
        for step in 0..20 {
            let stats = trainer.train_step(step, &mut loader)?;
            assert!(stats.loss.is_finite());
            assert!(stats.tokens_per_sec > 0.0);
            losses.push(stats.loss);
        }
        let first = losses[0];
        let last = *losses.last().unwrap();
        assert!(last < first, "loss should decrease: first={:.4} last={:.4}", first, last);
        Ok(())
    }

    #[test]
    fn test_lr_follows_schedule() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_train_config(dir.path());
        let schedule = CosineSchedule::new(cfg.max_lr, cfg.min_lr(), cfg.warmup_steps, cfg.max_steps)?;
        let mut trainer = Trainer::new(cfg, &ctx(0, 1), Box::new(SingleProcess))?;
        let mut loader = periodic_loader(dir.path(), 2, 8, 0, 1);
        for step in 0..3 {
            let stats = trainer.train_step(step, &mut loader)?;
            assert_eq!(stats.lr, schedule.lr(step)?);
        }
        Ok(())
    }

    #[test]
    fn test_mismatched_context_is_sync_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Trainer::new(
            tiny_train_config(dir.path()),
            &ctx(0, 1),
            Box::new(CountingPair {
                f32_calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .err()
        .unwrap();
        assert!(matches!(err, crate::error::TrainError::Synchronization(_)));
    }

    #[test]
    fn test_too_wide_hellaswag_example_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let val_dir = tempfile::tempdir().unwrap();
        let cfg = TrainConfig {
            eval_interval: 1,
            max_steps: 3,
            ..tiny_train_config(dir.path())
        };
        let width = cfg.model.block_size * 2;
        let wide = RenderedExample {
            tokens: vec![vec![1; width]; 4],
            mask: vec![vec![1; width]; 4],
            label: 0,
        };
        let mut trainer = Trainer::new(cfg, &ctx(0, 1), Box::new(SingleProcess)).unwrap();
        let mut train = periodic_loader(dir.path(), 2, 8, 0, 1);
        let mut val = periodic_loader(val_dir.path(), 2, 8, 0, 1);

        let err = trainer
            .run(
                &mut train,
                EvalInputs {
                    val_loader: Some(&mut val),
                    hellaswag: std::slice::from_ref(&wide),
                    codec: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, crate::error::TrainError::Config(_)));
        assert!(err.is_fatal_at_startup());
        assert!(!dir.path().join(MetricsLog::FILE_NAME).exists());
    }
}
