//! Model and run configuration for GPT-2 pretraining.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{config_error, IoResultExt, TrainError, TrainResult};

fn default_min_lr_ratio() -> f64 {
    0.1
}

fn default_betas() -> (f64, f64) {
    (0.9, 0.95)
}

fn default_eps() -> f64 {
    1e-8
}

fn default_grad_clip() -> f64 {
    1.0
}

fn default_val_loss_steps() -> usize {
    20
}

fn default_num_return_sequences() -> usize {
    4
}

fn default_sample_max_length() -> usize {
    32
}

fn default_top_k() -> usize {
    50
}

fn default_sample_prompt() -> String {
    "Hello, I'm a language model,".to_string()
}

fn default_seed() -> u64 {
    1337
}

fn default_sample_seed() -> u64 {
    42
}

fn default_log_dir() -> String {
    "log".to_string()
}

/// GPT-2 architecture hyperparameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GptConfig {
    /// Maximum sequence length (size of the positional table).
    pub block_size: usize,
    pub vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self::gpt2()
    }
}

impl GptConfig {
    /// 124M parameters.
    pub fn gpt2() -> Self {
        Self {
            block_size: 1024,
            vocab_size: 50257,
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
        }
    }

    /// 350M parameters.
    pub fn gpt2_medium() -> Self {
        Self {
            n_layer: 24,
            n_head: 16,
            n_embd: 1024,
            ..Self::gpt2()
        }
    }

    /// 774M parameters.
    pub fn gpt2_large() -> Self {
        Self {
            n_layer: 36,
            n_head: 20,
            n_embd: 1280,
            ..Self::gpt2()
        }
    }

    /// 1558M parameters.
    pub fn gpt2_xl() -> Self {
        Self {
            n_layer: 48,
            n_head: 25,
            n_embd: 1600,
            ..Self::gpt2()
        }
    }

    /// Resolve a published checkpoint family name.
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "gpt2" => Some(Self::gpt2()),
            "gpt2-medium" => Some(Self::gpt2_medium()),
            "gpt2-large" => Some(Self::gpt2_large()),
            "gpt2-xl" => Some(Self::gpt2_xl()),
            _ => None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Parameter count with the output projection tied to the token embedding.
    pub fn param_count(&self) -> usize {
        let d = self.n_embd;
        let embed = self.vocab_size * d + self.block_size * d;
        let attn = d * 3 * d + 3 * d + d * d + d;
        let mlp = d * 4 * d + 4 * d + 4 * d * d + d;
        let norms = 4 * d;
        embed + self.n_layer * (attn + mlp + norms) + 2 * d
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.n_layer == 0 {
            errors.push("n_layer must be greater than 0".to_string());
        }
        if self.n_head == 0 {
            errors.push("n_head must be greater than 0".to_string());
        } else if self.n_embd % self.n_head != 0 {
            errors.push(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            ));
        }
        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than 0".to_string());
        }
        if self.block_size == 0 {
            errors.push("block_size must be greater than 0".to_string());
        }
    }
}

/// Model + run hyperparameter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub model: GptConfig,

    // Batch geometry
    /// Tokens per optimizer step across all ranks and micro-steps.
    pub total_batch_size: usize,
    /// Rows per micro-batch (B).
    pub micro_batch_size: usize,
    /// Sequence length per row (T).
    pub seq_len: usize,

    // Schedule + optimizer
    pub max_lr: f64,
    #[serde(default = "default_min_lr_ratio")]
    pub min_lr_ratio: f64,
    pub warmup_steps: usize,
    pub max_steps: usize,
    pub weight_decay: f64,
    #[serde(default = "default_betas")]
    pub betas: (f64, f64),
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f64,

    // Cadence
    /// Validation loss + benchmark every N steps (and on the last step).
    pub eval_interval: usize,
    #[serde(default = "default_val_loss_steps")]
    pub val_loss_steps: usize,
    /// Checkpoint every N steps (never at step 0; always on the last step).
    pub checkpoint_interval: usize,
    /// Keep only the newest N checkpoints (0 = keep all).
    #[serde(default)]
    pub keep_last_checkpoints: usize,
    /// Sample every N steps (never at step 0; always on the last step).
    pub sample_interval: usize,

    // Sampling
    #[serde(default = "default_num_return_sequences")]
    pub num_return_sequences: usize,
    #[serde(default = "default_sample_max_length")]
    pub sample_max_length: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_sample_prompt")]
    pub sample_prompt: String,

    // Seeds
    /// Parameter init seed, identical on every rank.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Sampling seed; each rank offsets it by its rank.
    #[serde(default = "default_sample_seed")]
    pub sample_seed: u64,

    // Paths
    pub data_root: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// HellaSwag validation JSONL (None = benchmark disabled).
    #[serde(default)]
    pub hellaswag_path: Option<String>,
}

impl TrainConfig {
    /// The reference GPT-2 (124M) run on a 10B-token corpus.
    ///
    /// ~0.5M tokens per step; 19073 steps is one epoch, four epochs total.
    pub fn gpt2_124m() -> Self {
        Self {
            model: GptConfig {
                // padded to a multiple of 128 for kernel friendliness
                vocab_size: 50304,
                ..GptConfig::gpt2()
            },
            total_batch_size: 524_288,
            micro_batch_size: 64,
            seq_len: 1024,
            max_lr: 6e-4,
            min_lr_ratio: 0.1,
            warmup_steps: 715,
            max_steps: 19073 * 4,
            weight_decay: 0.1,
            betas: default_betas(),
            eps: default_eps(),
            grad_clip: 1.0,
            eval_interval: 250,
            val_loss_steps: 20,
            checkpoint_interval: 5000,
            keep_last_checkpoints: 0,
            sample_interval: 250,
            num_return_sequences: 4,
            sample_max_length: 32,
            top_k: 50,
            sample_prompt: default_sample_prompt(),
            seed: 1337,
            sample_seed: 42,
            data_root: "edu_fineweb10B".to_string(),
            log_dir: default_log_dir(),
            hellaswag_path: None,
        }
    }

    /// Small model that trains on a laptop CPU.
    pub fn tiny_cpu() -> Self {
        Self {
            model: GptConfig {
                block_size: 128,
                vocab_size: 50304,
                n_layer: 4,
                n_head: 4,
                n_embd: 128,
            },
            total_batch_size: 4096,
            micro_batch_size: 8,
            seq_len: 128,
            max_lr: 1e-3,
            warmup_steps: 50,
            max_steps: 2000,
            eval_interval: 100,
            val_loss_steps: 5,
            checkpoint_interval: 500,
            sample_interval: 100,
            data_root: "data/tiny".to_string(),
            ..Self::gpt2_124m()
        }
    }

    /// Resolve a preset by name.
    pub fn from_preset(name: &str) -> Option<Self> {
        match name {
            "gpt2-124m" | "gpt2_124m" | "gpt2" => Some(Self::gpt2_124m()),
            "tiny-cpu" | "tiny_cpu" => Some(Self::tiny_cpu()),
            _ => None,
        }
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: &Path) -> TrainResult<Self> {
        let raw = std::fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| config_error(format!("parse {}: {}", path.display(), e)))
    }

    pub fn min_lr(&self) -> f64 {
        self.max_lr * self.min_lr_ratio
    }

    /// Tokens one rank consumes per micro-step.
    pub fn tokens_per_micro_batch(&self) -> usize {
        self.micro_batch_size * self.seq_len
    }

    /// Micro-steps per optimizer step for a given world size.
    ///
    /// Fails unless `total_batch_size` divides evenly by `B * T * world_size`.
    pub fn grad_accum_steps(&self, world_size: usize) -> TrainResult<usize> {
        let per_step = self.tokens_per_micro_batch() * world_size;
        if per_step == 0 {
            return Err(config_error("B * T * world_size must be greater than 0"));
        }
        if self.total_batch_size % per_step != 0 {
            return Err(config_error(format!(
                "total_batch_size ({}) must be divisible by B * T * world_size ({} * {} * {} = {})",
                self.total_batch_size,
                self.micro_batch_size,
                self.seq_len,
                world_size,
                per_step
            )));
        }
        Ok(self.total_batch_size / per_step)
    }

    /// Validate configuration and return list of errors.
    ///
    /// Warnings are logged; errors are returned together so a bad config
    /// reports everything at once.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        self.model.collect_errors(&mut errors);

        if self.micro_batch_size == 0 {
            errors.push("micro_batch_size must be greater than 0".to_string());
        }
        if self.seq_len == 0 {
            errors.push("seq_len must be greater than 0".to_string());
        }
        if self.seq_len > self.model.block_size {
            errors.push(format!(
                "seq_len ({}) must be <= block_size ({})",
                self.seq_len, self.model.block_size
            ));
        }
        if self.total_batch_size == 0 {
            errors.push("total_batch_size must be greater than 0".to_string());
        }
        if self.max_lr <= 0.0 {
            errors.push(format!("max_lr ({}) must be positive", self.max_lr));
        }
        if !(0.0..=1.0).contains(&self.min_lr_ratio) {
            errors.push(format!(
                "min_lr_ratio ({}) must be in [0, 1]",
                self.min_lr_ratio
            ));
        }
        if self.warmup_steps >= self.max_steps {
            errors.push(format!(
                "warmup_steps ({}) must be < max_steps ({})",
                self.warmup_steps, self.max_steps
            ));
        }
        if self.grad_clip <= 0.0 {
            errors.push(format!("grad_clip ({}) must be positive", self.grad_clip));
        }
        if self.val_loss_steps == 0 {
            errors.push("val_loss_steps must be greater than 0".to_string());
        }
        if self.top_k == 0 {
            errors.push("top_k must be greater than 0".to_string());
        }
        if self.num_return_sequences == 0 {
            errors.push("num_return_sequences must be greater than 0".to_string());
        }

        if self.model.vocab_size % 64 != 0 {
            warnings.push(format!(
                "vocab_size ({}) is not a multiple of 64; matmul kernels run slower",
                self.model.vocab_size
            ));
        }
        if self.eval_interval == 0 {
            warnings.push("eval_interval is 0: evaluation only runs on the last step".to_string());
        }

        for warning in &warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `validate()` folded into a single configuration error.
    pub fn ensure_valid(&self) -> TrainResult<()> {
        self.validate()
            .map_err(|errors| TrainError::Config(errors.join("; ")))
    }
}
