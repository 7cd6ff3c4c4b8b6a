//! CLI entry point for gpt2-train.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use gpt2_train::checkpoint::{load_checkpoint, restore_vars, save_checkpoint, CheckpointMeta};
use gpt2_train::config::{GptConfig, TrainConfig};
use gpt2_train::data::{
    load_examples, prepare_shards, render_example, Gpt2Tokenizer, RenderedExample,
    ShardedLoader, Split, TextCodec,
};
use gpt2_train::dist::{DevicePreference, RunContext};
use gpt2_train::import::import_safetensors;
use gpt2_train::logging::{init_console_logging, init_logging};
use gpt2_train::model::Gpt;
use gpt2_train::sample::{generate, SampleConfig};
use gpt2_train::train::{EvalInputs, Trainer};

#[derive(Parser)]
#[command(name = "gpt2-train", about = "Pretrain GPT-2 models with candle")]
struct Cli {
    /// Emit JSON logs instead of human-readable ones
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model (multi-process when RANK/LOCAL_RANK/WORLD_SIZE are set)
    Train {
        /// Preset: gpt2-124m or tiny-cpu
        #[arg(long, default_value = "gpt2-124m")]
        preset: String,

        /// JSON config file; replaces the preset
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        data_root: Option<String>,

        #[arg(long)]
        log_dir: Option<String>,

        #[arg(long)]
        max_steps: Option<usize>,

        #[arg(long)]
        micro_batch_size: Option<usize>,

        #[arg(long)]
        seq_len: Option<usize>,

        /// auto, cpu, cuda or metal
        #[arg(long, default_value = "auto")]
        device: String,

        /// tokenizer.json, needed for sampling and HellaSwag
        #[arg(long)]
        tokenizer: Option<PathBuf>,

        /// HellaSwag validation JSONL
        #[arg(long)]
        hellaswag: Option<PathBuf>,

        /// Start from a checkpoint instead of random weights
        #[arg(long)]
        init_from: Option<PathBuf>,
    },

    /// Sample continuations from a checkpoint
    Generate {
        #[arg(long)]
        checkpoint: PathBuf,

        #[arg(long)]
        tokenizer: PathBuf,

        #[arg(long, default_value = "Hello, I'm a language model,")]
        prompt: String,

        #[arg(long, default_value = "4")]
        num_return_sequences: usize,

        /// Total length including the prompt
        #[arg(long, default_value = "32")]
        max_length: usize,

        #[arg(long, default_value = "50")]
        top_k: usize,

        #[arg(long, default_value = "42")]
        seed: u64,

        #[arg(long, default_value = "auto")]
        device: String,
    },

    /// Convert published GPT-2 safetensors into a training checkpoint
    Import {
        /// HuggingFace model.safetensors
        #[arg(long)]
        input: PathBuf,

        /// gpt2, gpt2-medium, gpt2-large or gpt2-xl
        #[arg(long, default_value = "gpt2")]
        model_type: String,

        #[arg(long, default_value = "log")]
        output_dir: PathBuf,
    },

    /// Tokenize a text file into .npy shards (first shard val, rest train)
    Prepare {
        #[arg(long)]
        text: PathBuf,

        #[arg(long)]
        tokenizer: PathBuf,

        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value = "corpus")]
        prefix: String,

        /// Tokens per shard
        #[arg(long, default_value = "100000000")]
        shard_size: usize,
    },
}

fn resolve_train_config(preset: &str, config: Option<&Path>) -> anyhow::Result<TrainConfig> {
    match config {
        Some(path) => Ok(TrainConfig::from_json_file(path)?),
        None => TrainConfig::from_preset(preset).with_context(|| {
            format!("unknown preset '{}', use gpt2-124m or tiny-cpu", preset)
        }),
    }
}

fn render_hellaswag(
    path: &Path,
    tokenizer: Option<&Gpt2Tokenizer>,
) -> anyhow::Result<Vec<RenderedExample>> {
    let Some(tokenizer) = tokenizer else {
        bail!("--hellaswag needs --tokenizer to render examples");
    };
    let examples = load_examples(path)?;
    let rendered = examples
        .iter()
        .map(|ex| render_example(ex, tokenizer))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::info!(path = %path.display(), examples = rendered.len(), "HellaSwag examples loaded");
    Ok(rendered)
}

#[allow(clippy::too_many_arguments)]
fn run_train(
    preset: String,
    config: Option<PathBuf>,
    data_root: Option<String>,
    log_dir: Option<String>,
    max_steps: Option<usize>,
    micro_batch_size: Option<usize>,
    seq_len: Option<usize>,
    device: String,
    tokenizer: Option<PathBuf>,
    hellaswag: Option<PathBuf>,
    init_from: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut cfg = resolve_train_config(&preset, config.as_deref())?;
    if let Some(root) = data_root {
        cfg.data_root = root;
    }
    if let Some(dir) = log_dir {
        cfg.log_dir = dir;
    }
    if let Some(steps) = max_steps {
        cfg.max_steps = steps;
    }
    if let Some(b) = micro_batch_size {
        cfg.micro_batch_size = b;
    }
    if let Some(t) = seq_len {
        cfg.seq_len = t;
    }
    if let Some(path) = hellaswag {
        cfg.hellaswag_path = Some(path.display().to_string());
    }
    cfg.ensure_valid()?;

    let ctx = RunContext::from_env(device.parse::<DevicePreference>()?)?;
    let collective = ctx.connect()?;
    let mut trainer = Trainer::new(cfg.clone(), &ctx, collective)?;
    if let Some(path) = init_from {
        trainer.restore(&path)?;
    }

    let root = Path::new(&cfg.data_root);
    let (b, t) = (cfg.micro_batch_size, cfg.seq_len);
    let mut train_loader =
        ShardedLoader::new(root, Split::Train, b, t, ctx.rank, ctx.world_size, &ctx.device)?;
    let mut val_loader =
        ShardedLoader::new(root, Split::Val, b, t, ctx.rank, ctx.world_size, &ctx.device)?;
    if ctx.is_master {
        tracing::info!(
            root = %root.display(),
            train_shards = train_loader.num_shards(),
            val_shards = val_loader.num_shards(),
            "Data loaded"
        );
    }

    let tokenizer = tokenizer
        .as_deref()
        .map(Gpt2Tokenizer::from_file)
        .transpose()?;
    let examples = match cfg.hellaswag_path.as_deref() {
        Some(path) => render_hellaswag(Path::new(path), tokenizer.as_ref())?,
        None => Vec::new(),
    };
    if tokenizer.is_none() {
        tracing::warn!("No tokenizer given, sampling is disabled");
    }

    let summary = trainer.run(
        &mut train_loader,
        EvalInputs {
            val_loader: Some(&mut val_loader),
            hellaswag: &examples,
            codec: tokenizer.as_ref().map(|t| t as &dyn TextCodec),
        },
    )?;
    if ctx.is_master {
        tracing::info!(
            steps = summary.steps,
            train_loss = summary.final_train_loss,
            val_loss = summary.final_val_loss,
            hellaswag = summary.final_accuracy,
            checkpoints = summary.checkpoints.len(),
            "Run finished"
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        init_logging();
    } else {
        init_console_logging();
    }

    match cli.command {
        Commands::Train {
            preset,
            config,
            data_root,
            log_dir,
            max_steps,
            micro_batch_size,
            seq_len,
            device,
            tokenizer,
            hellaswag,
            init_from,
        } => run_train(
            preset,
            config,
            data_root,
            log_dir,
            max_steps,
            micro_batch_size,
            seq_len,
            device,
            tokenizer,
            hellaswag,
            init_from,
        )?,

        Commands::Generate {
            checkpoint,
            tokenizer,
            prompt,
            num_return_sequences,
            max_length,
            top_k,
            seed,
            device,
        } => {
            let ctx = RunContext::from_env(device.parse::<DevicePreference>()?)?;
            let loaded = load_checkpoint(&checkpoint, &ctx.device)?;
            let (model, varmap) = Gpt::build(&loaded.meta.config, &ctx.device, 0)?;
            restore_vars(&varmap, &loaded.tensors, &checkpoint)?;
            tracing::info!(
                path = %checkpoint.display(),
                step = loaded.meta.step,
                val_loss = loaded.meta.val_loss,
                "Checkpoint loaded"
            );

            let tokenizer = Gpt2Tokenizer::from_file(&tokenizer)?;
            let prompt_ids = tokenizer.encode(&prompt)?;
            let config = SampleConfig {
                num_return_sequences,
                max_length,
                top_k,
                seed,
            };
            let sequences = generate(&model, &prompt_ids, &config, ctx.rank, &ctx.device)?;
            for (i, tokens) in sequences.iter().enumerate() {
                println!("sample {}: {}", i, tokenizer.decode(tokens)?);
            }
        }

        Commands::Import {
            input,
            model_type,
            output_dir,
        } => {
            let config = GptConfig::from_model_type(&model_type).with_context(|| {
                format!(
                    "unknown model type '{}', use gpt2, gpt2-medium, gpt2-large or gpt2-xl",
                    model_type
                )
            })?;
            let device = candle_core::Device::Cpu;
            let (_model, varmap) = Gpt::build(&config, &device, 0)?;
            let count = import_safetensors(&input, &varmap, &device)?;
            let meta = CheckpointMeta {
                config,
                step: 0,
                val_loss: None,
            };
            let path = save_checkpoint(&varmap, &meta, &output_dir)?;
            tracing::info!(
                tensors = count,
                from = %input.display(),
                to = %path.display(),
                "Pretrained weights imported"
            );
        }

        Commands::Prepare {
            text,
            tokenizer,
            output,
            prefix,
            shard_size,
        } => {
            let tokenizer = Gpt2Tokenizer::from_file(&tokenizer)?;
            let raw = std::fs::read_to_string(&text)
                .with_context(|| format!("failed to read {}", text.display()))?;
            // blank lines separate documents
            let documents = raw.split("\n\n").map(str::trim).filter(|d| !d.is_empty());
            let shards = prepare_shards(documents, &tokenizer, &output, &prefix, shard_size)?;
            tracing::info!(shards = shards.len(), output = %output.display(), "Corpus prepared");
        }
    }

    Ok(())
}
