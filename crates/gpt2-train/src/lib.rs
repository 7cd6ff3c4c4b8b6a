//! # GPT-2 Training Library
//!
//! Pretraining orchestration for GPT-2 style language models on candle.
//!
//! ## Architecture Overview
//!
//! - **Data**: rank-strided sequential feeder over pre-tokenized `.npy`/`.bin`
//!   shards, plus shard preparation and HellaSwag rendering
//! - **Distributed**: environment-derived run context, blocking collectives
//!   (single process, in-process threads, TCP star), deferred gradient sync
//! - **Optimization**: gradient accumulation, global-norm clipping, warmup +
//!   cosine learning rate, AdamW with decay/no-decay parameter groups
//! - **Periodic work**: validation loss, HellaSwag accuracy, top-k sampling
//!   and safetensors checkpoints on a step-keyed cadence
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gpt2_train::config::TrainConfig;
//! use gpt2_train::data::{ShardedLoader, Split};
//! use gpt2_train::dist::{DevicePreference, RunContext};
//! use gpt2_train::train::{EvalInputs, Trainer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = TrainConfig::tiny_cpu();
//! let ctx = RunContext::from_env(DevicePreference::Auto)?;
//! let mut trainer = Trainer::new(config.clone(), &ctx, ctx.connect()?)?;
//!
//! let mut train = ShardedLoader::new(
//!     config.data_root.as_ref(),
//!     Split::Train,
//!     config.micro_batch_size,
//!     config.seq_len,
//!     ctx.rank,
//!     ctx.world_size,
//!     &ctx.device,
//! )?;
//! trainer.run(&mut train, EvalInputs::default())?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dist;
pub mod error;
pub mod eval;
pub mod import;
pub mod logging;
pub mod model;
pub mod optim;
pub mod sample;
pub mod schedule;
pub mod train;

pub use error::{TrainError, TrainResult};
