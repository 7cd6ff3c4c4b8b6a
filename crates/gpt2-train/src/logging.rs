//! Structured logging for training with tracing, plus the plain-text metrics
//! log written by the master rank.
//!
//! Events carry structured fields so JSON output can be filtered by `event`.
//! Non-finite losses and large gradient norms are flagged automatically.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{IoResultExt, TrainResult};

const GRAD_NORM_WARN: f64 = 10.0;

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs for production monitoring.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gpt2_train=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();

    info!("Structured logging initialized");
}

/// Initialize human-readable console logging.
pub fn init_console_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gpt2_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .try_init();
}

/// Per-step metrics reported by the master.
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    /// Mean loss over all micro-steps and ranks.
    pub loss: f64,
    /// Learning rate applied this step.
    pub learning_rate: f64,
    /// Total gradient norm before clipping.
    pub grad_norm: f64,
    pub tokens_per_sec: f64,
    pub step_ms: f64,
}

/// Log a training step with structured metrics.
///
/// Emits an error for a NaN/infinite loss and a warning for a gradient norm
/// above 10.
pub fn log_training_step(step: usize, metrics: &TrainingMetrics) {
    let span = span!(Level::INFO, "training_step", step = step);
    let _enter = span.enter();

    if !metrics.loss.is_finite() {
        error!(
            loss = metrics.loss,
            step = step,
            event = "divergence",
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        loss = format!("{:.6}", metrics.loss),
        lr = format!("{:.4e}", metrics.learning_rate),
        grad_norm = format!("{:.4}", metrics.grad_norm),
        dt_ms = format!("{:.2}", metrics.step_ms),
        tokens_per_sec = format!("{:.2}", metrics.tokens_per_sec),
        "Training step completed"
    );

    if metrics.grad_norm > GRAD_NORM_WARN {
        warn!(
            grad_norm = metrics.grad_norm,
            step = step,
            threshold = GRAD_NORM_WARN,
            "High gradient norm before clipping"
        );
    }

    debug!(step = step, raw_loss = metrics.loss, "Training diagnostics");
}

/// Log validation loss.
pub fn log_evaluation(step: usize, val_loss: f64) {
    info!(
        step = step,
        val_loss = format!("{:.4}", val_loss),
        event = "evaluation",
        "Validation loss"
    );
}

/// Log multiple-choice benchmark accuracy.
pub fn log_benchmark(step: usize, correct: usize, total: usize, accuracy: f64) {
    info!(
        step = step,
        correct = correct,
        total = total,
        accuracy = format!("{:.4}", accuracy),
        event = "hellaswag",
        "HellaSwag accuracy"
    );
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &Path, val_loss: Option<f64>, size: &str) {
    info!(
        step = step,
        path = %path.display(),
        val_loss = val_loss,
        size = size,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log one generated continuation.
pub fn log_sample(rank: usize, index: usize, text: &str) {
    info!(rank = rank, sample = index, text = text, event = "sample", "Generated sample");
}

/// Append-only `"<step> <tag> <value>"` lines in `<log_dir>/log.txt`.
///
/// Only the master opens one; the file is truncated on creation.
pub struct MetricsLog {
    path: PathBuf,
    file: File,
}

impl MetricsLog {
    pub const FILE_NAME: &'static str = "log.txt";

    pub fn create(log_dir: &Path) -> TrainResult<Self> {
        std::fs::create_dir_all(log_dir).with_path(log_dir)?;
        let path = log_dir.join(Self::FILE_NAME);
        File::create(&path).with_path(&path)?;
        let file = OpenOptions::new().append(true).open(&path).with_path(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, line: String) -> TrainResult<()> {
        writeln!(self.file, "{}", line).with_path(&self.path)?;
        self.file.flush().with_path(&self.path)
    }

    pub fn train(&mut self, step: usize, loss: f64) -> TrainResult<()> {
        self.append(format!("{} train {:.6}", step, loss))
    }

    pub fn val(&mut self, step: usize, loss: f64) -> TrainResult<()> {
        self.append(format!("{} val {:.4}", step, loss))
    }

    pub fn hella(&mut self, step: usize, accuracy: f64) -> TrainResult<()> {
        self.append(format!("{} hella {:.4}", step, accuracy))
    }
}
