//! Error types for GPT-2 training.
//!
//! Every failure the orchestration core can hit maps onto one variant here.
//! Configuration, data-availability and synchronization errors are fatal at
//! startup; checkpoint errors are surfaced by the master and never retried.

use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TrainError {
    /// Errors from the Candle tensor library
    #[error("Candle error: {0}")]
    Candle(String),

    /// Invalid batch geometry, schedule preconditions, bad launch variables.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No shards for a split, or shards that cannot feed a single batch.
    #[error("Data availability error: {0}")]
    DataAvailability(String),

    /// The collective backend could not be reached or broke mid-run.
    #[error("Synchronization error: {0}")]
    Synchronization(String),

    /// Checkpoint save/load failures
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// Pretrained weight import failures (name set or shape mismatch)
    #[error("Import error: {0}")]
    Import(String),

    /// Tokenizer load/encode/decode failures
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },
}

/// Result type alias for training operations
pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Errors that must abort the run before the first step.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            TrainError::Config(_) | TrainError::DataAvailability(_) | TrainError::Synchronization(_)
        )
    }

    /// Get the path associated with this error (if any)
    pub fn path(&self) -> Option<&str> {
        match self {
            TrainError::Checkpoint { path, .. } => Some(path),
            TrainError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        TrainError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        TrainError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

/// Helper trait for adding path context to IO operations
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T> {
        self.map_err(|e| TrainError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint errors
pub fn checkpoint_error<P: AsRef<std::path::Path>>(message: impl Into<String>, path: P) -> TrainError {
    TrainError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> TrainError {
    TrainError::Config(message.into())
}

/// Helper for creating synchronization errors
pub fn sync_error(message: impl Into<String>) -> TrainError {
    TrainError::Synchronization(message.into())
}
