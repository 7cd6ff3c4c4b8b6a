//! GPT-2 tokenizer wrapper using HuggingFace tokenizers crate.

use std::path::Path;

use crate::error::{TrainError, TrainResult};

/// Text <-> token ID conversion used by sampling, benchmark rendering and
/// shard preparation.
pub trait TextCodec {
    fn encode(&self, text: &str) -> TrainResult<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> TrainResult<String>;

    /// Token appended between documents when building shards.
    fn eot_token(&self) -> Option<u32> {
        None
    }
}

/// GPT-2 BPE tokenizer (50257 vocab).
pub struct Gpt2Tokenizer {
    inner: tokenizers::Tokenizer,
    pub vocab_size: usize,
    eot: Option<u32>,
}

impl Gpt2Tokenizer {
    /// Load from a local tokenizer.json file.
    pub fn from_file(path: &Path) -> TrainResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            TrainError::Tokenizer(format!("failed to load {}: {}", path.display(), e))
        })?;
        Ok(Self::wrap(inner))
    }

    /// Load from raw bytes (e.g. embedded tokenizer.json).
    pub fn from_bytes(bytes: &[u8]) -> TrainResult<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| TrainError::Tokenizer(format!("failed to load from bytes: {}", e)))?;
        Ok(Self::wrap(inner))
    }

    fn wrap(inner: tokenizers::Tokenizer) -> Self {
        let vocab_size = inner.get_vocab_size(true);
        let eot = inner.token_to_id("<|endoftext|>");
        Self {
            inner,
            vocab_size,
            eot,
        }
    }
}

impl TextCodec for Gpt2Tokenizer {
    fn encode(&self, text: &str) -> TrainResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TrainError::Tokenizer(format!("encoding error: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> TrainResult<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| TrainError::Tokenizer(format!("decoding error: {}", e)))
    }

    fn eot_token(&self) -> Option<u32> {
        self.eot
    }
}
