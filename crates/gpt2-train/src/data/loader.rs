//! Deterministic rank-strided batch feeder over token shards.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use super::shards::{list_shards, load_tokens, Split};
use crate::error::{TrainError, TrainResult};

/// Streams `(x, y)` batches of shape `(B, T)` from a split's shards.
///
/// Rank `r` of `n` reads windows at offsets `B*T*(r + k*n)` within a shard,
/// so workers see disjoint interleaved slices. When the next stride would run
/// past the active shard the feeder moves to the next shard (circularly) and
/// restarts at the rank's base offset; the tail of the old shard is dropped.
pub struct ShardedLoader {
    batch_size: usize,
    seq_len: usize,
    rank: usize,
    world_size: usize,
    split: Split,
    shards: Vec<PathBuf>,
    current_shard: usize,
    tokens: Vec<u32>,
    position: usize,
    device: Device,
}

impl ShardedLoader {
    /// List the split's shards under `root` and load the first one.
    pub fn new(
        root: &Path,
        split: Split,
        batch_size: usize,
        seq_len: usize,
        rank: usize,
        world_size: usize,
        device: &Device,
    ) -> TrainResult<Self> {
        let shards = list_shards(root, split)?;
        Self::from_shards(shards, split, batch_size, seq_len, rank, world_size, device)
    }

    pub fn from_shards(
        shards: Vec<PathBuf>,
        split: Split,
        batch_size: usize,
        seq_len: usize,
        rank: usize,
        world_size: usize,
        device: &Device,
    ) -> TrainResult<Self> {
        if shards.is_empty() {
            return Err(TrainError::DataAvailability(format!(
                "no shards found for split '{}'",
                split
            )));
        }
        if batch_size == 0 || seq_len == 0 {
            return Err(TrainError::Config(
                "batch_size and seq_len must be greater than 0".to_string(),
            ));
        }
        if world_size == 0 || rank >= world_size {
            return Err(TrainError::Config(format!(
                "rank {} out of range for world size {}",
                rank, world_size
            )));
        }

        tracing::info!(
            split = %split,
            num_shards = shards.len(),
            batch_size,
            seq_len,
            rank,
            "Found shards"
        );

        let mut loader = Self {
            batch_size,
            seq_len,
            rank,
            world_size,
            split,
            shards,
            current_shard: 0,
            tokens: Vec::new(),
            position: 0,
            device: device.clone(),
        };
        loader.reset()?;
        Ok(loader)
    }

    /// Back to shard 0 at this rank's base offset.
    pub fn reset(&mut self) -> TrainResult<()> {
        self.current_shard = 0;
        self.tokens = load_tokens(&self.shards[0])?;
        self.position = self.base_offset();
        Ok(())
    }

    fn base_offset(&self) -> usize {
        self.batch_size * self.seq_len * self.rank
    }

    fn stride(&self) -> usize {
        self.batch_size * self.seq_len * self.world_size
    }

    fn window_fits(&self) -> bool {
        self.position + self.stride() + 1 <= self.tokens.len()
    }

    /// Advance shards until the active one can serve a stride.
    fn ensure_window(&mut self) -> TrainResult<()> {
        let mut attempts = 0;
        while !self.window_fits() {
            if attempts == self.shards.len() {
                return Err(TrainError::DataAvailability(format!(
                    "no '{}' shard holds {} tokens for rank {} of {}",
                    self.split,
                    self.base_offset() + self.stride() + 1,
                    self.rank,
                    self.world_size
                )));
            }
            attempts += 1;
            let next = (self.current_shard + 1) % self.shards.len();
            tracing::debug!(
                split = %self.split,
                from = self.current_shard,
                to = next,
                dropped_tail = self.tokens.len().saturating_sub(self.position),
                "Advancing to next shard"
            );
            if next != self.current_shard {
                self.tokens = load_tokens(&self.shards[next])?;
            }
            self.current_shard = next;
            self.position = self.base_offset();
        }
        Ok(())
    }

    /// Raw `B*T+1` token window for the next batch.
    pub fn next_window(&mut self) -> TrainResult<Vec<u32>> {
        self.ensure_window()?;
        let len = self.batch_size * self.seq_len + 1;
        let window = self.tokens[self.position..self.position + len].to_vec();
        self.position += self.stride();
        Ok(window)
    }

    /// Next `(x, y)` pair; `y` is `x` shifted left by one token.
    pub fn next_batch(&mut self) -> TrainResult<(Tensor, Tensor)> {
        let window = self.next_window()?;
        let n = self.batch_size * self.seq_len;
        let shape = (self.batch_size, self.seq_len);
        let x = Tensor::from_slice(&window[..n], shape, &self.device)?;
        let y = Tensor::from_slice(&window[1..], shape, &self.device)?;
        Ok((x, y))
    }

    pub fn current_shard(&self) -> usize {
        self.current_shard
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}
