//! GPT-2 decoder: token + position embedding -> pre-norm blocks -> tied LM head.
//!
//! Parameter names follow the HuggingFace layout (`transformer.h.{i}.attn.c_attn`
//! and so on) so pretrained weights map onto the var map one-to-one. The output
//! projection has no parameter of its own: it multiplies by the transpose of
//! the token embedding.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Embedding, LayerNorm, Linear, Module, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::config::GptConfig;
use crate::error::{TrainError, TrainResult};

const LN_EPS: f64 = 1e-5;
const INIT_STD: f64 = 0.02;

/// The forward capability the training loop, evaluator and sampler rely on.
pub trait LanguageModel {
    /// `(B, T)` u32 tokens -> `(B, T, vocab)` logits.
    fn forward(&self, tokens: &Tensor) -> Result<Tensor>;

    /// Maximum context the model accepts.
    fn block_size(&self) -> usize;

    /// Logits plus mean next-token cross-entropy against `targets`.
    fn forward_with_loss(&self, tokens: &Tensor, targets: &Tensor) -> Result<(Tensor, Tensor)> {
        let logits = self.forward(tokens)?;
        let (b, t, v) = logits.dims3()?;
        let loss = candle_nn::loss::cross_entropy(
            &logits.reshape((b * t, v))?,
            &targets.flatten_all()?,
        )?;
        Ok((logits, loss))
    }
}

/// Upper triangle filled with -inf, diagonal and below = 0.
fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)
}

struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_attn: candle_nn::linear(cfg.n_embd, 3 * cfg.n_embd, vb.pp("c_attn"))?,
            c_proj: candle_nn::linear(cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
            n_head: cfg.n_head,
            head_dim: cfg.head_dim(),
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let head_dim = self.head_dim;
        let qkv = self.c_attn.forward(x)?;

        let heads = |i: usize| -> Result<Tensor> {
            qkv.narrow(2, i * c, c)?
                .reshape((b, t, self.n_head, head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let (q, k, v) = (heads(0)?, heads(1)?, heads(2)?);

        let scale = 1.0 / (head_dim as f64).sqrt();
        let att = (q.matmul(&k.t()?)? * scale)?;
        let att = att.broadcast_add(mask)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let y = att.matmul(&v)?; // (B, nh, T, hd)

        let y = y.transpose(1, 2)?.reshape((b, t, c))?;
        self.c_proj.forward(&y)
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: candle_nn::linear(cfg.n_embd, 4 * cfg.n_embd, vb.pp("c_fc"))?,
            c_proj: candle_nn::linear(4 * cfg.n_embd, cfg.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // tanh-approximated GELU, as in GPT-2
        self.c_proj.forward(&self.c_fc.forward(x)?.gelu()?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: candle_nn::layer_norm(cfg.n_embd, LN_EPS, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(cfg, vb.pp("attn"))?,
            ln_2: candle_nn::layer_norm(cfg.n_embd, LN_EPS, vb.pp("ln_2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, mask)?)?;
        &x + self.mlp.forward(&self.ln_2.forward(&x)?)?
    }
}

/// GPT-2 language model.
pub struct Gpt {
    config: GptConfig,
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
}

impl Gpt {
    pub fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("transformer");
        let wte = candle_nn::embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = candle_nn::embedding(config.block_size, config.n_embd, vb.pp("wpe"))?;
        let blocks = (0..config.n_layer)
            .map(|i| Block::new(config, vb.pp(format!("h.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = candle_nn::layer_norm(config.n_embd, LN_EPS, vb.pp("ln_f"))?;
        Ok(Self {
            config: config.clone(),
            wte,
            wpe,
            blocks,
            ln_f,
        })
    }

    /// Fresh model on `device` with a new var map and seeded GPT-2 init.
    pub fn build(config: &GptConfig, device: &Device, seed: u64) -> TrainResult<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vb)?;
        init_weights(&varmap, config, seed)?;
        Ok((model, varmap))
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// The output projection matrix; the same tensor as the token embedding.
    pub fn lm_head_weight(&self) -> &Tensor {
        self.wte.embeddings()
    }

    pub fn token_embedding(&self) -> &Tensor {
        self.wte.embeddings()
    }
}

impl LanguageModel for Gpt {
    fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (b, t) = tokens.dims2()?;
        if t > self.config.block_size {
            candle_core::bail!(
                "cannot forward sequence of length {}, block size is only {}",
                t,
                self.config.block_size
            );
        }
        let device = tokens.device();
        let pos = Tensor::arange(0u32, t as u32, device)?;
        let tok_emb = self.wte.forward(tokens)?; // (B, T, C)
        let pos_emb = self.wpe.forward(&pos)?; // (T, C)
        let mut x = tok_emb.broadcast_add(&pos_emb)?;

        let mask = causal_mask(t, device)?;
        for block in &self.blocks {
            x = block.forward(&x, &mask)?;
        }
        let x = self.ln_f.forward(&x)?;

        let c = self.config.n_embd;
        x.reshape((b * t, c))?
            .matmul(&self.lm_head_weight().t()?)?
            .reshape((b, t, ()))
    }

    fn block_size(&self) -> usize {
        self.config.block_size
    }
}

/// Overwrite every var with the GPT-2 initialization, deterministically.
///
/// Vars are visited in sorted name order from one RNG, so every process that
/// uses the same seed and config starts from identical parameters:
/// - biases: 0
/// - layer-norm scale: 1
/// - residual output projections (`c_proj.weight`): N(0, 0.02 / sqrt(2 * n_layer))
/// - all other weights and embeddings: N(0, 0.02)
pub fn init_weights(varmap: &VarMap, config: &GptConfig, seed: u64) -> TrainResult<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainError::Candle("var map lock poisoned".to_string()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let proj_std = INIT_STD * (2.0 * config.n_layer as f64).powf(-0.5);

    for name in names {
        let var = &data[name];
        let shape = var.shape().clone();
        let device = var.device();
        let is_norm = name.contains(".ln_") || name.contains("ln_f");
        let value = if name.ends_with(".bias") {
            Tensor::zeros(&shape, DType::F32, device)?
        } else if is_norm {
            Tensor::ones(&shape, DType::F32, device)?
        } else {
            let std = if name.ends_with("c_proj.weight") {
                proj_std
            } else {
                INIT_STD
            };
            let normal = Normal::new(0.0f32, std as f32)
                .map_err(|e| TrainError::Config(format!("init std {}: {}", std, e)))?;
            let values: Vec<f32> = (0..shape.elem_count())
                .map(|_| normal.sample(&mut rng))
                .collect();
            Tensor::from_vec(values, &shape, device)?
        };
        var.set(&value)?;
    }
    Ok(())
}

/// Mean cross-entropy per row over masked positions; the mask is shifted with
/// the targets so a row's score starts at its last context token.
///
/// `tokens`: `(N, L)` u32, `mask`: `(N, L)` f32, `logits`: `(N, L, V)`.
/// Returns the index of the lowest-loss row.
pub fn most_likely_row(tokens: &Tensor, mask: &Tensor, logits: &Tensor) -> Result<usize> {
    let (n, l, _v) = logits.dims3()?;
    if l < 2 {
        candle_core::bail!("rows need at least 2 tokens to score, got {}", l);
    }
    let shift_logits = logits.narrow(1, 0, l - 1)?.contiguous()?;
    let shift_tokens = tokens.narrow(1, 1, l - 1)?.contiguous()?;
    let shift_mask = mask.narrow(1, 1, l - 1)?.to_dtype(DType::F32)?;

    let log_probs = candle_nn::ops::log_softmax(&shift_logits, D::Minus1)?;
    let picked = log_probs
        .gather(&shift_tokens.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?; // (N, L-1)
    let losses = picked.neg()?;

    let sum_loss = (losses * &shift_mask)?.sum(1)?;
    let count = shift_mask.sum(1)?;
    let avg = sum_loss.div(&count)?; // (N,)
    let avg = avg.to_vec1::<f32>()?;

    let mut best = 0;
    for i in 1..n {
        // NaN rows (empty mask) never win
        if avg[i] < avg[best] || avg[best].is_nan() {
            best = i;
        }
    }
    Ok(best)
}
