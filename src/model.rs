//! GPT-style causal language model built on candle

use crate::lora::{LoraConfig, LoraLinear};
use candle_core::{bail, DType, IndexOp, Module, ModuleT, Result, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear_b, ops::softmax, Dropout, Embedding, LayerNorm, LayerNormConfig,
    Linear, VarBuilder,
};
use std::cmp;
use std::path::PathBuf;

/// Config for specifying parameters of the causal LM
#[derive(Debug, Clone, Copy)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub context_length: usize,
    pub emb_dim: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub drop_rate: f32,
    pub qkv_bias: bool,
}

impl ModelConfig {
    /// The 124M-parameter base configuration
    pub fn base() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 768,
            n_heads: 12,
            n_layers: 12,
            drop_rate: 0.1,
            qkv_bias: true,
        }
    }

    /// The 355M-parameter medium configuration
    pub fn medium() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 1_024,
            n_heads: 16,
            n_layers: 24,
            drop_rate: 0.1,
            qkv_bias: true,
        }
    }

    /// A tiny configuration for unit tests
    pub fn tiny_test() -> Self {
        Self {
            vocab_size: 500,
            context_length: 16,
            emb_dim: 12,
            n_heads: 3,
            n_layers: 2,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }
}

/// A linear projection that may carry a LoRA adapter.
///
/// Kept as an explicit enum rather than a trait object so the concrete layer
/// stays visible when adapters are injected after construction.
#[derive(Clone, Debug)]
pub enum ProjLayer {
    Plain(Linear),
    Lora(LoraLinear),
}

impl ProjLayer {
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            ProjLayer::Plain(linear) => linear.forward(xs),
            ProjLayer::Lora(lora) => lora.forward_t(xs, train),
        }
    }

    fn add_lora(&mut self, cfg: &LoraConfig, vb: VarBuilder<'_>) -> Result<()> {
        if let ProjLayer::Plain(base) = self {
            let wrapped = LoraLinear::wrap(base.clone(), cfg, vb)?;
            *self = ProjLayer::Lora(wrapped);
        }
        Ok(())
    }
}

/// Multi-head causal self-attention with LoRA-wrappable query/value
/// projections.
#[derive(Clone, Debug)]
pub struct CausalSelfAttention {
    w_query: ProjLayer,
    w_key: ProjLayer,
    w_value: ProjLayer,
    out_proj: Linear,
    dropout: Dropout,
    n_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    pub fn new(cfg: ModelConfig, vb: VarBuilder<'_>) -> Result<Self> {
        if cfg.emb_dim % cfg.n_heads != 0 {
            bail!(
                "emb_dim ({}) must be divisible by n_heads ({})",
                cfg.emb_dim,
                cfg.n_heads
            );
        }
        let d = cfg.emb_dim;
        let w_query = ProjLayer::Plain(linear_b(d, d, cfg.qkv_bias, vb.pp("query"))?);
        let w_key = ProjLayer::Plain(linear_b(d, d, cfg.qkv_bias, vb.pp("key"))?);
        let w_value = ProjLayer::Plain(linear_b(d, d, cfg.qkv_bias, vb.pp("value"))?);
        let out_proj = linear_b(d, d, true, vb.pp("out_proj"))?;
        Ok(Self {
            w_query,
            w_key,
            w_value,
            out_proj,
            dropout: Dropout::new(cfg.drop_rate),
            n_heads: cfg.n_heads,
            head_dim: d / cfg.n_heads,
        })
    }

    /// Wraps the query and value projections with LoRA adapters registered
    /// under `vb`.
    pub fn add_lora(&mut self, cfg: &LoraConfig, vb: VarBuilder<'_>) -> Result<()> {
        self.w_query.add_lora(cfg, vb.pp("query"))?;
        self.w_value.add_lora(cfg, vb.pp("value"))?;
        Ok(())
    }

    fn split_heads(&self, xs: Tensor, b: usize, t: usize) -> Result<Tensor> {
        xs.reshape((b, t, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl ModuleT for CausalSelfAttention {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, c) = xs.dims3()?;
        let queries = self.split_heads(self.w_query.forward_t(xs, train)?, b, t)?;
        let keys = self.split_heads(self.w_key.forward_t(xs, train)?, b, t)?;
        let values = self.split_heads(self.w_value.forward_t(xs, train)?, b, t)?;

        let scores = queries.matmul(&keys.transpose(D::Minus2, D::Minus1)?)?;
        let scores = (scores / (self.head_dim as f64).sqrt())?;

        let mask = Tensor::tril2(t, DType::U8, xs.device())?
            .reshape((1, 1, t, t))?
            .broadcast_as(scores.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, xs.device())?
            .to_dtype(scores.dtype())?
            .broadcast_as(scores.shape())?;
        let scores = mask.where_cond(&scores, &neg_inf)?;

        let weights = softmax(&scores, D::Minus1)?;
        let weights = self.dropout.forward(&weights, train)?;

        let context = weights
            .matmul(&values)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, c))?;
        self.out_proj.forward(&context)
    }
}

/// Position-wise feed forward with GELU
#[derive(Clone, Debug)]
pub struct FeedForward {
    fc: Linear,
    proj: Linear,
}

impl FeedForward {
    pub fn new(cfg: ModelConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let fc = linear_b(cfg.emb_dim, 4 * cfg.emb_dim, true, vb.pp("fc"))?;
        let proj = linear_b(4 * cfg.emb_dim, cfg.emb_dim, true, vb.pp("proj"))?;
        Ok(Self { fc, proj })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.proj.forward(&self.fc.forward(xs)?.gelu()?)
    }
}

/// A pre-norm transformer block
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    att: CausalSelfAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    drop_shortcut: Dropout,
}

impl TransformerBlock {
    pub fn new(cfg: ModelConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let ln_cfg = LayerNormConfig::default();
        Ok(Self {
            att: CausalSelfAttention::new(cfg, vb.pp("mha"))?,
            ff: FeedForward::new(cfg, vb.pp("ff"))?,
            norm1: layer_norm(cfg.emb_dim, ln_cfg, vb.pp("norm1"))?,
            norm2: layer_norm(cfg.emb_dim, ln_cfg, vb.pp("norm2"))?,
            drop_shortcut: Dropout::new(cfg.drop_rate),
        })
    }

    pub fn attention_mut(&mut self) -> &mut CausalSelfAttention {
        &mut self.att
    }
}

impl ModuleT for TransformerBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = xs.clone();
        let mut x = self.norm1.forward(xs)?;
        x = self.att.forward_t(&x, train)?;
        x = self.drop_shortcut.forward(&x, train)?;
        x = (x + shortcut)?;

        let shortcut = x.clone();
        let mut y = self.norm2.forward(&x)?;
        y = self.ff.forward(&y)?;
        y = self.drop_shortcut.forward(&y, train)?;
        y + shortcut
    }
}

/// The decoder-only causal LM
pub struct GptModel {
    tok_emb: Embedding,
    pos_emb: Embedding,
    drop_emb: Dropout,
    blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    out_head: Linear,
    cfg: ModelConfig,
}

impl GptModel {
    /// Creates a new `GptModel`
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::{VarBuilder, VarMap};
    /// use exam_eval_rs::model::{GptModel, ModelConfig};
    ///
    /// let varmap = VarMap::new();
    /// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    /// let model = GptModel::new(ModelConfig::tiny_test(), vb.pp("model")).unwrap();
    /// ```
    pub fn new(cfg: ModelConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let tok_emb = embedding(cfg.vocab_size, cfg.emb_dim, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.context_length, cfg.emb_dim, vb.pp("pos_emb"))?;
        let blocks = (0..cfg.n_layers)
            .map(|ix| TransformerBlock::new(cfg, vb.pp(format!("blocks.{}", ix))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = layer_norm(cfg.emb_dim, LayerNormConfig::default(), vb.pp("final_norm"))?;
        let out_head = linear_b(cfg.emb_dim, cfg.vocab_size, false, vb.pp("out_head"))?;
        Ok(Self {
            tok_emb,
            pos_emb,
            drop_emb: Dropout::new(cfg.drop_rate),
            blocks,
            final_norm,
            out_head,
            cfg,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    /// Injects LoRA adapters into every block's attention projections. The
    /// adapter variables are registered under `vb`, which is expected to be
    /// backed by its own `VarMap` so that only adapter weights reach the
    /// optimizer.
    pub fn add_lora(&mut self, cfg: &LoraConfig, vb: VarBuilder<'_>) -> Result<()> {
        for (ix, block) in self.blocks.iter_mut().enumerate() {
            block
                .attention_mut()
                .add_lora(cfg, vb.pp(format!("blocks.{}.mha", ix)))?;
        }
        Ok(())
    }
}

impl ModuleT for GptModel {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch_size, seq_len) = xs.dims2()?;
        let tok_embeds = self.tok_emb.forward(xs)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, xs.device())?;
        let pos_embeds = self.pos_emb.embeddings().index_select(&pos_ids, 0)?;

        let mut x = tok_embeds.broadcast_add(&pos_embeds)?;
        x = self.drop_emb.forward(&x, train)?;
        for block in self.blocks.iter() {
            x = block.forward_t(&x, train)?;
        }
        x = self.final_norm.forward(&x)?;
        self.out_head.forward(&x)
    }
}

/// Greedy generation: appends up to `max_new_tokens` tokens to `idx`,
/// stopping early when `eos_token_id` is produced (single-sequence batches
/// only; the stop token is not appended).
pub fn generate_text(
    model: &GptModel,
    idx: Tensor,
    max_new_tokens: usize,
    context_size: usize,
    eos_token_id: Option<u32>,
) -> Result<Tensor> {
    let mut idx = idx.clone();
    for _ in 0..max_new_tokens {
        let (b, seq_len) = idx.dims2()?;
        let start = cmp::max(0isize, seq_len as isize - context_size as isize) as usize;
        let idx_cond = idx.i((.., start..seq_len))?;
        let logits = model.forward_t(&idx_cond, false)?;
        let (_b, c, _vocab_size) = logits.dims3()?;
        let logits = logits.i((.., c - 1, ..))?;
        let probas = softmax(&logits, 1)?;
        let idx_next = probas.argmax_keepdim(D::Minus1)?;
        if b == 1 {
            if let Some(eos) = eos_token_id {
                if idx_next.flatten_all()?.to_vec1::<u32>()?[0] == eos {
                    break;
                }
            }
        }
        idx = Tensor::cat(&[&idx, &idx_next], D::Minus1)?;
    }
    Ok(idx)
}

/// Fetches a checkpoint file from the HuggingFace hub, returning its local
/// cache path.
pub fn download_pretrained(model_id: &str, filename: &str) -> anyhow::Result<PathBuf> {
    let api = hf_hub::api::sync::Api::new()?;
    let repo = api.model(model_id.to_string());
    let path = repo.get(filename)?;
    Ok(path)
}
