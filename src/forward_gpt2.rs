//! GPT-2 forward pass with hook-point activation capture
//!
//! Custom implementation that runs block by block and records every
//! signal of [`CapturePoint::all`] into an [`ActivationCache`].
//!
//! Differences from the LLaMA-family blocks:
//! - Learned absolute position embeddings (`wpe`) instead of RoPE
//! - LayerNorm with bias instead of RmsNorm
//! - Projections stored as `Conv1D` (weight shape `(in, out)`), all with bias
//! - Fused QKV projection (`c_attn`)
//! - Two-layer MLP with `gelu_new` instead of SwiGLU

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, Embedding, LayerNorm, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use crate::cache::ActivationCache;
use crate::capture::CapturePoint;
use crate::masks::create_causal_mask;
use crate::model::AuditBackend;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    /// MLP width; `null` in config.json means `4 * n_embd`
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_activation_function")]
    pub activation_function: String,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,
    #[serde(default)]
    pub model_type: Option<String>,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_activation_function() -> String {
    "gelu_new".to_string()
}

fn default_bos_token_id() -> u32 {
    50256
}

impl Gpt2Config {
    /// Width of the MLP hidden layer (`mlp.hook_pre` / `mlp.hook_post`)
    pub fn d_mlp(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

/// MLP nonlinearity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    /// Tanh approximation used by the original GPT-2 checkpoints
    GeluNew,
    /// Exact erf-based GELU
    Gelu,
    Relu,
}

impl Activation {
    fn from_config(name: &str) -> Result<Self> {
        match name {
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(Self::GeluNew),
            "gelu" => Ok(Self::Gelu),
            "relu" => Ok(Self::Relu),
            other => anyhow::bail!("Unsupported activation function: {other}"),
        }
    }

    fn apply(self, x: &Tensor) -> Result<Tensor> {
        let y = match self {
            Self::GeluNew => x.gelu()?,
            Self::Gelu => x.gelu_erf()?,
            Self::Relu => x.relu()?,
        };
        Ok(y)
    }
}

/// Load a GPT-2 `Conv1D` as a regular linear layer
///
/// `Conv1D` keeps its weight as `(in, out)`; `Linear` expects `(out, in)`.
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight.t()?.contiguous()?, Some(bias)))
}

/// Multi-head causal self-attention with fused QKV projection
struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        anyhow::ensure!(
            config.n_embd % config.n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            config.n_embd,
            config.n_head
        );
        let c_attn = conv1d(config.n_embd, 3 * config.n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d(config.n_embd, config.n_embd, vb.pp("c_proj"))?;

        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            head_dim: config.n_embd / config.n_head,
        })
    }

    /// Returns `(output, z)` where `z` is the attention-weighted value mix
    /// with heads concatenated, taken before `c_proj`: `[batch, seq, d_model]`
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, seq_len, d_model) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let split_heads = |index: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, index * d_model, d_model)?
                .reshape((b, seq_len, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(0)?;
        let k = split_heads(1)?;
        let v = split_heads(2)?;

        // Scaled dot-product attention
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let scores = scores.broadcast_add(&mask)?;
        let pattern = candle_nn::ops::softmax_last_dim(&scores)?;

        let z = pattern
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, d_model))?;
        let output = self.c_proj.forward(&z)?;
        Ok((output, z))
    }
}

/// Values recorded inside the MLP
struct MlpTrace {
    pre: Tensor,
    post: Tensor,
    output: Tensor,
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    activation: Activation,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let d_mlp = config.d_mlp();
        Ok(Self {
            c_fc: conv1d(config.n_embd, d_mlp, vb.pp("c_fc"))?,
            c_proj: conv1d(d_mlp, config.n_embd, vb.pp("c_proj"))?,
            activation: Activation::from_config(&config.activation_function)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<MlpTrace> {
        let pre = self.c_fc.forward(x)?;
        let post = self.activation.apply(&pre)?;
        let output = self.c_proj.forward(&post)?;
        Ok(MlpTrace { pre, post, output })
    }
}

/// Single pre-LN transformer block
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            ln_1: candle_nn::layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: candle_nn::layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
        })
    }

    /// Run the block and record its eight hook points under `layer`
    fn forward(&self, x: &Tensor, layer: usize, cache: &mut ActivationCache) -> Result<Tensor> {
        let (attn_out, z) = self.attn.forward(&self.ln_1.forward(x)?)?;
        let resid_mid = (x + &attn_out)?;

        let mlp = self.mlp.forward(&self.ln_2.forward(&resid_mid)?)?;
        let resid_post = (&resid_mid + &mlp.output)?;

        cache.insert(CapturePoint::resid_pre(layer), x.clone());
        cache.insert(CapturePoint::attn_z(layer), z);
        cache.insert(CapturePoint::attn_out(layer), attn_out);
        cache.insert(CapturePoint::resid_mid(layer), resid_mid);
        cache.insert(CapturePoint::mlp_pre(layer), mlp.pre);
        cache.insert(CapturePoint::mlp_post(layer), mlp.post);
        cache.insert(CapturePoint::mlp_out(layer), mlp.output);
        cache.insert(CapturePoint::resid_post(layer), resid_post.clone());

        Ok(resid_post)
    }
}

/// Safetensors index for sharded checkpoints
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// GPT-2 with activation capture at every hook point
pub struct AuditGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    config: Gpt2Config,
}

impl AuditGpt2 {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading GPT-2 from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Gpt2Config = serde_json::from_str(&config_str)?;

        if let Some(model_type) = config.model_type.as_deref() {
            anyhow::ensure!(
                model_type == "gpt2",
                "{model_id} is a `{model_type}` checkpoint, expected `gpt2`"
            );
        }

        info!(
            "Model config: {} layers, {} hidden, {} mlp, {} vocab",
            config.n_layer,
            config.n_embd,
            config.d_mlp(),
            config.vocab_size
        );

        let weights_paths = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
            shard_names.sort();
            shard_names.dedup();

            info!("Downloading {} shard files...", shard_names.len());
            let mut paths = Vec::with_capacity(shard_names.len());
            for shard_name in &shard_names {
                let path = repo
                    .get(shard_name)
                    .with_context(|| format!("Failed to download {shard_name}"))?;
                paths.push(path);
            }
            paths
        } else {
            let path = repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?;
            vec![path]
        };

        info!("Loading weights from {} file(s)...", weights_paths.len());
        // SAFETY: the files are read-only checkpoints fetched into the hub cache
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };

        Self::from_var_builder(vb, config)
    }

    /// Build the model from already-resolved weights
    ///
    /// Accepts both bare checkpoints (`wte.weight`) and ones saved from the
    /// LM-head wrapper (`transformer.wte.weight`).
    pub fn from_var_builder(vb: VarBuilder, config: Gpt2Config) -> Result<Self> {
        let vb = if vb.contains_tensor("wte.weight") {
            vb
        } else {
            vb.pp("transformer")
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            debug!("Loading block {}/{}", i + 1, config.n_layer);
            blocks.push(Block::load(vb.pp(format!("h.{i}")), &config)?);
        }

        let ln_f = candle_nn::layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        info!("Model loaded successfully with {} blocks", config.n_layer);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            config,
        })
    }

    /// Forward pass recording every hook point
    ///
    /// `input_ids` has shape `[batch, seq_len]`. Returns the final
    /// layer-normed hidden state and the filled cache.
    pub fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
        let (_batch, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(seq_len > 0, "Cannot run a forward pass on zero tokens");
        anyhow::ensure!(
            seq_len <= self.config.n_positions,
            "Sequence of {seq_len} tokens exceeds the {}-token context window",
            self.config.n_positions
        );

        let mut cache = ActivationCache::new();

        let token_embed = self.wte.forward(input_ids)?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let pos_embed = self.wpe.forward(&positions)?.unsqueeze(0)?;
        let mut hidden = token_embed.broadcast_add(&pos_embed)?;

        cache.insert(CapturePoint::embed(), token_embed);
        cache.insert(CapturePoint::pos_embed(), pos_embed);

        for (i, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(&hidden, i, &mut cache)?;
            debug!("Processed block {}/{}", i + 1, self.blocks.len());
        }

        let output = self.ln_f.forward(&hidden)?;
        Ok((output, cache))
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }
}

impl AuditBackend for AuditGpt2 {
    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn d_model(&self) -> usize {
        self.config.n_embd
    }

    fn d_mlp(&self) -> usize {
        self.config.d_mlp()
    }

    fn n_heads(&self) -> usize {
        self.config.n_head
    }

    fn context_length(&self) -> usize {
        self.config.n_positions
    }

    fn bos_token_id(&self) -> Option<u32> {
        Some(self.config.bos_token_id)
    }

    fn capture_points(&self) -> Vec<CapturePoint> {
        CapturePoint::all(self.config.n_layer)
    }

    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
        self.forward_with_cache(input_ids)
    }
}
