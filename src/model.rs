//! AuditModel wrapper for instrumented forward passes
//!
//! Two seams live here:
//! - [`AuditBackend`]: one model architecture, token ids in, activation cache out
//! - [`ModelRunner`]: what the delta engine consumes, text in, activation cache out

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::cache::ActivationCache;
use crate::capture::CapturePoint;
use crate::forward_gpt2::AuditGpt2;

/// Architecture-level backend trait.
///
/// Implementing this trait is the only requirement for auditing a new
/// architecture: expose the hook points the forward pass records and run
/// the pass on token ids.
pub trait AuditBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn d_mlp(&self) -> usize;
    fn n_heads(&self) -> usize;
    fn context_length(&self) -> usize;

    /// Token prepended to every input, if the architecture uses one
    fn bos_token_id(&self) -> Option<u32> {
        None
    }

    /// Every point recorded by [`forward_with_cache`](Self::forward_with_cache)
    fn capture_points(&self) -> Vec<CapturePoint>;

    // --- Forward pass ---
    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)>;
}

/// Capability consumed by the delta engine.
///
/// A runner exposes a finite set of capture points and, for one input
/// text, produces a cache holding the tensor recorded at each of them.
/// Running must not mutate model parameters or keep state between calls.
pub trait ModelRunner {
    /// Points this runner records on every pass
    fn capture_points(&self) -> Vec<CapturePoint>;

    /// Run one inference-only forward pass on `text`
    fn run_with_cache(&self, text: &str) -> Result<ActivationCache>;
}

/// High-level model wrapper for audits
///
/// Owns the tokenizer and the device; the backend is chosen at load time.
pub struct AuditModel {
    model: Box<dyn AuditBackend>,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
    prepend_bos: bool,
}

impl AuditModel {
    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        let device = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };
        // GPT-2 checkpoints are f32; reduced precision would shift the deltas
        let dtype = DType::F32;

        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let model = AuditGpt2::load(model_id, &device, dtype)?;

        Ok(Self::from_parts(Box::new(model), tokenizer, device, model_id))
    }

    /// Assemble a model from an already-built backend and tokenizer
    pub fn from_parts(
        model: Box<dyn AuditBackend>,
        tokenizer: Tokenizer,
        device: Device,
        model_id: &str,
    ) -> Self {
        let prepend_bos = model.bos_token_id().is_some();
        Self {
            model,
            tokenizer,
            device,
            model_id: model_id.to_string(),
            prepend_bos,
        }
    }

    /// Enable or disable the BOS token in front of every input
    ///
    /// On by default whenever the backend has a BOS token.
    pub fn with_prepend_bos(mut self, prepend_bos: bool) -> Self {
        self.prepend_bos = prepend_bos;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of transformer blocks
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Residual stream width
    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    /// MLP hidden width
    pub fn d_mlp(&self) -> usize {
        self.model.d_mlp()
    }

    pub fn n_heads(&self) -> usize {
        self.model.n_heads()
    }

    /// Longest token sequence one pass accepts, BOS included
    pub fn context_length(&self) -> usize {
        self.model.context_length()
    }

    /// Token ids fed to the model for `text`, BOS included
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if self.prepend_bos {
            if let Some(bos) = self.model.bos_token_id() {
                ids.push(bos);
            }
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    /// Tokenize text and return token strings, BOS included
    pub fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        self.encode(text)?
            .into_iter()
            .map(|id| {
                self.tokenizer
                    .decode(&[id], false)
                    .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
            })
            .collect()
    }

    /// Get every recorded activation for a text input
    pub fn get_activations(&self, text: &str) -> Result<ActivationCache> {
        let input_ids = self.encode(text)?;
        debug!("Forward pass over {} tokens", input_ids.len());

        let input_tensor = Tensor::new(&input_ids[..], &self.device)?.unsqueeze(0)?;
        let (_, cache) = self.model.forward_with_cache(&input_tensor)?;

        Ok(cache)
    }
}

impl ModelRunner for AuditModel {
    fn capture_points(&self) -> Vec<CapturePoint> {
        self.model.capture_points()
    }

    fn run_with_cache(&self, text: &str) -> Result<ActivationCache> {
        self.get_activations(text)
    }
}

impl<R: ModelRunner + ?Sized> ModelRunner for &R {
    fn capture_points(&self) -> Vec<CapturePoint> {
        (**self).capture_points()
    }

    fn run_with_cache(&self, text: &str) -> Result<ActivationCache> {
        (**self).run_with_cache(text)
    }
}
