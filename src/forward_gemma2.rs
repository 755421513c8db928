//! Gemma 2 forward pass with hook points
//!
//! Custom implementation for Gemma 2 (google/gemma-2-2b) used by the word
//! projection game, where layer-6 residual activations feed a sparse
//! autoencoder. Supports:
//! - Alternating sliding window / global attention per layer
//! - Attention logit soft-capping (50.0) and final logit soft-capping (30.0)
//! - Four-norm decoder layers (pre/post attention + pre/post MLP)
//! - GQA with explicit head_dim=256 (not derived from hidden_size/num_heads)

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::kv_cache::KVCache;
use crate::masks::{create_causal_mask, create_generation_mask};
use crate::model::{weight_files, HookedBackend};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Gemma 2 model configuration (matches HuggingFace config.json).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gemma2Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub head_dim: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
    #[serde(default)]
    pub final_logit_softcapping: Option<f64>,
    #[serde(default = "default_query_pre_attn_scalar")]
    pub query_pre_attn_scalar: usize,
    #[serde(default)]
    pub sliding_window: Option<usize>,
}

fn default_rope_theta() -> f64 {
    10000.0
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_max_position_embeddings() -> usize {
    8192
}
fn default_query_pre_attn_scalar() -> usize {
    256
}

impl Gemma2Config {
    /// Sliding window for `layer`: even layers are local, odd layers global.
    fn window_for_layer(&self, layer: usize) -> Option<usize> {
        if layer % 2 == 0 {
            self.sliding_window
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// RmsNorm (Gemma-style: weight + 1.0)
// ---------------------------------------------------------------------------

struct GemmaRmsNorm {
    weight: Tensor,
    eps: f64,
}

impl GemmaRmsNorm {
    fn load(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(dim, "weight")?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let internal_dtype = match x_dtype {
            DType::F16 | DType::BF16 => DType::F32,
            d => d,
        };
        let hidden_size = x.dim(D::Minus1)?;
        let x = x.to_dtype(internal_dtype)?;
        let variance = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden_size as f64)?;
        let x_normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let scale = (self.weight.to_dtype(internal_dtype)? + 1.0)?;
        Ok(x_normed.broadcast_mul(&scale)?.to_dtype(x_dtype)?)
    }
}

// ---------------------------------------------------------------------------
// Rotary Embedding
// ---------------------------------------------------------------------------

struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &Gemma2Config, device: &Device, dtype: DType) -> Result<Self> {
        let head_dim = config.head_dim;
        let max_seq_len = config.max_position_embeddings;
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0f32 / (config.rope_theta.powf(i as f64 / head_dim as f64) as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q_embed, k_embed))
    }
}

/// Per-pass state shared by every layer
struct Pass<'a> {
    rotary: &'a RotaryEmbedding,
    hooks: &'a HookSpec,
    start_pos: usize,
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    n_rep: usize,
    head_dim: usize,
    attn_logit_softcapping: Option<f64>,
    scale: f64,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim;
        let hidden_size = config.hidden_size;

        let q_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            n_rep: num_heads / num_kv_heads,
            head_dim,
            attn_logit_softcapping: config.attn_logit_softcapping,
            scale: 1.0 / (config.query_pre_attn_scalar as f64).sqrt(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        layer: usize,
        window: Option<usize>,
        pass: &Pass,
        kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = pass.rotary.apply(&q, &k, pass.start_pos)?;

        let (k, v) = match kv_cache {
            Some(cache) => cache.append(layer, k, v.contiguous()?)?,
            None => (k, v),
        };

        // GQA: expand KV heads
        let k = repeat_kv(k, self.n_rep)?.contiguous()?;
        let v = repeat_kv(v, self.n_rep)?.contiguous()?;
        let q = q.contiguous()?;

        let mut attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;

        if let Some(sc) = self.attn_logit_softcapping {
            attn_weights = ((attn_weights / sc)?.tanh()? * sc)?;
        }

        let mask = if pass.start_pos == 0 {
            create_causal_mask(seq_len, window, x.device(), x.dtype())?
        } else {
            create_generation_mask(seq_len, pass.start_pos, window, x.device(), x.dtype())?
        };
        attn_weights = attn_weights.broadcast_add(&mask)?;

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, ()))?;

        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((b, n_kv, n_rep, seq_len, head_dim))?
        .reshape((b, n_kv * n_rep, seq_len, head_dim))?)
}

// ---------------------------------------------------------------------------
// MLP (GeGLU: gelu_pytorch_tanh(gate) * up)
// ---------------------------------------------------------------------------

#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let gate_proj = linear_no_bias(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("gate_proj"),
        )?;
        let up_proj = linear_no_bias(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("up_proj"),
        )?;
        let down_proj = linear_no_bias(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("down_proj"),
        )?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    fn forward(&self, x: &Tensor, layer: usize, pass: &Pass, cache: &mut HookCache) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.gelu()?;
        let up = pass.hooks.apply(
            HookPoint::MlpUp(layer),
            self.up_proj.forward(x)?,
            pass.start_pos,
            cache,
        )?;
        let hidden = pass
            .hooks
            .apply(HookPoint::MlpPost(layer), (gate * up)?, pass.start_pos, cache)?;
        pass.hooks.apply(
            HookPoint::MlpOut(layer),
            self.down_proj.forward(&hidden)?,
            pass.start_pos,
            cache,
        )
    }
}

// ---------------------------------------------------------------------------
// Decoder Layer (4 norms: pre/post attention + pre/post MLP)
// ---------------------------------------------------------------------------

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: GemmaRmsNorm,
    post_attention_layernorm: GemmaRmsNorm,
    pre_feedforward_layernorm: GemmaRmsNorm,
    post_feedforward_layernorm: GemmaRmsNorm,
    window: Option<usize>,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &Gemma2Config, layer_idx: usize) -> Result<Self> {
        let norm = |name: &str| GemmaRmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp(name));
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: norm("input_layernorm")?,
            post_attention_layernorm: norm("post_attention_layernorm")?,
            pre_feedforward_layernorm: norm("pre_feedforward_layernorm")?,
            post_feedforward_layernorm: norm("post_feedforward_layernorm")?,
            window: config.window_for_layer(layer_idx),
        })
    }

    fn forward(
        &self,
        xs: Tensor,
        layer: usize,
        pass: &Pass,
        kv_cache: Option<&mut KVCache>,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let residual = pass
            .hooks
            .apply(HookPoint::ResidPre(layer), xs, pass.start_pos, cache)?;
        let xs = self.input_layernorm.forward(&residual)?;
        let xs = self
            .self_attn
            .forward(&xs, layer, self.window, pass, kv_cache)?;
        let xs = self.post_attention_layernorm.forward(&xs)?;
        let residual = (xs + residual)?;

        let xs = self.pre_feedforward_layernorm.forward(&residual)?;
        let xs = self.mlp.forward(&xs, layer, pass, cache)?;
        let xs = self.post_feedforward_layernorm.forward(&xs)?;
        pass.hooks.apply(
            HookPoint::ResidPost(layer),
            (residual + xs)?,
            pass.start_pos,
            cache,
        )
    }
}

// ---------------------------------------------------------------------------
// HookedGemma2
// ---------------------------------------------------------------------------

/// Gemma 2 model with hook points at every layer.
pub struct HookedGemma2 {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: GemmaRmsNorm,
    rotary: RotaryEmbedding,
    config: Gemma2Config,
    device: Device,
}

impl HookedGemma2 {
    /// Load Gemma 2 model from HuggingFace.
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading Gemma 2 from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Gemma2Config = serde_json::from_str(&config_str)?;

        info!(
            "Gemma 2 config: {} layers, hidden={}, heads={}, kv_heads={}, head_dim={}, vocab={}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.head_dim,
            config.vocab_size
        );
        info!(
            "  attn_softcap={:?}, final_softcap={:?}, sliding_window={:?}",
            config.attn_logit_softcapping, config.final_logit_softcapping, config.sliding_window
        );

        let weights_paths = weight_files(&repo)?;
        info!("Loading weights from {} file(s)...", weights_paths.len());

        // SAFETY: the safetensors files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::from_varbuilder(config, vb, device)
    }

    /// Build the model from an existing VarBuilder (HF tensor names).
    pub fn from_varbuilder(config: Gemma2Config, vb: VarBuilder, device: &Device) -> Result<Self> {
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                &config,
                i,
            )?);
        }

        let norm =
            GemmaRmsNorm::load(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;
        let rotary = RotaryEmbedding::new(&config, device, vb.dtype())?;

        info!(
            "Gemma 2 loaded: {} layers (vocab_size: {})",
            config.num_hidden_layers, config.vocab_size
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
            config,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &Gemma2Config {
        &self.config
    }

    /// Apply final logit soft-capping: `sc * tanh(logits / sc)`.
    fn apply_final_softcap(&self, logits: Tensor) -> Result<Tensor> {
        match self.config.final_logit_softcapping {
            Some(sc) => Ok(((logits / sc)?.tanh()? * sc)?),
            None => Ok(logits),
        }
    }

    fn run(
        &self,
        input_ids: &Tensor,
        hooks: &HookSpec,
        mut kv_cache: Option<&mut KVCache>,
    ) -> Result<HookCache> {
        let start_pos = kv_cache.as_ref().map_or(0, |c| c.seq_len());
        let pass = Pass {
            rotary: &self.rotary,
            hooks,
            start_pos,
        };
        let mut cache = HookCache::new();

        // Embedding with sqrt(hidden_size) scaling
        let normalizer = (self.config.hidden_size as f64).sqrt();
        let embedded = (self.embed_tokens.forward(input_ids)? * normalizer)?;
        let mut hidden = hooks.apply(HookPoint::Embed, embedded, start_pos, &mut cache)?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(hidden, i, &pass, kv_cache.as_deref_mut(), &mut cache)?;
        }

        let output = hooks.apply(
            HookPoint::FinalNorm,
            self.norm.forward(&hidden)?,
            start_pos,
            &mut cache,
        )?;
        cache.set_output(output);
        Ok(cache)
    }
}

impl HookedBackend for HookedGemma2 {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn d_mlp(&self) -> usize {
        self.config.intermediate_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_hooked(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.run(input_ids, hooks, None)
    }

    /// Tied embeddings, then the final soft-cap.
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?;
        self.apply_final_softcap(logits)
    }

    fn new_kv_cache(&self) -> KVCache {
        KVCache::new(self.config.num_hidden_layers)
    }

    fn forward_with_kv_cache(
        &self,
        input_ids: &Tensor,
        kv_cache: &mut KVCache,
        hooks: &HookSpec,
    ) -> Result<Tensor> {
        let output = self.run(input_ids, hooks, Some(kv_cache))?.into_output()?;
        let seq_len = output.dim(1)?;
        self.project_to_vocab(&output.i((.., seq_len - 1, ..))?)
    }
}
