//! LLaMA forward pass with hook points
//!
//! Layer-by-layer implementation of the Llama 3.x architecture that runs
//! [`HookSpec::apply`] at every named hook point, so activations can be
//! captured and individual MLP neurons edited during the pass.
//!
//! Architecture notes:
//! - No bias on any projection (Q, K, V, O, MLP)
//! - GQA (8 KV heads for 8B)
//! - SwiGLU MLP: `down(silu(gate(x)) * up(x))`
//! - Llama 3.1 frequency-scaled RoPE (`rope_scaling.rope_type = "llama3"`)
//! - Optional tied embeddings (Llama 3.2 1B/3B)

use std::f64::consts::PI;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::hooks::{HookCache, HookPoint, HookSpec};
use crate::kv_cache::KVCache;
use crate::masks::{create_causal_mask, create_generation_mask};
use crate::model::{weight_files, HookedBackend};

/// RoPE tables are built up to this many positions
const MAX_ROPE_POSITIONS: usize = 8192;

/// Model configuration (matches HuggingFace config.json)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

/// Llama 3.1 RoPE frequency scaling
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RopeScaling {
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
    #[serde(default, alias = "type")]
    pub rope_type: Option<String>,
}

fn default_rope_theta() -> f64 {
    500_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    131_072
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

impl LlamaConfig {
    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Rotary position embeddings (half-rotation layout, as in HuggingFace)
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, device: &Device, dtype: DType) -> Result<Self> {
        let dim = config.head_dim();
        let max_seq_len = config.max_position_embeddings.min(MAX_ROPE_POSITIONS);

        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| 1.0 / config.rope_theta.powf(i as f64 / dim as f64))
            .map(|freq| scale_frequency(freq, config.rope_scaling.as_ref()) as f32)
            .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;

        // Positions stay in f32 so large indices keep full precision
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Llama 3.1 frequency scaling: long wavelengths are slowed down by
/// `factor`, short ones are kept, the band in between is interpolated.
fn scale_frequency(freq: f64, scaling: Option<&RopeScaling>) -> f64 {
    let Some(s) = scaling else {
        return freq;
    };
    if s.rope_type.as_deref().is_some_and(|t| t != "llama3") {
        return freq;
    }
    let original = s.original_max_position_embeddings as f64;
    let low_freq_wavelen = original / s.low_freq_factor;
    let high_freq_wavelen = original / s.high_freq_factor;
    let wavelen = 2.0 * PI / freq;

    if wavelen < high_freq_wavelen {
        freq
    } else if wavelen > low_freq_wavelen {
        freq / s.factor
    } else {
        let smooth =
            (original / wavelen - s.low_freq_factor) / (s.high_freq_factor - s.low_freq_factor);
        (1.0 - smooth) * freq / s.factor + smooth * freq
    }
}

/// Per-pass state shared by every layer
struct Pass<'a> {
    rotary: &'a RotaryEmbedding,
    hooks: &'a HookSpec,
    start_pos: usize,
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let q_proj = linear_no_bias(
            config.hidden_size,
            config.num_attention_heads * head_dim,
            vb.pp("q_proj"),
        )?;
        let k_proj = linear_no_bias(
            config.hidden_size,
            config.num_key_value_heads * head_dim,
            vb.pp("k_proj"),
        )?;
        let v_proj = linear_no_bias(
            config.hidden_size,
            config.num_key_value_heads * head_dim,
            vb.pp("v_proj"),
        )?;
        let o_proj = linear_no_bias(
            config.num_attention_heads * head_dim,
            config.hidden_size,
            vb.pp("o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        layer: usize,
        pass: &Pass,
        kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = pass.rotary.apply(&q, &k, pass.start_pos)?;

        // Cache before GQA expansion
        let (k, v) = match kv_cache {
            Some(cache) => cache.append(layer, k, v.contiguous()?)?,
            None => (k, v),
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;
        let q = q.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = if pass.start_pos == 0 {
            create_causal_mask(seq_len, None, x.device(), x.dtype())?
        } else {
            create_generation_mask(seq_len, pass.start_pos, None, x.device(), x.dtype())?
        };
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((b, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU MLP with hooks on the up projection, the gated hidden state and
/// the down projection
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
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
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
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

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let self_attn = Attention::load(vb.pp("self_attn"), config)?;
        let mlp = MLP::load(vb.pp("mlp"), config)?;
        let input_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        x: Tensor,
        layer: usize,
        pass: &Pass,
        kv_cache: Option<&mut KVCache>,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let residual = pass
            .hooks
            .apply(HookPoint::ResidPre(layer), x, pass.start_pos, cache)?;
        let h = self.input_layernorm.forward(&residual)?;
        let h = self.self_attn.forward(&h, layer, pass, kv_cache)?;
        let residual = (residual + h)?;

        let h = self.post_attention_layernorm.forward(&residual)?;
        let h = self.mlp.forward(&h, layer, pass, cache)?;
        pass.hooks.apply(
            HookPoint::ResidPost(layer),
            (residual + h)?,
            pass.start_pos,
            cache,
        )
    }
}

/// LLaMA model with hook points at every layer
pub struct HookedLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: LlamaConfig,
    device: Device,
}

impl HookedLlama {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading LLaMA from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: LlamaConfig = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} mlp, {} vocab",
            config.num_hidden_layers,
            config.hidden_size,
            config.intermediate_size,
            config.vocab_size
        );

        let weights_paths = weight_files(&repo)?;
        info!("Loading weights from {} file(s)...", weights_paths.len());

        // SAFETY: the safetensors files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::from_varbuilder(config, vb, device)
    }

    /// Build the model from an existing VarBuilder (HF tensor names).
    pub fn from_varbuilder(config: LlamaConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
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
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(&config, device, vb.dtype())?;

        info!(
            "Model loaded successfully with {} layers (vocab_size: {})",
            config.num_hidden_layers, config.vocab_size
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    /// Run the hooked pass. With a KV cache, `input_ids` continue the cached
    /// sequence; the cache output holds final-norm hidden states.
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

        let mut hidden = hooks.apply(
            HookPoint::Embed,
            self.embed_tokens.forward(input_ids)?,
            start_pos,
            &mut cache,
        )?;

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

impl HookedBackend for HookedLlama {
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

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.lm_head.forward(hidden)?)
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
