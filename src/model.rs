//! CarnivalModel wrapper for hooked language models
//!
//! Supports LLaMA (steering and knob games) and Gemma 2 (word projection game)
//! behind one [`HookedBackend`] interface.

use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::chat::{ChatFormat, ChatMessage};
use crate::forward_gemma2::HookedGemma2;
use crate::forward_llama::HookedLlama;
use crate::hooks::{HookCache, HookSite, HookSpec};
use crate::intervention::{log_softmax_last, NeuronSteeringResult, NeuronSteeringSpec};
use crate::kv_cache::KVCache;

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// LLaMA 3.x (Meta)
    Llama,
    /// Gemma 2 (Google)
    Gemma2,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        let model_lower = model_id.to_lowercase();
        if model_lower.contains("gemma") {
            ModelArchitecture::Gemma2
        } else if model_lower.contains("llama") {
            ModelArchitecture::Llama
        } else {
            info!(
                "Unknown model architecture for '{}', defaulting to Llama",
                model_id
            );
            ModelArchitecture::Llama
        }
    }
}

/// Unified backend trait for hooked transformer models.
///
/// Every implementation calls [`HookSpec::apply`] at each hook point, which
/// is all the steering, stats and projection code relies on.
pub trait HookedBackend: Send + Sync {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    /// MLP hidden width (`intermediate_size`)
    fn d_mlp(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn device(&self) -> &Device;

    // --- Forward passes ---

    /// Full pass over `input_ids` (`[batch, seq]`). The cache output holds
    /// the final-norm hidden states `[batch, seq, d_model]`.
    fn forward_hooked(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    /// Hidden states to vocabulary logits (including any final soft-cap).
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor>;

    // --- Generation (KV-cache) ---
    fn new_kv_cache(&self) -> KVCache;

    /// Process `input_ids` after the cached positions, returning the logits
    /// of the last new position `[batch, vocab]`.
    fn forward_with_kv_cache(
        &self,
        input_ids: &Tensor,
        kv_cache: &mut KVCache,
        hooks: &HookSpec,
    ) -> Result<Tensor>;

    /// Width of the activation at `site`
    fn units_at(&self, site: HookSite) -> usize {
        if site.is_mlp_hidden() {
            self.d_mlp()
        } else {
            self.d_model()
        }
    }

    /// Next-token logits `[batch, vocab]` at the final position.
    fn last_token_logits(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<Tensor> {
        let cache = self.forward_hooked(input_ids, hooks)?;
        let hidden = cache.output()?;
        let seq_len = hidden.dim(1)?;
        ensure!(seq_len > 0, "Empty input sequence");
        self.project_to_vocab(&hidden.i((.., seq_len - 1, ..))?)
    }

    /// Autoregressive generation with the KV-cache. The hooks apply to the
    /// prompt prefill and to every decode step.
    fn generate(
        &self,
        prompt_ids: &[u32],
        max_tokens: usize,
        temperature: f32,
        stop_tokens: &[u32],
        hooks: &HookSpec,
    ) -> Result<Vec<u32>> {
        ensure!(!prompt_ids.is_empty(), "Cannot generate from an empty prompt");

        let mut kv_cache = self.new_kv_cache();
        let input = Tensor::new(prompt_ids, self.device())?.unsqueeze(0)?;
        let mut logits = self.forward_with_kv_cache(&input, &mut kv_cache, hooks)?;

        let mut generated = Vec::with_capacity(max_tokens);
        while generated.len() < max_tokens {
            let next = sample_token(&logits, temperature)?;
            if stop_tokens.contains(&next) {
                break;
            }
            generated.push(next);
            if generated.len() == max_tokens {
                break;
            }
            let input = Tensor::new(&[next], self.device())?.unsqueeze(0)?;
            logits = self.forward_with_kv_cache(&input, &mut kv_cache, hooks)?;
        }

        debug!(
            "Generated {} tokens (cache: {} positions, {} bytes)",
            generated.len(),
            kv_cache.seq_len(),
            kv_cache.memory_usage()
        );
        Ok(generated)
    }
}

/// Safetensors index for sharded models.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Download the weight files of a repo (sharded or single).
pub(crate) fn weight_files(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        info!("Model is sharded, loading index...");
        let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
        let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
        shard_names.sort();
        shard_names.dedup();
        info!("Downloading {} shard files...", shard_names.len());
        shard_names
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("Failed to download {name}"))
            })
            .collect()
    } else {
        let path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        Ok(vec![path])
    }
}

/// Pick the device and dtype: CUDA in BF16 when available, else CPU in F32.
pub fn select_device(force_cpu: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            (dev, DType::BF16)
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

/// One candidate for the next token
#[derive(Debug, Clone, Serialize)]
pub struct TokenPrediction {
    pub token_id: u32,
    pub token: String,
    pub probability: f32,
    pub log_prob: f32,
}

/// High-level model wrapper for the carnival games
pub struct CarnivalModel {
    backend: Box<dyn HookedBackend>,
    tokenizer: Tokenizer,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
}

impl CarnivalModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, false)
    }

    /// Load with explicit device choice
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: bool) -> Result<Self> {
        let architecture = ModelArchitecture::from_model_id(model_id);
        let (device, dtype) = select_device(force_cpu);

        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let backend: Box<dyn HookedBackend> = match architecture {
            ModelArchitecture::Llama => Box::new(HookedLlama::load(model_id, &device, dtype)?),
            ModelArchitecture::Gemma2 => Box::new(HookedGemma2::load(model_id, &device, dtype)?),
        };

        Ok(Self::from_parts(backend, tokenizer, architecture, model_id))
    }

    /// Assemble a model from an already-built backend and tokenizer.
    pub fn from_parts(
        backend: Box<dyn HookedBackend>,
        tokenizer: Tokenizer,
        architecture: ModelArchitecture,
        model_id: &str,
    ) -> Self {
        let device = backend.device().clone();
        Self {
            backend,
            tokenizer,
            device,
            architecture,
            model_id: model_id.to_string(),
        }
    }

    pub fn backend(&self) -> &dyn HookedBackend {
        self.backend.as_ref()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn d_mlp(&self) -> usize {
        self.backend.d_mlp()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Chat template matching this checkpoint
    pub fn chat_format(&self) -> ChatFormat {
        ChatFormat::for_model(self.architecture, &self.model_id)
    }

    /// Tokenize text
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Tokenize a prompt. Chat-formatted prompts already carry their BOS
    /// marker, plain prompts get the tokenizer's special tokens.
    pub fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
        let add_special_tokens = self.chat_format() == ChatFormat::Plain;
        let ids = self.encode(text, add_special_tokens)?;
        ensure!(!ids.is_empty(), "Prompt {text:?} produced no tokens");
        Ok(ids)
    }

    /// `[1, seq]` input tensor for a prompt
    pub fn prompt_tensor(&self, text: &str) -> Result<Tensor> {
        let ids = self.encode_prompt(text)?;
        Ok(Tensor::new(&ids[..], &self.device)?.unsqueeze(0)?)
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    /// Decode a token ID to string
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    /// Vocabulary id of an exact token string
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    /// Id of the token a word is predicted as, mid-sentence.
    ///
    /// Tries the byte-level BPE form (`Ġword`), then the SentencePiece form
    /// (`▁word`), then encodes `" word"` and requires a single token.
    pub fn word_token_id(&self, word: &str) -> Result<u32> {
        let word = word.trim();
        ensure!(!word.is_empty(), "Empty word");

        if let Some(id) = self
            .token_id(&format!("Ġ{word}"))
            .or_else(|| self.token_id(&format!("▁{word}")))
        {
            return Ok(id);
        }

        let ids = self.encode(&format!(" {word}"), false)?;
        match ids.as_slice() {
            [id] if self.is_unknown_token(*id) => bail!("Word {word:?} is not in the vocabulary"),
            [id] => Ok(*id),
            _ => bail!(
                "Word {word:?} is not a single token (encodes to {} tokens)",
                ids.len()
            ),
        }
    }

    fn is_unknown_token(&self, id: u32) -> bool {
        matches!(
            self.tokenizer.id_to_token(id).as_deref(),
            Some("<unk>" | "[UNK]" | "<|unk|>")
        )
    }

    /// End-of-sequence / end-of-turn token ids known to the tokenizer
    pub fn eos_token_ids(&self) -> Vec<u32> {
        ["<|eot_id|>", "<|end_of_text|>", "<end_of_turn>", "<eos>", "</s>"]
            .iter()
            .filter_map(|t| self.token_id(t))
            .collect()
    }

    /// Hooked forward pass over a prompt
    pub fn run_hooked(&self, text: &str, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward_hooked(&self.prompt_tensor(text)?, hooks)
    }

    /// Next-token logits `[1, vocab]` for a prompt
    pub fn last_token_logits(&self, text: &str, hooks: &HookSpec) -> Result<Tensor> {
        self.backend
            .last_token_logits(&self.prompt_tensor(text)?, hooks)
    }

    /// Baseline and steered next-token logits for one prompt.
    pub fn forward_with_neuron_steering(
        &self,
        text: &str,
        spec: &NeuronSteeringSpec,
    ) -> Result<NeuronSteeringResult> {
        let input = self.prompt_tensor(text)?;
        spec.validate(
            self.backend.n_layers(),
            self.backend.units_at(spec.site),
            input.dim(1)?,
        )?;

        let baseline = self.backend.last_token_logits(&input, &HookSpec::new())?;
        let steered = self.backend.last_token_logits(&input, &spec.to_hook_spec())?;
        Ok(NeuronSteeringResult::new(baseline, steered, spec.clone()))
    }

    /// Top-k next-token candidates
    pub fn predict_next(
        &self,
        text: &str,
        hooks: &HookSpec,
        k: usize,
    ) -> Result<Vec<TokenPrediction>> {
        let logits = self.last_token_logits(text, hooks)?;
        self.top_predictions(&logits, k)
    }

    /// Top-k candidates from a logit vector
    pub fn top_predictions(&self, logits: &Tensor, k: usize) -> Result<Vec<TokenPrediction>> {
        let log_probs = log_softmax_last(logits)?;

        let mut ranked: Vec<(usize, f32)> = log_probs.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(idx, log_prob)| TokenPrediction {
                token_id: idx as u32,
                token: self.decode_token(idx as u32),
                probability: log_prob.exp(),
                log_prob,
            })
            .collect())
    }

    /// Generate a continuation of `prompt`, optionally steered.
    pub fn generate(
        &self,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        spec: Option<&NeuronSteeringSpec>,
    ) -> Result<GenerationResult> {
        let prompt_tokens = self.encode_prompt(prompt)?;
        let hooks = match spec {
            Some(spec) => {
                spec.validate(
                    self.backend.n_layers(),
                    self.backend.units_at(spec.site),
                    prompt_tokens.len(),
                )?;
                spec.to_hook_spec()
            }
            None => HookSpec::new(),
        };
        let stop_tokens = self.eos_token_ids();

        let generated_tokens = self.backend.generate(
            &prompt_tokens,
            max_tokens,
            temperature,
            &stop_tokens,
            &hooks,
        )?;

        let all_tokens: Vec<u32> = prompt_tokens
            .iter()
            .chain(generated_tokens.iter())
            .copied()
            .collect();

        Ok(GenerationResult {
            prompt: prompt.to_string(),
            full_text: self.decode(&all_tokens, true)?,
            generated_text: self.decode(&generated_tokens, true)?,
            total_tokens: all_tokens.len(),
            prompt_tokens,
            generated_tokens,
        })
    }

    /// Generate an assistant reply to a user message.
    pub fn generate_chat(
        &self,
        user: &str,
        max_tokens: usize,
        temperature: f32,
        spec: Option<&NeuronSteeringSpec>,
    ) -> Result<String> {
        let format = self.chat_format();
        let prompt = format.render(&[ChatMessage::user(user)], true, false);
        let result = self.generate(&prompt, max_tokens, temperature, spec)?;

        let reply = result.generated_text.trim();
        let reply = format
            .end_of_turn()
            .map_or(reply, |marker| reply.trim_end_matches(marker));
        Ok(reply.trim().to_string())
    }
}

/// Sample a token from logits
pub fn sample_token(logits: &Tensor, temperature: f32) -> Result<u32> {
    if temperature <= 0.0 {
        argmax(logits)
    } else {
        sample_with_temperature(logits, temperature)
    }
}

/// Argmax sampling (greedy)
pub fn argmax(logits: &Tensor) -> Result<u32> {
    let logits_vec: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    let (max_idx, _) = logits_vec
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;

    Ok(max_idx as u32)
}

/// Temperature-based sampling
fn sample_with_temperature(logits: &Tensor, temperature: f32) -> Result<u32> {
    use rand::Rng;

    let logits_vec: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    ensure!(!logits_vec.is_empty(), "Empty logits");

    let scaled: Vec<f32> = logits_vec.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let mut rng = rand::thread_rng();
    let r: f32 = rng.gen::<f32>() * sum;
    let mut cumsum = 0.0;
    for (idx, &p) in exp_vals.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }

    Ok((exp_vals.len() - 1) as u32)
}

/// Result of text generation with details
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    /// Original prompt text
    pub prompt: String,
    /// Full output (prompt + generated)
    pub full_text: String,
    /// Only the generated portion
    pub generated_text: String,
    /// Token IDs from the prompt
    pub prompt_tokens: Vec<u32>,
    /// Token IDs that were generated
    pub generated_tokens: Vec<u32>,
    /// Total token count
    pub total_tokens: usize,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::forward_llama::LlamaConfig;
    use crate::intervention::EditKind;
    use crate::neuron::{NeuronTarget, TokenPosition};
    use candle_nn::{VarBuilder, VarMap};
    use serial_test::serial;
    use std::str::FromStr;

    /// Whitespace word-level tokenizer over a fixed vocabulary.
    pub(crate) fn word_tokenizer(words: &[&str]) -> Tokenizer {
        let vocab: serde_json::Map<String, serde_json::Value> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), serde_json::json!(i)))
            .collect();
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        Tokenizer::from_str(&json.to_string()).unwrap()
    }

    const WORDS: [&str; 12] = [
        "<unk>", "the", "ball", "was", "passed", "to", "Ġlebron", "Ġjordan", "▁water",
        "fire", "<|eot_id|>", "sky",
    ];

    pub(crate) fn tiny_model() -> CarnivalModel {
        let config: LlamaConfig = serde_json::from_str(
            r#"{
                "hidden_size": 8,
                "intermediate_size": 16,
                "num_attention_heads": 2,
                "num_key_value_heads": 1,
                "num_hidden_layers": 2,
                "vocab_size": 12,
                "max_position_embeddings": 32
            }"#,
        )
        .unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let backend = HookedLlama::from_varbuilder(config, vb, &Device::Cpu).unwrap();
        CarnivalModel::from_parts(
            Box::new(backend),
            word_tokenizer(&WORDS),
            ModelArchitecture::Llama,
            "test/tiny-llama",
        )
    }

    #[test]
    fn test_architecture_detection() {
        assert_eq!(
            ModelArchitecture::from_model_id("meta-llama/Llama-3.1-8B-Instruct"),
            ModelArchitecture::Llama
        );
        assert_eq!(
            ModelArchitecture::from_model_id("google/gemma-2-2b"),
            ModelArchitecture::Gemma2
        );
        assert_eq!(
            ModelArchitecture::from_model_id("someone/mystery"),
            ModelArchitecture::Llama
        );
    }

    #[test]
    fn test_argmax_and_greedy_sampling() {
        let logits = Tensor::new(&[0.1f32, 2.0, -1.0, 1.9], &Device::Cpu).unwrap();
        assert_eq!(argmax(&logits).unwrap(), 1);
        assert_eq!(sample_token(&logits, 0.0).unwrap(), 1);
        let sampled = sample_token(&logits, 1.0).unwrap();
        assert!(sampled < 4);
    }

    #[test]
    fn test_word_token_lookup() {
        let model = tiny_model();
        assert_eq!(model.word_token_id("lebron").unwrap(), 6);
        assert_eq!(model.word_token_id(" jordan ").unwrap(), 7);
        assert_eq!(model.word_token_id("water").unwrap(), 8);
        assert_eq!(model.word_token_id("fire").unwrap(), 9);
        assert!(model.word_token_id("").is_err());
        assert!(model.word_token_id("curry").is_err());
        assert_eq!(model.eos_token_ids(), vec![10]);
    }

    #[test]
    #[serial]
    fn test_steering_result_and_predictions() {
        let model = tiny_model();
        assert_eq!(model.chat_format(), ChatFormat::Plain);

        let spec = NeuronSteeringSpec::new(EditKind::Clamp(25.0))
            .site(HookSite::MlpPost)
            .neuron(NeuronTarget::new(1, 3));
        let result = model
            .forward_with_neuron_steering("the ball was passed to", &spec)
            .unwrap();
        assert!(result.kl_divergence().unwrap() >= 0.0);

        let preds = model
            .predict_next("the ball was passed to", &HookSpec::new(), 3)
            .unwrap();
        assert_eq!(preds.len(), 3);
        assert!(preds[0].probability >= preds[1].probability);
    }

    #[test]
    #[serial]
    fn test_invalid_spec_rejected() {
        let model = tiny_model();
        let spec = NeuronSteeringSpec::zero().neuron(NeuronTarget::new(5, 0));
        assert!(model.forward_with_neuron_steering("sky", &spec).is_err());
    }

    fn logits_vec(logits: &Tensor) -> Vec<f32> {
        logits
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len());
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    /// Prefill `prompt`, then decode `next` through the KV-cache.
    fn cached_decode_logits(
        backend: &dyn HookedBackend,
        prompt: &[u32],
        next: u32,
        hooks: &HookSpec,
    ) -> Vec<f32> {
        let dev = backend.device();
        let mut kv_cache = backend.new_kv_cache();
        let prefill = Tensor::new(prompt, dev).unwrap().unsqueeze(0).unwrap();
        backend
            .forward_with_kv_cache(&prefill, &mut kv_cache, hooks)
            .unwrap();
        let step = Tensor::new(&[next], dev).unwrap().unsqueeze(0).unwrap();
        let logits = backend
            .forward_with_kv_cache(&step, &mut kv_cache, hooks)
            .unwrap();
        assert_eq!(kv_cache.seq_len(), prompt.len() + 1);
        logits_vec(&logits)
    }

    fn full_pass_logits(backend: &dyn HookedBackend, ids: &[u32], hooks: &HookSpec) -> Vec<f32> {
        let input = Tensor::new(ids, backend.device()).unwrap().unsqueeze(0).unwrap();
        logits_vec(&backend.last_token_logits(&input, hooks).unwrap())
    }

    fn clamp_at(tokens: &[TokenPosition]) -> HookSpec {
        let target = NeuronTarget::new(1, 3);
        tokens
            .iter()
            .fold(
                NeuronSteeringSpec::new(EditKind::Clamp(25.0)).site(HookSite::MlpPost),
                |spec, &token| spec.neuron(target.at(token)),
            )
            .to_hook_spec()
    }

    #[test]
    #[serial]
    fn test_cached_decode_matches_full_pass_with_edits() {
        let model = tiny_model();
        let backend = model.backend();
        let prompt = [1u32, 2, 3];
        let next = 5u32;
        let full: Vec<u32> = prompt.iter().copied().chain([next]).collect();

        let unsteered = full_pass_logits(backend, &full, &HookSpec::new());
        assert!(
            max_abs_diff(&cached_decode_logits(backend, &prompt, next, &HookSpec::new()), &unsteered)
                < 1e-3
        );

        // `All` edits every prefill position and the decoded token
        let all = clamp_at(&[TokenPosition::All]);
        let steered = full_pass_logits(backend, &full, &all);
        assert!(max_abs_diff(&steered, &unsteered) > 1e-2);
        assert!(max_abs_diff(&cached_decode_logits(backend, &prompt, next, &all), &steered) < 1e-3);

        // `LAST` edits the last prompt token at prefill, then each decoded token
        let last = cached_decode_logits(backend, &prompt, next, &clamp_at(&[TokenPosition::LAST]));
        let expected = full_pass_logits(
            backend,
            &full,
            &clamp_at(&[TokenPosition::Index(2), TokenPosition::Index(3)]),
        );
        assert!(max_abs_diff(&last, &expected) < 1e-3);

        // An absolute index only applies at its own position
        let first = clamp_at(&[TokenPosition::Index(0)]);
        assert!(
            max_abs_diff(
                &cached_decode_logits(backend, &prompt, next, &first),
                &full_pass_logits(backend, &full, &first)
            ) < 1e-3
        );
    }

    #[test]
    #[serial]
    fn test_steered_generation_follows_steered_logits() {
        let model = tiny_model();
        let spec = NeuronSteeringSpec::new(EditKind::Clamp(25.0))
            .site(HookSite::MlpPost)
            .neuron(NeuronTarget::new(1, 3).at(TokenPosition::All));

        let result = model.generate("the sky", 2, 0.0, Some(&spec)).unwrap();
        let steered = model.last_token_logits("the sky", &spec.to_hook_spec()).unwrap();
        let first = argmax(&steered).unwrap();
        if first == 10 {
            assert!(result.generated_tokens.is_empty());
        } else {
            assert_eq!(result.generated_tokens[0], first);
        }

        // Edits are validated against the prompt before decoding starts
        let bad = NeuronSteeringSpec::zero()
            .site(HookSite::MlpPost)
            .neuron(NeuronTarget::new(1, 3).at(TokenPosition::Index(9)));
        assert!(model.generate("the sky", 2, 0.0, Some(&bad)).is_err());
    }

    #[test]
    #[serial]
    fn test_generate_respects_max_tokens() {
        let model = tiny_model();
        let result = model.generate("the sky", 3, 0.0, None).unwrap();
        assert_eq!(result.prompt_tokens, vec![1, 11]);
        assert!(result.generated_tokens.len() <= 3);
        assert_eq!(
            result.total_tokens,
            result.prompt_tokens.len() + result.generated_tokens.len()
        );
    }
}
