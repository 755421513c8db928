// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `w_enc`/`w_dec`
#![allow(clippy::module_name_repetitions)] // CarnivalModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Method style pedantic:
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_sign_loss)]

//! carnival-rs: interpretability carnival games on candle
//!
//! Three games built on hooked transformer forward passes:
//! neuron surgery (steer MLP neurons and watch two candidate answers move),
//! feature hunt (place a guessed word on a 2D map of activations), and
//! adversarial MNIST (draw on a digit until the classifier changes its mind).
//!
//! ## Architecture
//!
//! - `neuron`: Neuron targets, token positions and neuron-path parsing
//! - `hooks`: Named hook points, hook specs and the captured-activation cache
//! - `intervention`: Neuron edits (zero, clamp, scale) and logit utilities
//! - `forward_llama`: LLaMA 3.x forward pass with hooks at every site
//! - `forward_gemma2`: Gemma 2 forward pass with hooks at every site
//! - `masks`: Shared attention mask utilities (causal, sliding window, generation)
//! - `kv_cache`: KV-cache for autoregressive generation
//! - `model`: `HookedBackend` trait and the `CarnivalModel` wrapper
//! - `chat`: Llama 3 and Gemma chat templates
//! - `steering`: Progressive neuron sweep and knob steering
//! - `stats`: Activation statistics and t-tests
//! - `prompts`: Prompt sets
//! - `experiment`: Steering experiment runner and reports
//! - `plot`: Sweep plots
//! - `sae`: Sparse autoencoder loading and encoding
//! - `projection`: Word → 2D projection
//! - `mnist`: Drawing canvas and digit classifier
//! - `api`: HTTP routes for the games

pub mod api;
pub mod chat;
pub mod experiment;
pub mod forward_gemma2;
pub mod forward_llama;
pub mod hooks;
pub mod intervention;
pub mod kv_cache;
pub mod masks;
pub mod mnist;
pub mod model;
pub mod neuron;
pub mod plot;
pub mod projection;
pub mod prompts;
pub mod sae;
pub mod stats;
pub mod steering;

pub use api::{create_router, AppState};
pub use chat::{format_question, ChatFormat, ChatMessage};
pub use experiment::{
    ExperimentOutput, SteeringExperiment, SteeringExperimentConfig, SteeringReport,
};
pub use forward_gemma2::{Gemma2Config, HookedGemma2};
pub use forward_llama::{HookedLlama, LlamaConfig};
pub use hooks::{HookCache, HookPoint, HookSite, HookSpec};
pub use intervention::{
    apply_neuron_edits, kl_divergence, log_prob_of, log_softmax_last, EditKind, NeuronEdit,
    NeuronSteeringResult, NeuronSteeringSpec,
};
pub use kv_cache::KVCache;
pub use masks::{clear_mask_caches, create_causal_mask, create_generation_mask};
pub use mnist::{parse_drawn_coords, DigitCanvas, DigitClassifier, DigitGame, DigitPrediction};
pub use model::{
    CarnivalModel, GenerationResult, HookedBackend, ModelArchitecture, TokenPrediction,
};
pub use neuron::{sort_targets, NeuronTarget, TokenPosition};
pub use plot::plot_sweep;
pub use projection::{fit_word_projection, LinearProjection, WordLocation, WordProjector};
pub use prompts::{PromptSet, BASKETBALL_PROMPTS};
pub use sae::{SaeConfig, SparseAutoencoder, SparseFeatures};
pub use stats::{collect_activation_stats, ActivationStats, SummaryStats, TTestResult};
pub use steering::{
    knob_steering, parse_knob_turns, progressive_sweep, KnobGame, KnobPrediction, SweepResult,
    SweepStep, SweepSummary,
};
