//! Neuron interventions for carnival-rs
//!
//! Enables causal experiments by editing individual units of a hooked
//! activation and measuring the impact on next-token log-probabilities.
//!
//! ## Edit Kinds
//!
//! - **Zero**: set the unit to 0 (ablation)
//! - **Clamp**: set the unit to a fixed value
//! - **Scale**: multiply the unit by a factor (knob steering)
//!
//! ## Edit Mechanism
//!
//! All edits at one hook point are folded into two `[1, seq, units]` masks
//! and applied as `x * mul + add`, so a single broadcast multiply-add edits
//! any number of cells. A later edit to the same cell overrides an earlier
//! one.
//!
//! ## Example
//!
//! ```ignore
//! use carnival_rs::{CarnivalModel, EditKind, HookSite, NeuronSteeringSpec, NeuronTarget};
//!
//! let model = CarnivalModel::from_pretrained("meta-llama/Llama-3.1-8B-Instruct")?;
//!
//! // Zero neuron 10263 of layer 2 at the last prompt token
//! let spec = NeuronSteeringSpec::new(EditKind::Zero)
//!     .site(HookSite::MlpOut)
//!     .neuron(NeuronTarget::new(2, 10263));
//!
//! let result = model.forward_with_neuron_steering(&prompt, &spec)?;
//! println!("KL divergence: {}", result.kl_divergence()?);
//! ```

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::hooks::{HookSite, HookSpec};
use crate::neuron::{NeuronTarget, TokenPosition};

/// What to do to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    #[default]
    Zero,
    Clamp(f32),
    Scale(f32),
}

impl EditKind {
    /// `(mul, add)` coefficients for `x * mul + add`.
    fn coefficients(self) -> (f32, f32) {
        match self {
            EditKind::Zero => (0.0, 0.0),
            EditKind::Clamp(v) => (0.0, v),
            EditKind::Scale(f) => (f, 0.0),
        }
    }
}

impl fmt::Display for EditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditKind::Zero => write!(f, "zero"),
            EditKind::Clamp(v) => write!(f, "clamp:{v}"),
            EditKind::Scale(s) => write!(f, "scale:{s}"),
        }
    }
}

impl FromStr for EditKind {
    type Err = anyhow::Error;

    /// `zero`, `clamp:<value>` or `scale:<factor>`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("zero") {
            return Ok(EditKind::Zero);
        }
        let (name, value) = s
            .split_once(':')
            .with_context(|| format!("Invalid edit kind {s:?} (expected zero, clamp:<v>, scale:<f>)"))?;
        let value: f32 = value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value in edit kind {s:?}"))?;
        match name.trim().to_ascii_lowercase().as_str() {
            "clamp" => Ok(EditKind::Clamp(value)),
            "scale" => Ok(EditKind::Scale(value)),
            other => bail!("Unknown edit kind: {other:?}"),
        }
    }
}

/// One edit at one hook point: unit index, token position, edit kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeuronEdit {
    pub neuron: usize,
    pub token: TokenPosition,
    pub kind: EditKind,
}

impl NeuronEdit {
    pub fn new(neuron: usize, token: TokenPosition, kind: EditKind) -> Self {
        Self {
            neuron,
            token,
            kind,
        }
    }
}

/// Apply neuron edits to an activation of shape `[batch, seq, units]`.
///
/// `start_pos` is the absolute position of the first token in `x` (non-zero
/// during KV-cached decoding). Edits apply to every batch element.
pub fn apply_neuron_edits(x: &Tensor, edits: &[NeuronEdit], start_pos: usize) -> Result<Tensor> {
    let (_batch, seq_len, units) = x.dims3()?;

    let mut mul = vec![1.0f32; seq_len * units];
    let mut add = vec![0.0f32; seq_len * units];
    let mut touched = false;

    for edit in edits {
        if edit.neuron >= units {
            bail!(
                "Neuron {} out of range (activation has {units} units)",
                edit.neuron
            );
        }
        let (m, a) = edit.kind.coefficients();
        for pos in edit.token.resolve(start_pos, seq_len)? {
            let idx = pos * units + edit.neuron;
            mul[idx] = m;
            add[idx] = a;
            touched = true;
        }
    }

    if !touched {
        return Ok(x.clone());
    }

    let device = x.device();
    let mul = Tensor::from_vec(mul, (1, seq_len, units), device)?.to_dtype(x.dtype())?;
    let add = Tensor::from_vec(add, (1, seq_len, units), device)?.to_dtype(x.dtype())?;
    Ok(x.broadcast_mul(&mul)?.broadcast_add(&add)?)
}

/// Specification of a set of neuron edits at one hook site.
///
/// Each target carries its own edit kind so knob steering can scale every
/// neuron by a different factor.
#[derive(Debug, Clone)]
pub struct NeuronSteeringSpec {
    /// Hook site the edits are applied at
    pub site: HookSite,

    /// Default kind for targets added with [`Self::neuron`]
    pub kind: EditKind,

    /// Targets and their edit kinds, in application order
    pub edits: Vec<(NeuronTarget, EditKind)>,
}

impl NeuronSteeringSpec {
    /// Create an empty spec at the default site (MLP output).
    pub fn new(kind: EditKind) -> Self {
        Self {
            site: HookSite::default(),
            kind,
            edits: Vec::new(),
        }
    }

    /// Shortcut for zero-ablation
    pub fn zero() -> Self {
        Self::new(EditKind::Zero)
    }

    pub fn site(mut self, site: HookSite) -> Self {
        self.site = site;
        self
    }

    /// Add a target with the spec's default kind.
    pub fn neuron(mut self, target: NeuronTarget) -> Self {
        self.edits.push((target, self.kind));
        self
    }

    /// Add several targets with the spec's default kind.
    pub fn neurons(mut self, targets: &[NeuronTarget]) -> Self {
        let kind = self.kind;
        self.edits.extend(targets.iter().map(|&t| (t, kind)));
        self
    }

    /// Add a target with an explicit kind.
    pub fn neuron_with(mut self, target: NeuronTarget, kind: EditKind) -> Self {
        self.edits.push((target, kind));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Check if any edit targets this layer
    pub fn applies_to_layer(&self, layer: usize) -> bool {
        self.edits.iter().any(|(t, _)| t.layer == layer)
    }

    /// Layers touched by this spec, ascending and deduplicated
    pub fn layers(&self) -> Vec<usize> {
        let mut layers: Vec<usize> = self.edits.iter().map(|(t, _)| t.layer).collect();
        layers.sort_unstable();
        layers.dedup();
        layers
    }

    /// Validate the spec against model dimensions.
    ///
    /// `n_units` is the width of the activation at the spec's site.
    pub fn validate(&self, n_layers: usize, n_units: usize, seq_len: usize) -> Result<()> {
        for (target, kind) in &self.edits {
            if target.layer >= n_layers {
                bail!(
                    "Layer {} out of range (model has {n_layers} layers)",
                    target.layer
                );
            }
            if target.neuron >= n_units {
                bail!(
                    "Neuron {} out of range ({} has {n_units} units)",
                    target.neuron,
                    self.site
                );
            }
            target.token.resolve(0, seq_len)?;
            if let EditKind::Scale(f) | EditKind::Clamp(f) = kind {
                if !f.is_finite() {
                    bail!("Edit value must be finite, got {f}");
                }
            }
        }
        Ok(())
    }

    /// Translate into per-hook-point edits.
    pub fn to_hook_spec(&self) -> HookSpec {
        let mut hooks = HookSpec::new();
        self.extend_hook_spec(&mut hooks);
        hooks
    }

    /// Add this spec's edits to an existing hook spec.
    pub fn extend_hook_spec(&self, hooks: &mut HookSpec) {
        for (target, kind) in &self.edits {
            hooks.edit(
                self.site.at(target.layer),
                NeuronEdit::new(target.neuron, target.token, *kind),
            );
        }
    }
}

impl Default for NeuronSteeringSpec {
    fn default() -> Self {
        Self::zero()
    }
}

/// Result of a neuron steering experiment
#[derive(Debug)]
pub struct NeuronSteeringResult {
    /// Last-position logits from the baseline pass (no intervention)
    pub baseline_logits: Tensor,

    /// Last-position logits from the steered pass
    pub steered_logits: Tensor,

    /// The specification used
    pub spec: NeuronSteeringSpec,
}

impl NeuronSteeringResult {
    pub fn new(baseline_logits: Tensor, steered_logits: Tensor, spec: NeuronSteeringSpec) -> Self {
        Self {
            baseline_logits,
            steered_logits,
            spec,
        }
    }

    /// KL(baseline || steered) over the next-token distribution
    pub fn kl_divergence(&self) -> Result<f32> {
        kl_divergence(&self.baseline_logits, &self.steered_logits)
    }

    /// Change in log-probability of `token_id`: steered minus baseline.
    ///
    /// Negative values mean the edit made the token less likely.
    pub fn log_prob_delta(&self, token_id: u32) -> Result<f32> {
        let baseline = log_prob_of(&self.baseline_logits, token_id)?;
        let steered = log_prob_of(&self.steered_logits, token_id)?;
        Ok(steered - baseline)
    }

    /// Raw logit difference (baseline minus steered) for one token.
    pub fn logit_diff(&self, token_id: u32) -> Result<f32> {
        let baseline: Vec<f32> = self
            .baseline_logits
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;
        let steered: Vec<f32> = self
            .steered_logits
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;

        let idx = token_id as usize;
        if idx >= baseline.len() {
            bail!("Token ID {token_id} out of range");
        }
        Ok(baseline[idx] - steered[idx])
    }

    /// Top-k tokens whose probability moved most.
    ///
    /// Returns `(token_id, baseline_prob, steered_prob, abs_diff)`.
    pub fn top_changed_tokens(&self, k: usize) -> Result<Vec<(u32, f32, f32, f32)>> {
        let baseline = softmax_to_vec(&self.baseline_logits)?;
        let steered = softmax_to_vec(&self.steered_logits)?;

        let mut changes: Vec<(u32, f32, f32, f32)> = baseline
            .iter()
            .zip(steered.iter())
            .enumerate()
            .map(|(idx, (&b, &s))| (idx as u32, b, s, (b - s).abs()))
            .collect();

        changes.sort_by(|a, b| b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal));
        Ok(changes.into_iter().take(k).collect())
    }
}

/// KL(P || Q) where P = softmax(baseline), Q = softmax(steered)
pub fn kl_divergence(baseline_logits: &Tensor, steered_logits: &Tensor) -> Result<f32> {
    let p = softmax_to_vec(baseline_logits)?;
    let q = softmax_to_vec(steered_logits)?;

    let kl: f32 = p
        .iter()
        .zip(q.iter())
        .filter(|(&pi, &qi)| pi > 1e-10 && qi > 1e-10)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum();

    Ok(kl)
}

fn softmax_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    let logits_f32 = logits.to_dtype(DType::F32)?;
    let probs = candle_nn::ops::softmax_last_dim(&logits_f32)?;
    Ok(probs.flatten_all()?.to_vec1()?)
}

/// Log-softmax of a 1-D logit vector, computed in f64 with log-sum-exp.
pub fn log_softmax_vec(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let max = f64::from(max);
    let sum: f64 = logits.iter().map(|&l| (f64::from(l) - max).exp()).sum();
    let log_z = max + sum.ln();
    logits
        .iter()
        .map(|&l| (f64::from(l) - log_z) as f32)
        .collect()
}

/// Log-softmax over the vocabulary of last-position logits (`[vocab]` or `[1, vocab]`).
pub fn log_softmax_last(logits: &Tensor) -> Result<Vec<f32>> {
    let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    Ok(log_softmax_vec(&logits))
}

/// Log-probability of `token_id` under `logits` (`[vocab]` or `[1, vocab]`).
pub fn log_prob_of(logits: &Tensor, token_id: u32) -> Result<f32> {
    let log_probs = log_softmax_last(logits)?;
    let idx = token_id as usize;
    if idx >= log_probs.len() {
        bail!(
            "Token ID {token_id} out of range (vocabulary has {} entries)",
            log_probs.len()
        );
    }
    Ok(log_probs[idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn ramp(seq: usize, units: usize) -> Tensor {
        let data: Vec<f32> = (0..seq * units).map(|i| i as f32 + 1.0).collect();
        Tensor::from_vec(data, (1, seq, units), &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_zero_last_token() {
        let x = ramp(2, 3);
        let edits = [NeuronEdit::new(1, TokenPosition::LAST, EditKind::Zero)];
        let y = apply_neuron_edits(&x, &edits, 0).unwrap();
        assert_eq!(values(&y), vec![1.0, 2.0, 3.0, 4.0, 0.0, 6.0]);
    }

    #[test]
    fn test_clamp_and_scale() {
        let x = ramp(2, 3);
        let edits = [
            NeuronEdit::new(0, TokenPosition::Index(0), EditKind::Clamp(10.0)),
            NeuronEdit::new(2, TokenPosition::All, EditKind::Scale(2.0)),
        ];
        let y = apply_neuron_edits(&x, &edits, 0).unwrap();
        assert_eq!(values(&y), vec![10.0, 2.0, 6.0, 4.0, 5.0, 12.0]);
    }

    #[test]
    fn test_later_edit_overrides() {
        let x = ramp(1, 2);
        let edits = [
            NeuronEdit::new(0, TokenPosition::LAST, EditKind::Zero),
            NeuronEdit::new(0, TokenPosition::LAST, EditKind::Clamp(7.0)),
        ];
        let y = apply_neuron_edits(&x, &edits, 0).unwrap();
        assert_eq!(values(&y), vec![7.0, 2.0]);
    }

    #[test]
    fn test_edits_apply_to_every_batch_element() {
        let x = Tensor::ones((2, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let edits = [NeuronEdit::new(1, TokenPosition::LAST, EditKind::Zero)];
        let y = apply_neuron_edits(&x, &edits, 0).unwrap();
        assert_eq!(values(&y), vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_out_of_range_neuron_fails() {
        let x = ramp(1, 2);
        let edits = [NeuronEdit::new(2, TokenPosition::LAST, EditKind::Zero)];
        assert!(apply_neuron_edits(&x, &edits, 0).is_err());
    }

    #[test]
    fn test_decode_step_skips_prompt_positions() {
        let x = ramp(1, 2);
        let edits = [NeuronEdit::new(0, TokenPosition::Index(1), EditKind::Zero)];
        let y = apply_neuron_edits(&x, &edits, 5).unwrap();
        assert_eq!(values(&y), vec![1.0, 2.0]);
    }

    #[test]
    fn test_edit_kind_from_str() {
        assert_eq!("zero".parse::<EditKind>().unwrap(), EditKind::Zero);
        assert_eq!("clamp:2.5".parse::<EditKind>().unwrap(), EditKind::Clamp(2.5));
        assert_eq!("scale: 0.5".parse::<EditKind>().unwrap(), EditKind::Scale(0.5));
        assert!("nudge:1".parse::<EditKind>().is_err());
        assert!("clamp".parse::<EditKind>().is_err());
    }

    #[test]
    fn test_spec_builder() {
        let spec = NeuronSteeringSpec::zero()
            .neuron(NeuronTarget::new(3, 1))
            .neuron_with(NeuronTarget::new(1, 4), EditKind::Scale(2.0));

        assert_eq!(spec.len(), 2);
        assert!(spec.applies_to_layer(1));
        assert!(spec.applies_to_layer(3));
        assert!(!spec.applies_to_layer(2));
        assert_eq!(spec.layers(), vec![1, 3]);

        let hooks = spec.to_hook_spec();
        assert_eq!(hooks.num_edits(), 2);
        let at_l1 = hooks.edits_at(&HookSite::MlpOut.at(1));
        assert_eq!(at_l1[0].kind, EditKind::Scale(2.0));
    }

    #[test]
    fn test_spec_validation() {
        let spec = NeuronSteeringSpec::zero().neuron(NeuronTarget::new(5, 0));
        assert!(spec.validate(4, 8, 3).is_err());

        let spec = NeuronSteeringSpec::zero().neuron(NeuronTarget::new(1, 8));
        assert!(spec.validate(4, 8, 3).is_err());

        let spec = NeuronSteeringSpec::zero()
            .neuron(NeuronTarget::new(1, 2).at(TokenPosition::Index(3)));
        assert!(spec.validate(4, 8, 3).is_err());

        let spec = NeuronSteeringSpec::zero().neuron(NeuronTarget::new(1, 2));
        assert!(spec.validate(4, 8, 3).is_ok());
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let lp = log_softmax_vec(&[1.0, 2.0, 3.0]);
        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(lp[2] > lp[1] && lp[1] > lp[0]);

        let batched = Tensor::new(&[[1.0f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let from_tensor = log_softmax_last(&batched).unwrap();
        assert_eq!(from_tensor, lp);
        assert_eq!(log_prob_of(&batched, 2).unwrap(), lp[2]);
        assert!(log_prob_of(&batched, 3).is_err());
    }

    #[test]
    fn test_log_prob_delta_and_kl() {
        let base = Tensor::new(&[0.0f32, 0.0, 0.0], &Device::Cpu).unwrap();
        let steered = Tensor::new(&[0.0f32, 0.0, 3.0], &Device::Cpu).unwrap();
        let result = NeuronSteeringResult::new(base, steered, NeuronSteeringSpec::zero());

        assert!(result.log_prob_delta(0).unwrap() < 0.0);
        assert!(result.log_prob_delta(2).unwrap() > 0.0);
        assert!(result.kl_divergence().unwrap() > 0.0);
        assert_eq!(result.logit_diff(2).unwrap(), -3.0);
        assert!(result.log_prob_delta(3).is_err());

        let top = result.top_changed_tokens(1).unwrap();
        assert_eq!(top[0].0, 2);
    }

    #[test]
    fn test_kl_identical_is_zero() {
        let logits = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        assert!(kl_divergence(&logits, &logits).unwrap().abs() < 1e-6);
    }
}
