//! Forward hooks for activation capture and neuron edits
//!
//! Backends call [`HookSpec::apply`] at every named [`HookPoint`] in their
//! forward pass. A `HookSpec` decides whether to capture the tensor flowing
//! through that point and which neuron edits to apply to it.
//!
//! Hook point names follow the TransformerLens convention:
//!
//! | Point | Name | Tensor |
//! |-------|------|--------|
//! | `Embed` | `hook_embed` | token embeddings |
//! | `ResidPre(i)` | `blocks.{i}.hook_resid_pre` | residual stream entering layer `i` |
//! | `MlpUp(i)` | `blocks.{i}.mlp.hook_up` | output of `up_proj` |
//! | `MlpPost(i)` | `blocks.{i}.mlp.hook_post` | input of `down_proj` |
//! | `MlpOut(i)` | `blocks.{i}.hook_mlp_out` | output of `down_proj` |
//! | `ResidPost(i)` | `blocks.{i}.hook_resid_post` | residual stream leaving layer `i` |
//! | `FinalNorm` | `hook_final_norm` | output of the final norm |

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::intervention::{apply_neuron_edits, NeuronEdit};

/// Named location in a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    Embed,
    ResidPre(usize),
    MlpUp(usize),
    MlpPost(usize),
    MlpOut(usize),
    ResidPost(usize),
    FinalNorm,
}

impl HookPoint {
    /// Layer index, if this is a per-layer point.
    pub fn layer(&self) -> Option<usize> {
        match *self {
            HookPoint::ResidPre(l)
            | HookPoint::MlpUp(l)
            | HookPoint::MlpPost(l)
            | HookPoint::MlpOut(l)
            | HookPoint::ResidPost(l) => Some(l),
            HookPoint::Embed | HookPoint::FinalNorm => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::Embed => write!(f, "hook_embed"),
            HookPoint::ResidPre(i) => write!(f, "blocks.{i}.hook_resid_pre"),
            HookPoint::MlpUp(i) => write!(f, "blocks.{i}.mlp.hook_up"),
            HookPoint::MlpPost(i) => write!(f, "blocks.{i}.mlp.hook_post"),
            HookPoint::MlpOut(i) => write!(f, "blocks.{i}.hook_mlp_out"),
            HookPoint::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            HookPoint::FinalNorm => write!(f, "hook_final_norm"),
        }
    }
}

impl FromStr for HookPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hook_embed" => return Ok(HookPoint::Embed),
            "hook_final_norm" => return Ok(HookPoint::FinalNorm),
            _ => {}
        }
        let rest = s
            .strip_prefix("blocks.")
            .with_context(|| format!("Unknown hook point: {s:?}"))?;
        let (layer, name) = rest
            .split_once('.')
            .with_context(|| format!("Unknown hook point: {s:?}"))?;
        let layer: usize = layer
            .parse()
            .with_context(|| format!("Invalid layer in hook point {s:?}"))?;
        match name {
            "hook_resid_pre" => Ok(HookPoint::ResidPre(layer)),
            "mlp.hook_up" => Ok(HookPoint::MlpUp(layer)),
            "mlp.hook_post" => Ok(HookPoint::MlpPost(layer)),
            "hook_mlp_out" => Ok(HookPoint::MlpOut(layer)),
            "hook_resid_post" => Ok(HookPoint::ResidPost(layer)),
            _ => bail!("Unknown hook point: {s:?}"),
        }
    }
}

/// Per-layer hook site, independent of the layer index.
///
/// Experiments pick a site once and pair it with each target's layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HookSite {
    ResidPre,
    /// Output of the MLP up projection
    MlpUp,
    /// Gated hidden state entering the down projection
    MlpPost,
    /// Output of the MLP down projection
    #[default]
    MlpOut,
    ResidPost,
}

impl HookSite {
    pub fn at(self, layer: usize) -> HookPoint {
        match self {
            HookSite::ResidPre => HookPoint::ResidPre(layer),
            HookSite::MlpUp => HookPoint::MlpUp(layer),
            HookSite::MlpPost => HookPoint::MlpPost(layer),
            HookSite::MlpOut => HookPoint::MlpOut(layer),
            HookSite::ResidPost => HookPoint::ResidPost(layer),
        }
    }

    /// Whether units at this site index the MLP hidden dimension (`d_mlp`)
    /// rather than the residual dimension (`d_model`).
    pub fn is_mlp_hidden(self) -> bool {
        matches!(self, HookSite::MlpUp | HookSite::MlpPost)
    }
}

impl FromStr for HookSite {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "resid_pre" => Ok(HookSite::ResidPre),
            "mlp_up" | "up_proj" => Ok(HookSite::MlpUp),
            "mlp_post" => Ok(HookSite::MlpPost),
            "mlp_out" | "down_proj" => Ok(HookSite::MlpOut),
            "resid_post" => Ok(HookSite::ResidPost),
            other => bail!("Unknown hook site: {other:?}"),
        }
    }
}

impl fmt::Display for HookSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookSite::ResidPre => "resid_pre",
            HookSite::MlpUp => "mlp_up",
            HookSite::MlpPost => "mlp_post",
            HookSite::MlpOut => "mlp_out",
            HookSite::ResidPost => "resid_post",
        };
        f.write_str(name)
    }
}

/// What to capture and which neuron edits to apply during a forward pass.
///
/// An empty spec costs nothing beyond a hash lookup per hook point.
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    captures: HashSet<HookPoint>,
    edits: HashMap<HookPoint, Vec<NeuronEdit>>,
}

impl HookSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at `hook` (before any edit).
    pub fn capture(&mut self, hook: HookPoint) -> &mut Self {
        self.captures.insert(hook);
        self
    }

    /// Register a neuron edit at `hook`. Edits at the same point are applied
    /// in registration order.
    pub fn edit(&mut self, hook: HookPoint, edit: NeuronEdit) -> &mut Self {
        self.edits.entry(hook).or_default().push(edit);
        self
    }

    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    pub fn edits_at(&self, hook: &HookPoint) -> &[NeuronEdit] {
        self.edits.get(hook).map_or(&[], Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.edits.is_empty()
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    pub fn num_edits(&self) -> usize {
        self.edits.values().map(Vec::len).sum()
    }

    /// Hook points that carry edits.
    pub fn edited_points(&self) -> impl Iterator<Item = &HookPoint> {
        self.edits.keys()
    }

    /// Run the hook at `hook` on activation `x` of shape `[batch, seq, units]`.
    ///
    /// `start_pos` is the number of tokens already in the KV cache (0 for a
    /// full pass). Captures store the unedited tensor.
    pub fn apply(
        &self,
        hook: HookPoint,
        x: Tensor,
        start_pos: usize,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        if self.is_empty() {
            return Ok(x);
        }
        if self.captures.contains(&hook) {
            cache.store(hook, x.clone());
        }
        match self.edits.get(&hook) {
            Some(edits) if !edits.is_empty() => apply_neuron_edits(&x, edits, start_pos)
                .with_context(|| format!("Neuron edit failed at {hook}")),
            _ => Ok(x),
        }
    }
}

/// Tensors captured during a forward pass, plus its output.
#[derive(Debug, Default)]
pub struct HookCache {
    output: Option<Tensor>,
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output of the forward pass (final-norm hidden states).
    pub fn output(&self) -> Result<&Tensor> {
        self.output
            .as_ref()
            .context("Forward pass did not record an output")
    }

    pub fn into_output(self) -> Result<Tensor> {
        self.output.context("Forward pass did not record an output")
    }

    pub fn set_output(&mut self, output: Tensor) {
        self.output = Some(output);
    }

    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .with_context(|| format!("Hook point `{hook}` was not captured"))
    }

    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}
