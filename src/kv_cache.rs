//! KV-cache for hooked autoregressive generation
//!
//! Each layer keeps the keys and values of every position seen so far,
//! laid out as `[batch, num_kv_heads, seq_len, head_dim]` (before GQA
//! expansion). Neuron edits made while a position was processed are baked
//! into its cached keys and values, so an edited prompt keeps influencing
//! every generated token without re-running the prompt.

use anyhow::{bail, Result};
use candle_core::Tensor;

#[derive(Debug, Clone)]
pub struct KVCache {
    pub keys: Vec<Option<Tensor>>,
    pub values: Vec<Option<Tensor>>,
}

impl KVCache {
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Number of cached positions (0 if empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    pub fn clear(&mut self) {
        self.keys.iter_mut().for_each(|k| *k = None);
        self.values.iter_mut().for_each(|v| *v = None);
    }

    /// Append this step's keys and values for `layer` and return the full
    /// cached sequence for that layer.
    pub fn append(&mut self, layer: usize, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        if layer >= self.keys.len() {
            bail!(
                "Layer {layer} out of range (cache has {} layers)",
                self.keys.len()
            );
        }
        let (k, v) = match (self.keys[layer].take(), self.values[layer].take()) {
            (Some(prev_k), Some(prev_v)) => (
                Tensor::cat(&[&prev_k, &k], 2)?,
                Tensor::cat(&[&prev_v, &v], 2)?,
            ),
            _ => (k, v),
        };
        self.keys[layer] = Some(k.clone());
        self.values[layer] = Some(v.clone());
        Ok((k, v))
    }

    /// Total bytes held by cached tensors
    pub fn memory_usage(&self) -> usize {
        self.keys
            .iter()
            .chain(self.values.iter())
            .flatten()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

impl Default for KVCache {
    fn default() -> Self {
        Self::new(0)
    }
}
