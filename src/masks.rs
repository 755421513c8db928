//! Attention masks shared by the hooked backends
//!
//! Full-pass masks are cached by `(seq_len, window, device, dtype)`; the
//! steering sweep re-runs the same prompt once per step, so every step after
//! the first reuses the same tensor (shallow clone, no data copy).
//!
//! A mask entry is `0.0` where a query may attend to a key and `-inf`
//! elsewhere. With a sliding window `w`, query `i` sees keys `j` with
//! `i - w <= j <= i`.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

type MaskKey = (usize, Option<usize>, usize, DType);

static CAUSAL_MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Single device per backend type is assumed.
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

fn visible(query: usize, key: usize, window: Option<usize>) -> bool {
    key <= query && window.map_or(true, |w| query - key <= w)
}

/// Causal mask of shape `[1, 1, seq_len, seq_len]`, optionally windowed.
///
/// For seq_len=3 without a window:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(
    seq_len: usize,
    window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let key = (seq_len, window, device_id(device), dtype);

    if let Some(cached) = CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        return Ok(cached.clone());
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| {
                if visible(i, j, window) {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, mask.clone());

    Ok(mask)
}

/// Mask for `new_seq_len` tokens appended after `start_pos` cached tokens.
///
/// Shape `[1, 1, new_seq_len, start_pos + new_seq_len]`. Not cached: the
/// shape changes on every decode step.
pub fn create_generation_mask(
    new_seq_len: usize,
    start_pos: usize,
    window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let total_seq_len = start_pos + new_seq_len;

    // One new token sees the whole cache unless a window cuts it off
    if new_seq_len == 1 && window.map_or(true, |w| start_pos <= w) {
        return Ok(Tensor::zeros((1, 1, 1, total_seq_len), dtype, device)?);
    }

    let mask: Vec<f32> = (0..new_seq_len)
        .flat_map(|i| {
            let query = start_pos + i;
            (0..total_seq_len).map(move |j| {
                if visible(query, j, window) {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();

    Ok(Tensor::from_vec(mask, (1, 1, new_seq_len, total_seq_len), device)?.to_dtype(dtype)?)
}

pub fn clear_mask_caches() {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .len()
}
