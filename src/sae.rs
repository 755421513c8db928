//! Sparse autoencoder over a residual-stream hook point
//!
//! Loads SAELens-style weights (`sae_weights.safetensors` + `cfg.json`) either
//! from a local directory or from a HuggingFace repository folder, and encodes
//! activations into sparse features.
//!
//! # Architecture
//!
//! ```text
//! pre  = (x - b_dec * apply_b_dec_to_input) @ W_enc + b_enc     W_enc: [d_in, d_sae]
//! f    = ReLU(pre)                       (standard)
//! f    = pre * [pre > threshold]         (JumpReLU, when `threshold` is present)
//! x^   = f @ W_dec + b_dec                                       W_dec: [d_sae, d_in]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use serde::Deserialize;
use tracing::info;

use crate::hooks::HookPoint;

pub const WEIGHTS_FILE: &str = "sae_weights.safetensors";
pub const CONFIG_FILE: &str = "cfg.json";

/// Fields of `cfg.json` the encoder needs; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
struct SaeFileConfig {
    #[serde(default)]
    d_in: Option<usize>,
    #[serde(default)]
    d_sae: Option<usize>,
    #[serde(default)]
    hook_name: Option<String>,
    #[serde(default)]
    apply_b_dec_to_input: bool,
    #[serde(default)]
    architecture: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SaeConfig {
    pub d_in: usize,
    pub d_sae: usize,
    /// TransformerLens hook name, e.g. `blocks.6.hook_resid_post`
    pub hook_name: Option<String>,
    pub apply_b_dec_to_input: bool,
    pub jump_relu: bool,
}

impl SaeConfig {
    /// The hook point the SAE was trained on, if its name is one we know.
    pub fn hook_point(&self) -> Option<HookPoint> {
        self.hook_name.as_deref().and_then(|h| h.parse().ok())
    }
}

/// One active feature and its activation
pub type FeatureActivation = (usize, f32);

/// Active features sorted by activation (descending)
#[derive(Debug, Clone, Default)]
pub struct SparseFeatures {
    pub features: Vec<FeatureActivation>,
}

impl SparseFeatures {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, feature: usize) -> Option<f32> {
        self.features
            .iter()
            .find(|(f, _)| *f == feature)
            .map(|(_, v)| *v)
    }
}

/// Encoder/decoder weights, kept in F32 on the target device.
#[derive(Clone)]
pub struct SparseAutoencoder {
    config: SaeConfig,
    w_enc: Tensor,
    b_enc: Tensor,
    w_dec: Tensor,
    b_dec: Tensor,
    threshold: Option<Tensor>,
}

impl SparseAutoencoder {
    /// Download `{folder}/sae_weights.safetensors` and `{folder}/cfg.json`
    /// from a HuggingFace model repository.
    pub fn from_pretrained(repo_id: &str, folder: &str, device: &Device) -> Result<Self> {
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        let prefix = folder.trim_end_matches('/');
        let join = |file: &str| {
            if prefix.is_empty() {
                file.to_string()
            } else {
                format!("{prefix}/{file}")
            }
        };

        info!("Downloading SAE {repo_id}/{prefix}");
        let weights = repo
            .get(&join(WEIGHTS_FILE))
            .with_context(|| format!("Failed to download SAE weights from {repo_id}"))?;
        let cfg = repo.get(&join(CONFIG_FILE)).ok();
        Self::load_local(&weights, cfg.as_deref(), device)
    }

    /// Load from a directory holding `sae_weights.safetensors` and optionally `cfg.json`.
    pub fn load_dir(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let cfg: PathBuf = dir.join(CONFIG_FILE);
        let cfg = cfg.exists().then_some(cfg);
        Self::load_local(&dir.join(WEIGHTS_FILE), cfg.as_deref(), device)
    }

    pub fn load_local(weights_path: &Path, cfg_path: Option<&Path>, device: &Device) -> Result<Self> {
        let file_config = match cfg_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str::<SaeFileConfig>(&text)
                    .with_context(|| format!("Invalid SAE config {}", path.display()))?
            }
            None => SaeFileConfig::default(),
        };

        let data = std::fs::read(weights_path)
            .with_context(|| format!("Failed to read {}", weights_path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to deserialize {}", weights_path.display()))?;

        let load = |name: &str| -> Result<Tensor> {
            let view = st
                .tensor(name)
                .with_context(|| format!("Tensor '{name}' not found in SAE weights"))?;
            tensor_from_view(&view, device)
        };
        let threshold = if st.names().iter().any(|n| n.as_str() == "threshold") {
            Some(load("threshold")?)
        } else {
            None
        };

        Self::from_tensors(
            load("W_enc")?,
            load("b_enc")?,
            load("W_dec")?,
            load("b_dec")?,
            threshold,
            file_config,
        )
    }

    fn from_tensors(
        w_enc: Tensor,
        b_enc: Tensor,
        w_dec: Tensor,
        b_dec: Tensor,
        threshold: Option<Tensor>,
        file_config: SaeFileConfig,
    ) -> Result<Self> {
        let (d_in, d_sae) = w_enc.dims2().context("W_enc must be 2D")?;
        ensure!(
            w_dec.dims2()? == (d_sae, d_in),
            "W_dec shape {:?} does not match W_enc [{d_in}, {d_sae}] transposed",
            w_dec.dims()
        );
        ensure!(b_enc.dims() == [d_sae], "b_enc must have shape [{d_sae}]");
        ensure!(b_dec.dims() == [d_in], "b_dec must have shape [{d_in}]");
        if let Some(th) = &threshold {
            ensure!(th.dims() == [d_sae], "threshold must have shape [{d_sae}]");
        }
        if let Some(d) = file_config.d_in {
            ensure!(d == d_in, "cfg.json d_in={d} but weights have {d_in}");
        }
        if let Some(d) = file_config.d_sae {
            ensure!(d == d_sae, "cfg.json d_sae={d} but weights have {d_sae}");
        }

        let jump_relu = threshold.is_some();
        if let Some(arch) = &file_config.architecture {
            ensure!(
                arch != "jumprelu" || jump_relu,
                "cfg.json declares a JumpReLU SAE but the weights have no threshold"
            );
        }

        let config = SaeConfig {
            d_in,
            d_sae,
            hook_name: file_config.hook_name,
            apply_b_dec_to_input: file_config.apply_b_dec_to_input,
            jump_relu,
        };
        info!(
            "SAE: d_in={}, d_sae={}, hook={}, {}",
            config.d_in,
            config.d_sae,
            config.hook_name.as_deref().unwrap_or("?"),
            if jump_relu { "JumpReLU" } else { "ReLU" }
        );

        let to_f32 = |t: Tensor| t.to_dtype(DType::F32);
        Ok(Self {
            config,
            w_enc: to_f32(w_enc)?,
            b_enc: to_f32(b_enc)?,
            w_dec: to_f32(w_dec)?,
            b_dec: to_f32(b_dec)?,
            threshold: threshold.map(to_f32).transpose()?,
        })
    }

    pub fn config(&self) -> &SaeConfig {
        &self.config
    }

    /// Feature activations for `x` of shape `[.., d_in]` → `[.., d_sae]`.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let (x, squeeze) = self.as_rows(x)?;
        let x = if self.config.apply_b_dec_to_input {
            x.broadcast_sub(&self.b_dec)?
        } else {
            x
        };
        let pre = x.broadcast_matmul(&self.w_enc)?.broadcast_add(&self.b_enc)?;
        let acts = match &self.threshold {
            Some(th) => {
                let gate = pre.broadcast_gt(th)?.to_dtype(DType::F32)?;
                (pre * gate)?
            }
            None => pre.relu()?,
        };
        if squeeze {
            Ok(acts.squeeze(0)?)
        } else {
            Ok(acts)
        }
    }

    /// Reconstruction from feature activations `[.., d_sae]` → `[.., d_in]`.
    pub fn decode(&self, features: &Tensor) -> Result<Tensor> {
        let f = features.to_dtype(DType::F32)?;
        let (f, squeeze) = if f.rank() == 1 {
            (f.unsqueeze(0)?, true)
        } else {
            (f, false)
        };
        let out = f.broadcast_matmul(&self.w_dec)?.broadcast_add(&self.b_dec)?;
        if squeeze {
            Ok(out.squeeze(0)?)
        } else {
            Ok(out)
        }
    }

    /// All features active on a single activation vector.
    pub fn active_features(&self, x: &Tensor) -> Result<SparseFeatures> {
        let acts: Vec<f32> = self.encode(&x.flatten_all()?)?.to_vec1()?;
        let mut features: Vec<FeatureActivation> = acts
            .into_iter()
            .enumerate()
            .filter(|(_, v)| *v > 0.0)
            .collect();
        features.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(SparseFeatures { features })
    }

    pub fn top_k(&self, x: &Tensor, k: usize) -> Result<SparseFeatures> {
        let mut sparse = self.active_features(x)?;
        sparse.features.truncate(k);
        Ok(sparse)
    }

    /// Activation of one feature on a single activation vector.
    pub fn feature_activation(&self, x: &Tensor, feature: usize) -> Result<f32> {
        ensure!(
            feature < self.config.d_sae,
            "Feature {feature} out of range (SAE has {} features)",
            self.config.d_sae
        );
        let acts = self.encode(&x.flatten_all()?)?;
        Ok(acts.get(feature)?.to_scalar::<f32>()?)
    }

    fn as_rows(&self, x: &Tensor) -> Result<(Tensor, bool)> {
        let x = x.to_dtype(DType::F32)?;
        let last = x.dims().last().copied().unwrap_or(0);
        ensure!(
            last == self.config.d_in,
            "SAE expects last dimension {}, got {:?}",
            self.config.d_in,
            x.dims()
        );
        if x.rank() == 1 {
            Ok((x.unsqueeze(0)?, true))
        } else {
            Ok((x, false))
        }
    }
}

fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported SAE tensor dtype: {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// d_in = 2, d_sae = 3: feature 0 reads x0, feature 1 reads x1,
    /// feature 2 reads -(x0 + x1).
    fn weights(with_threshold: bool) -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let mut map = HashMap::new();
        map.insert(
            "W_enc".to_string(),
            Tensor::new(&[[1.0f32, 0.0, -1.0], [0.0, 1.0, -1.0]], &dev).unwrap(),
        );
        map.insert(
            "b_enc".to_string(),
            Tensor::new(&[0.0f32, 0.0, 0.0], &dev).unwrap(),
        );
        map.insert(
            "W_dec".to_string(),
            Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [0.5, 0.5]], &dev).unwrap(),
        );
        map.insert("b_dec".to_string(), Tensor::new(&[0.5f32, -0.5], &dev).unwrap());
        if with_threshold {
            map.insert(
                "threshold".to_string(),
                Tensor::new(&[1.0f32, 1.0, 1.0], &dev).unwrap(),
            );
        }
        map
    }

    fn write_sae(dir: &Path, with_threshold: bool, cfg: Option<&str>) {
        candle_core::safetensors::save(&weights(with_threshold), dir.join(WEIGHTS_FILE)).unwrap();
        if let Some(cfg) = cfg {
            std::fs::write(dir.join(CONFIG_FILE), cfg).unwrap();
        }
    }

    #[test]
    fn test_load_dir_with_config() {
        let dir = tempdir().unwrap();
        write_sae(
            dir.path(),
            false,
            Some(r#"{"d_in": 2, "d_sae": 3, "hook_name": "blocks.6.hook_resid_post", "dtype": "float32"}"#),
        );
        let sae = SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(sae.config().d_in, 2);
        assert_eq!(sae.config().d_sae, 3);
        assert!(!sae.config().jump_relu);
        assert_eq!(sae.config().hook_point(), Some(HookPoint::ResidPost(6)));
    }

    #[test]
    fn test_relu_encode_and_sparse() {
        let dir = tempdir().unwrap();
        write_sae(dir.path(), false, None);
        let sae = SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).unwrap();

        let x = Tensor::new(&[2.0f32, 0.5], &Device::Cpu).unwrap();
        let acts: Vec<f32> = sae.encode(&x).unwrap().to_vec1().unwrap();
        assert_eq!(acts, vec![2.0, 0.5, 0.0]);

        let sparse = sae.active_features(&x).unwrap();
        assert_eq!(sparse.features, vec![(0, 2.0), (1, 0.5)]);
        assert_eq!(sae.top_k(&x, 1).unwrap().features, vec![(0, 2.0)]);
        assert_eq!(sparse.get(2), None);

        let neg = Tensor::new(&[-1.0f32, -2.0], &Device::Cpu).unwrap();
        assert_eq!(sae.feature_activation(&neg, 2).unwrap(), 3.0);
        assert!(sae.feature_activation(&neg, 3).is_err());
    }

    #[test]
    fn test_jump_relu_threshold() {
        let dir = tempdir().unwrap();
        write_sae(dir.path(), true, Some(r#"{"architecture": "jumprelu"}"#));
        let sae = SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).unwrap();
        assert!(sae.config().jump_relu);

        // 0.5 is positive but below the threshold of 1.0
        let x = Tensor::new(&[2.0f32, 0.5], &Device::Cpu).unwrap();
        let acts: Vec<f32> = sae.encode(&x).unwrap().to_vec1().unwrap();
        assert_eq!(acts, vec![2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_apply_b_dec_to_input_and_decode() {
        let dir = tempdir().unwrap();
        write_sae(dir.path(), false, Some(r#"{"apply_b_dec_to_input": true}"#));
        let sae = SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).unwrap();

        // x - b_dec = [1.5, 1.0]
        let x = Tensor::new(&[[2.0f32, 0.5]], &Device::Cpu).unwrap();
        let acts = sae.encode(&x).unwrap();
        assert_eq!(acts.dims(), &[1, 3]);
        assert_eq!(acts.to_vec2::<f32>().unwrap(), vec![vec![1.5, 1.0, 0.0]]);

        let recon: Vec<f32> = sae
            .decode(&Tensor::new(&[1.5f32, 1.0, 0.0], &Device::Cpu).unwrap())
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(recon, vec![2.0, 0.5]);
    }

    #[test]
    fn test_shape_mismatches_rejected() {
        let dir = tempdir().unwrap();
        write_sae(dir.path(), false, Some(r#"{"d_in": 4}"#));
        assert!(SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).is_err());

        let dir = tempdir().unwrap();
        write_sae(dir.path(), false, Some(r#"{"architecture": "jumprelu"}"#));
        assert!(SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).is_err());

        let dir = tempdir().unwrap();
        write_sae(dir.path(), false, None);
        let sae = SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).unwrap();
        let wrong = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        assert!(sae.encode(&wrong).is_err());
    }

    #[test]
    fn test_missing_weights() {
        let dir = tempdir().unwrap();
        assert!(SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).is_err());
    }
}
