//! Word → 2D activation projection
//!
//! A word is run through the model, its last-token activation is read at a
//! residual hook point, and an affine map flattens it onto the plane. The map
//! is stored as plain JSON and is usually fitted with PCA over a vocabulary of
//! guess words. An optional SAE feature supplies the scalar shown next to the
//! point; without one the scalar is the activation norm.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use candle_core::{DType, IndexOp, Tensor};
use linfa::prelude::*;
use linfa_reduction::Pca;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::hooks::{HookSite, HookSpec};
use crate::model::CarnivalModel;
use crate::sae::SparseAutoencoder;

pub const DEFAULT_PROJECTION_LAYER: usize = 6;

/// `coords = x @ weights + bias`, with `weights` stored row-major as `[d][2]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearProjection {
    pub weights: Vec<[f32; 2]>,
    pub bias: [f32; 2],
}

impl LinearProjection {
    pub fn new(weights: Vec<[f32; 2]>, bias: [f32; 2]) -> Self {
        Self { weights, bias }
    }

    pub fn input_dim(&self) -> usize {
        self.weights.len()
    }

    pub fn project(&self, x: &[f32]) -> Result<[f32; 2]> {
        ensure!(
            x.len() == self.weights.len(),
            "Projection expects {} inputs, got {}",
            self.weights.len(),
            x.len()
        );
        let mut out = self.bias;
        for (v, w) in x.iter().zip(&self.weights) {
            out[0] += v * w[0];
            out[1] += v * w[1];
        }
        Ok(out)
    }

    /// Fit a two-component PCA and read back its affine map.
    ///
    /// The map is recovered by projecting the origin (bias) and each unit
    /// vector (bias + column), which holds for any affine transform.
    pub fn fit_pca(samples: &[Vec<f32>]) -> Result<Self> {
        ensure!(samples.len() >= 2, "PCA needs at least 2 samples");
        let d = samples[0].len();
        ensure!(d >= 2, "PCA needs at least 2 input dimensions");
        ensure!(
            samples.iter().all(|s| s.len() == d),
            "All samples must have the same dimension"
        );

        let flat: Vec<f64> = samples
            .iter()
            .flat_map(|s| s.iter().map(|&v| f64::from(v)))
            .collect();
        let x = Array2::from_shape_vec((samples.len(), d), flat)
            .context("Failed to create sample matrix")?;

        debug!("Fitting PCA: {} samples, {} dims", x.nrows(), x.ncols());
        let dataset = DatasetBase::from(x);
        let pca = Pca::params(2).fit(&dataset).context("Failed to fit PCA")?;

        let mut probes = Array2::<f64>::zeros((d + 1, d));
        for i in 0..d {
            probes[[i + 1, i]] = 1.0;
        }
        let projected: Array2<f64> = pca.predict(&probes);
        ensure!(
            projected.ncols() == 2,
            "PCA produced {} components",
            projected.ncols()
        );

        let bias = [projected[[0, 0]] as f32, projected[[0, 1]] as f32];
        let weights = (0..d)
            .map(|i| {
                [
                    (projected[[i + 1, 0]] - projected[[0, 0]]) as f32,
                    (projected[[i + 1, 1]] - projected[[0, 1]]) as f32,
                ]
            })
            .collect();

        info!(
            "Fitted PCA projection over {} samples (explained variance ratio {:?})",
            samples.len(),
            pca.explained_variance_ratio().to_vec()
        );
        Ok(Self { weights, bias })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read projection {}", path.display()))?;
        let projection: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid projection file {}", path.display()))?;
        Ok(projection)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Last-token activation of `word` at `site` of `layer`, as f32.
pub fn word_activation(
    model: &CarnivalModel,
    word: &str,
    layer: usize,
    site: HookSite,
) -> Result<Vec<f32>> {
    ensure!(!word.trim().is_empty(), "Empty word");
    ensure!(
        layer < model.n_layers(),
        "Layer {layer} out of range (model has {} layers)",
        model.n_layers()
    );

    let ids = model.encode(word, true)?;
    ensure!(!ids.is_empty(), "Word {word:?} produced no tokens");
    let input = Tensor::new(&ids[..], model.device())?.unsqueeze(0)?;

    let point = site.at(layer);
    let mut hooks = HookSpec::new();
    hooks.capture(point);
    let cache = model.backend().forward_hooked(&input, &hooks)?;
    let activation = cache.require(&point)?;

    Ok(activation
        .i((0, ids.len() - 1))?
        .to_dtype(DType::F32)?
        .to_vec1()?)
}

/// Where a guessed word lands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WordLocation {
    pub coordinates: [f32; 2],
    pub scalar: f32,
}

/// Projects words into the 2D guessing plane
pub struct WordProjector {
    model: CarnivalModel,
    layer: usize,
    site: HookSite,
    projection: LinearProjection,
    feature: Option<(SparseAutoencoder, usize)>,
}

impl WordProjector {
    pub fn new(model: CarnivalModel, projection: LinearProjection) -> Result<Self> {
        ensure!(
            projection.input_dim() == model.d_model(),
            "Projection input dimension {} does not match model d_model {}",
            projection.input_dim(),
            model.d_model()
        );
        Ok(Self {
            model,
            layer: DEFAULT_PROJECTION_LAYER,
            site: HookSite::ResidPost,
            projection,
            feature: None,
        })
    }

    pub fn with_layer(mut self, layer: usize) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_site(mut self, site: HookSite) -> Self {
        self.site = site;
        self
    }

    /// Report the activation of `feature` in `sae` as the scalar.
    ///
    /// An SAE whose `cfg.json` names a hook must have been trained on the
    /// point this projector reads.
    pub fn with_feature(mut self, sae: SparseAutoencoder, feature: usize) -> Result<Self> {
        ensure!(
            sae.config().d_in == self.model.d_model(),
            "SAE d_in {} does not match model d_model {}",
            sae.config().d_in,
            self.model.d_model()
        );
        ensure!(
            feature < sae.config().d_sae,
            "Feature {feature} out of range (SAE has {} features)",
            sae.config().d_sae
        );
        self.feature = Some((sae, feature));
        self.check_feature_hook()?;
        Ok(self)
    }

    fn check_feature_hook(&self) -> Result<()> {
        if let Some(trained_on) = self
            .feature
            .as_ref()
            .and_then(|(sae, _)| sae.config().hook_point())
        {
            let read = self.site.at(self.layer);
            ensure!(
                trained_on == read,
                "SAE was trained on {trained_on} but the projector reads {read}"
            );
        }
        Ok(())
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn locate(&self, word: &str) -> Result<WordLocation> {
        self.check_feature_hook()?;
        let activation = word_activation(&self.model, word, self.layer, self.site)?;
        let coordinates = self.projection.project(&activation)?;
        let scalar = match &self.feature {
            Some((sae, feature)) => {
                let x = Tensor::new(&activation[..], self.model.device())?;
                sae.feature_activation(&x, *feature)?
            }
            None => activation.iter().map(|v| v * v).sum::<f32>().sqrt(),
        };
        debug!("{word:?} → ({:.3}, {:.3}), scalar {scalar:.3}", coordinates[0], coordinates[1]);
        Ok(WordLocation {
            coordinates,
            scalar,
        })
    }
}

/// Fit a projection over the activations of a word list.
pub fn fit_word_projection(
    model: &CarnivalModel,
    words: &[String],
    layer: usize,
    site: HookSite,
) -> Result<LinearProjection> {
    let samples = words
        .iter()
        .map(|w| word_activation(model, w, layer, site))
        .collect::<Result<Vec<_>>>()?;
    LinearProjection::fit_pca(&samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_model;
    use candle_core::Device;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_project() {
        let p = LinearProjection::new(vec![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]], [0.5, -0.5]);
        assert_eq!(p.project(&[1.0, 1.0, 1.0]).unwrap(), [2.5, 2.5]);
        assert!(p.project(&[1.0]).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("projection.json");
        let p = LinearProjection::new(vec![[0.25, -1.0], [3.0, 0.5]], [1.0, 2.0]);
        p.save(&path).unwrap();
        assert_eq!(LinearProjection::load(&path).unwrap(), p);
        assert!(LinearProjection::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_fit_pca_finds_main_axis() {
        // Points spread along the first axis, with a little noise on the second
        let samples: Vec<Vec<f32>> = (0..10)
            .map(|i| {
                let t = i as f32 - 4.5;
                vec![t, 0.1 * (i % 2) as f32, 3.0]
            })
            .collect();
        let p = LinearProjection::fit_pca(&samples).unwrap();
        assert_eq!(p.input_dim(), 3);

        // First component follows axis 0 (up to sign)
        assert!(p.weights[0][0].abs() > 0.99);
        assert!(p.weights[1][0].abs() < 0.05);

        // Centered: the mean sample maps to the origin
        let mean = p.project(&[0.0, 0.05, 3.0]).unwrap();
        assert!(mean[0].abs() < 1e-4);
        assert!(mean[1].abs() < 1e-4);

        // Spread along the first coordinate matches the input spread
        let lo = p.project(&samples[0]).unwrap();
        let hi = p.project(&samples[9]).unwrap();
        assert!(((hi[0] - lo[0]).abs() - 9.0).abs() < 1e-2);
    }

    #[test]
    fn test_fit_pca_rejects_bad_input() {
        assert!(LinearProjection::fit_pca(&[vec![1.0, 2.0]]).is_err());
        assert!(LinearProjection::fit_pca(&[vec![1.0], vec![2.0]]).is_err());
        assert!(LinearProjection::fit_pca(&[vec![1.0, 2.0], vec![1.0]]).is_err());
    }

    #[test]
    #[serial]
    fn test_word_projector_locates_words() {
        let model = tiny_model();
        let d = model.d_model();
        let mut weights = vec![[0.0, 0.0]; d];
        weights[0] = [1.0, 0.0];
        weights[1] = [0.0, 1.0];
        let projection = LinearProjection::new(weights, [0.0, 0.0]);

        let projector = WordProjector::new(model, projection)
            .unwrap()
            .with_layer(1);
        let a = projector.locate("fire").unwrap();
        let again = projector.locate("fire").unwrap();
        assert_eq!(a, again);
        assert!(a.scalar >= 0.0);

        assert!(projector.locate("  ").is_err());
        let out_of_range = WordProjector::new(
            tiny_model(),
            LinearProjection::new(vec![[0.0, 0.0]; d], [0.0, 0.0]),
        )
        .unwrap()
        .with_layer(6);
        assert!(out_of_range.locate("fire").is_err());
    }

    /// SAE over the tiny model's residual whose feature `i` reads unit `i`
    fn write_identity_sae(dir: &std::path::Path, hook_name: Option<&str>) {
        let dev = Device::Cpu;
        let d = tiny_model().d_model();
        let eye = Tensor::eye(d, DType::F32, &dev).unwrap();
        let mut map = std::collections::HashMap::new();
        map.insert("W_enc".to_string(), eye.clone());
        map.insert("W_dec".to_string(), eye);
        map.insert("b_enc".to_string(), Tensor::zeros(d, DType::F32, &dev).unwrap());
        map.insert("b_dec".to_string(), Tensor::zeros(d, DType::F32, &dev).unwrap());
        candle_core::safetensors::save(&map, dir.join(crate::sae::WEIGHTS_FILE)).unwrap();
        if let Some(hook) = hook_name {
            let cfg = serde_json::json!({ "d_in": d, "d_sae": d, "hook_name": hook });
            std::fs::write(dir.join(crate::sae::CONFIG_FILE), cfg.to_string()).unwrap();
        }
    }

    fn zero_projector() -> WordProjector {
        let model = tiny_model();
        let d = model.d_model();
        WordProjector::new(model, LinearProjection::new(vec![[0.0, 0.0]; d], [0.0, 0.0])).unwrap()
    }

    #[test]
    #[serial]
    fn test_sae_hook_must_match_read_point() {
        let dir = tempdir().unwrap();
        write_identity_sae(dir.path(), Some("blocks.0.hook_resid_post"));
        let sae = SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).unwrap();

        // Trained on layer 0, read at layer 1
        let err = zero_projector()
            .with_layer(1)
            .with_feature(sae.clone(), 2)
            .err()
            .unwrap();
        assert!(err.to_string().contains("blocks.0.hook_resid_post"));

        // Same layer, wrong site
        assert!(zero_projector()
            .with_layer(0)
            .with_site(HookSite::ResidPre)
            .with_feature(sae.clone(), 2)
            .is_err());

        let projector = zero_projector().with_layer(0).with_feature(sae, 2).unwrap();
        let location = projector.locate("fire").unwrap();
        let activation = word_activation(&projector.model, "fire", 0, HookSite::ResidPost).unwrap();
        assert!((location.scalar - activation[2].max(0.0)).abs() < 1e-5);

        // Moving the read point afterwards is caught when locating
        assert!(projector.with_layer(1).locate("fire").is_err());
    }

    #[test]
    #[serial]
    fn test_sae_without_hook_name_is_accepted() {
        let dir = tempdir().unwrap();
        write_identity_sae(dir.path(), None);
        let sae = SparseAutoencoder::load_dir(dir.path(), &Device::Cpu).unwrap();
        let projector = zero_projector().with_layer(1).with_feature(sae, 0).unwrap();
        assert!(projector.locate("sky").unwrap().scalar >= 0.0);
    }

    #[test]
    #[serial]
    fn test_projection_dim_must_match_model() {
        let projection = LinearProjection::new(vec![[1.0, 0.0]; 3], [0.0, 0.0]);
        assert!(WordProjector::new(tiny_model(), projection).is_err());
    }

    #[test]
    #[serial]
    fn test_fit_word_projection() {
        let model = tiny_model();
        let words: Vec<String> = ["fire", "sky", "ball", "the"]
            .iter()
            .map(|w| w.to_string())
            .collect();
        let p = fit_word_projection(&model, &words, 0, HookSite::ResidPost).unwrap();
        assert_eq!(p.input_dim(), model.d_model());
    }
}
