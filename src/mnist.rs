//! Adversarial MNIST: draw on a digit and watch the classifier change its mind
//!
//! The player draws strokes on a fixed base image; every drawn pixel is set to
//! the darkest value in the image and the edited copy is classified. The
//! classifier is rebuilt from a PyTorch state dict exported to safetensors.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::argmax;

/// Parse `"(1,2), (3,4)"` into `[(1, 2), (3, 4)]`.
///
/// Parentheses are dropped and the rest is split on commas; fields that are
/// not plain non-negative integers are skipped, and a trailing unpaired value
/// is ignored. Digit fields too large for `usize` keep their slot as
/// `usize::MAX`, which no canvas contains.
pub fn parse_drawn_coords(input: &str) -> Vec<(usize, usize)> {
    let values: Vec<usize> = input
        .replace(['(', ')'], "")
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty() && field.chars().all(|c| c.is_ascii_digit()))
        .map(|field| field.parse().unwrap_or(usize::MAX))
        .collect();
    values.chunks_exact(2).map(|p| (p[0], p[1])).collect()
}

/// Grayscale image stored channel-first as `[C, H, W]` (`C` = 1)
#[derive(Debug, Clone, PartialEq)]
pub struct DigitCanvas {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl DigitCanvas {
    pub fn from_gray(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self> {
        ensure!(width > 0 && height > 0, "Canvas must not be empty");
        ensure!(
            pixels.len() == width * height,
            "Expected {} pixels for {width}x{height}, got {}",
            width * height,
            pixels.len()
        );
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn from_png(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let img = image::open(path)
            .with_context(|| format!("Failed to open image {}", path.display()))?
            .to_luma8();
        let (w, h) = img.dimensions();
        info!("Loaded base digit {} ({w}x{h})", path.display());
        Self::from_gray(w as usize, h as usize, img.into_raw())
    }

    pub fn from_png_bytes(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory(bytes)
            .context("Failed to decode image")?
            .to_luma8();
        let (w, h) = img.dimensions();
        Self::from_gray(w as usize, h as usize, img.into_raw())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// `[C, H, W]`
    pub fn shape(&self) -> (usize, usize, usize) {
        (1, self.height, self.width)
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<u8> {
        (x < self.width && y < self.height).then(|| self.pixels[y * self.width + x])
    }

    pub fn min_value(&self) -> u8 {
        self.pixels.iter().copied().min().unwrap_or(0)
    }

    /// Copy of the canvas with every in-bounds `(x, y)` set to the minimum
    /// pixel value of the original. Out-of-bounds points are ignored.
    pub fn apply_strokes(&self, points: &[(usize, usize)]) -> Self {
        let min = self.min_value();
        let mut edited = self.clone();
        let mut drawn = 0;
        for &(x, y) in points {
            if x < self.width && y < self.height {
                edited.pixels[y * self.width + x] = min;
                drawn += 1;
            }
        }
        debug!("Drew {drawn}/{} points", points.len());
        edited
    }

    /// `[1, C, H, W]` F32 tensor scaled to `[0, 1]`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let t = Tensor::from_vec(self.pixels.clone(), (1, 1, self.height, self.width), device)?
            .to_dtype(DType::F32)?;
        Ok((t / 255.0)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitPrediction {
    pub prediction: u32,
    pub probabilities: Vec<f32>,
}

enum Network {
    /// conv1 → relu → conv2 → relu → max_pool(2) → flatten → fc1 → relu → fc2
    Cnn {
        conv1: Conv2d,
        conv2: Conv2d,
        fc1: Linear,
        fc2: Linear,
    },
    /// flatten → fc1 → relu → fc2 [→ relu → fc3]
    Mlp {
        fc1: Linear,
        fc2: Linear,
        fc3: Option<Linear>,
    },
}

/// MNIST classifier rebuilt from a safetensors state dict
pub struct DigitClassifier {
    network: Network,
    device: Device,
    n_classes: usize,
}

fn shape_of(tensors: &HashMap<String, Tensor>, name: &str) -> Result<Vec<usize>> {
    Ok(tensors
        .get(name)
        .with_context(|| format!("Tensor '{name}' not found in classifier weights"))?
        .dims()
        .to_vec())
}

fn linear(tensors: &HashMap<String, Tensor>, vb: &VarBuilder, name: &str) -> Result<Linear> {
    let shape = shape_of(tensors, &format!("{name}.weight"))?;
    ensure!(shape.len() == 2, "{name}.weight must be 2D, got {shape:?}");
    Ok(candle_nn::linear(shape[1], shape[0], vb.pp(name))?)
}

fn conv(tensors: &HashMap<String, Tensor>, vb: &VarBuilder, name: &str) -> Result<Conv2d> {
    let shape = shape_of(tensors, &format!("{name}.weight"))?;
    ensure!(shape.len() == 4, "{name}.weight must be 4D, got {shape:?}");
    ensure!(shape[2] == shape[3], "{name} kernel must be square");
    Ok(candle_nn::conv2d(
        shape[1],
        shape[0],
        shape[2],
        Conv2dConfig::default(),
        vb.pp(name),
    )?)
}

impl DigitClassifier {
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load classifier {}", path.display()))?;
        let classifier = Self::from_tensors(tensors, device)?;
        info!(
            "Loaded {} digit classifier from {}",
            classifier.architecture(),
            path.display()
        );
        Ok(classifier)
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>, device: &Device) -> Result<Self> {
        let tensors: HashMap<String, Tensor> = tensors
            .into_iter()
            .map(|(k, v)| -> Result<(String, Tensor)> { Ok((k, v.to_dtype(DType::F32)?)) })
            .collect::<Result<_>>()?;
        let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, device);

        let network = if tensors.contains_key("conv1.weight") {
            Network::Cnn {
                conv1: conv(&tensors, &vb, "conv1")?,
                conv2: conv(&tensors, &vb, "conv2")?,
                fc1: linear(&tensors, &vb, "fc1")?,
                fc2: linear(&tensors, &vb, "fc2")?,
            }
        } else if tensors.contains_key("fc1.weight") {
            let fc3 = if tensors.contains_key("fc3.weight") {
                Some(linear(&tensors, &vb, "fc3")?)
            } else {
                None
            };
            Network::Mlp {
                fc1: linear(&tensors, &vb, "fc1")?,
                fc2: linear(&tensors, &vb, "fc2")?,
                fc3,
            }
        } else {
            bail!("Unrecognised classifier: expected conv1.weight or fc1.weight");
        };

        let last = match &network {
            Network::Cnn { .. } => "fc2",
            Network::Mlp { fc3: Some(_), .. } => "fc3",
            Network::Mlp { fc3: None, .. } => "fc2",
        };
        let n_classes = shape_of(&tensors, &format!("{last}.weight"))?[0];

        Ok(Self {
            network,
            device: device.clone(),
            n_classes,
        })
    }

    pub fn architecture(&self) -> &'static str {
        match self.network {
            Network::Cnn { .. } => "CNN",
            Network::Mlp { .. } => "MLP",
        }
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Class scores for a `[B, C, H, W]` batch
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let logits = match &self.network {
            Network::Cnn {
                conv1,
                conv2,
                fc1,
                fc2,
            } => {
                let x = conv1.forward(x)?.relu()?;
                let x = conv2.forward(&x)?.relu()?;
                let x = x.max_pool2d(2)?.flatten_from(1)?;
                let x = fc1.forward(&x)?.relu()?;
                fc2.forward(&x)?
            }
            Network::Mlp { fc1, fc2, fc3 } => {
                let x = x.flatten_from(1)?;
                let x = fc1.forward(&x)?.relu()?;
                let x = fc2.forward(&x)?;
                match fc3 {
                    Some(fc3) => fc3.forward(&x.relu()?)?,
                    None => x,
                }
            }
        };
        Ok(logits)
    }

    pub fn predict(&self, canvas: &DigitCanvas) -> Result<DigitPrediction> {
        let input = canvas.to_tensor(&self.device)?;
        let logits = self.forward(&input)?.squeeze(0)?;
        let prediction = argmax(&logits)?;
        let probabilities = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec1::<f32>()?;
        Ok(DigitPrediction {
            prediction,
            probabilities,
        })
    }
}

/// A base digit plus the classifier that judges the player's edits
pub struct DigitGame {
    canvas: DigitCanvas,
    classifier: DigitClassifier,
}

impl DigitGame {
    pub fn new(canvas: DigitCanvas, classifier: DigitClassifier) -> Self {
        Self { canvas, classifier }
    }

    pub fn load(image: impl AsRef<Path>, weights: impl AsRef<Path>) -> Result<Self> {
        let canvas = DigitCanvas::from_png(image)?;
        let classifier = DigitClassifier::load(weights, &Device::Cpu)?;
        Ok(Self::new(canvas, classifier))
    }

    pub fn canvas(&self) -> &DigitCanvas {
        &self.canvas
    }

    pub fn predict_points(&self, points: &[(usize, usize)]) -> Result<DigitPrediction> {
        self.classifier.predict(&self.canvas.apply_strokes(points))
    }

    pub fn predict_drawing(&self, drawn_coords: &str) -> Result<DigitPrediction> {
        self.predict_points(&parse_drawn_coords(drawn_coords))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    /// 2x2 MLP: class 0 reads pixel (0, 0), class 1 is a constant 0.5,
    /// class 2 reads pixel (1, 1).
    pub(crate) fn toy_mlp_weights() -> HashMap<String, Tensor> {
        let dev = Device::Cpu;
        let eye: Vec<f32> = (0..16).map(|i| if i % 5 == 0 { 1.0 } else { 0.0 }).collect();
        let mut map = HashMap::new();
        map.insert(
            "fc1.weight".to_string(),
            Tensor::from_vec(eye, (4, 4), &dev).unwrap(),
        );
        map.insert("fc1.bias".to_string(), Tensor::zeros(4, DType::F32, &dev).unwrap());
        map.insert(
            "fc2.weight".to_string(),
            Tensor::new(
                &[[1.0f32, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]],
                &dev,
            )
            .unwrap(),
        );
        map.insert(
            "fc2.bias".to_string(),
            Tensor::new(&[0.0f32, 0.5, 0.0], &dev).unwrap(),
        );
        map
    }

    pub(crate) fn toy_canvas() -> DigitCanvas {
        DigitCanvas::from_gray(2, 2, vec![255, 255, 255, 0]).unwrap()
    }

    #[test]
    fn test_parse_drawn_coords() {
        assert_eq!(parse_drawn_coords("(1,2), (3,4)"), vec![(1, 2), (3, 4)]);
        assert_eq!(parse_drawn_coords("(1, 2), (3"), vec![(1, 2)]);
        assert_eq!(parse_drawn_coords("(-1, 2), (a, 3), 4"), vec![(2, 3)]);
        assert_eq!(
            parse_drawn_coords("(99999999999999999999999, 2), (3, 4)"),
            vec![(usize::MAX, 2), (3, 4)]
        );
        assert!(parse_drawn_coords("").is_empty());
        assert!(parse_drawn_coords("nonsense").is_empty());
    }

    #[test]
    fn test_apply_strokes_leaves_base_untouched() {
        let canvas = DigitCanvas::from_gray(3, 2, vec![10, 200, 200, 200, 200, 200]).unwrap();
        let edited = canvas.apply_strokes(&[(2, 1), (9, 0), (0, 7)]);

        assert_eq!(edited.pixel(2, 1), Some(10));
        assert_eq!(edited.pixel(1, 1), Some(200));
        assert_eq!(canvas.pixel(2, 1), Some(200));
        assert_eq!(canvas.shape(), (1, 2, 3));
        assert_eq!(canvas.pixel(3, 0), None);
    }

    #[test]
    fn test_canvas_rejects_bad_dimensions() {
        assert!(DigitCanvas::from_gray(2, 2, vec![0; 3]).is_err());
        assert!(DigitCanvas::from_gray(0, 2, vec![]).is_err());
    }

    #[test]
    fn test_png_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("three.png");
        image::GrayImage::from_raw(2, 2, vec![0, 64, 128, 255])
            .unwrap()
            .save(&path)
            .unwrap();

        let canvas = DigitCanvas::from_png(&path).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (2, 2));
        assert_eq!(canvas.pixel(1, 0), Some(64));
        assert_eq!(canvas.min_value(), 0);

        let tensor = canvas.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 1, 2, 2]);
        let max = tensor.flatten_all().unwrap().max(0).unwrap();
        assert_eq!(max.to_scalar::<f32>().unwrap(), 1.0);
    }

    #[test]
    fn test_mlp_prediction_follows_strokes() {
        let classifier = DigitClassifier::from_tensors(toy_mlp_weights(), &Device::Cpu).unwrap();
        assert_eq!(classifier.architecture(), "MLP");
        assert_eq!(classifier.n_classes(), 3);

        let game = DigitGame::new(toy_canvas(), classifier);
        let before = game.predict_drawing("").unwrap();
        assert_eq!(before.prediction, 0);
        assert_eq!(before.probabilities.len(), 3);
        let total: f32 = before.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);

        // Erasing (0, 0) removes the evidence for class 0
        let after = game.predict_drawing("(0, 0), (5, 5)").unwrap();
        assert_eq!(after.prediction, 1);
        assert_eq!(game.canvas().pixel(0, 0), Some(255));
    }

    #[test]
    fn test_cnn_from_safetensors() {
        let dev = Device::Cpu;
        let ramp = |n: usize, shape: &[usize]| {
            let v: Vec<f32> = (0..n).map(|i| ((i % 7) as f32 - 3.0) * 0.1).collect();
            Tensor::from_vec(v, shape, &dev).unwrap()
        };
        let mut map = HashMap::new();
        map.insert("conv1.weight".to_string(), ramp(18, &[2, 1, 3, 3]));
        map.insert("conv1.bias".to_string(), ramp(2, &[2]));
        map.insert("conv2.weight".to_string(), ramp(36, &[2, 2, 3, 3]));
        map.insert("conv2.bias".to_string(), ramp(2, &[2]));
        // 8x8 → 6x6 → 4x4 → pool 2x2, 2 channels
        map.insert("fc1.weight".to_string(), ramp(32, &[4, 8]));
        map.insert("fc1.bias".to_string(), ramp(4, &[4]));
        map.insert("fc2.weight".to_string(), ramp(40, &[10, 4]));
        map.insert("fc2.bias".to_string(), ramp(10, &[10]));

        let dir = tempdir().unwrap();
        let path = dir.path().join("mnist.safetensors");
        candle_core::safetensors::save(&map, &path).unwrap();

        let classifier = DigitClassifier::load(&path, &dev).unwrap();
        assert_eq!(classifier.architecture(), "CNN");
        assert_eq!(classifier.n_classes(), 10);

        let canvas = DigitCanvas::from_gray(8, 8, (0..64).map(|i| (i * 4) as u8).collect()).unwrap();
        let prediction = classifier.predict(&canvas).unwrap();
        assert!(prediction.prediction < 10);
        assert_eq!(prediction.probabilities.len(), 10);
    }

    #[test]
    fn test_unknown_state_dict_rejected() {
        let mut map = HashMap::new();
        map.insert(
            "encoder.weight".to_string(),
            Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(DigitClassifier::from_tensors(map, &Device::Cpu).is_err());
    }
}
