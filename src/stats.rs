//! Summary statistics and activation statistics
//!
//! [`collect_activation_stats`] records, for every target neuron, the value
//! it takes at its token position across a prompt set, grouped under the
//! `"layer/neuron"` key. The t-tests back the sweep summaries.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{ensure, Result};
use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::hooks::{HookSite, HookSpec};
use crate::model::HookedBackend;
use crate::neuron::{sort_targets, NeuronTarget};

/// Count, mean, sample standard deviation and range of a set of values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub n: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryStats {
    pub fn from_values(values: &[f64]) -> Self {
        let n = values.len();
        if n == 0 {
            return Self {
                n: 0,
                mean: 0.0,
                std_dev: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }

        let mean = values.iter().mean();
        let std_dev = if n > 1 { values.iter().std_dev() } else { 0.0 };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Self {
            n,
            mean,
            std_dev,
            min,
            max,
        }
    }

    pub fn from_f32(values: &[f32]) -> Self {
        let values: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
        Self::from_values(&values)
    }

    /// Standard error of the mean
    pub fn std_error(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.std_dev / (self.n as f64).sqrt()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TTestResult {
    pub t: f64,
    pub df: f64,
    pub p_value: f64,
}

impl TTestResult {
    fn undefined() -> Self {
        Self {
            t: 0.0,
            df: 0.0,
            p_value: 1.0,
        }
    }

    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

/// Two-sided p-value of `t` under Student's t with `df` degrees of freedom
fn two_sided_p(t: f64, df: f64) -> f64 {
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) if df > 0.0 && t.is_finite() => 2.0 * (1.0 - dist.cdf(t.abs())),
        _ => 1.0,
    }
}

/// One-sample t-test of `mean(values) == mu`.
///
/// With zero variance the result is undefined (t = 0, p = 1) unless the mean
/// itself differs from `mu`, in which case `t` is infinite and `p` is 0.
pub fn one_sample_t_test(values: &[f64], mu: f64) -> TTestResult {
    let stats = SummaryStats::from_values(values);
    if stats.n < 2 {
        return TTestResult::undefined();
    }
    let df = (stats.n - 1) as f64;
    let se = stats.std_error();
    let diff = stats.mean - mu;

    if se == 0.0 {
        if diff == 0.0 {
            return TTestResult {
                t: 0.0,
                df,
                p_value: 1.0,
            };
        }
        return TTestResult {
            t: diff.signum() * f64::INFINITY,
            df,
            p_value: 0.0,
        };
    }

    let t = diff / se;
    TTestResult {
        t,
        df,
        p_value: two_sided_p(t, df),
    }
}

/// Welch's t-test (unequal variances) between two samples
pub fn welch_t_test(a: &SummaryStats, b: &SummaryStats) -> TTestResult {
    let n1 = a.n as f64;
    let n2 = b.n as f64;
    if a.n < 2 || b.n < 2 {
        return TTestResult::undefined();
    }

    let se1 = a.std_dev.powi(2) / n1;
    let se2 = b.std_dev.powi(2) / n2;
    let se_diff = (se1 + se2).sqrt();

    let t = if se_diff > 0.0 {
        (a.mean - b.mean) / se_diff
    } else {
        0.0
    };

    // Welch-Satterthwaite degrees of freedom
    let df = if se1 > 0.0 && se2 > 0.0 {
        let numerator = (se1 + se2).powi(2);
        let denominator = (se1.powi(2) / (n1 - 1.0)) + (se2.powi(2) / (n2 - 1.0));
        numerator / denominator
    } else {
        n1 + n2 - 2.0
    };

    TTestResult {
        t,
        df,
        p_value: two_sided_p(t, df),
    }
}

/// Observed values of one neuron
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronActivationStats {
    pub target: NeuronTarget,
    /// One value per prompt (per position for `All` targets)
    pub values: Vec<f32>,
    pub summary: SummaryStats,
}

/// Activation statistics of a neuron list at one hook site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationStats {
    pub site: HookSite,
    pub n_prompts: usize,
    /// Keyed by `"layer/neuron"`
    pub neurons: BTreeMap<String, NeuronActivationStats>,
}

impl ActivationStats {
    pub fn get(&self, target: &NeuronTarget) -> Option<&NeuronActivationStats> {
        self.neurons.get(&target.key())
    }

    pub fn len(&self) -> usize {
        self.neurons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neurons.is_empty()
    }
}

/// Capture each target neuron's activation at `site` over a prompt set.
///
/// No edits are applied; every prompt takes one hooked forward pass that
/// captures only the layers the targets live in.
pub fn collect_activation_stats(
    backend: &dyn HookedBackend,
    prompts: &[Vec<u32>],
    targets: &[NeuronTarget],
    site: HookSite,
) -> Result<ActivationStats> {
    ensure!(!prompts.is_empty(), "No prompts to collect activations from");

    let mut targets = targets.to_vec();
    sort_targets(&mut targets);

    let units = backend.units_at(site);
    for target in &targets {
        ensure!(
            target.layer < backend.n_layers(),
            "Layer {} out of range (model has {} layers)",
            target.layer,
            backend.n_layers()
        );
        ensure!(
            target.neuron < units,
            "Neuron {} out of range ({site} has {units} units)",
            target.neuron
        );
    }

    let layers: BTreeSet<usize> = targets.iter().map(|t| t.layer).collect();
    let mut hooks = HookSpec::new();
    for &layer in &layers {
        hooks.capture(site.at(layer));
    }

    let mut values: BTreeMap<String, (NeuronTarget, Vec<f32>)> = targets
        .iter()
        .map(|t| (t.key(), (*t, Vec::new())))
        .collect();

    for (i, ids) in prompts.iter().enumerate() {
        let input = Tensor::new(&ids[..], backend.device())?.unsqueeze(0)?;
        let seq_len = ids.len();
        let cache = backend.forward_hooked(&input, &hooks)?;

        for target in &targets {
            let activation = cache.require(&site.at(target.layer))?;
            let entry = values
                .get_mut(&target.key())
                .ok_or_else(|| anyhow::anyhow!("Missing slot for {}", target.key()))?;
            for pos in target.token.resolve(0, seq_len)? {
                let v = activation
                    .i((0, pos, target.neuron))?
                    .to_dtype(DType::F32)?
                    .to_scalar::<f32>()?;
                entry.1.push(v);
            }
        }
        debug!("Collected activations for prompt {}/{}", i + 1, prompts.len());
    }

    let neurons: BTreeMap<String, NeuronActivationStats> = values
        .into_iter()
        .map(|(key, (target, values))| {
            let summary = SummaryStats::from_f32(&values);
            (
                key,
                NeuronActivationStats {
                    target,
                    values,
                    summary,
                },
            )
        })
        .collect();

    info!(
        "Collected activation stats for {} neurons over {} prompts at {}",
        neurons.len(),
        prompts.len(),
        site
    );

    Ok(ActivationStats {
        site,
        n_prompts: prompts.len(),
        neurons,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_stats() {
        let stats = SummaryStats::from_values(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(stats.n, 4);
        assert!((stats.mean - 2.5).abs() < 1e-12);
        // Sample std-dev of 1..=4
        assert!((stats.std_dev - 1.290_994_448_735_805_6).abs() < 1e-9);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
    }

    #[test]
    fn test_summary_stats_edge_cases() {
        let empty = SummaryStats::from_values(&[]);
        assert_eq!(empty.n, 0);
        assert_eq!(empty.mean, 0.0);

        let single = SummaryStats::from_f32(&[-2.5]);
        assert_eq!(single.n, 1);
        assert_eq!(single.mean, -2.5);
        assert_eq!(single.std_dev, 0.0);
        assert_eq!(single.std_error(), 0.0);
    }

    #[test]
    fn test_one_sample_t_test() {
        // Clearly negative deltas
        let deltas = [-1.0, -1.2, -0.9, -1.1, -1.05];
        let result = one_sample_t_test(&deltas, 0.0);
        assert!(result.t < -10.0);
        assert_eq!(result.df, 4.0);
        assert!(result.is_significant(0.001));

        // Centered on zero
        let centered = [-1.0, 1.0, -0.5, 0.5];
        let result = one_sample_t_test(&centered, 0.0);
        assert!(result.t.abs() < 1e-12);
        assert!((result.p_value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_one_sample_t_test_degenerate() {
        assert_eq!(one_sample_t_test(&[1.0], 0.0).p_value, 1.0);
        assert_eq!(one_sample_t_test(&[0.0, 0.0, 0.0], 0.0).p_value, 1.0);
        let constant = one_sample_t_test(&[2.0, 2.0], 0.0);
        assert_eq!(constant.p_value, 0.0);
        assert!(constant.t.is_infinite());
    }

    #[test]
    fn test_welch_t_test() {
        let a = SummaryStats::from_values(&[0.1, 0.12, 0.11, 0.13, 0.09]);
        let b = SummaryStats::from_values(&[0.02, 0.03, 0.025, 0.035, 0.02]);
        let result = welch_t_test(&a, &b);
        assert!(result.t > 0.0);
        assert!(result.is_significant(0.01));

        let tiny = SummaryStats::from_values(&[1.0]);
        assert_eq!(welch_t_test(&a, &tiny).p_value, 1.0);
    }
}
