//! Progressive neuron steering for carnival-rs
//!
//! The sweep sorts a neuron list by `(layer, token, neuron)` and edits a
//! growing prefix of it: step `k` intervenes on the first `k` neurons. Each
//! step records how the log-probability of two candidate answers moved
//! relative to the unedited baseline, so the curve shows how much of the
//! model's preference for one answer over the other flows through those
//! neurons.
//!
//! ## Usage
//!
//! ```ignore
//! use carnival_rs::{progressive_sweep, EditKind, HookSite};
//!
//! let result = progressive_sweep(
//!     model.backend(),
//!     &prompt_ids,
//!     &neurons,
//!     lebron_id,
//!     jordan_id,
//!     HookSite::MlpOut,
//!     EditKind::Zero,
//! )?;
//!
//! for step in &result.steps {
//!     println!("{}: {:+.3} / {:+.3}", step.n_steered, step.mean_delta_a, step.mean_delta_b);
//! }
//! ```

use anyhow::{ensure, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chat::format_question;
use crate::hooks::{HookSite, HookSpec};
use crate::intervention::{log_prob_of, EditKind, NeuronSteeringSpec};
use crate::model::{argmax, CarnivalModel, HookedBackend};
use crate::neuron::{sort_targets, NeuronTarget};
use crate::stats::{one_sample_t_test, welch_t_test, SummaryStats, TTestResult};

/// One point of the sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepStep {
    /// Number of neurons edited at this step
    pub n_steered: usize,

    /// The neuron added at this step (`None` for the baseline step)
    pub added: Option<NeuronTarget>,

    /// Per-prompt `steered - baseline` log-probability of token A
    pub delta_a: Vec<f32>,

    /// Per-prompt `steered - baseline` log-probability of token B
    pub delta_b: Vec<f32>,

    pub mean_delta_a: f32,
    pub mean_delta_b: f32,
}

impl SweepStep {
    fn new(n_steered: usize, added: Option<NeuronTarget>, delta_a: Vec<f32>, delta_b: Vec<f32>) -> Self {
        Self {
            n_steered,
            added,
            mean_delta_a: mean(&delta_a),
            mean_delta_b: mean(&delta_b),
            delta_a,
            delta_b,
        }
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Full result of a progressive sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    /// Neurons in the order they were added
    pub neurons: Vec<NeuronTarget>,
    pub site: HookSite,
    pub kind: EditKind,
    pub token_a: u32,
    pub token_b: u32,

    /// Per-prompt baseline log-probabilities
    pub baseline_a: Vec<f32>,
    pub baseline_b: Vec<f32>,

    /// `neurons.len() + 1` steps, step 0 being the unedited baseline
    pub steps: Vec<SweepStep>,
}

impl SweepResult {
    pub fn n_prompts(&self) -> usize {
        self.baseline_a.len()
    }

    /// Mean delta of token A per step
    pub fn mean_deltas_a(&self) -> Vec<f32> {
        self.steps.iter().map(|s| s.mean_delta_a).collect()
    }

    /// Mean delta of token B per step
    pub fn mean_deltas_b(&self) -> Vec<f32> {
        self.steps.iter().map(|s| s.mean_delta_b).collect()
    }

    pub fn final_step(&self) -> Option<&SweepStep> {
        self.steps.last()
    }

    /// Step with the largest mean gap `delta_b - delta_a`
    pub fn max_separation_step(&self) -> Option<&SweepStep> {
        self.steps.iter().max_by(|x, y| {
            let gx = x.mean_delta_b - x.mean_delta_a;
            let gy = y.mean_delta_b - y.mean_delta_a;
            gx.partial_cmp(&gy).unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Statistics of the final step across prompts
    pub fn summary(&self) -> SweepSummary {
        let (delta_a, delta_b) = self
            .final_step()
            .map(|s| (to_f64(&s.delta_a), to_f64(&s.delta_b)))
            .unwrap_or_default();

        let stats_a = SummaryStats::from_values(&delta_a);
        let stats_b = SummaryStats::from_values(&delta_b);
        let gap: Vec<f64> = delta_b.iter().zip(&delta_a).map(|(b, a)| b - a).collect();

        SweepSummary {
            n_prompts: self.n_prompts(),
            n_neurons: self.neurons.len(),
            delta_a: stats_a,
            delta_b: stats_b,
            t_test_a: one_sample_t_test(&delta_a, 0.0),
            t_test_b: one_sample_t_test(&delta_b, 0.0),
            a_vs_b: welch_t_test(&stats_a, &stats_b),
            paired_gap: one_sample_t_test(&gap, 0.0),
        }
    }
}

fn to_f64(values: &[f32]) -> Vec<f64> {
    values.iter().map(|&v| f64::from(v)).collect()
}

/// Final-step statistics of a sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub n_prompts: usize,
    pub n_neurons: usize,
    pub delta_a: SummaryStats,
    pub delta_b: SummaryStats,
    /// Token A delta against zero
    pub t_test_a: TTestResult,
    /// Token B delta against zero
    pub t_test_b: TTestResult,
    /// Token A delta against token B delta (Welch)
    pub a_vs_b: TTestResult,
    /// Per-prompt `delta_b - delta_a` against zero
    pub paired_gap: TTestResult,
}

fn input_tensor(backend: &dyn HookedBackend, ids: &[u32]) -> Result<Tensor> {
    Ok(Tensor::new(ids, backend.device())?.unsqueeze(0)?)
}

/// Log-probabilities of `token_a` and `token_b` at the final position
fn answer_log_probs(
    backend: &dyn HookedBackend,
    input: &Tensor,
    hooks: &HookSpec,
    token_a: u32,
    token_b: u32,
) -> Result<(f32, f32)> {
    let logits = backend.last_token_logits(input, hooks)?;
    Ok((log_prob_of(&logits, token_a)?, log_prob_of(&logits, token_b)?))
}

/// Progressive neuron intervention sweep.
///
/// Every prompt is run on its own (no padding), so each prompt's final
/// position is its real last token. Step 0 edits nothing and reports a zero
/// delta.
pub fn progressive_sweep(
    backend: &dyn HookedBackend,
    prompts: &[Vec<u32>],
    neurons: &[NeuronTarget],
    token_a: u32,
    token_b: u32,
    site: HookSite,
    kind: EditKind,
) -> Result<SweepResult> {
    ensure!(!prompts.is_empty(), "No prompts to sweep");
    let vocab_size = backend.vocab_size();
    ensure!(
        (token_a as usize) < vocab_size && (token_b as usize) < vocab_size,
        "Token ids {token_a}/{token_b} out of range (vocabulary has {vocab_size} entries)"
    );

    let mut neurons = neurons.to_vec();
    sort_targets(&mut neurons);

    let full_spec = NeuronSteeringSpec::new(kind).site(site).neurons(&neurons);
    let units = backend.units_at(site);
    for ids in prompts {
        ensure!(!ids.is_empty(), "Empty prompt in sweep");
        full_spec.validate(backend.n_layers(), units, ids.len())?;
    }

    let inputs: Vec<Tensor> = prompts
        .iter()
        .map(|ids| input_tensor(backend, ids))
        .collect::<Result<_>>()?;

    info!(
        "Sweeping {} neurons at {} ({}) over {} prompts",
        neurons.len(),
        site,
        kind,
        prompts.len()
    );

    let mut baseline_a = Vec::with_capacity(inputs.len());
    let mut baseline_b = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let (a, b) = answer_log_probs(backend, input, &HookSpec::new(), token_a, token_b)?;
        baseline_a.push(a);
        baseline_b.push(b);
    }

    let mut steps = Vec::with_capacity(neurons.len() + 1);
    steps.push(SweepStep::new(
        0,
        None,
        vec![0.0; inputs.len()],
        vec![0.0; inputs.len()],
    ));

    for k in 1..=neurons.len() {
        let hooks = NeuronSteeringSpec::new(kind)
            .site(site)
            .neurons(&neurons[..k])
            .to_hook_spec();

        let mut delta_a = Vec::with_capacity(inputs.len());
        let mut delta_b = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let (a, b) = answer_log_probs(backend, input, &hooks, token_a, token_b)?;
            delta_a.push(a - baseline_a[i]);
            delta_b.push(b - baseline_b[i]);
        }

        let step = SweepStep::new(k, Some(neurons[k - 1]), delta_a, delta_b);
        debug!(
            "Step {}/{} (+{}): mean delta A {:+.4}, B {:+.4}",
            k,
            neurons.len(),
            neurons[k - 1],
            step.mean_delta_a,
            step.mean_delta_b
        );
        steps.push(step);
    }

    Ok(SweepResult {
        neurons,
        site,
        kind,
        token_a,
        token_b,
        baseline_a,
        baseline_b,
        steps,
    })
}

/// Parse a comma-separated knob list such as `"1.0, 0.5, -2"`.
pub fn parse_knob_turns(input: &str) -> Result<Vec<f32>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let v: f32 = s
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid knob value {s:?}"))?;
            ensure!(v.is_finite(), "Knob value must be finite, got {s:?}");
            Ok(v)
        })
        .collect()
}

/// Greedy answer after turning each neuron's knob
#[derive(Debug, Clone, Serialize)]
pub struct KnobPrediction {
    pub token_id: u32,
    pub prediction: String,
}

/// Scale `neurons[i]` by `knobs[i]` at `site` and return the greedy
/// next-token prediction for `prompt`. Neurons without a knob keep their
/// activation.
pub fn knob_steering(
    model: &CarnivalModel,
    prompt: &str,
    neurons: &[NeuronTarget],
    knobs: &[f32],
    site: HookSite,
) -> Result<KnobPrediction> {
    ensure!(
        knobs.len() <= neurons.len(),
        "{} knob values for {} neurons",
        knobs.len(),
        neurons.len()
    );

    let spec = neurons
        .iter()
        .zip(knobs)
        .fold(NeuronSteeringSpec::new(EditKind::Scale(1.0)).site(site), |spec, (&t, &k)| {
            spec.neuron_with(t, EditKind::Scale(k))
        });

    let input = model.prompt_tensor(prompt)?;
    spec.validate(
        model.n_layers(),
        model.backend().units_at(site),
        input.dim(1)?,
    )?;

    let logits = model
        .backend()
        .last_token_logits(&input, &spec.to_hook_spec())?;
    let token_id = argmax(&logits)?;
    let prediction = model.decode_token(token_id).trim().to_string();

    debug!("Knobs {:?} -> {:?} ({})", knobs, prediction, token_id);
    Ok(KnobPrediction {
        token_id,
        prediction,
    })
}

/// Surgery-sim game: a fixed prompt and neuron list steered by knob turns
pub struct KnobGame {
    model: CarnivalModel,
    prompt: String,
    neurons: Vec<NeuronTarget>,
    site: HookSite,
}

impl KnobGame {
    /// `stem` is wrapped in the question/answer chat framing of the model.
    pub fn new(
        model: CarnivalModel,
        stem: &str,
        mut neurons: Vec<NeuronTarget>,
        site: HookSite,
    ) -> Result<Self> {
        ensure!(!neurons.is_empty(), "Knob game needs at least one neuron");
        sort_targets(&mut neurons);
        let prompt = format_question(model.chat_format(), stem);
        info!("Knob game: {} neurons at {site}", neurons.len());
        Ok(Self {
            model,
            prompt,
            neurons,
            site,
        })
    }

    pub fn neurons(&self) -> &[NeuronTarget] {
        &self.neurons
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Parse `"1.0, 0.5"` and predict with knob `i` scaling neuron `i`.
    pub fn turn(&self, knob_turns: &str) -> Result<KnobPrediction> {
        let knobs = parse_knob_turns(knob_turns)?;
        knob_steering(&self.model, &self.prompt, &self.neurons, &knobs, self.site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_model;
    use serial_test::serial;

    fn step(n: usize, a: Vec<f32>, b: Vec<f32>) -> SweepStep {
        SweepStep::new(n, None, a, b)
    }

    fn result_with(steps: Vec<SweepStep>) -> SweepResult {
        SweepResult {
            neurons: vec![NeuronTarget::new(0, 1), NeuronTarget::new(1, 2)],
            site: HookSite::MlpOut,
            kind: EditKind::Zero,
            token_a: 3,
            token_b: 4,
            baseline_a: vec![-1.0, -2.0, -1.5],
            baseline_b: vec![-3.0, -2.5, -2.0],
            steps,
        }
    }

    #[test]
    fn test_step_means() {
        let s = step(1, vec![-1.0, -2.0, -3.0], vec![0.5, 0.5, 1.0]);
        assert!((s.mean_delta_a + 2.0).abs() < 1e-6);
        assert!((s.mean_delta_b - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(step(0, vec![], vec![]).mean_delta_a, 0.0);
    }

    #[test]
    fn test_summary_and_separation() {
        let result = result_with(vec![
            step(0, vec![0.0; 3], vec![0.0; 3]),
            step(1, vec![-0.5, -0.4, -0.6], vec![0.1, 0.2, 0.15]),
            step(2, vec![-1.0, -1.2, -0.9], vec![0.4, 0.5, 0.45]),
        ]);

        assert_eq!(result.n_prompts(), 3);
        assert_eq!(result.mean_deltas_a().len(), 3);
        assert_eq!(result.max_separation_step().unwrap().n_steered, 2);

        let summary = result.summary();
        assert_eq!(summary.n_neurons, 2);
        assert_eq!(summary.delta_a.n, 3);
        assert!(summary.delta_a.mean < 0.0);
        assert!(summary.t_test_a.t < 0.0);
        assert!(summary.paired_gap.t > 0.0);
        assert!(summary.a_vs_b.is_significant(0.01));
    }

    #[test]
    fn test_parse_knob_turns() {
        assert_eq!(parse_knob_turns("1.0, 0.5,-2").unwrap(), vec![1.0, 0.5, -2.0]);
        assert_eq!(parse_knob_turns(" 3 ,").unwrap(), vec![3.0]);
        assert!(parse_knob_turns("").unwrap().is_empty());
        assert!(parse_knob_turns("1.0, abc").is_err());
        assert!(parse_knob_turns("inf").is_err());
    }

    #[test]
    fn test_sweep_result_serializes() {
        let result = result_with(vec![step(0, vec![0.0; 3], vec![0.0; 3])]);
        let json = serde_json::to_string(&result).unwrap();
        let back: SweepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.neurons, result.neurons);
        assert_eq!(back.kind, EditKind::Zero);
    }

    #[test]
    #[serial]
    fn test_knob_game() {
        let game = KnobGame::new(
            tiny_model(),
            "the ball was passed to",
            vec![NeuronTarget::new(1, 2), NeuronTarget::new(0, 1)],
            HookSite::MlpOut,
        )
        .unwrap();
        assert_eq!(game.neurons()[0].layer, 0);
        assert!(game.prompt().ends_with("Answer:"));

        // Unit knobs leave the model untouched
        let untouched = game.turn("").unwrap();
        assert_eq!(game.turn("1.0, 1.0").unwrap().token_id, untouched.token_id);
        assert_eq!(untouched.prediction, untouched.prediction.trim());

        assert!(game.turn("1, 2, 3").is_err());
        assert!(game.turn("abc").is_err());
    }

    #[test]
    fn test_knob_game_needs_neurons() {
        let game = KnobGame::new(tiny_model(), "sky", vec![], HookSite::MlpOut);
        assert!(game.is_err());
    }
}
