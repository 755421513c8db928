//! Experiment runner for neuron steering sweeps
//!
//! Coordinates prompt loading, token resolution, the progressive sweep, and
//! the JSON and PNG reports written under the output directory.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::hooks::HookSite;
use crate::intervention::EditKind;
use crate::model::CarnivalModel;
use crate::neuron::{sort_targets, NeuronTarget};
use crate::plot::plot_sweep;
use crate::prompts::PromptSet;
use crate::steering::{progressive_sweep, SweepResult, SweepSummary};

pub const DEFAULT_STEERING_MODEL: &str = "meta-llama/Llama-3.1-8B-Instruct";

/// Configuration for a steering experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringExperimentConfig {
    /// HuggingFace model id
    pub model_id: String,
    /// Inline prompt stems (used when `prompt_file` is unset)
    pub prompts: Vec<String>,
    /// JSON prompt set (`{"prompts": [...]}`)
    pub prompt_file: Option<PathBuf>,
    /// Neuron paths such as `"<model>_2_10263_None"`
    pub neuron_paths: Vec<String>,
    /// Explicit targets, merged with `neuron_paths`
    pub neurons: Vec<NeuronTarget>,
    pub word_a: String,
    pub word_b: String,
    pub site: HookSite,
    pub kind: EditKind,
    /// Wrap each prompt in the question/answer chat framing
    pub chat: bool,
    pub output_dir: PathBuf,
}

impl Default for SteeringExperimentConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_STEERING_MODEL.to_string(),
            prompts: vec![],
            prompt_file: None,
            neuron_paths: vec![],
            neurons: vec![],
            word_a: "lebron".to_string(),
            word_b: "jordan".to_string(),
            site: HookSite::MlpOut,
            kind: EditKind::Zero,
            chat: true,
            output_dir: PathBuf::from("figures"),
        }
    }
}

impl SteeringExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read experiment config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid experiment config {}", path.display()))
    }

    /// Prompt file, then inline prompts, then the built-in basketball set.
    pub fn prompt_set(&self) -> Result<PromptSet> {
        if let Some(path) = &self.prompt_file {
            return PromptSet::load(path);
        }
        if !self.prompts.is_empty() {
            return Ok(PromptSet::new(self.prompts.clone()));
        }
        Ok(PromptSet::basketball())
    }

    /// All targets from `neuron_paths` and `neurons`, sorted and deduplicated.
    pub fn targets(&self) -> Result<Vec<NeuronTarget>> {
        let mut targets = self
            .neuron_paths
            .iter()
            .map(|p| NeuronTarget::parse_path(p))
            .collect::<Result<Vec<_>>>()?;
        targets.extend(self.neurons.iter().copied());
        ensure!(!targets.is_empty(), "No neurons to steer");
        sort_targets(&mut targets);
        targets.dedup();
        Ok(targets)
    }
}

/// Everything written to `neuron_steer_<timestamp>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringReport {
    pub model_id: String,
    pub timestamp: String,
    pub word_a: String,
    pub word_b: String,
    pub prompts: Vec<String>,
    pub summary: SweepSummary,
    pub result: SweepResult,
}

impl SteeringReport {
    pub fn file_stem(&self) -> String {
        format!("neuron_steer_{}", self.timestamp)
    }

    pub fn save_json(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.json", self.file_stem()));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!("Saved sweep report to {}", path.display());
        Ok(path)
    }

    pub fn save_plot(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}.png", self.file_stem()));
        plot_sweep(&self.result, &self.word_a, &self.word_b, &path)?;
        Ok(path)
    }
}

/// Paths written by [`SteeringExperiment::run`]
#[derive(Debug)]
pub struct ExperimentOutput {
    pub report: SteeringReport,
    pub json_path: PathBuf,
    pub plot_path: Option<PathBuf>,
}

/// `%d%H%M` stamp used in report file names
pub fn timestamp() -> String {
    chrono::Local::now().format("%d%H%M").to_string()
}

/// Main experiment runner
pub struct SteeringExperiment {
    config: SteeringExperimentConfig,
    model: CarnivalModel,
}

impl SteeringExperiment {
    pub fn new(model: CarnivalModel, config: SteeringExperimentConfig) -> Self {
        Self { config, model }
    }

    /// Load the configured model and build the experiment
    pub fn from_config(config: SteeringExperimentConfig, force_cpu: bool) -> Result<Self> {
        let model = CarnivalModel::from_pretrained_with_device(&config.model_id, force_cpu)?;
        Ok(Self::new(model, config))
    }

    pub fn config(&self) -> &SteeringExperimentConfig {
        &self.config
    }

    /// Run the sweep without writing anything
    pub fn sweep(&self) -> Result<SteeringReport> {
        info!("Starting steering experiment");
        info!("Config: {:?}", self.config);

        let prompts = self.config.prompt_set()?;
        ensure!(!prompts.is_empty(), "Prompt set is empty");
        let targets = self.config.targets()?;

        let token_a = self.model.word_token_id(&self.config.word_a)?;
        let token_b = self.model.word_token_id(&self.config.word_b)?;
        info!(
            "Token A {:?} = {}, token B {:?} = {}",
            self.config.word_a, token_a, self.config.word_b, token_b
        );

        let texts = if self.config.chat {
            prompts.formatted(self.model.chat_format())
        } else {
            prompts.prompts().to_vec()
        };
        let prompt_ids = texts
            .iter()
            .map(|t| {
                if self.config.chat {
                    self.model.encode_prompt(t)
                } else {
                    self.model.encode(t, true)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let result = progressive_sweep(
            self.model.backend(),
            &prompt_ids,
            &targets,
            token_a,
            token_b,
            self.config.site,
            self.config.kind,
        )?;
        let summary = result.summary();

        info!(
            "Final step: mean delta {} {:+.4} (p={:.2e}), {} {:+.4} (p={:.2e})",
            self.config.word_a,
            summary.delta_a.mean,
            summary.t_test_a.p_value,
            self.config.word_b,
            summary.delta_b.mean,
            summary.t_test_b.p_value
        );

        Ok(SteeringReport {
            model_id: self.model.model_id().to_string(),
            timestamp: timestamp(),
            word_a: self.config.word_a.clone(),
            word_b: self.config.word_b.clone(),
            prompts: texts,
            summary,
            result,
        })
    }

    /// Run the sweep and write the JSON report and the plot
    pub fn run(&self) -> Result<ExperimentOutput> {
        let report = self.sweep()?;
        let dir = &self.config.output_dir;
        let json_path = report.save_json(dir)?;
        let plot_path = match report.save_plot(dir) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Could not draw sweep plot: {e}");
                None
            }
        };
        Ok(ExperimentOutput {
            report,
            json_path,
            plot_path,
        })
    }
}
