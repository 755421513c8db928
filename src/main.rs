//! carnival-rs CLI: interpretability carnival games

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use candle_core::Device;
use carnival_rs::api::{self, AppState, DEFAULT_PORT};
use carnival_rs::experiment::DEFAULT_STEERING_MODEL;
use carnival_rs::projection::DEFAULT_PROJECTION_LAYER;
use carnival_rs::{
    collect_activation_stats, fit_word_projection, CarnivalModel, DigitGame, EditKind, HookSite,
    KnobGame, LinearProjection, NeuronSteeringSpec, NeuronTarget, PromptSet, SparseAutoencoder,
    SteeringExperiment, SteeringExperimentConfig, WordProjector,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_PROJECTION_MODEL: &str = "google/gemma-2-2b";

#[derive(Parser)]
#[command(name = "carnival-rs")]
#[command(about = "Interpretability carnival: neuron surgery, feature hunt and adversarial MNIST")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Progressive neuron steering sweep with a JSON report and plot
    Steer(SteerArgs),
    /// Activation statistics of neurons over a prompt set
    Stats(StatsArgs),
    /// Generate text, optionally with steered neurons
    Generate(GenerateArgs),
    /// Classify the base digit with drawn strokes applied
    Digit(DigitArgs),
    /// Place words on the 2D activation map
    Project(ProjectArgs),
    /// Fit a PCA projection over a word list
    FitProjection(FitProjectionArgs),
    /// Serve the game routes over HTTP
    Serve(ServeArgs),
}

#[derive(Args)]
struct SteerArgs {
    /// Experiment config JSON (command-line flags override its fields)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model ID from `HuggingFace`
    #[arg(short, long)]
    model: Option<String>,

    /// Neuron paths, e.g. "2_10263_None" (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    neurons: Vec<NeuronTarget>,

    /// Prompt set JSON file
    #[arg(short, long)]
    prompts: Option<PathBuf>,

    #[arg(long)]
    word_a: Option<String>,

    #[arg(long)]
    word_b: Option<String>,

    /// Hook site: resid_pre, mlp_up, mlp_post, mlp_out, resid_post
    #[arg(long)]
    site: Option<HookSite>,

    /// Edit kind: zero, clamp:<value>, scale:<factor>
    #[arg(long)]
    kind: Option<EditKind>,

    /// Use prompts as-is instead of the question/answer chat framing
    #[arg(long)]
    no_chat: bool,

    /// Output directory for the report and plot
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct StatsArgs {
    #[arg(short, long, default_value = DEFAULT_STEERING_MODEL)]
    model: String,

    /// Neuron paths, e.g. "2_10263_None" (comma-separated)
    #[arg(short, long, value_delimiter = ',', required = true)]
    neurons: Vec<NeuronTarget>,

    /// Prompt set JSON file (default: built-in basketball prompts)
    #[arg(short, long)]
    prompts: Option<PathBuf>,

    #[arg(long, default_value = "mlp_up")]
    site: HookSite,

    /// Write the statistics as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(short, long, default_value = DEFAULT_STEERING_MODEL)]
    model: String,

    #[arg(short, long)]
    prompt: String,

    #[arg(long, default_value_t = 32)]
    max_tokens: usize,

    #[arg(short, long, default_value_t = 0.0)]
    temperature: f32,

    /// Neurons to edit while generating (comma-separated paths)
    #[arg(short, long, value_delimiter = ',')]
    neurons: Vec<NeuronTarget>,

    #[arg(long, default_value = "mlp_out")]
    site: HookSite,

    #[arg(long, default_value = "zero")]
    kind: EditKind,

    /// Wrap the prompt as a chat user message
    #[arg(long)]
    chat: bool,
}

#[derive(Args)]
struct DigitArgs {
    /// Base digit image (PNG)
    #[arg(long, default_value = "assets/three.png")]
    image: PathBuf,

    /// Classifier state dict (safetensors)
    #[arg(long, default_value = "assets/mnist_model.safetensors")]
    weights: PathBuf,

    /// Drawn points, e.g. "(1,2), (3,4)"
    #[arg(long, default_value = "")]
    points: String,
}

#[derive(Args, Clone)]
struct ProjectorArgs {
    #[arg(long, default_value = DEFAULT_PROJECTION_MODEL)]
    projection_model: String,

    #[arg(long, default_value_t = DEFAULT_PROJECTION_LAYER)]
    layer: usize,

    /// Projection JSON produced by `fit-projection`
    #[arg(long)]
    projection: Option<PathBuf>,

    /// SAE directory with sae_weights.safetensors and cfg.json
    #[arg(long)]
    sae_dir: Option<PathBuf>,

    /// SAE HuggingFace repository (with --sae-folder)
    #[arg(long)]
    sae_repo: Option<String>,

    #[arg(long, default_value = "blocks.6.hook_resid_post")]
    sae_folder: String,

    /// SAE feature reported as the scalar
    #[arg(long)]
    feature: Option<usize>,
}

#[derive(Args)]
struct ProjectArgs {
    #[command(flatten)]
    projector: ProjectorArgs,

    /// Words to place
    #[arg(required = true)]
    words: Vec<String>,
}

#[derive(Args)]
struct FitProjectionArgs {
    #[arg(short, long, default_value = DEFAULT_PROJECTION_MODEL)]
    model: String,

    #[arg(long, default_value_t = DEFAULT_PROJECTION_LAYER)]
    layer: usize,

    /// Words to fit on (comma-separated)
    #[arg(long, value_delimiter = ',')]
    words: Vec<String>,

    /// File with one word per line
    #[arg(long)]
    words_file: Option<PathBuf>,

    #[arg(short, long, default_value = "projection.json")]
    output: PathBuf,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Base digit image; enables /api/predict together with --digit-weights
    #[arg(long)]
    digit_image: Option<PathBuf>,

    #[arg(long)]
    digit_weights: Option<PathBuf>,

    /// Enables /coordinates when --projection is set
    #[command(flatten)]
    projector: ProjectorArgs,

    /// Neurons behind the knobs; enables /api/steer
    #[arg(long, value_delimiter = ',')]
    steer_neurons: Vec<NeuronTarget>,

    #[arg(long, default_value = DEFAULT_STEERING_MODEL)]
    steer_model: String,

    #[arg(long, default_value = "The ball was passed to ")]
    steer_prompt: String,

    #[arg(long, default_value = "mlp_out")]
    steer_site: HookSite,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Steer(args) => run_steer(args, cli.cpu),
        Command::Stats(args) => run_stats(args, cli.cpu),
        Command::Generate(args) => run_generate(args, cli.cpu),
        Command::Digit(args) => run_digit(args),
        Command::Project(args) => run_project(args, cli.cpu),
        Command::FitProjection(args) => run_fit_projection(args, cli.cpu),
        Command::Serve(args) => run_serve(args, cli.cpu),
    }
}

fn load_prompts(path: Option<&PathBuf>) -> Result<PromptSet> {
    match path {
        Some(path) => PromptSet::load(path),
        None => Ok(PromptSet::basketball()),
    }
}

fn run_steer(args: SteerArgs, force_cpu: bool) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SteeringExperimentConfig::load(path)?,
        None => SteeringExperimentConfig::default(),
    };
    if let Some(model) = args.model {
        config.model_id = model;
    }
    if !args.neurons.is_empty() {
        config.neurons = args.neurons;
    }
    if args.prompts.is_some() {
        config.prompt_file = args.prompts;
    }
    if let Some(word) = args.word_a {
        config.word_a = word;
    }
    if let Some(word) = args.word_b {
        config.word_b = word;
    }
    if let Some(site) = args.site {
        config.site = site;
    }
    if let Some(kind) = args.kind {
        config.kind = kind;
    }
    if args.no_chat {
        config.chat = false;
    }
    if let Some(output) = args.output {
        config.output_dir = output;
    }

    println!("=== carnival-rs: neuron surgery ===");
    println!("Model:  {}", config.model_id);
    println!("Tokens: {} vs {}", config.word_a, config.word_b);
    println!("Site:   {} ({})", config.site, config.kind);
    println!("Output: {}", config.output_dir.display());
    if force_cpu {
        println!("Mode:   CPU (forced)");
    }

    let experiment = SteeringExperiment::from_config(config, force_cpu)?;
    let output = experiment.run()?;
    let report = &output.report;

    println!("\n=== Results ===");
    for step in &report.result.steps {
        let added = step
            .added
            .map_or_else(|| "baseline".to_string(), |t| t.to_string());
        println!(
            "{:3} {:>18}  {}: {:+.4}  {}: {:+.4}",
            step.n_steered,
            added,
            report.word_a,
            step.mean_delta_a,
            report.word_b,
            step.mean_delta_b
        );
    }
    let summary = &report.summary;
    println!(
        "\nFinal: {} {:+.4} (p={:.2e}), {} {:+.4} (p={:.2e}), gap p={:.2e}",
        report.word_a,
        summary.delta_a.mean,
        summary.t_test_a.p_value,
        report.word_b,
        summary.delta_b.mean,
        summary.t_test_b.p_value,
        summary.paired_gap.p_value
    );
    println!("Report: {}", output.json_path.display());
    if let Some(plot) = &output.plot_path {
        println!("Plot:   {}", plot.display());
    }
    Ok(())
}

fn run_stats(args: StatsArgs, force_cpu: bool) -> Result<()> {
    let model = CarnivalModel::from_pretrained_with_device(&args.model, force_cpu)?;
    let prompts = load_prompts(args.prompts.as_ref())?;
    let ids = prompts
        .formatted(model.chat_format())
        .iter()
        .map(|p| model.encode_prompt(p))
        .collect::<Result<Vec<_>>>()?;

    let stats = collect_activation_stats(model.backend(), &ids, &args.neurons, args.site)?;

    println!("\n=== Activation statistics at {} ===", stats.site);
    for (key, neuron) in &stats.neurons {
        let s = &neuron.summary;
        println!(
            "{key:>12}: n={:3} mean={:+.4} std={:.4} min={:+.4} max={:+.4}",
            s.n, s.mean, s.std_dev, s.min, s.max
        );
    }

    if let Some(path) = args.output {
        std::fs::write(&path, serde_json::to_string_pretty(&stats)?)?;
        info!("Statistics saved to {}", path.display());
    }
    Ok(())
}

fn run_generate(args: GenerateArgs, force_cpu: bool) -> Result<()> {
    let model = CarnivalModel::from_pretrained_with_device(&args.model, force_cpu)?;
    let spec = (!args.neurons.is_empty())
        .then(|| NeuronSteeringSpec::new(args.kind).site(args.site).neurons(&args.neurons));

    if args.chat {
        let reply = model.generate_chat(&args.prompt, args.max_tokens, args.temperature, spec.as_ref())?;
        println!("{reply}");
    } else {
        let result = model.generate(&args.prompt, args.max_tokens, args.temperature, spec.as_ref())?;
        println!("{}", result.full_text);
        info!(
            "Generated {} tokens ({} total)",
            result.generated_tokens.len(),
            result.total_tokens
        );
    }
    Ok(())
}

fn run_digit(args: DigitArgs) -> Result<()> {
    let game = DigitGame::load(&args.image, &args.weights)?;
    let prediction = game.predict_drawing(&args.points)?;
    println!("Prediction: {}", prediction.prediction);
    for (digit, p) in prediction.probabilities.iter().enumerate() {
        println!("  {digit}: {p:.4}");
    }
    Ok(())
}

fn build_projector(args: &ProjectorArgs, force_cpu: bool) -> Result<WordProjector> {
    let projection_path = args
        .projection
        .as_ref()
        .context("--projection is required (see `carnival-rs fit-projection`)")?;
    let projection = LinearProjection::load(projection_path)?;
    let model = CarnivalModel::from_pretrained_with_device(&args.projection_model, force_cpu)?;
    let device = model.device().clone();
    let mut projector = WordProjector::new(model, projection)?.with_layer(args.layer);

    if let Some(feature) = args.feature {
        let sae = load_sae(args, &device)?;
        projector = projector.with_feature(sae, feature)?;
    }
    Ok(projector)
}

fn load_sae(args: &ProjectorArgs, device: &Device) -> Result<SparseAutoencoder> {
    match (&args.sae_dir, &args.sae_repo) {
        (Some(dir), _) => SparseAutoencoder::load_dir(dir, device),
        (None, Some(repo)) => SparseAutoencoder::from_pretrained(repo, &args.sae_folder, device),
        (None, None) => anyhow::bail!("--feature needs --sae-dir or --sae-repo"),
    }
}

fn run_project(args: ProjectArgs, force_cpu: bool) -> Result<()> {
    let projector = build_projector(&args.projector, force_cpu)?;
    for word in &args.words {
        let location = projector.locate(word)?;
        println!(
            "{word:>16}: ({:+.4}, {:+.4})  scalar {:.4}",
            location.coordinates[0], location.coordinates[1], location.scalar
        );
    }
    Ok(())
}

fn run_fit_projection(args: FitProjectionArgs, force_cpu: bool) -> Result<()> {
    let mut words = args.words;
    if let Some(path) = &args.words_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        words.extend(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
    }
    ensure!(words.len() >= 2, "Need at least two words to fit a projection");

    let model = CarnivalModel::from_pretrained_with_device(&args.model, force_cpu)?;
    let projection = fit_word_projection(&model, &words, args.layer, HookSite::ResidPost)?;
    projection.save(&args.output)?;
    println!(
        "Fitted projection over {} words at layer {} → {}",
        words.len(),
        args.layer,
        args.output.display()
    );
    Ok(())
}

fn run_serve(args: ServeArgs, force_cpu: bool) -> Result<()> {
    let mut state = AppState::new();

    match (&args.digit_image, &args.digit_weights) {
        (Some(image), Some(weights)) => {
            state = state.with_digit_game(DigitGame::load(image, weights)?);
        }
        (None, None) => info!("Digit game disabled"),
        _ => anyhow::bail!("--digit-image and --digit-weights must be given together"),
    }

    if args.projector.projection.is_some() {
        state = state.with_word_projector(build_projector(&args.projector, force_cpu)?);
    } else {
        info!("Coordinates game disabled (no --projection)");
    }

    if args.steer_neurons.is_empty() {
        info!("Steering game disabled (no --steer-neurons)");
    } else {
        let model = CarnivalModel::from_pretrained_with_device(&args.steer_model, force_cpu)?;
        let game = KnobGame::new(model, &args.steer_prompt, args.steer_neurons, args.steer_site)?;
        state = state.with_knob_game(game);
    }

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid address {}:{}", args.host, args.port))?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(api::serve(state, addr))
}
