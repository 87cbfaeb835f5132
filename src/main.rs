use clap::{Args, Parser, Subcommand};
use fairvae::config::{FairnessMode, LabelDistanceMetric, TrainConfig};
use fairvae::context::ExecutionContext;
use fairvae::data::{load_data, DataView};
use fairvae::errors::FairVaeError;
use fairvae::evaluate::{evaluate_model, EvalOptions};
use fairvae::label_distance::{label_distance_file, target_labels, LabelDistances};
use fairvae::model::{MpVae, VaeDims};
use fairvae::pipeline::{run, RunPaths};
use fairvae::utils::build_path;
use log::info;
use std::path::PathBuf;

/// Fairness-regularized training of a dual-channel multi-label VAE.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the prior model, cluster its label latents and train the fair model.
    Train(RunArgs),
    /// Evaluate a stored fair model on the training and validation sets.
    Evaluate {
        #[command(flatten)]
        run: RunArgs,
        /// Use the last epoch's checkpoint instead of the best validation one.
        #[arg(long)]
        last: bool,
        /// Label distance used for the weighted disparity.
        #[arg(long, default_value = "jaccard")]
        metric: LabelDistanceMetric,
    },
    /// Compute and store the label distance map of a dataset.
    LabelDistances {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long, default_value = "jaccard")]
        metric: LabelDistanceMetric,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON configuration file. Missing fields take their defaults.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    max_epoch: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    cuda: Option<usize>,
    /// Restart at fair training from a stored cluster assignment.
    #[arg(long)]
    resume: bool,
    /// Recompute cached label distances.
    #[arg(long)]
    train_new: bool,
}

impl RunArgs {
    fn load(&self) -> Result<TrainConfig, FairVaeError> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };
        if let Some(v) = &self.dataset {
            config.dataset = v.clone();
        }
        if let Some(v) = &self.data_dir {
            config.data_dir = v.clone();
        }
        if let Some(v) = &self.output_dir {
            config.output_dir = v.clone();
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.max_epoch {
            config.max_epoch = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if self.cuda.is_some() {
            config.cuda = self.cuda;
        }
        config.resume |= self.resume;
        config.train_new |= self.train_new;
        Ok(config)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, FairVaeError> {
    serde_json::to_string_pretty(value).map_err(|e| FairVaeError::UnableToWrite(e.to_string()))
}

fn main() -> Result<(), FairVaeError> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Train(args) => {
            let outcome = run(args.load()?)?;
            println!("{}", to_json(&outcome)?);
        }
        Command::Evaluate { run, last, metric } => {
            let mut config = run.load()?;
            config.fairness = FairnessMode::Distance(metric);
            let mut ctx = ExecutionContext::new(config)?;
            let data = load_data(&ctx.config.data_dir, &ctx.config.dataset, DataView::Fair, ctx.config.batch_size)?;
            let paths = RunPaths::new(&ctx.config);
            let dims = VaeDims {
                feature_dim: data.feature_dim(),
                label_dim: data.label_dim(),
                latent_dim: ctx.config.latent_dim,
                hidden_dim: ctx.config.hidden_dim,
                z_dim: ctx.config.z_dim,
            };
            let mut model = MpVae::new(dims, &mut ctx.rng, &ctx.device)?;
            let checkpoint = if last { paths.fair_model_final() } else { paths.fair_model_best() };
            info!("loading {}", checkpoint.display());
            model.load(&checkpoint)?;

            build_path(&paths.model_dir)?;
            let distances = LabelDistances::load_or_compute(
                label_distance_file(&paths.model_dir, metric, ctx.config.dist_gamma),
                ctx.config.train_new,
                data.labels(),
                metric,
                ctx.config.dist_gamma,
            )?;
            let targets = target_labels(&ctx.config, data.labels())?;
            let eval = evaluate_model(&mut model, &data, &ctx, &targets, Some(&distances), EvalOptions::default())?;
            println!("{}", to_json(&eval)?);
        }
        Command::LabelDistances { run, metric } => {
            let config = run.load()?;
            let data = load_data(&config.data_dir, &config.dataset, DataView::Fair, config.batch_size)?;
            let paths = RunPaths::new(&config);
            build_path(&paths.model_dir)?;
            let path = label_distance_file(&paths.model_dir, metric, config.dist_gamma);
            let distances = LabelDistances::load_or_compute(&path, true, data.labels(), metric, config.dist_gamma)?;
            println!("{} targets written to {}", distances.0.len(), path.display());
        }
    }
    Ok(())
}
