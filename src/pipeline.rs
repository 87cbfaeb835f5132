//! Pipeline
//!
//! The two-phase run: an unconstrained prior model, hard clustering of its label
//! latents, and a fresh model trained with the cluster disparity penalty.
use crate::cluster::{cluster_latents, ClusterAssignment};
use crate::config::{FairnessMode, TrainConfig};
use crate::context::ExecutionContext;
use crate::data::{load_data, DataSplit, DataView};
use crate::errors::FairVaeError;
use crate::evaluate::validate;
use crate::fairness::fairness_penalty;
use crate::metrics::BestMetrics;
use crate::model::{LatentModel, MpVae, VaeDims};
use crate::optim::{Adam, StepLr};
use crate::train::{run_epoch, EpochStats};
use crate::utils::build_path;
use log::info;
use serde::Serialize;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Stages of a run, always visited in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    PriorTraining,
    Clustering,
    FairTraining,
    Done,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::PriorTraining => "prior_training",
            Phase::Clustering => "clustering",
            Phase::FairTraining => "fair_training",
            Phase::Done => "done",
        }
    }

    pub fn next(&self) -> Phase {
        match self {
            Phase::PriorTraining => Phase::Clustering,
            Phase::Clustering => Phase::FairTraining,
            Phase::FairTraining | Phase::Done => Phase::Done,
        }
    }
}

/// Where a run keeps its artefacts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPaths {
    pub model_dir: PathBuf,
    pub summary_dir: PathBuf,
}

impl RunPaths {
    pub fn new(config: &TrainConfig) -> Self {
        let setting = config.param_setting();
        RunPaths {
            model_dir: config
                .output_dir
                .join("model")
                .join(format!("model_{}", config.dataset))
                .join(&setting),
            summary_dir: config.output_dir.join("summary").join(&config.dataset).join(&setting),
        }
    }

    pub fn create(&self) -> Result<(), FairVaeError> {
        build_path(&self.model_dir)?;
        build_path(&self.summary_dir)
    }

    pub fn prior_model(&self) -> PathBuf {
        self.model_dir.join("prior_vae.safetensors")
    }

    pub fn fair_model_best(&self) -> PathBuf {
        self.model_dir.join("fair_vae_best.safetensors")
    }

    pub fn fair_model_final(&self) -> PathBuf {
        self.model_dir.join("fair_vae_final.safetensors")
    }

    pub fn clusters(&self) -> PathBuf {
        self.model_dir.join("clusters.json")
    }

    pub fn config(&self) -> PathBuf {
        self.model_dir.join("config.json")
    }

    pub fn summary(&self) -> PathBuf {
        self.summary_dir.join("summary.jsonl")
    }
}

/// Appends one timestamped JSON record per line.
pub struct SummaryWriter {
    path: PathBuf,
}

impl SummaryWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        SummaryWriter {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn write<T: Serialize>(&self, phase: Phase, event: &str, epoch: Option<usize>, payload: &T) -> Result<(), FairVaeError> {
        let record = json!({
            "timestamp": chrono::Local::now().to_rfc3339(),
            "phase": phase.name(),
            "event": event,
            "epoch": epoch,
            "payload": payload,
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FairVaeError::UnableToWrite(format!("{}: {}", self.path.display(), e)))?;
        writeln!(file, "{}", record).map_err(|e| FairVaeError::UnableToWrite(format!("{}: {}", self.path.display(), e)))
    }
}

/// What a completed run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub assignment: ClusterAssignment,
    pub fair_penalties: Vec<f32>,
    pub best_valid_nll: f64,
    pub final_valid_nll: f64,
    pub final_metrics: BestMetrics,
}

/// Only the cluster penalty can be trained. Distance-weighted fairness is reported by
/// `evaluate_model` on a stored model.
fn check_trainable(config: &TrainConfig) -> Result<(), FairVaeError> {
    match config.fairness {
        FairnessMode::Cluster => Ok(()),
        FairnessMode::Distance(metric) => Err(FairVaeError::Unimplemented(format!(
            "training with the {} distance-weighted penalty is not supported yet, distance fairness is evaluation only",
            metric.name()
        ))),
    }
}

fn model_dims(data: &DataSplit, config: &TrainConfig) -> VaeDims {
    VaeDims {
        feature_dim: data.feature_dim(),
        label_dim: data.label_dim(),
        latent_dim: config.latent_dim,
        hidden_dim: config.hidden_dim,
        z_dim: config.z_dim,
    }
}

fn epoch_record(stats: &EpochStats, lr: f64) -> serde_json::Value {
    json!({ "stats": stats, "learning_rate": lr })
}

fn train_prior(
    ctx: &mut ExecutionContext,
    data: &DataSplit,
    paths: &RunPaths,
    summary: &SummaryWriter,
) -> Result<MpVae, FairVaeError> {
    let start = Instant::now();
    let mut model = MpVae::new(model_dims(data, &ctx.config), &mut ctx.rng, &ctx.device)?;
    let mut optimizer = Adam::new("reconstruction", model.vars(), ctx.config.learning_rate)?;
    let mut scheduler = StepLr::for_config(&ctx.config, data.train_idx().len());
    let track = ctx.config.eval_after_epoch;

    for epoch in 0..ctx.config.prior_epochs() {
        let stats = run_epoch(data, &model, &mut optimizer, Some(&mut scheduler), ctx, track)?;
        summary.write(Phase::PriorTraining, "epoch", Some(epoch), &epoch_record(&stats, optimizer.learning_rate()))?;
        if track {
            let (nll, metrics) = validate(&mut model, data, data.valid_idx(), ctx)?;
            summary.write(Phase::PriorTraining, "validation", Some(epoch), &json!({ "nll": nll, "metrics": metrics }))?;
        }
    }
    model.save(paths.prior_model())?;
    info!(
        "Finished training the prior model for {} epochs in {} seconds.",
        ctx.config.prior_epochs(),
        start.elapsed().as_secs()
    );
    Ok(model)
}

fn train_fair(
    ctx: &mut ExecutionContext,
    data: &DataSplit,
    assignment: &ClusterAssignment,
    paths: &RunPaths,
    summary: &SummaryWriter,
) -> Result<(Vec<f32>, f64, f64, BestMetrics), FairVaeError> {
    let start = Instant::now();
    let mut model = MpVae::new(model_dims(data, &ctx.config), &mut ctx.rng, &ctx.device)?;
    let mut reconstruction = Adam::new("reconstruction", model.vars(), ctx.config.learning_rate)?;
    let mut disparity = Adam::new("disparity", model.vars(), ctx.config.learning_rate)?;
    let mut scheduler = StepLr::for_config(&ctx.config, data.train_idx().len());
    let track = ctx.config.eval_after_epoch;

    let mut penalties = Vec::with_capacity(ctx.config.max_epoch);
    let mut best_nll = f64::INFINITY;
    let mut last = None;
    for epoch in 0..ctx.config.max_epoch {
        let stats = run_epoch(data, &model, &mut reconstruction, Some(&mut scheduler), ctx, track)?;
        summary.write(Phase::FairTraining, "epoch", Some(epoch), &epoch_record(&stats, reconstruction.learning_rate()))?;

        let penalty = fairness_penalty(data, &model, &mut disparity, ctx, assignment, true)?;
        penalties.push(penalty);
        summary.write(Phase::FairTraining, "disparity", Some(epoch), &json!({ "penalty": penalty }))?;

        let (nll, metrics) = validate(&mut model, data, data.valid_idx(), ctx)?;
        summary.write(Phase::FairTraining, "validation", Some(epoch), &json!({ "nll": nll, "metrics": metrics }))?;
        if nll < best_nll {
            best_nll = nll;
            model.save(paths.fair_model_best())?;
        }
        last = Some((nll, metrics));
    }
    model.save(paths.fair_model_final())?;
    info!(
        "Finished training the fair model for {} epochs in {} seconds.",
        ctx.config.max_epoch,
        start.elapsed().as_secs()
    );

    let (final_nll, final_metrics) = match last {
        Some(v) => v,
        None => validate(&mut model, data, data.valid_idx(), ctx)?,
    };
    Ok((penalties, best_nll, final_nll, final_metrics))
}

/// Run every phase on the prior and fair views of one dataset.
///
/// The generator is reseeded before each phase. With `resume` set the run restarts at
/// fair training from a stored cluster assignment; any other resume point is rejected.
/// Distance fairness mode is rejected before any work starts.
pub fn train_fair_through_regularize(
    ctx: &mut ExecutionContext,
    prior_data: &DataSplit,
    fair_data: &DataSplit,
    paths: &RunPaths,
) -> Result<PipelineOutcome, FairVaeError> {
    check_trainable(&ctx.config)?;
    paths.create()?;
    ctx.config.save(paths.config())?;
    let summary = SummaryWriter::new(paths.summary());

    let mut phase = Phase::PriorTraining;
    let mut prior = None;
    let mut assignment = None;
    if ctx.config.resume {
        if !paths.clusters().exists() {
            return Err(FairVaeError::ResumeUnsupported(format!(
                "no cluster assignment at {}, runs can only resume at the start of fair training",
                paths.clusters().display()
            )));
        }
        assignment = Some(ClusterAssignment::load(paths.clusters())?);
        phase = Phase::FairTraining;
        info!("resuming from {}", paths.clusters().display());
    }

    let mut fair_result = None;
    while phase != Phase::Done {
        ctx.reseed();
        info!("entering phase {}", phase.name());
        summary.write(phase, "start", None, &json!({}))?;
        match phase {
            Phase::PriorTraining => {
                prior = Some(train_prior(ctx, prior_data, paths, &summary)?);
            }
            Phase::Clustering => {
                let model = prior
                    .as_mut()
                    .ok_or_else(|| FairVaeError::InvalidData("clustering needs a trained prior model".to_string()))?;
                let a = cluster_latents(model, prior_data, ctx, true)?;
                a.save(paths.clusters())?;
                summary.write(phase, "clusters", None, &json!({ "sizes": a.sizes(), "threshold": a.threshold }))?;
                assignment = Some(a);
            }
            Phase::FairTraining => {
                let a = assignment
                    .as_ref()
                    .ok_or_else(|| FairVaeError::InvalidData("fair training needs a cluster assignment".to_string()))?;
                fair_result = Some(train_fair(ctx, fair_data, a, paths, &summary)?);
            }
            Phase::Done => {}
        }
        phase = phase.next();
    }

    let (fair_penalties, best_valid_nll, final_valid_nll, final_metrics) =
        fair_result.ok_or_else(|| FairVaeError::InvalidData("fair training did not run".to_string()))?;
    let assignment =
        assignment.ok_or_else(|| FairVaeError::InvalidData("clustering did not run".to_string()))?;

    Ok(PipelineOutcome {
        assignment,
        fair_penalties,
        best_valid_nll,
        final_valid_nll,
        final_metrics,
    })
}

/// Load both views of the configured dataset and run the pipeline.
pub fn run(config: TrainConfig) -> Result<PipelineOutcome, FairVaeError> {
    check_trainable(&config)?;
    let mut ctx = ExecutionContext::new(config)?;
    let prior_data = load_data(&ctx.config.data_dir, &ctx.config.dataset, DataView::Prior, ctx.config.batch_size)?;
    let fair_data = load_data(&ctx.config.data_dir, &ctx.config.dataset, DataView::Fair, ctx.config.batch_size)?;
    let paths = RunPaths::new(&ctx.config);
    train_fair_through_regularize(&mut ctx, &prior_data, &fair_data, &paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabelDistanceMetric;
    use crate::data::{Matrix, SplitIndices};
    use crate::train::tests::{synthetic_split, tiny_config};
    use candle_core::Device;
    use std::fs;

    fn prior_view(fair: &DataSplit) -> DataSplit {
        let features: Matrix = fair.features().hconcat(fair.sensitive().unwrap()).unwrap();
        let splits = SplitIndices {
            train: fair.train_idx().to_vec(),
            valid: fair.valid_idx().to_vec(),
            test: fair.test_idx().to_vec(),
        };
        DataSplit::new(features, fair.labels().clone(), None, splits, fair.batch_size()).unwrap()
    }

    fn run_config(tag: &str) -> TrainConfig {
        TrainConfig {
            output_dir: std::env::temp_dir().join(format!("fairvae-pipeline-{}-{}", tag, std::process::id())),
            labels_cluster_min_size: 2,
            ..tiny_config()
        }
    }

    fn run_once(config: TrainConfig) -> Result<PipelineOutcome, FairVaeError> {
        let fair = synthetic_split(40, 8, true);
        let prior = prior_view(&fair);
        let paths = RunPaths::new(&config);
        let mut ctx = ExecutionContext::with_device(config, Device::Cpu);
        train_fair_through_regularize(&mut ctx, &prior, &fair, &paths)
    }

    fn metric_bits(m: &BestMetrics) -> Vec<u64> {
        m.iter().map(|(_, v)| v.to_bits()).collect()
    }

    #[test]
    fn test_phase_order() {
        let mut phase = Phase::PriorTraining;
        let mut seen = vec![phase];
        while phase != Phase::Done {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![Phase::PriorTraining, Phase::Clustering, Phase::FairTraining, Phase::Done]
        );
    }

    #[test]
    fn test_run_paths() {
        let config = TrainConfig::default();
        let paths = RunPaths::new(&config);
        assert_eq!(
            paths.model_dir,
            PathBuf::from("fairreg/model/model_adult/lr-0.001_lr-decay_0.50_lr-times_4.0_nll-0.10_l2-1.00_c-200.00")
        );
        assert!(paths.summary().ends_with("summary/adult/lr-0.001_lr-decay_0.50_lr-times_4.0_nll-0.10_l2-1.00_c-200.00/summary.jsonl"));
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let a_cfg = run_config("a");
        let b_cfg = run_config("b");
        let a = run_once(a_cfg.clone()).unwrap();
        let b = run_once(b_cfg.clone()).unwrap();
        assert_eq!(a.assignment, b.assignment);
        assert_eq!(a.final_valid_nll.to_bits(), b.final_valid_nll.to_bits());
        assert_eq!(metric_bits(&a.final_metrics), metric_bits(&b.final_metrics));
        assert_eq!(a.fair_penalties, b.fair_penalties);
        assert!(a.assignment.sizes().iter().all(|s| *s >= 2));

        let paths = RunPaths::new(&a_cfg);
        assert!(paths.prior_model().exists());
        assert!(paths.fair_model_final().exists());
        let lines = fs::read_to_string(paths.summary()).unwrap();
        assert!(lines.lines().count() > 3);

        // Resuming at the phase boundary repeats fair training exactly.
        let resumed = run_once(TrainConfig { resume: true, ..a_cfg.clone() }).unwrap();
        assert_eq!(resumed.assignment, a.assignment);
        assert_eq!(metric_bits(&resumed.final_metrics), metric_bits(&a.final_metrics));

        fs::remove_dir_all(&a_cfg.output_dir).unwrap();
        fs::remove_dir_all(&b_cfg.output_dir).unwrap();
    }

    #[test]
    fn test_resume_without_clusters_is_rejected() {
        let cfg = TrainConfig {
            resume: true,
            ..run_config("resume")
        };
        let dir = cfg.output_dir.clone();
        assert!(matches!(run_once(cfg), Err(FairVaeError::ResumeUnsupported(_))));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_distance_mode_training_is_rejected() {
        for metric in [LabelDistanceMetric::Jaccard, LabelDistanceMetric::IndicationFunction] {
            let cfg = TrainConfig {
                fairness: FairnessMode::Distance(metric),
                max_epoch: 1,
                ..run_config("distance")
            };
            let paths = RunPaths::new(&cfg);
            assert!(matches!(run_once(cfg.clone()), Err(FairVaeError::Unimplemented(_))));
            assert!(matches!(run(cfg), Err(FairVaeError::Unimplemented(_))));
            // Nothing was trained or written.
            assert!(!paths.model_dir.exists());
        }
    }
}
