//! Evaluate
//!
//! Inference passes over an index set: the validation threshold sweep used during
//! training, and the fuller train/valid report with distance-weighted disparity.
use crate::context::ExecutionContext;
use crate::data::{DataSplit, GroupIndex, Matrix, SplitKind};
use crate::errors::FairVaeError;
use crate::fairness::weighted_group_disparities;
use crate::label_distance::LabelDistances;
use crate::metrics::{select_best_metrics, sweep_thresholds, BestMetrics};
use crate::model::{compute_loss, with_inference, LatentModel};
use crate::sampler::batch_ranges;
use crate::train::loss_settings;
use crate::utils::{label_key, mean};
use log::info;
use rand::rngs::StdRng;
use serde::Serialize;

/// Losses and best metrics of one inference pass.
#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub split: &'static str,
    pub nll: f64,
    pub c_loss: f64,
    pub total: f64,
    pub metrics: BestMetrics,
    /// Mean distance-weighted disparity, when fairness was evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disparity: Option<f64>,
}

struct Pass {
    nll: f64,
    c_loss: f64,
    total: f64,
    feat_z: Matrix,
    metrics: BestMetrics,
}

/// Run `model`, already in inference mode, over `index` in the given order.
fn inference_pass<M: LatentModel>(
    model: &M,
    data: &DataSplit,
    index: &[usize],
    ctx: &ExecutionContext,
    rng: &mut StdRng,
) -> Result<Pass, FairVaeError> {
    let n = index.len();
    let batch_size = data.batch_size().min(n);
    let settings = loss_settings(&ctx.config, ctx.config.n_test_sample);
    let (mut nll, mut c_loss, mut total) = (0.0, 0.0, 0.0);
    let mut probs = Vec::new();
    let mut feat_z = Vec::new();

    for range in batch_ranges(n, batch_size) {
        let weight = range.len() as f64;
        let (feats, labels) = data.batch(&index[range], &ctx.device)?;
        let out = model.forward(&labels, &feats, rng)?;
        let loss = compute_loss(&labels, &out, model.r_sqrt_sigma(), &settings, rng)?;
        nll += loss.nll as f64 * weight;
        c_loss += loss.c_loss as f64 * weight;
        total += loss.total_value as f64 * weight;
        probs.push(Matrix::from_tensor(&loss.indiv_prob)?);
        let z = model.feat_reparameterize(&out.feat_mu, &out.feat_logvar, rng)?;
        feat_z.push(Matrix::from_tensor(&z)?);
    }

    let probs = Matrix::vconcat(&probs)?;
    let labels = Matrix::new(data.labels().gather(index), n, data.label_dim())?;
    let metrics = select_best_metrics(&sweep_thresholds(&probs, &labels)?)?;
    Ok(Pass {
        nll: nll / n as f64,
        c_loss: c_loss / n as f64,
        total: total / n as f64,
        feat_z: Matrix::vconcat(&feat_z)?,
        metrics,
    })
}

fn log_pass(split: &str, pass: &Pass, ctx: &ExecutionContext) {
    let m = |name: &str| pass.metrics.get(name).unwrap_or(f64::NAN);
    info!(
        "{} results: acc={:.6}, ha={:.6}, exam_f1={:.6}, macro_f1={:.6}, micro_f1={:.6}, nll_loss={:.6}, c_loss={:.6}, total_loss={:.6}",
        split,
        m("ACC"),
        m("HA"),
        m("ebF1"),
        m("maF1"),
        m("miF1"),
        pass.nll * ctx.config.nll_coeff,
        pass.c_loss * ctx.config.c_coeff,
        pass.total
    );
}

/// Inference pass over `index` with a 27-threshold sweep.
///
/// Returns the sample-weighted average NLL and the best value of every tracked
/// metric. The model is in inference mode for the duration of the call and every
/// stochastic draw comes from a generator seeded from the run seed, so repeated
/// calls give identical results.
pub fn validate<M: LatentModel>(
    model: &mut M,
    data: &DataSplit,
    index: &[usize],
    ctx: &ExecutionContext,
) -> Result<(f64, BestMetrics), FairVaeError> {
    if index.is_empty() {
        return Err(FairVaeError::EmptyIndexSet("validation"));
    }
    let mut rng = ctx.inference_rng();
    let pass = with_inference(model, |m| inference_pass(m, data, index, ctx, &mut rng))?;
    log_pass("valid", &pass, ctx);
    Ok((pass.nll, pass.metrics))
}

/// Which parts of `evaluate_model` to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOptions {
    pub train: bool,
    pub valid: bool,
    pub fairness: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            train: true,
            valid: true,
            fairness: true,
        }
    }
}

/// Reports of the requested splits.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEvaluation {
    pub train: Option<SplitReport>,
    pub valid: Option<SplitReport>,
}

/// Mean over targets and sensitive groups of the distance-weighted disparity of the
/// feature-channel latents. Labels missing from a target's distance map weigh 0.
pub fn weighted_mean_disparity(
    feat_z: &Matrix,
    labels: &Matrix,
    groups: &[usize],
    targets: &[String],
    distances: &LabelDistances,
) -> f64 {
    let keys: Vec<String> = (0..labels.rows).map(|i| label_key(labels.row(i))).collect();
    let mut diffs = Vec::new();
    for target in targets {
        let weights: Vec<f64> = keys.iter().map(|k| distances.weight(target, k)).collect();
        diffs.extend(weighted_group_disparities(feat_z, &weights, groups));
    }
    mean(&diffs)
}

/// Evaluate `model` on the training and/or validation sets, and the distance-weighted
/// disparity around `targets` when `options.fairness` is set.
pub fn evaluate_model<M: LatentModel>(
    model: &mut M,
    data: &DataSplit,
    ctx: &ExecutionContext,
    targets: &[String],
    distances: Option<&LabelDistances>,
    options: EvalOptions,
) -> Result<ModelEvaluation, FairVaeError> {
    let fairness = match (options.fairness, distances) {
        (false, _) => None,
        (true, None) => None,
        (true, Some(d)) => {
            if targets.is_empty() {
                return Err(FairVaeError::Unimplemented(
                    "distance fairness evaluation needs a target label".to_string(),
                ));
            }
            let sensitive = data.sensitive().ok_or(FairVaeError::MissingSensitive)?;
            Some((d, GroupIndex::from_matrix(sensitive)))
        }
    };

    let mut report = |kind: SplitKind| -> Result<SplitReport, FairVaeError> {
        let index = data.indices(kind);
        if index.is_empty() {
            return Err(FairVaeError::EmptyIndexSet(kind.name()));
        }
        let mut rng = ctx.inference_rng();
        let pass = with_inference(&mut *model, |m| inference_pass(m, data, index, ctx, &mut rng))?;
        log_pass(kind.name(), &pass, ctx);
        let disparity = fairness.as_ref().map(|(d, group_index)| {
            let labels = Matrix {
                data: data.labels().gather(index),
                rows: index.len(),
                cols: data.label_dim(),
            };
            let groups: Vec<usize> = index.iter().map(|i| group_index.group_of(*i)).collect();
            weighted_mean_disparity(&pass.feat_z, &labels, &groups, targets, d)
        });
        if let Some(d) = disparity {
            info!("{} weighted disparity={:.6}", kind.name(), d);
        }
        Ok(SplitReport {
            split: kind.name(),
            nll: pass.nll,
            c_loss: pass.c_loss,
            total: pass.total,
            metrics: pass.metrics,
            disparity,
        })
    };

    let train = if options.train { Some(report(SplitKind::Train)?) } else { None };
    let valid = if options.valid { Some(report(SplitKind::Valid)?) } else { None };
    Ok(ModelEvaluation { train, valid })
}
