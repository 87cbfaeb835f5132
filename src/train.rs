//! Train
//!
//! One pass of mini-batch training over the training index set.
use crate::config::{ResidueSigma, TrainConfig};
use crate::constants::{GRAD_CLIP_NORM, TRAIN_THRESHOLD};
use crate::context::ExecutionContext;
use crate::data::{DataSplit, Matrix};
use crate::errors::FairVaeError;
use crate::metrics::compute_metrics;
use crate::model::{compute_loss, glorot_factor, LatentModel, LossSettings};
use crate::optim::{clip_grad_norm, has_finite_grad, Adam, StepLr};
use crate::sampler::{batch_ranges, Sampler, ShuffleSampler};
use candle_core::Tensor;
use log::info;
use rand::rngs::StdRng;
use serde::Serialize;

/// Loss settings of a training or evaluation pass.
pub fn loss_settings(config: &TrainConfig, n_samples: usize) -> LossSettings {
    LossSettings {
        nll_coeff: config.nll_coeff,
        c_coeff: config.c_coeff,
        n_samples,
    }
}

/// Correlation factor for one training batch: the model's own, or a fresh random draw.
pub fn residue_factor<M: LatentModel>(
    model: &M,
    config: &TrainConfig,
    label_dim: usize,
    rng: &mut StdRng,
) -> Result<Tensor, FairVaeError> {
    match config.residue_sigma {
        ResidueSigma::Learned => Ok(model.r_sqrt_sigma().clone()),
        ResidueSigma::Random => glorot_factor(rng, label_dim, config.z_dim, model.device()),
    }
}

/// Averages over the processed batches of one epoch. Only filled when metrics are tracked.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EpochStats {
    pub n_batches: usize,
    pub nll: f64,
    pub nll_x: f64,
    pub c_loss: f64,
    pub c_loss_x: f64,
    pub kl: f64,
    pub total: f64,
    pub macro_f1: f64,
    pub micro_f1: f64,
    /// Feature channel probabilities of every trained sample, in visiting order.
    #[serde(skip)]
    pub probs: Option<Matrix>,
    #[serde(skip)]
    pub labels: Option<Matrix>,
}

#[derive(Default)]
struct Running {
    nll: f64,
    nll_x: f64,
    c_loss: f64,
    c_loss_x: f64,
    kl: f64,
    total: f64,
    macro_f1: f64,
    micro_f1: f64,
    probs: Vec<Matrix>,
    labels: Vec<Matrix>,
}

/// Train `model` for one epoch over `data`'s training set.
///
/// The training index set is visited in a fresh permutation drawn from `ctx.rng`. Each
/// batch runs forward, loss, backward, clips the global gradient norm, checks the
/// gradients are finite, and takes one `optimizer` step followed by one `scheduler` step.
pub fn run_epoch<M: LatentModel>(
    data: &DataSplit,
    model: &M,
    optimizer: &mut Adam,
    mut scheduler: Option<&mut StepLr>,
    ctx: &mut ExecutionContext,
    track_metrics: bool,
) -> Result<EpochStats, FairVaeError> {
    if data.train_idx().is_empty() {
        return Err(FairVaeError::EmptyIndexSet("train"));
    }
    let order = ShuffleSampler.order(&mut ctx.rng, data.train_idx());
    let settings = loss_settings(&ctx.config, ctx.config.n_train_sample);
    let mut running = Running::default();
    let mut n_batches = 0;

    for range in batch_ranges(order.len(), data.batch_size()) {
        let (feats, labels) = data.batch(&order[range], &ctx.device)?;
        let out = model.forward(&labels, &feats, &mut ctx.rng)?;
        let r_sqrt_sigma = residue_factor(model, &ctx.config, data.label_dim(), &mut ctx.rng)?;
        let loss = compute_loss(&labels, &out, &r_sqrt_sigma, &settings, &mut ctx.rng)?;

        let mut grads = loss.total.backward()?;
        clip_grad_norm(&mut grads, optimizer.vars(), GRAD_CLIP_NORM)?;
        has_finite_grad(&grads, optimizer.vars())?;
        optimizer.step(&grads)?;
        if let Some(s) = scheduler.as_deref_mut() {
            s.step(optimizer);
        }
        n_batches += 1;

        if track_metrics {
            let probs = Matrix::from_tensor(&loss.indiv_prob)?;
            let labels = Matrix::from_tensor(&labels)?;
            let metrics = compute_metrics(&probs, &labels, TRAIN_THRESHOLD, false)?;
            running.nll += loss.nll as f64;
            running.nll_x += loss.nll_x as f64;
            running.c_loss += loss.c_loss as f64;
            running.c_loss_x += loss.c_loss_x as f64;
            running.kl += loss.kl as f64;
            running.total += loss.total_value as f64;
            running.macro_f1 += metrics.get("maF1").copied().unwrap_or(f64::NAN);
            running.micro_f1 += metrics.get("miF1").copied().unwrap_or(f64::NAN);
            running.probs.push(probs);
            running.labels.push(labels);
        }
    }

    if !track_metrics {
        return Ok(EpochStats {
            n_batches,
            ..Default::default()
        });
    }

    let n = n_batches.max(1) as f64;
    let stats = EpochStats {
        n_batches,
        nll: running.nll / n,
        nll_x: running.nll_x / n,
        c_loss: running.c_loss / n,
        c_loss_x: running.c_loss_x / n,
        kl: running.kl / n,
        total: running.total / n,
        macro_f1: running.macro_f1 / n,
        micro_f1: running.micro_f1 / n,
        probs: Some(Matrix::vconcat(&running.probs)?),
        labels: Some(Matrix::vconcat(&running.labels)?),
    };
    info!(
        "macro_f1={:.6}, micro_f1={:.6}, nll_loss={:.6}, nll_loss_x={:.6}, c_loss={:.6}, c_loss_x={:.6}, kl_loss={:.6}, total_loss={:.6}",
        stats.macro_f1,
        stats.micro_f1,
        stats.nll * ctx.config.nll_coeff,
        stats.nll_x * ctx.config.nll_coeff,
        stats.c_loss * ctx.config.c_coeff,
        stats.c_loss_x * ctx.config.c_coeff,
        stats.kl,
        stats.total
    );
    Ok(stats)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::SplitIndices;
    use crate::model::{MpVae, VaeDims};
    use candle_core::Device;

    /// Small separable dataset: label 0 follows the sign of feature 0, label 1 of feature 1.
    pub(crate) fn synthetic_split(n: usize, batch_size: usize, with_sensitive: bool) -> DataSplit {
        let mut features = Vec::with_capacity(n * 3);
        let mut labels = Vec::with_capacity(n * 2);
        let mut sensitive = Vec::with_capacity(n);
        for i in 0..n {
            let a = ((i * 7) % 11) as f32 / 11.0 - 0.5;
            let b = ((i * 5) % 13) as f32 / 13.0 - 0.5;
            let s = (i % 2) as f32;
            features.extend_from_slice(&[a, b, s * 0.1]);
            labels.push(if a > 0.0 { 1.0 } else { 0.0 });
            labels.push(if b > 0.0 { 1.0 } else { 0.0 });
            sensitive.push(s);
        }
        let features = Matrix::new(features, n, 3).unwrap();
        let labels = Matrix::new(labels, n, 2).unwrap();
        let sensitive = with_sensitive.then(|| Matrix::new(sensitive, n, 1).unwrap());
        let splits = SplitIndices {
            train: (0..n * 6 / 10).collect(),
            valid: (n * 6 / 10..n * 8 / 10).collect(),
            test: (n * 8 / 10..n).collect(),
        };
        DataSplit::new(features, labels, sensitive, splits, batch_size).unwrap()
    }

    pub(crate) fn tiny_config() -> TrainConfig {
        TrainConfig {
            batch_size: 8,
            max_epoch: 5,
            latent_dim: 2,
            hidden_dim: 8,
            z_dim: 2,
            n_train_sample: 2,
            n_test_sample: 4,
            ..Default::default()
        }
    }

    pub(crate) fn tiny_model(data: &DataSplit, ctx: &mut ExecutionContext) -> MpVae {
        let dims = VaeDims {
            feature_dim: data.feature_dim(),
            label_dim: data.label_dim(),
            latent_dim: ctx.config.latent_dim,
            hidden_dim: ctx.config.hidden_dim,
            z_dim: ctx.config.z_dim,
        };
        MpVae::new(dims, &mut ctx.rng, &ctx.device).unwrap()
    }

    #[test]
    fn test_run_epoch_tracks_every_sample() {
        let data = synthetic_split(30, 8, false);
        let mut ctx = ExecutionContext::with_device(tiny_config(), Device::Cpu);
        let model = tiny_model(&data, &mut ctx);
        let mut opt = Adam::new("reconstruction", model.vars(), ctx.config.learning_rate).unwrap();
        let mut sched = StepLr::for_config(&ctx.config, data.train_idx().len());
        let stats = run_epoch(&data, &model, &mut opt, Some(&mut sched), &mut ctx, true).unwrap();
        // 18 training samples in batches of 8.
        assert_eq!(stats.n_batches, 3);
        assert_eq!(stats.probs.as_ref().unwrap().rows, 18);
        assert_eq!(stats.labels.as_ref().unwrap().cols, 2);
        assert!(stats.total.is_finite());
    }

    #[test]
    fn test_run_epoch_untracked_and_random_residue() {
        let data = synthetic_split(16, 8, false);
        let config = TrainConfig {
            residue_sigma: ResidueSigma::Random,
            ..tiny_config()
        };
        let mut ctx = ExecutionContext::with_device(config, Device::Cpu);
        let model = tiny_model(&data, &mut ctx);
        let before = model.r_sqrt_sigma().to_vec2::<f32>().unwrap();
        let mut opt = Adam::new("reconstruction", model.vars(), ctx.config.learning_rate).unwrap();
        let stats = run_epoch(&data, &model, &mut opt, None, &mut ctx, false).unwrap();
        assert_eq!(stats.n_batches, 2);
        assert!(stats.probs.is_none());
        // The learned factor takes no part in the loss, so it receives no update.
        let after = model.r_sqrt_sigma().to_vec2::<f32>().unwrap();
        assert_eq!(before, after);
    }
}
