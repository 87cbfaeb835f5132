//! Loss
//!
//! Multivariate probit likelihood, pairwise ranking loss and the KL term tying the
//! feature channel to the label channel.
use super::{randn, VaeOutput};
use crate::constants::{KL_EPS, PROBIT_EPS};
use crate::errors::FairVaeError;
use candle_core::{Tensor, D};
use rand::rngs::StdRng;

/// Coefficients and Monte Carlo sample count of one loss evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossSettings {
    pub nll_coeff: f64,
    pub c_coeff: f64,
    /// Probit noise samples per data point.
    pub n_samples: usize,
}

/// Result of `compute_loss`. `total` carries the graph, the rest are detached values.
pub struct LossOutput {
    pub total: Tensor,
    pub total_value: f32,
    pub nll: f32,
    pub nll_x: f32,
    pub c_loss: f32,
    pub c_loss_x: f32,
    pub kl: f32,
    /// Per-label probabilities of the feature channel, `(batch, label_dim)`.
    pub indiv_prob: Tensor,
}

/// Probit probabilities of every noise sample, `(n_samples, batch, label_dim)`.
fn probit_samples(
    logits: &Tensor,
    r_sqrt_sigma: &Tensor,
    n_samples: usize,
    rng: &mut StdRng,
) -> Result<Tensor, FairVaeError> {
    let (batch, label_dim) = logits.dims2()?;
    let (_, z_dim) = r_sqrt_sigma.dims2()?;
    let noise = randn(rng, (n_samples * batch, z_dim), logits.device())?;
    let correlated = noise
        .matmul(&r_sqrt_sigma.t()?)?
        .reshape((n_samples, batch, label_dim))?
        .broadcast_add(logits)?;
    let cdf = correlated
        .affine(std::f64::consts::FRAC_1_SQRT_2, 0.0)?
        .erf()?
        .affine(0.5, 0.5)?;
    Ok(cdf.affine(1.0 - 2.0 * PROBIT_EPS, PROBIT_EPS)?)
}

/// Negative log of the Monte Carlo estimate of `P(labels)`, averaged over the batch.
fn probit_nll(phi: &Tensor, labels: &Tensor) -> Result<Tensor, FairVaeError> {
    let n_samples = phi.dim(0)?;
    let pos = phi.log()?.broadcast_mul(labels)?;
    let neg = phi.affine(-1.0, 1.0)?.log()?.broadcast_mul(&labels.affine(-1.0, 1.0)?)?;
    let ll = pos.add(&neg)?.sum(D::Minus1)?;
    let max = ll.max(0)?;
    let lse = ll.broadcast_sub(&max)?.exp()?.sum(0)?.log()?.add(&max)?;
    Ok(lse.affine(-1.0, (n_samples as f64).ln())?.mean_all()?)
}

/// Every positive/negative label pair contributes `exp(s_neg - s_pos)`. The double sum
/// factorises into the product of two per-row sums, normalised by the pair count.
fn ranking_loss(logits: &Tensor, labels: &Tensor, pair_counts: &Tensor) -> Result<Tensor, FairVaeError> {
    let bounded = logits.affine(0.1, 0.0)?.tanh()?.affine(10.0, 0.0)?;
    let pos = bounded.neg()?.exp()?.mul(labels)?.sum(D::Minus1)?;
    let neg = bounded.exp()?.mul(&labels.affine(-1.0, 1.0)?)?.sum(D::Minus1)?;
    Ok(pos.mul(&neg)?.div(pair_counts)?.mean_all()?)
}

/// `KL(q(z | x, y) || q(z | x))`, summed over latent dims and averaged over the batch.
fn gaussian_kl(out: &VaeOutput) -> Result<Tensor, FairVaeError> {
    let lv_diff = out.feat_logvar.sub(&out.label_logvar)?;
    let var_ratio = lv_diff.neg()?.exp()?;
    let mu_term = out
        .feat_mu
        .sub(&out.label_mu)?
        .sqr()?
        .div(&out.feat_logvar.exp()?.affine(1.0, KL_EPS)?)?;
    let per_dim = lv_diff.add(&var_ratio)?.add(&mu_term)?.affine(0.5, -0.5)?;
    Ok(per_dim.sum(D::Minus1)?.mean_all()?)
}

/// `max(n_pos * n_neg, 1)` for every row of a binary label matrix.
fn pair_counts(labels: &Tensor) -> Result<Tensor, FairVaeError> {
    let rows = labels.to_vec2::<f32>()?;
    let counts: Vec<f32> = rows
        .iter()
        .map(|r| {
            let n_pos = r.iter().filter(|v| **v > 0.5).count();
            let n_neg = r.len() - n_pos;
            (n_pos * n_neg).max(1) as f32
        })
        .collect();
    Ok(Tensor::from_vec(counts, rows.len(), labels.device())?)
}

fn scalar(t: &Tensor) -> Result<f32, FairVaeError> {
    Ok(t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?)
}

/// Loss of one batch. `labels` is `(batch, label_dim)`; `r_sqrt_sigma` is the
/// residual correlation factor used for both channels.
pub fn compute_loss(
    labels: &Tensor,
    out: &VaeOutput,
    r_sqrt_sigma: &Tensor,
    settings: &LossSettings,
    rng: &mut StdRng,
) -> Result<LossOutput, FairVaeError> {
    let n_samples = settings.n_samples.max(1);

    let phi = probit_samples(&out.label_out, r_sqrt_sigma, n_samples, rng)?;
    let nll = probit_nll(&phi, labels)?;
    let phi_x = probit_samples(&out.feat_out, r_sqrt_sigma, n_samples, rng)?;
    let nll_x = probit_nll(&phi_x, labels)?;
    let indiv_prob = phi_x.mean(0)?;

    let counts = pair_counts(labels)?;
    let c_loss = ranking_loss(&out.label_out, labels, &counts)?;
    let c_loss_x = ranking_loss(&out.feat_out, labels, &counts)?;
    let kl = gaussian_kl(out)?;

    let total = nll
        .add(&nll_x)?
        .affine(settings.nll_coeff, 0.0)?
        .add(&c_loss.add(&c_loss_x)?.affine(settings.c_coeff, 0.0)?)?
        .add(&kl)?;

    Ok(LossOutput {
        total_value: scalar(&total)?,
        nll: scalar(&nll)?,
        nll_x: scalar(&nll_x)?,
        c_loss: scalar(&c_loss)?,
        c_loss_x: scalar(&c_loss_x)?,
        kl: scalar(&kl)?,
        total,
        indiv_prob,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::precision_round;
    use candle_core::Device;
    use rand::SeedableRng;

    fn output(label_out: Tensor, feat_out: Tensor, latent: usize) -> VaeOutput {
        let batch = label_out.dim(0).unwrap();
        let zeros = Tensor::zeros((batch, latent), candle_core::DType::F32, &Device::Cpu).unwrap();
        VaeOutput {
            label_out,
            label_mu: zeros.clone(),
            label_logvar: zeros.clone(),
            feat_out,
            feat_mu: zeros.clone(),
            feat_logvar: zeros,
        }
    }

    #[test]
    fn test_matching_channels_have_zero_kl() {
        let logits = Tensor::new(&[[0.3f32, -0.2]], &Device::Cpu).unwrap();
        let out = output(logits.clone(), logits, 3);
        let kl = gaussian_kl(&out).unwrap().to_scalar::<f32>().unwrap();
        assert!(kl.abs() < 1e-5);
    }

    #[test]
    fn test_ranking_loss_closed_form() {
        // One positive with logit 0 and one negative with logit 0: exp(0 - 0) / 1.
        let logits = Tensor::new(&[[0f32, 0.]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1f32, 0.]], &Device::Cpu).unwrap();
        let counts = pair_counts(&labels).unwrap();
        let c = ranking_loss(&logits, &labels, &counts).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(precision_round(c as f64, 5), 1.0);

        // All-positive rows have no pairs and contribute nothing.
        let labels = Tensor::new(&[[1f32, 1.]], &Device::Cpu).unwrap();
        let counts = pair_counts(&labels).unwrap();
        let c = ranking_loss(&logits, &labels, &counts).unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(c, 0.0);
    }

    #[test]
    fn test_confident_logits_give_small_nll() {
        let r = Tensor::zeros((2, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1f32, 0.]], &Device::Cpu).unwrap();
        let good = Tensor::new(&[[6f32, -6.]], &Device::Cpu).unwrap();
        let bad = Tensor::new(&[[-6f32, 6.]], &Device::Cpu).unwrap();
        let settings = LossSettings {
            nll_coeff: 0.1,
            c_coeff: 200.0,
            n_samples: 4,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let good = compute_loss(&labels, &output(good.clone(), good, 2), &r, &settings, &mut rng).unwrap();
        let bad = compute_loss(&labels, &output(bad.clone(), bad, 2), &r, &settings, &mut rng).unwrap();
        assert!(good.nll < 1e-3);
        assert!(bad.nll > good.nll);
        assert!(bad.total_value > good.total_value);
        let probs = good.indiv_prob.to_vec2::<f32>().unwrap();
        assert!(probs[0][0] > 0.99 && probs[0][1] < 0.01);
    }

    #[test]
    fn test_loss_is_seeded() {
        let r = Tensor::new(&[[0.5f32, -0.1], [0.2, 0.3]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1f32, 0.], [0., 1.]], &Device::Cpu).unwrap();
        let logits = Tensor::new(&[[0.1f32, -0.4], [0.7, 0.2]], &Device::Cpu).unwrap();
        let settings = LossSettings {
            nll_coeff: 1.0,
            c_coeff: 1.0,
            n_samples: 8,
        };
        let a = compute_loss(&labels, &output(logits.clone(), logits.clone(), 2), &r, &settings, &mut StdRng::seed_from_u64(5))
            .unwrap();
        let b = compute_loss(&labels, &output(logits.clone(), logits, 2), &r, &settings, &mut StdRng::seed_from_u64(5))
            .unwrap();
        assert_eq!(a.total_value, b.total_value);
        assert_eq!(a.nll_x, b.nll_x);
    }
}
