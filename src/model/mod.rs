//! Model
//!
//! The interface the training stages need from a dual-channel VAE, and the
//! candle implementation used by the pipeline.
pub mod loss;
pub mod vae;

pub use loss::{compute_loss, LossOutput, LossSettings};
pub use vae::{MpVae, VaeDims};

use crate::errors::FairVaeError;
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// Outputs of one forward pass. `label_*` come from the label channel encoder,
/// `feat_*` from the feature channel encoder; both reconstructions are label logits.
pub struct VaeOutput {
    pub label_out: Tensor,
    pub label_mu: Tensor,
    pub label_logvar: Tensor,
    pub feat_out: Tensor,
    pub feat_mu: Tensor,
    pub feat_logvar: Tensor,
}

/// A dual-channel VAE as seen by the epoch driver, the evaluator and the fairness stages.
pub trait LatentModel {
    /// Encode `(labels, feats)` through both channels and decode both latent samples.
    fn forward(&self, labels: &Tensor, feats: &Tensor, rng: &mut StdRng) -> Result<VaeOutput, FairVaeError>;

    /// Latent sample of the label channel. The mean in inference mode.
    fn label_reparameterize(&self, mu: &Tensor, logvar: &Tensor, rng: &mut StdRng) -> Result<Tensor, FairVaeError>;

    /// Latent sample of the feature channel. The mean in inference mode.
    fn feat_reparameterize(&self, mu: &Tensor, logvar: &Tensor, rng: &mut StdRng) -> Result<Tensor, FairVaeError>;

    /// Learnable low-rank factor of the residual label correlation, `(label_dim, z_dim)`.
    fn r_sqrt_sigma(&self) -> &Tensor;

    /// Every trainable parameter, for optimizer binding.
    fn vars(&self) -> Vec<Var>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn device(&self) -> &Device;
}

/// Run `f` with the model in inference mode, restoring the previous mode on every exit path.
pub fn with_inference<M, T, F>(model: &mut M, f: F) -> Result<T, FairVaeError>
where
    M: LatentModel,
    F: FnOnce(&M) -> Result<T, FairVaeError>,
{
    let was_training = model.is_training();
    model.set_training(false);
    let result = f(model);
    model.set_training(was_training);
    result
}

/// Standard normal tensor drawn from `rng`, so that every random draw follows the run seed.
pub fn randn(rng: &mut StdRng, shape: (usize, usize), device: &Device) -> Result<Tensor, FairVaeError> {
    let values: Vec<f32> = (0..shape.0 * shape.1).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Uniform tensor on `[-bound, bound]` drawn from `rng`.
pub fn uniform(rng: &mut StdRng, shape: (usize, usize), bound: f64, device: &Device) -> Result<Tensor, FairVaeError> {
    let bound = bound as f32;
    let values: Vec<f32> = (0..shape.0 * shape.1).map(|_| rng.gen_range(-bound..=bound)).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Glorot-uniform correlation factor, used both to initialise the learnable factor and
/// as the per-batch random factor.
pub fn glorot_factor(rng: &mut StdRng, label_dim: usize, z_dim: usize, device: &Device) -> Result<Tensor, FairVaeError> {
    let bound = (6.0 / (label_dim + z_dim) as f64).sqrt();
    uniform(rng, (label_dim, z_dim), bound, device)
}

/// `mu + eps * exp(logvar / 2)` with `eps` drawn from `rng`.
pub fn reparameterize(mu: &Tensor, logvar: &Tensor, rng: &mut StdRng) -> Result<Tensor, FairVaeError> {
    let eps = randn(rng, mu.dims2()?, mu.device())?;
    let std = logvar.affine(0.5, 0.0)?.exp()?;
    Ok(mu.add(&eps.mul(&std)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny_vae() -> MpVae {
        let dims = VaeDims {
            feature_dim: 2,
            label_dim: 2,
            latent_dim: 2,
            hidden_dim: 3,
            z_dim: 2,
        };
        MpVae::new(dims, &mut StdRng::seed_from_u64(0), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_with_inference_restores_previous_mode() {
        let mut model = tiny_vae();
        let inner = with_inference(&mut model, |m| Ok(m.is_training())).unwrap();
        assert!(!inner);
        assert!(model.is_training());

        // A model already in inference mode stays there.
        model.set_training(false);
        let inner = with_inference(&mut model, |m| Ok(m.is_training())).unwrap();
        assert!(!inner);
        assert!(!model.is_training());

        // The mode is restored even when the closure fails.
        model.set_training(true);
        let err = with_inference(&mut model, |_| -> Result<(), FairVaeError> {
            Err(FairVaeError::EmptyIndexSet("valid"))
        });
        assert!(err.is_err());
        assert!(model.is_training());
    }

    #[test]
    fn test_randn_is_seeded() {
        let a = randn(&mut StdRng::seed_from_u64(7), (3, 2), &Device::Cpu).unwrap();
        let b = randn(&mut StdRng::seed_from_u64(7), (3, 2), &Device::Cpu).unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_glorot_bounds() {
        let f = glorot_factor(&mut StdRng::seed_from_u64(1), 4, 2, &Device::Cpu).unwrap();
        let bound = 1.0_f32;
        for row in f.to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|v| v.abs() <= bound));
        }
    }

    #[test]
    fn test_reparameterize_zero_variance_limit() {
        let mu = Tensor::new(&[[1f32, -2.], [0.5, 3.]], &Device::Cpu).unwrap();
        let logvar = Tensor::new(&[[-80f32, -80.], [-80., -80.]], &Device::Cpu).unwrap();
        let z = reparameterize(&mu, &logvar, &mut StdRng::seed_from_u64(0)).unwrap();
        let z = z.to_vec2::<f32>().unwrap();
        assert!((z[0][0] - 1.).abs() < 1e-6);
        assert!((z[1][1] - 3.).abs() < 1e-6);
    }
}
