//! Multivariate-probit VAE with a label channel and a feature channel.
//!
//! The label encoder sees `[features, labels]`, the feature encoder sees the features
//! only, and a single decoder maps `[z, features]` to label logits for either channel.
use super::{glorot_factor, reparameterize, uniform, LatentModel, VaeOutput};
use crate::errors::FairVaeError;
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::path::Path;

/// Layer sizes of an `MpVae`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VaeDims {
    pub feature_dim: usize,
    pub label_dim: usize,
    pub latent_dim: usize,
    pub hidden_dim: usize,
    pub z_dim: usize,
}

struct Dense {
    weight: Var,
    bias: Var,
}

impl Dense {
    /// PyTorch style initialisation, uniform on `±1/sqrt(in_dim)`.
    fn new(in_dim: usize, out_dim: usize, rng: &mut StdRng, device: &Device) -> Result<Self, FairVaeError> {
        let bound = 1.0 / (in_dim as f64).sqrt();
        let weight = Var::from_tensor(&uniform(rng, (in_dim, out_dim), bound, device)?)?;
        let bias = Var::from_tensor(&uniform(rng, (1, out_dim), bound, device)?.squeeze(0)?)?;
        Ok(Dense { weight, bias })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor, FairVaeError> {
        Ok(x.matmul(self.weight.as_tensor())?.broadcast_add(self.bias.as_tensor())?)
    }

    fn named_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((format!("{}.weight", prefix), self.weight.clone()));
        out.push((format!("{}.bias", prefix), self.bias.clone()));
    }
}

/// Two relu layers followed by a linear head.
struct Mlp {
    hidden: [Dense; 2],
    head: Dense,
}

impl Mlp {
    fn new(
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self, FairVaeError> {
        Ok(Mlp {
            hidden: [
                Dense::new(in_dim, hidden_dim, rng, device)?,
                Dense::new(hidden_dim, hidden_dim, rng, device)?,
            ],
            head: Dense::new(hidden_dim, out_dim, rng, device)?,
        })
    }

    fn trunk(&self, x: &Tensor) -> Result<Tensor, FairVaeError> {
        let mut h = x.clone();
        for layer in &self.hidden {
            h = layer.forward(&h)?.relu()?;
        }
        Ok(h)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor, FairVaeError> {
        self.head.forward(&self.trunk(x)?)
    }

    fn named_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        for (i, layer) in self.hidden.iter().enumerate() {
            layer.named_vars(&format!("{}.hidden{}", prefix, i), out);
        }
        self.head.named_vars(&format!("{}.head", prefix), out);
    }
}

/// Gaussian encoder, an `Mlp` trunk with separate mean and log-variance heads.
struct Encoder {
    body: Mlp,
    logvar_head: Dense,
}

impl Encoder {
    fn new(in_dim: usize, dims: &VaeDims, rng: &mut StdRng, device: &Device) -> Result<Self, FairVaeError> {
        Ok(Encoder {
            body: Mlp::new(in_dim, dims.hidden_dim, dims.latent_dim, rng, device)?,
            logvar_head: Dense::new(dims.hidden_dim, dims.latent_dim, rng, device)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor), FairVaeError> {
        let h = self.body.trunk(x)?;
        let mu = self.body.head.forward(&h)?;
        let logvar = self.logvar_head.forward(&h)?;
        Ok((mu, logvar))
    }

    fn named_vars(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.body.named_vars(prefix, out);
        self.logvar_head.named_vars(&format!("{}.logvar", prefix), out);
    }
}

pub struct MpVae {
    label_encoder: Encoder,
    feat_encoder: Encoder,
    decoder: Mlp,
    r_sqrt_sigma: Var,
    training: bool,
    device: Device,
}

impl MpVae {
    /// Build a freshly initialised model. All initial values are drawn from `rng`.
    pub fn new(dims: VaeDims, rng: &mut StdRng, device: &Device) -> Result<Self, FairVaeError> {
        let label_encoder = Encoder::new(dims.feature_dim + dims.label_dim, &dims, rng, device)?;
        let feat_encoder = Encoder::new(dims.feature_dim, &dims, rng, device)?;
        let decoder = Mlp::new(dims.latent_dim + dims.feature_dim, dims.hidden_dim, dims.label_dim, rng, device)?;
        let r_sqrt_sigma = Var::from_tensor(&glorot_factor(rng, dims.label_dim, dims.z_dim, device)?)?;
        Ok(MpVae {
            label_encoder,
            feat_encoder,
            decoder,
            r_sqrt_sigma,
            training: true,
            device: device.clone(),
        })
    }

    fn decode(&self, z: &Tensor, feats: &Tensor) -> Result<Tensor, FairVaeError> {
        self.decoder.forward(&Tensor::cat(&[z, feats], 1)?)
    }

    /// Parameters keyed by a stable name, the keys of a saved snapshot.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut out = Vec::new();
        self.label_encoder.named_vars("label_encoder", &mut out);
        self.feat_encoder.named_vars("feat_encoder", &mut out);
        self.decoder.named_vars("decoder", &mut out);
        out.push(("r_sqrt_sigma".to_string(), self.r_sqrt_sigma.clone()));
        out
    }

    /// Write every parameter to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FairVaeError> {
        let tensors: HashMap<String, Tensor> = self
            .named_vars()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path.as_ref())
            .map_err(|e| FairVaeError::UnableToWrite(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Overwrite every parameter with the values stored at `path`.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<(), FairVaeError> {
        let tensors = candle_core::safetensors::load(path.as_ref(), &self.device)
            .map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", path.as_ref().display(), e)))?;
        for (name, var) in self.named_vars() {
            let value = tensors
                .get(&name)
                .ok_or_else(|| FairVaeError::UnableToRead(format!("{}: missing tensor {}", path.as_ref().display(), name)))?;
            var.set(value)?;
        }
        Ok(())
    }
}

impl LatentModel for MpVae {
    fn forward(&self, labels: &Tensor, feats: &Tensor, rng: &mut StdRng) -> Result<VaeOutput, FairVaeError> {
        let (label_mu, label_logvar) = self.label_encoder.forward(&Tensor::cat(&[feats, labels], 1)?)?;
        let label_z = self.label_reparameterize(&label_mu, &label_logvar, rng)?;
        let label_out = self.decode(&label_z, feats)?;

        let (feat_mu, feat_logvar) = self.feat_encoder.forward(feats)?;
        let feat_z = self.feat_reparameterize(&feat_mu, &feat_logvar, rng)?;
        let feat_out = self.decode(&feat_z, feats)?;

        Ok(VaeOutput {
            label_out,
            label_mu,
            label_logvar,
            feat_out,
            feat_mu,
            feat_logvar,
        })
    }

    fn label_reparameterize(&self, mu: &Tensor, logvar: &Tensor, rng: &mut StdRng) -> Result<Tensor, FairVaeError> {
        if self.training {
            reparameterize(mu, logvar, rng)
        } else {
            Ok(mu.clone())
        }
    }

    fn feat_reparameterize(&self, mu: &Tensor, logvar: &Tensor, rng: &mut StdRng) -> Result<Tensor, FairVaeError> {
        if self.training {
            reparameterize(mu, logvar, rng)
        } else {
            Ok(mu.clone())
        }
    }

    fn r_sqrt_sigma(&self) -> &Tensor {
        self.r_sqrt_sigma.as_tensor()
    }

    fn vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, v)| v).collect()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tiny_dims() -> VaeDims {
        VaeDims {
            feature_dim: 3,
            label_dim: 4,
            latent_dim: 2,
            hidden_dim: 5,
            z_dim: 3,
        }
    }

    #[test]
    fn test_forward_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let model = MpVae::new(tiny_dims(), &mut rng, &Device::Cpu).unwrap();
        let feats = Tensor::zeros((6, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::ones((6, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let out = model.forward(&labels, &feats, &mut rng).unwrap();
        assert_eq!(out.label_out.dims2().unwrap(), (6, 4));
        assert_eq!(out.feat_out.dims2().unwrap(), (6, 4));
        assert_eq!(out.label_mu.dims2().unwrap(), (6, 2));
        assert_eq!(out.feat_logvar.dims2().unwrap(), (6, 2));
        assert_eq!(model.r_sqrt_sigma().dims2().unwrap(), (4, 3));
    }

    #[test]
    fn test_initialisation_is_seeded() {
        let a = MpVae::new(tiny_dims(), &mut StdRng::seed_from_u64(4), &Device::Cpu).unwrap();
        let b = MpVae::new(tiny_dims(), &mut StdRng::seed_from_u64(4), &Device::Cpu).unwrap();
        for ((na, va), (nb, vb)) in a.named_vars().iter().zip(b.named_vars().iter()) {
            assert_eq!(na, nb);
            let va = va.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let vb = vb.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(va, vb);
        }
    }

    #[test]
    fn test_inference_mode_is_deterministic() {
        let mut model = MpVae::new(tiny_dims(), &mut StdRng::seed_from_u64(1), &Device::Cpu).unwrap();
        model.set_training(false);
        let feats = Tensor::new(&[[0.1f32, 0.2, 0.3]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1f32, 0., 1., 0.]], &Device::Cpu).unwrap();
        let a = model.forward(&labels, &feats, &mut StdRng::seed_from_u64(2)).unwrap();
        let b = model.forward(&labels, &feats, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(
            a.feat_out.to_vec2::<f32>().unwrap(),
            b.feat_out.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_save_and_load_snapshot() {
        let path = std::env::temp_dir().join(format!("fairvae-vae-{}.safetensors", std::process::id()));
        let a = MpVae::new(tiny_dims(), &mut StdRng::seed_from_u64(10), &Device::Cpu).unwrap();
        let b = MpVae::new(tiny_dims(), &mut StdRng::seed_from_u64(11), &Device::Cpu).unwrap();
        a.save(&path).unwrap();
        b.load(&path).unwrap();
        let ra = a.r_sqrt_sigma().to_vec2::<f32>().unwrap();
        let rb = b.r_sqrt_sigma().to_vec2::<f32>().unwrap();
        assert_eq!(ra, rb);
        std::fs::remove_file(&path).unwrap();
    }
}
