//! Optim
//!
//! Adam bound to a model's parameters, the step learning rate schedule, and gradient
//! hygiene applied between the backward pass and the update.
use crate::config::TrainConfig;
use crate::constants::WEIGHT_DECAY;
use crate::errors::FairVaeError;
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{debug, warn};

/// Adam over a fixed set of parameters. Several optimizers may share the same
/// parameters; each keeps its own moment estimates.
pub struct Adam {
    name: &'static str,
    vars: Vec<Var>,
    inner: AdamW,
}

impl Adam {
    pub fn new(name: &'static str, vars: Vec<Var>, learning_rate: f64) -> Result<Self, FairVaeError> {
        let params = ParamsAdamW {
            lr: learning_rate,
            weight_decay: WEIGHT_DECAY,
            ..Default::default()
        };
        let inner = AdamW::new(vars.clone(), params)?;
        Ok(Adam { name, vars, inner })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr)
    }

    /// Apply one update from `grads`.
    pub fn step(&mut self, grads: &GradStore) -> Result<(), FairVaeError> {
        Ok(self.inner.step(grads)?)
    }
}

/// Multiply the learning rate by `gamma` every `step_size` scheduler steps.
///
/// `step_size` may be fractional. A decay happens on every step whose count is an exact
/// multiple of `step_size`, so a fractional size decays less often than its floor would.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    lr: f64,
    step_size: f64,
    gamma: f64,
    steps: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: f64, gamma: f64) -> Self {
        StepLr {
            lr: base_lr,
            step_size,
            gamma,
            steps: 0,
        }
    }

    /// Schedule stepped once per batch that decays `lr_decay_times` times over
    /// `max_epoch` epochs of `n_train` samples.
    pub fn for_config(config: &TrainConfig, n_train: usize) -> Self {
        let one_epoch_iter = (n_train as f64 / config.batch_size as f64).ceil();
        let step_size = one_epoch_iter * (config.max_epoch as f64 / config.lr_decay_times);
        StepLr::new(config.learning_rate, step_size, config.lr_decay_ratio)
    }

    pub fn current_lr(&self) -> f64 {
        self.lr
    }

    /// Advance one step and push the resulting rate into `optimizer`.
    pub fn step(&mut self, optimizer: &mut Adam) {
        self.steps += 1;
        if self.step_size > 0.0 && (self.steps as f64) % self.step_size == 0.0 {
            self.lr *= self.gamma;
            debug!("{}: learning rate {} after {} steps", optimizer.name(), self.lr, self.steps);
        }
        optimizer.set_learning_rate(self.lr);
    }
}

/// Rescale the gradients of `vars` so that their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64, FairVaeError> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let total_norm = total.sqrt();
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let scaled = g.affine(clip_coef, 0.0)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(total_norm)
}

/// Whether every gradient of `vars` is finite. A `warn!` is emitted otherwise;
/// the update still goes ahead.
pub fn has_finite_grad(grads: &GradStore, vars: &[Var]) -> Result<bool, FairVaeError> {
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            let values = g.flatten_all()?.to_vec1::<f32>()?;
            if values.iter().any(|v| !v.is_finite()) {
                warn!("non finite gradient found in parameter of shape {:?}", var.as_tensor().dims());
                return Ok(false);
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::precision_round;
    use candle_core::Device;

    #[test]
    fn test_step_lr_fractional_step_size() {
        let config = TrainConfig {
            batch_size: 4,
            max_epoch: 2,
            lr_decay_times: 4.0,
            learning_rate: 1.0,
            lr_decay_ratio: 0.5,
            ..Default::default()
        };
        // ceil(10 / 4) * (2 / 4) = 1.5
        let mut sched = StepLr::for_config(&config, 10);
        let var = Var::new(&[1f32], &Device::Cpu).unwrap();
        let mut opt = Adam::new("reconstruction", vec![var], 1.0).unwrap();
        let mut lrs = Vec::new();
        for _ in 0..4 {
            sched.step(&mut opt);
            lrs.push(opt.learning_rate());
        }
        // Only step 3 is a multiple of 1.5.
        assert_eq!(lrs, vec![1.0, 1.0, 0.5, 0.5]);
        assert_eq!(sched.current_lr(), 0.5);
    }

    #[test]
    fn test_step_lr_integer_step_size() {
        let var = Var::new(&[1f32], &Device::Cpu).unwrap();
        let mut opt = Adam::new("reconstruction", vec![var], 1.0).unwrap();
        let mut sched = StepLr::new(1.0, 2.0, 0.1);
        let mut lrs = Vec::new();
        for _ in 0..5 {
            sched.step(&mut opt);
            lrs.push(precision_round(opt.learning_rate(), 6));
        }
        assert_eq!(lrs, vec![1.0, 0.1, 0.1, 0.01, 0.01]);
    }

    #[test]
    fn test_clip_grad_norm() {
        let a = Var::new(&[3f32, 0.], &Device::Cpu).unwrap();
        let b = Var::new(&[0f32, 4.], &Device::Cpu).unwrap();
        let loss = a.as_tensor().sqr().unwrap().sum_all().unwrap()
            .add(&b.as_tensor().sqr().unwrap().sum_all().unwrap())
            .unwrap()
            .affine(0.5, 0.)
            .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert_eq!(precision_round(norm, 4), 5.0);
        let ga = grads.get(a.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(precision_round(ga[0] as f64, 4), 0.6);
        let norm_after = clip_grad_norm(&mut grads, &vars, 100.0).unwrap();
        assert_eq!(precision_round(norm_after, 4), 1.0);
    }

    #[test]
    fn test_has_finite_grad() {
        let a = Var::new(&[1f32, 2.], &Device::Cpu).unwrap();
        let loss = a.as_tensor().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(has_finite_grad(&grads, &[a.clone()]).unwrap());

        let zero = Var::new(&[0f32], &Device::Cpu).unwrap();
        let loss = zero.as_tensor().log().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(!has_finite_grad(&grads, &[zero]).unwrap());
    }

    #[test]
    fn test_adam_moves_parameters() {
        let a = Var::new(&[1f32], &Device::Cpu).unwrap();
        let mut opt = Adam::new("disparity", vec![a.clone()], 0.1).unwrap();
        let grads = a.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();
        let v = a.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!(v < 1.0);
    }
}
