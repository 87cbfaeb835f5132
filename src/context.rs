//! Execution Context
//!
//! Device handle, random generator and hyperparameters threaded through every stage,
//! in place of process-wide device selection and scattered reseeding.
use crate::config::TrainConfig;
use crate::errors::FairVaeError;
use candle_core::Device;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub struct ExecutionContext {
    pub device: Device,
    pub rng: StdRng,
    pub config: TrainConfig,
}

impl ExecutionContext {
    /// Build a context for `config`, selecting the configured CUDA device when one
    /// is available and the CPU otherwise.
    pub fn new(config: TrainConfig) -> Result<Self, FairVaeError> {
        config.validate()?;
        let device = match config.cuda {
            Some(ordinal) => Device::cuda_if_available(ordinal)?,
            None => Device::Cpu,
        };
        Ok(Self::with_device(config, device))
    }

    pub fn with_device(config: TrainConfig, device: Device) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        ExecutionContext { device, rng, config }
    }

    /// Restart the generator from the configured seed. Called before every phase.
    pub fn reseed(&mut self) {
        info!("reseeding with {}", self.config.seed);
        self.rng = StdRng::seed_from_u64(self.config.seed);
    }

    /// A generator seeded like the context but independent of its state, so that
    /// inference passes are repeatable.
    pub fn inference_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.config.seed)
    }
}
