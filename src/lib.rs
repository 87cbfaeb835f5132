// Modules
pub mod cluster;
pub mod config;
pub mod constants;
pub mod context;
pub mod data;
pub mod errors;
pub mod evaluate;
pub mod fairness;
pub mod label_distance;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod pipeline;
pub mod sampler;
pub mod train;
pub mod utils;

// Individual classes, and functions
pub use cluster::{ClusterAssignment, Dendrogram};
pub use config::TrainConfig;
pub use context::ExecutionContext;
pub use data::{DataSplit, Matrix};
pub use errors::FairVaeError;
pub use model::{LatentModel, MpVae};
pub use pipeline::{run, train_fair_through_regularize};
