//! Training Configuration
//!
//! Defines the hyperparameter bundle used by every stage of the fair VAE pipeline,
//! together with the enums selecting the residual correlation, clustering linkage and
//! fairness mode.
use crate::errors::FairVaeError;
use crate::utils::{
    items_to_strings, validate_float_parameter, validate_positive_float_parameter, validate_positive_usize_parameter,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Source of the low-rank correlation factor used by the probit likelihood.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug, Default)]
pub enum ResidueSigma {
    /// Use the model's learnable factor.
    #[default]
    Learned,
    /// Draw a fresh Glorot-uniform factor for every training batch.
    Random,
}

impl FromStr for ResidueSigma {
    type Err = FairVaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "learned" | "Learned" => Ok(ResidueSigma::Learned),
            "random" | "Random" => Ok(ResidueSigma::Random),
            _ => Err(FairVaeError::ParseString(
                s.to_string(),
                "ResidueSigma".to_string(),
                items_to_strings(vec!["learned", "random"]),
            )),
        }
    }
}

/// Linkage criterion of the agglomerative clustering.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug, Default)]
pub enum Linkage {
    /// Minimum variance merge, heights in euclidean units.
    #[default]
    Ward,
    Average,
    Complete,
    Single,
}

impl FromStr for Linkage {
    type Err = FairVaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ward" | "Ward" => Ok(Linkage::Ward),
            "average" | "Average" => Ok(Linkage::Average),
            "complete" | "Complete" => Ok(Linkage::Complete),
            "single" | "Single" => Ok(Linkage::Single),
            _ => Err(FairVaeError::ParseString(
                s.to_string(),
                "Linkage".to_string(),
                items_to_strings(vec!["ward", "average", "complete", "single"]),
            )),
        }
    }
}

/// Label distance used to weight samples around a target label.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug)]
pub enum LabelDistanceMetric {
    /// Weight 1 for the target label itself, 0 for everything else.
    IndicationFunction,
    /// Jaccard similarity between label sets, raised to `dist_gamma`.
    Jaccard,
    /// Association-rule confidence. Recognised but not implemented.
    Arule,
}

impl LabelDistanceMetric {
    pub fn name(&self) -> &'static str {
        match self {
            LabelDistanceMetric::IndicationFunction => "indication_function",
            LabelDistanceMetric::Jaccard => "jaccard",
            LabelDistanceMetric::Arule => "arule",
        }
    }
}

impl FromStr for LabelDistanceMetric {
    type Err = FairVaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indication_function" => Ok(LabelDistanceMetric::IndicationFunction),
            "jaccard" => Ok(LabelDistanceMetric::Jaccard),
            "arule" => Ok(LabelDistanceMetric::Arule),
            _ => Err(FairVaeError::ParseString(
                s.to_string(),
                "LabelDistanceMetric".to_string(),
                items_to_strings(vec!["indication_function", "jaccard", "arule"]),
            )),
        }
    }
}

/// Which fairness notion the run regularizes or evaluates.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug, Default)]
pub enum FairnessMode {
    /// Hard latent clusters of the prior model, penalised per sensitive group.
    #[default]
    Cluster,
    /// Soft neighbourhoods around a target label, weighted by a label distance.
    /// Evaluation only; training in this mode is rejected as unimplemented.
    Distance(LabelDistanceMetric),
}

fn default_dataset() -> String {
    String::from("adult")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("fairreg")
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_lr_decay_ratio() -> f64 {
    0.5
}
fn default_lr_decay_times() -> f64 {
    4.0
}
fn default_nll_coeff() -> f64 {
    0.1
}
fn default_l2_coeff() -> f64 {
    1.0
}
fn default_c_coeff() -> f64 {
    200.0
}
fn default_batch_size() -> usize {
    128
}
fn default_max_epoch() -> usize {
    20
}
fn default_latent_dim() -> usize {
    8
}
fn default_hidden_dim() -> usize {
    256
}
fn default_z_dim() -> usize {
    16
}
fn default_n_train_sample() -> usize {
    10
}
fn default_n_test_sample() -> usize {
    100
}
fn default_cluster_distance_threshold() -> f64 {
    0.1
}
fn default_cluster_min_size() -> usize {
    4
}
fn default_dist_gamma() -> f64 {
    1.0
}
fn default_seed() -> u64 {
    4
}
fn default_eval_after_epoch() -> bool {
    true
}

/// Hyperparameters of a fair VAE run.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TrainConfig {
    /// Dataset name, also a path segment of every artifact.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// Directory holding one sub-directory per dataset.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Root of the model and summary trees.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Multiplicative learning-rate decay applied at every scheduler boundary.
    #[serde(default = "default_lr_decay_ratio")]
    pub lr_decay_ratio: f64,
    /// Number of decays over the full run.
    #[serde(default = "default_lr_decay_times")]
    pub lr_decay_times: f64,
    /// Weight of the two probit negative log-likelihood terms.
    #[serde(default = "default_nll_coeff")]
    pub nll_coeff: f64,
    /// Only used to name the run.
    #[serde(default = "default_l2_coeff")]
    pub l2_coeff: f64,
    /// Weight of the two ranking terms.
    #[serde(default = "default_c_coeff")]
    pub c_coeff: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_epoch")]
    pub max_epoch: usize,
    /// Dimension of both latent channels.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    /// Rank of the residual label correlation factor.
    #[serde(default = "default_z_dim")]
    pub z_dim: usize,
    /// Probit samples drawn per example during training.
    #[serde(default = "default_n_train_sample")]
    pub n_train_sample: usize,
    /// Probit samples drawn per example during evaluation.
    #[serde(default = "default_n_test_sample")]
    pub n_test_sample: usize,
    #[serde(default)]
    pub residue_sigma: ResidueSigma,
    /// Initial agglomerative clustering cut, doubled on every failed attempt.
    #[serde(default = "default_cluster_distance_threshold")]
    pub labels_cluster_distance_threshold: f64,
    #[serde(default = "default_cluster_min_size")]
    pub labels_cluster_min_size: usize,
    #[serde(default)]
    pub linkage: Linkage,
    #[serde(default)]
    pub fairness: FairnessMode,
    /// Target label bit string for distance based fairness. Several comma separated
    /// labels are rejected.
    #[serde(default)]
    pub target_label: Option<String>,
    /// Rank of the target label among label combinations sorted by frequency.
    #[serde(default)]
    pub target_label_idx: usize,
    /// Exponent applied to Jaccard similarities.
    #[serde(default = "default_dist_gamma")]
    pub dist_gamma: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// CUDA ordinal, CPU when absent or unavailable.
    #[serde(default)]
    pub cuda: Option<usize>,
    /// Resume at the clustering phase boundary.
    #[serde(default)]
    pub resume: bool,
    #[serde(default = "default_eval_after_epoch")]
    pub eval_after_epoch: bool,
    /// Recompute cached artifacts such as label distances.
    #[serde(default)]
    pub train_new: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            dataset: default_dataset(),
            data_dir: default_data_dir(),
            output_dir: default_output_dir(),
            learning_rate: default_learning_rate(),
            lr_decay_ratio: default_lr_decay_ratio(),
            lr_decay_times: default_lr_decay_times(),
            nll_coeff: default_nll_coeff(),
            l2_coeff: default_l2_coeff(),
            c_coeff: default_c_coeff(),
            batch_size: default_batch_size(),
            max_epoch: default_max_epoch(),
            latent_dim: default_latent_dim(),
            hidden_dim: default_hidden_dim(),
            z_dim: default_z_dim(),
            n_train_sample: default_n_train_sample(),
            n_test_sample: default_n_test_sample(),
            residue_sigma: ResidueSigma::default(),
            labels_cluster_distance_threshold: default_cluster_distance_threshold(),
            labels_cluster_min_size: default_cluster_min_size(),
            linkage: Linkage::default(),
            fairness: FairnessMode::default(),
            target_label: None,
            target_label_idx: 0,
            dist_gamma: default_dist_gamma(),
            seed: default_seed(),
            cuda: None,
            resume: false,
            eval_after_epoch: default_eval_after_epoch(),
            train_new: false,
        }
    }
}

impl TrainConfig {
    /// Load a configuration from a json file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, FairVaeError> {
        let json_str = fs::read_to_string(path.as_ref())
            .map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json(&json_str)
    }

    pub fn from_json(json_str: &str) -> Result<Self, FairVaeError> {
        serde_json::from_str::<TrainConfig>(json_str).map_err(|e| FairVaeError::UnableToRead(e.to_string()))
    }

    pub fn json_dump(&self) -> Result<String, FairVaeError> {
        serde_json::to_string_pretty(self).map_err(|e| FairVaeError::UnableToWrite(e.to_string()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FairVaeError> {
        let cfg = self.json_dump()?;
        fs::write(path.as_ref(), cfg)
            .map_err(|e| FairVaeError::UnableToWrite(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Check every hyperparameter, and reject fairness requests that have no
    /// implementation before any training work starts.
    pub fn validate(&self) -> Result<(), FairVaeError> {
        validate_positive_float_parameter(self.learning_rate, "learning_rate")?;
        validate_float_parameter(self.lr_decay_ratio, 0.0, 1.0, "lr_decay_ratio")?;
        validate_positive_float_parameter(self.lr_decay_times, "lr_decay_times")?;
        validate_float_parameter(self.nll_coeff, 0.0, f64::INFINITY, "nll_coeff")?;
        validate_float_parameter(self.c_coeff, 0.0, f64::INFINITY, "c_coeff")?;
        validate_positive_float_parameter(self.labels_cluster_distance_threshold, "labels_cluster_distance_threshold")?;
        validate_float_parameter(self.dist_gamma, 0.0, f64::INFINITY, "dist_gamma")?;
        validate_positive_usize_parameter(self.batch_size, "batch_size")?;
        validate_positive_usize_parameter(self.latent_dim, "latent_dim")?;
        validate_positive_usize_parameter(self.hidden_dim, "hidden_dim")?;
        validate_positive_usize_parameter(self.z_dim, "z_dim")?;
        validate_positive_usize_parameter(self.n_train_sample, "n_train_sample")?;
        validate_positive_usize_parameter(self.n_test_sample, "n_test_sample")?;
        validate_positive_usize_parameter(self.labels_cluster_min_size, "labels_cluster_min_size")?;

        if let FairnessMode::Distance(LabelDistanceMetric::Arule) = self.fairness {
            return Err(FairVaeError::Unimplemented(
                "association-rule label distances are not supported yet".to_string(),
            ));
        }
        if let Some(target) = &self.target_label {
            if target.contains(',') || target.split_whitespace().count() > 1 {
                return Err(FairVaeError::Unimplemented(
                    "cannot handle multiple target labels yet".to_string(),
                ));
            }
            if target.is_empty() || !target.chars().all(|c| c == '0' || c == '1') {
                return Err(FairVaeError::InvalidParameter(
                    "target_label".to_string(),
                    "a bit string such as 0101".to_string(),
                    target.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Path segment naming a run by its optimisation hyperparameters.
    pub fn param_setting(&self) -> String {
        format!(
            "lr-{}_lr-decay_{:.2}_lr-times_{:.1}_nll-{:.2}_l2-{:.2}_c-{:.2}",
            self.learning_rate, self.lr_decay_ratio, self.lr_decay_times, self.nll_coeff, self.l2_coeff, self.c_coeff
        )
    }

    /// Epochs of the unconstrained prior model.
    pub fn prior_epochs(&self) -> usize {
        self.max_epoch / crate::constants::PRIOR_EPOCH_DIVISOR
    }
}
