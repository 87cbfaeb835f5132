//! Label Distance
//!
//! Similarity weights between label combinations, used to soften fairness around a
//! target label, and the ranking of label combinations by frequency.
use crate::config::{LabelDistanceMetric, TrainConfig};
use crate::data::Matrix;
use crate::errors::FairVaeError;
use crate::utils::label_key;
use hashbrown::HashMap;
use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Distinct label rows as bit strings with their counts, most frequent first.
/// Ties keep ascending bit string order.
pub fn rank_label_combinations(labels: &Matrix) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for i in 0..labels.rows {
        *counts.entry(label_key(labels.row(i))).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

/// Rank of `target` among the label combinations, `None` when it never occurs.
pub fn retrieve_target_label_idx(labels: &Matrix, target: &str) -> Option<usize> {
    rank_label_combinations(labels).iter().position(|(key, _)| key == target)
}

/// Target labels of a run: the configured bit string, or the combination at rank
/// `target_label_idx`.
pub fn target_labels(config: &TrainConfig, labels: &Matrix) -> Result<Vec<String>, FairVaeError> {
    if let Some(target) = &config.target_label {
        if target.len() != labels.cols {
            return Err(FairVaeError::InvalidParameter(
                "target_label".to_string(),
                format!("a bit string of length {}", labels.cols),
                target.clone(),
            ));
        }
        return Ok(vec![target.clone()]);
    }
    let ranked = rank_label_combinations(labels);
    match ranked.get(config.target_label_idx) {
        Some((key, _)) => Ok(vec![key.clone()]),
        None => Err(FairVaeError::InvalidParameter(
            "target_label_idx".to_string(),
            format!("an index below {}", ranked.len()),
            config.target_label_idx.to_string(),
        )),
    }
}

/// Jaccard similarity of two bit strings. Two empty label sets are identical.
fn jaccard(a: &str, b: &str) -> f64 {
    let (mut inter, mut union) = (0usize, 0usize);
    for (x, y) in a.bytes().zip(b.bytes()) {
        let (x, y) = (x == b'1', y == b'1');
        if x && y {
            inter += 1;
        }
        if x || y {
            union += 1;
        }
    }
    if union == 0 {
        1.0
    } else {
        inter as f64 / union as f64
    }
}

/// Nested map `target bits -> label bits -> weight`. Absent entries weigh 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelDistances(pub BTreeMap<String, BTreeMap<String, f64>>);

impl LabelDistances {
    /// Weights for every pair of label combinations present in `labels`.
    pub fn compute(labels: &Matrix, metric: LabelDistanceMetric, gamma: f64) -> Result<Self, FairVaeError> {
        let keys: Vec<String> = rank_label_combinations(labels).into_iter().map(|(k, _)| k).collect();
        let map = match metric {
            LabelDistanceMetric::IndicationFunction => keys
                .iter()
                .map(|t| (t.clone(), BTreeMap::from([(t.clone(), 1.0)])))
                .collect(),
            LabelDistanceMetric::Jaccard => keys
                .par_iter()
                .map(|t| {
                    let row: BTreeMap<String, f64> = keys
                        .iter()
                        .filter_map(|l| {
                            let w = jaccard(t, l).powf(gamma);
                            (w > 0.0).then(|| (l.clone(), w))
                        })
                        .collect();
                    (t.clone(), row)
                })
                .collect(),
            LabelDistanceMetric::Arule => {
                return Err(FairVaeError::Unimplemented(
                    "association-rule label distances are not supported yet".to_string(),
                ))
            }
        };
        Ok(LabelDistances(map))
    }

    /// Weight of `label` around `target`.
    pub fn weight(&self, target: &str, label: &str) -> f64 {
        self.0.get(target).and_then(|row| row.get(label)).copied().unwrap_or(0.0)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FairVaeError> {
        let json = serde_json::to_string(self).map_err(|e| FairVaeError::UnableToWrite(e.to_string()))?;
        fs::write(path.as_ref(), json)
            .map_err(|e| FairVaeError::UnableToWrite(format!("{}: {}", path.as_ref().display(), e)))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FairVaeError> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&json).map_err(|e| FairVaeError::UnableToRead(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Reuse the map stored at `path` unless `train_new` is set, computing and storing
    /// it otherwise.
    pub fn load_or_compute<P: AsRef<Path>>(
        path: P,
        train_new: bool,
        labels: &Matrix,
        metric: LabelDistanceMetric,
        gamma: f64,
    ) -> Result<Self, FairVaeError> {
        let path = path.as_ref();
        if !train_new && path.exists() {
            info!("loading label distances from {}", path.display());
            return Self::load(path);
        }
        let distances = Self::compute(labels, metric, gamma)?;
        info!("writing {} label distance rows to {}", distances.0.len(), path.display());
        distances.save(path)?;
        Ok(distances)
    }
}

/// File name of a stored label-distance map.
pub fn label_distance_file(dir: &Path, metric: LabelDistanceMetric, gamma: f64) -> PathBuf {
    let hparams = match metric {
        LabelDistanceMetric::Jaccard => format!("{}_{}", metric.name(), gamma),
        _ => metric.name().to_string(),
    };
    dir.join(format!("label_dist-{}.json", hparams))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Matrix {
        Matrix::new(vec![1., 0., 1., 1., 0., 0., 1., 1., 1., 0., 1., 1.], 6, 2).unwrap()
    }

    #[test]
    fn test_rank_label_combinations() {
        let ranked = rank_label_combinations(&labels());
        assert_eq!(
            ranked,
            vec![("11".to_string(), 3), ("10".to_string(), 2), ("00".to_string(), 1)]
        );
        assert_eq!(retrieve_target_label_idx(&labels(), "10"), Some(1));
        assert_eq!(retrieve_target_label_idx(&labels(), "01"), None);
    }

    #[test]
    fn test_target_labels() {
        let cfg = TrainConfig {
            target_label_idx: 2,
            ..Default::default()
        };
        assert_eq!(target_labels(&cfg, &labels()).unwrap(), vec!["00".to_string()]);
        let cfg = TrainConfig {
            target_label_idx: 3,
            ..Default::default()
        };
        assert!(target_labels(&cfg, &labels()).is_err());
        let cfg = TrainConfig {
            target_label: Some("01".to_string()),
            ..Default::default()
        };
        assert_eq!(target_labels(&cfg, &labels()).unwrap(), vec!["01".to_string()]);
    }

    #[test]
    fn test_indication_function() {
        let d = LabelDistances::compute(&labels(), LabelDistanceMetric::IndicationFunction, 1.0).unwrap();
        assert_eq!(d.weight("11", "11"), 1.0);
        assert_eq!(d.weight("11", "10"), 0.0);
        assert_eq!(d.weight("01", "01"), 0.0);
    }

    #[test]
    fn test_jaccard_with_gamma() {
        let d = LabelDistances::compute(&labels(), LabelDistanceMetric::Jaccard, 2.0).unwrap();
        assert_eq!(d.weight("11", "10"), 0.25);
        assert_eq!(d.weight("00", "00"), 1.0);
        assert_eq!(d.weight("10", "00"), 0.0);
        assert!(!d.0["10"].contains_key("00"));
    }

    #[test]
    fn test_arule_is_unimplemented() {
        let err = LabelDistances::compute(&labels(), LabelDistanceMetric::Arule, 1.0).unwrap_err();
        assert!(matches!(err, FairVaeError::Unimplemented(_)));
    }

    #[test]
    fn test_load_or_compute_reuses_file() {
        let dir = std::env::temp_dir().join(format!("fairvae-labeldist-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = label_distance_file(&dir, LabelDistanceMetric::Jaccard, 1.0);
        assert!(path.ends_with("label_dist-jaccard_1.json"));
        let first = LabelDistances::load_or_compute(&path, false, &labels(), LabelDistanceMetric::Jaccard, 1.0).unwrap();
        let other = Matrix::new(vec![0., 1.], 1, 2).unwrap();
        let second = LabelDistances::load_or_compute(&path, false, &other, LabelDistanceMetric::Jaccard, 1.0).unwrap();
        assert_eq!(first, second);
        let fresh = LabelDistances::load_or_compute(&path, true, &other, LabelDistanceMetric::Jaccard, 1.0).unwrap();
        assert!(fresh.0.contains_key("01"));
        fs::remove_dir_all(&dir).unwrap();
    }
}
