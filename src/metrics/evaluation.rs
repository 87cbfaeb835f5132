use crate::constants::{METRICS, THRESHOLDS};
use crate::data::Matrix;
use crate::errors::FairVaeError;
use crate::metrics::classification::{
    average_precision_score, example_f1_score, hamming_accuracy, roc_auc_score, subset_accuracy, Confusion,
};
use crate::metrics::ranking::precision_at_k;
use crate::utils::{mean, median};
use hashbrown::HashMap;
use rayon::prelude::*;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Metric name to value, for one threshold.
pub type MetricTable = HashMap<String, f64>;

/// FDR style metrics are minimised, everything else is maximised.
pub fn maximize(metric: &str) -> bool {
    !metric.contains("FDR")
}

/// Whether `comparison` strictly improves on `value`. A NaN on either side never improves.
pub fn is_comparison_better(value: f64, comparison: f64, maximize: bool) -> bool {
    if maximize {
        comparison > value
    } else {
        comparison < value
    }
}

fn columns(m: &Matrix) -> Vec<Vec<f64>> {
    (0..m.cols)
        .map(|j| (0..m.rows).map(|i| m.data[i * m.cols + j] as f64).collect())
        .collect()
}

fn rows(m: &Matrix) -> Vec<Vec<f64>> {
    (0..m.rows).map(|i| m.row(i).iter().map(|v| *v as f64).collect()).collect()
}

/// Mean and median of the finite entries, NaN when there are none.
fn finite_summary(values: &[f64]) -> (f64, f64) {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    (mean(&finite), median(&finite))
}

/// Score predicted probabilities `probs` against binary `labels`, predicting a label when
/// its probability exceeds `threshold`.
///
/// Always reports `ACC`, `HA`, `ebF1`, `maF1` and `miF1`. With `all_metrics` the per-label
/// AUC, AUPR and FDR summaries and precision at 1, 3 and 5 are added.
pub fn compute_metrics(
    probs: &Matrix,
    labels: &Matrix,
    threshold: f64,
    all_metrics: bool,
) -> Result<MetricTable, FairVaeError> {
    if probs.rows != labels.rows || probs.cols != labels.cols {
        return Err(FairVaeError::InvalidData(format!(
            "predictions of shape ({}, {}) do not match labels of shape ({}, {})",
            probs.rows, probs.cols, labels.rows, labels.cols
        )));
    }
    let y_rows = rows(labels);
    let p_rows = rows(probs);
    let pred_rows: Vec<Vec<bool>> = p_rows
        .iter()
        .map(|r| r.iter().map(|p| *p > threshold).collect())
        .collect();

    let y_cols = columns(labels);
    let p_cols = columns(probs);
    let confusions: Vec<Confusion> = y_cols
        .par_iter()
        .zip(p_cols.par_iter())
        .map(|(y, p)| {
            let pred: Vec<bool> = p.iter().map(|v| *v > threshold).collect();
            Confusion::from_predictions(y, &pred)
        })
        .collect();
    let micro = confusions.iter().fold(Confusion::default(), |acc, c| acc.add(c));
    let label_f1: Vec<f64> = confusions.iter().map(|c| c.f1()).collect();

    let mut table = MetricTable::new();
    table.insert("ACC".to_string(), subset_accuracy(&y_rows, &pred_rows));
    table.insert("HA".to_string(), hamming_accuracy(&y_rows, &pred_rows));
    table.insert("ebF1".to_string(), example_f1_score(&y_rows, &pred_rows));
    table.insert("maF1".to_string(), mean(&label_f1));
    table.insert("miF1".to_string(), micro.f1());

    if all_metrics {
        let (auc, aupr): (Vec<f64>, Vec<f64>) = y_cols
            .par_iter()
            .zip(p_cols.par_iter())
            .map(|(y, p)| (roc_auc_score(y, p), average_precision_score(y, p)))
            .unzip();
        let fdr: Vec<f64> = confusions.iter().map(|c| c.fdr()).collect();
        let (mean_auc, median_auc) = finite_summary(&auc);
        let (mean_aupr, median_aupr) = finite_summary(&aupr);
        let (mean_fdr, median_fdr) = finite_summary(&fdr);
        table.insert("meanAUC".to_string(), mean_auc);
        table.insert("medianAUC".to_string(), median_auc);
        table.insert("meanAUPR".to_string(), mean_aupr);
        table.insert("medianAUPR".to_string(), median_aupr);
        table.insert("meanFDR".to_string(), mean_fdr);
        table.insert("medianFDR".to_string(), median_fdr);
        for k in [1, 3, 5] {
            table.insert(format!("p_at_{}", k), precision_at_k(&y_rows, &p_rows, k));
        }
    }
    Ok(table)
}

/// `compute_metrics` with `all_metrics` at every threshold of the sweep grid, in grid order.
pub fn sweep_thresholds(probs: &Matrix, labels: &Matrix) -> Result<Vec<MetricTable>, FairVaeError> {
    THRESHOLDS
        .par_iter()
        .map(|t| compute_metrics(probs, labels, *t, true))
        .collect()
}

/// Best value of every tracked metric over a threshold sweep, in reporting order.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMetrics {
    values: Vec<(String, f64)>,
}

impl BestMetrics {
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.iter().find(|(name, _)| name == metric).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, v)| (name.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for BestMetrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, v) in &self.values {
            map.serialize_entry(name, v)?;
        }
        map.end()
    }
}

/// Fold per-threshold tables into the best value of every tracked metric.
///
/// The first table seeds every entry; a later table replaces an entry only when it
/// strictly improves on it (lower for FDR metrics, higher otherwise).
pub fn select_best_metrics(tables: &[MetricTable]) -> Result<BestMetrics, FairVaeError> {
    let (first, rest) = tables.split_first().ok_or(FairVaeError::EmptyIndexSet("threshold"))?;
    let lookup = |table: &MetricTable, metric: &str| {
        table
            .get(metric)
            .copied()
            .ok_or_else(|| FairVaeError::InvalidData(format!("metric table has no entry for {}", metric)))
    };
    let mut values = METRICS
        .iter()
        .map(|m| Ok((m.to_string(), lookup(first, m)?)))
        .collect::<Result<Vec<_>, FairVaeError>>()?;
    for table in rest {
        for (name, best) in values.iter_mut() {
            let candidate = lookup(table, name)?;
            if is_comparison_better(*best, candidate, maximize(name)) {
                *best = candidate;
            }
        }
    }
    Ok(BestMetrics { values })
}
