//! Classification metrics over binary label matrices.
//!
//! Per-label scores take a single label column, `y` holding 0/1 targets and `yhat`
//! the predicted probabilities. Set-based scores take thresholded predictions.

/// Confusion counts of one label column at a fixed threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Confusion {
    pub tp: f64,
    pub fp: f64,
    pub fn_: f64,
    pub tn: f64,
}

impl Confusion {
    pub fn from_predictions(y: &[f64], pred: &[bool]) -> Self {
        let mut c = Confusion::default();
        for (y_, p_) in y.iter().zip(pred) {
            match (*y_ > 0.5, *p_) {
                (true, true) => c.tp += 1.0,
                (false, true) => c.fp += 1.0,
                (true, false) => c.fn_ += 1.0,
                (false, false) => c.tn += 1.0,
            }
        }
        c
    }

    pub fn add(&self, other: &Confusion) -> Confusion {
        Confusion {
            tp: self.tp + other.tp,
            fp: self.fp + other.fp,
            fn_: self.fn_ + other.fn_,
            tn: self.tn + other.tn,
        }
    }

    /// F1 score, 0 when there are neither positives nor predicted positives.
    pub fn f1(&self) -> f64 {
        let denom = 2.0 * self.tp + self.fp + self.fn_;
        if denom > 0.0 {
            2.0 * self.tp / denom
        } else {
            0.0
        }
    }

    /// False discovery rate, NaN when nothing is predicted positive.
    pub fn fdr(&self) -> f64 {
        let predicted = self.tp + self.fp;
        if predicted > 0.0 {
            self.fp / predicted
        } else {
            f64::NAN
        }
    }
}

fn trapezoid_area(x0: f64, x1: f64, y0: f64, y1: f64) -> f64 {
    (x0 - x1).abs() * (y0 + y1) * 0.5
}

/// Indices of `yhat` by descending score.
fn descending(yhat: &[f64]) -> Vec<usize> {
    let mut indices = (0..yhat.len()).collect::<Vec<_>>();
    indices.sort_unstable_by(|&a, &b| yhat[b].total_cmp(&yhat[a]));
    indices
}

/// Area under the ROC curve. NaN when the column holds a single class.
pub fn roc_auc_score(y: &[f64], yhat: &[f64]) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    let indices = descending(yhat);
    let mut auc: f64 = 0.0;

    let mut label = y[indices[0]];
    let mut fp = 1.0 - label;
    let mut tp: f64 = label;
    let mut tp_prev: f64 = 0.0;
    let mut fp_prev: f64 = 0.0;

    for i in 1..indices.len() {
        if yhat[indices[i]] != yhat[indices[i - 1]] {
            auc += trapezoid_area(fp_prev, fp, tp_prev, tp);
            tp_prev = tp;
            fp_prev = fp;
        }
        label = y[indices[i]];
        fp += 1.0 - label;
        tp += label;
    }

    auc += trapezoid_area(fp_prev, fp, tp_prev, tp);
    if fp <= 0.0 || tp <= 0.0 {
        return f64::NAN;
    }

    auc / (tp * fp)
}

/// Area under the precision-recall curve as average precision,
/// `sum_n (R_n - R_{n-1}) P_n` over distinct score thresholds. NaN without positives.
pub fn average_precision_score(y: &[f64], yhat: &[f64]) -> f64 {
    let total_pos: f64 = y.iter().sum();
    if total_pos <= 0.0 {
        return f64::NAN;
    }
    let indices = descending(yhat);
    let mut ap = 0.0;
    let mut tp = 0.0;
    let mut seen = 0.0;
    let mut recall_prev = 0.0;
    for (pos, &i) in indices.iter().enumerate() {
        tp += y[i];
        seen += 1.0;
        let last_of_tie = indices.get(pos + 1).map_or(true, |&j| yhat[j] != yhat[i]);
        if last_of_tie {
            let recall = tp / total_pos;
            ap += (recall - recall_prev) * (tp / seen);
            recall_prev = recall;
        }
    }
    ap
}

/// Share of rows predicted exactly.
pub fn subset_accuracy(y: &[Vec<f64>], pred: &[Vec<bool>]) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    let exact = y
        .iter()
        .zip(pred)
        .filter(|(y_, p_)| y_.iter().zip(p_.iter()).all(|(a, b)| (*a > 0.5) == *b))
        .count();
    exact as f64 / y.len() as f64
}

/// Share of label entries predicted correctly.
pub fn hamming_accuracy(y: &[Vec<f64>], pred: &[Vec<bool>]) -> f64 {
    let mut correct = 0usize;
    let mut total = 0usize;
    for (y_, p_) in y.iter().zip(pred) {
        for (a, b) in y_.iter().zip(p_) {
            total += 1;
            if (*a > 0.5) == *b {
                correct += 1;
            }
        }
    }
    if total == 0 {
        f64::NAN
    } else {
        correct as f64 / total as f64
    }
}

/// Example-based F1, rows with neither true nor predicted labels scoring 0.
pub fn example_f1_score(y: &[Vec<f64>], pred: &[Vec<bool>]) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    let sum: f64 = y
        .iter()
        .zip(pred)
        .map(|(y_, p_)| {
            let c = Confusion::from_predictions(y_, p_);
            c.f1()
        })
        .sum();
    sum / y.len() as f64
}
