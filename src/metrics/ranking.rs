//! Ranking metrics over per-sample label scores.

/// Mean over rows of the share of true labels among the `k` highest scored labels.
/// `k` is capped at the number of labels.
pub fn precision_at_k(y: &[Vec<f64>], yhat: &[Vec<f64>], k: usize) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    let total: f64 = y
        .iter()
        .zip(yhat)
        .map(|(y_, yhat_)| {
            let k = k.min(y_.len());
            if k == 0 {
                return 0.0;
            }
            let mut order = (0..yhat_.len()).collect::<Vec<_>>();
            order.sort_by(|&a, &b| yhat_[b].total_cmp(&yhat_[a]));
            let hits: f64 = order.iter().take(k).map(|&j| y_[j]).sum();
            hits / k as f64
        })
        .sum();
    total / y.len() as f64
}
