/// Decision thresholds swept during validation. Kept literal so evaluation numbers stay comparable.
pub const THRESHOLDS: [f64; 27] = [
    0.01, 0.02, 0.03, 0.04, 0.05, 0.06, 0.07, 0.08, 0.09, 0.10, 0.15, 0.20, 0.25, 0.30, 0.35, 0.40, 0.45, 0.50, 0.55,
    0.60, 0.65, 0.70, 0.75, 0.8, 0.85, 0.9, 0.95,
];

/// Metrics kept in the best-metrics snapshot, in reporting order.
pub const METRICS: [&str; 14] = [
    "ACC",
    "HA",
    "ebF1",
    "miF1",
    "maF1",
    "meanAUC",
    "medianAUC",
    "meanAUPR",
    "medianAUPR",
    "meanFDR",
    "medianFDR",
    "p_at_1",
    "p_at_3",
    "p_at_5",
];

pub const TRAIN_THRESHOLD: f64 = 0.5;
pub const GRAD_CLIP_NORM: f64 = 100.0;
pub const CLUSTER_MAX_RETRIES: usize = 10;
pub const PRIOR_EPOCH_DIVISOR: usize = 5;
pub const WEIGHT_DECAY: f64 = 1e-5;
pub const TRAIN_FRACTION: f64 = 0.7;
pub const VALID_FRACTION: f64 = 0.2;
pub const PROBIT_EPS: f64 = 1e-6;
pub const KL_EPS: f64 = 1e-6;
