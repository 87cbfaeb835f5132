//! Metrics
//!
//! Multi-label classification and ranking metrics, and the threshold sweep that keeps
//! the best value of each tracked metric.
pub mod classification;
pub mod evaluation;
pub mod ranking;

pub use evaluation::{compute_metrics, select_best_metrics, sweep_thresholds, BestMetrics, MetricTable};
