//! Errors
//!
//! Custom error types used throughout the `fairvae` crate.
use thiserror::Error;

/// Errors that can occur while training or evaluating a fair VAE.
#[derive(Debug, Error)]
pub enum FairVaeError {
    /// Unable to write an artifact to disk.
    #[error("Unable to write to file: {0}")]
    UnableToWrite(String),
    /// Unable to read an artifact from disk.
    #[error("Unable to read from file {0}")]
    UnableToRead(String),
    /// Invalid value parsing.
    #[error("Invalid value {0} passed for {1}, expected one of {2}.")]
    ParseString(String, String, String),
    /// First value is the name of the parameter, second is expected, third is what was passed.
    #[error("Invalid parameter value passed for {0}, expected {1} but {2} provided.")]
    InvalidParameter(String, String, String),
    /// The arrays handed to a data split are inconsistent.
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// An operation was asked to run over an empty index set.
    #[error("The {0} index set is empty.")]
    EmptyIndexSet(&'static str),
    /// The fairness stages need a sensitive attribute matrix.
    #[error("No sensitive attribute matrix is attached to this data split.")]
    MissingSensitive,
    /// Every clustering attempt left at least one cluster below the minimum size.
    #[error(
        "Labels clustering not converged after {} attempts, thresholds tried: {thresholds:?}, cluster sizes per attempt: {cluster_sizes:?}",
        thresholds.len()
    )]
    ClusteringNonConvergence {
        thresholds: Vec<f64>,
        cluster_sizes: Vec<Vec<usize>>,
    },
    /// A fairness mode that has no implementation was requested.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
    /// Resuming from the requested state is not possible.
    #[error("Resume unsupported: {0}")]
    ResumeUnsupported(String),
    /// Error raised by the tensor backend.
    #[error("Tensor backend error: {0}")]
    Candle(#[from] candle_core::Error),
}
