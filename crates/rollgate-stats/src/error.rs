//! Statistics and experiment tracking errors

use rollgate_model::{ExperimentId, Group};
use rollgate_store::StoreError;
use thiserror::Error;

/// Comparator input errors
///
/// These indicate bad input and are never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    /// Too few samples for variance
    #[error("insufficient data in {group} group: {found} samples, need at least {required}")]
    InsufficientData {
        /// Group that is short
        group: Group,
        /// Samples present
        found: usize,
        /// Samples required
        required: usize,
    },

    /// NaN or infinite sample
    #[error("non-finite sample {value} in {group} group")]
    NonFiniteSample {
        /// Group containing the sample
        group: Group,
        /// Offending value
        value: f64,
    },

    /// Significance level outside (0, 1)
    #[error("significance level must be in (0, 1), got {0}")]
    InvalidSignificanceLevel(f64),
}

/// Experiment tracker errors
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Experiment id registered twice
    #[error("experiment already registered: {0}")]
    DuplicateExperiment(ExperimentId),

    /// Experiment id never registered
    #[error("unknown experiment: {0}")]
    UnknownExperiment(ExperimentId),

    /// Group name not `control` / `treatment`
    #[error("invalid group {0:?}, expected control or treatment")]
    InvalidGroup(String),

    /// NaN or infinite observation
    #[error("observation value must be finite, got {0}")]
    InvalidValue(f64),

    /// Minimum sample size below what variance needs
    #[error("min_sample_size must be at least 2, got {0}")]
    InvalidMinSampleSize(usize),

    /// Comparator failure
    #[error(transparent)]
    Stats(#[from] StatsError),

    /// Observation log failure
    #[error("observation log: {0}")]
    Store(#[from] StoreError),
}

impl TrackerError {
    /// Only backend failures are worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Io(_)))
    }
}
