//! Rollgate Stats
//!
//! Two-sample comparison and experiment bookkeeping:
//!
//! - [`compare`] / [`StatisticalComparator`]: Welch t-test, Cohen's d and a
//!   95% confidence interval on the mean difference
//! - [`ExperimentTracker`]: registration, concurrent observation ingestion
//!   and lazily recomputed results
//!
//! # Example
//!
//! ```
//! use rollgate_stats::compare;
//!
//! let control = [10.0, 10.5, 9.8, 10.2, 10.1];
//! let treatment = [12.0, 12.4, 11.9, 12.2, 12.1];
//! let result = compare(&control, &treatment, 0.05).unwrap();
//! assert!(result.is_significant);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod comparator;
pub mod distribution;
pub mod error;
pub mod tracker;

pub use comparator::{
    compare, SampleSummary, StatisticalComparator, DEFAULT_SIGNIFICANCE_LEVEL,
    MIN_SAMPLES_FOR_VARIANCE,
};
pub use error::{StatsError, TrackerError};
pub use tracker::{
    ExperimentSnapshot, ExperimentStatus, ExperimentTracker, PendingCounts,
    DEFAULT_MIN_SAMPLE_SIZE,
};
