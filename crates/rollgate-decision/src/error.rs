//! Decision errors

use thiserror::Error;

/// Decision engine errors
///
/// Pure computation errors: bad input, never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecisionError {
    /// Quality value unusable for the drop computation
    #[error("invalid quality input: {0}")]
    InvalidQuality(String),

    /// Thresholds out of order or out of range
    #[error("invalid decision policy: {0}")]
    InvalidPolicy(String),
}
