//! Decision thresholds

use crate::error::DecisionError;
use serde::{Deserialize, Serialize};

/// Thresholds and confidences of the decision table
///
/// Drops are fractions of the baseline (`0.02` = 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionPolicy {
    /// Drops below this are approved
    pub minor_drop: f64,
    /// Drops at or above this are rejected
    pub major_drop: f64,
    /// `|Cohen's d|` below this forces manual review
    pub small_effect: f64,

    /// Quality held or improved, experiment significant
    pub confidence_improved_significant: f64,
    /// Quality held or improved, no significance
    pub confidence_improved: f64,
    /// Drop below `minor_drop`
    pub confidence_minor_drop: f64,
    /// Drop at or above `major_drop`
    pub confidence_major_drop: f64,
    /// Moderate drop confirmed by a significant experiment
    pub confidence_moderate_significant: f64,
    /// Moderate drop without significance
    pub confidence_moderate_review: f64,
    /// Small-effect downgrade
    pub confidence_small_effect: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            minor_drop: 0.02,
            major_drop: 0.05,
            small_effect: 0.2,
            confidence_improved_significant: 0.95,
            confidence_improved: 0.85,
            confidence_minor_drop: 0.90,
            confidence_major_drop: 0.95,
            confidence_moderate_significant: 0.85,
            confidence_moderate_review: 0.70,
            confidence_small_effect: 0.60,
        }
    }
}

impl DecisionPolicy {
    /// Check threshold ordering and confidence ranges
    ///
    /// # Errors
    /// [`DecisionError::InvalidPolicy`] naming the first bad field
    pub fn validate(&self) -> Result<(), DecisionError> {
        if !(self.minor_drop > 0.0 && self.minor_drop <= self.major_drop && self.major_drop < 1.0) {
            return Err(DecisionError::InvalidPolicy(format!(
                "need 0 < minor_drop ({}) <= major_drop ({}) < 1",
                self.minor_drop, self.major_drop
            )));
        }
        if !(self.small_effect >= 0.0 && self.small_effect.is_finite()) {
            return Err(DecisionError::InvalidPolicy(format!(
                "small_effect must be a non-negative number, got {}",
                self.small_effect
            )));
        }
        for (name, value) in [
            ("confidence_improved_significant", self.confidence_improved_significant),
            ("confidence_improved", self.confidence_improved),
            ("confidence_minor_drop", self.confidence_minor_drop),
            ("confidence_major_drop", self.confidence_major_drop),
            ("confidence_moderate_significant", self.confidence_moderate_significant),
            ("confidence_moderate_review", self.confidence_moderate_review),
            ("confidence_small_effect", self.confidence_small_effect),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DecisionError::InvalidPolicy(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        assert!(DecisionPolicy::default().validate().is_ok());
    }

    #[test]
    fn inverted_drop_bands_are_rejected() {
        let policy = DecisionPolicy {
            minor_drop: 0.10,
            major_drop: 0.05,
            ..DecisionPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(DecisionError::InvalidPolicy(msg)) if msg.contains("minor_drop")
        ));
    }

    #[test]
    fn confidence_out_of_range_is_rejected() {
        let policy = DecisionPolicy {
            confidence_improved: 1.2,
            ..DecisionPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let policy: DecisionPolicy = toml::from_str("major_drop = 0.08").unwrap();
        assert_eq!(policy.major_drop, 0.08);
        assert_eq!(policy.minor_drop, 0.02);
    }
}
