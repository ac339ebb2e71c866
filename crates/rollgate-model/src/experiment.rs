//! A/B experiment records

use crate::ids::ExperimentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Experiment arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    /// Current configuration
    Control,
    /// Proposed configuration
    Treatment,
}

impl Group {
    /// Lowercase group name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Treatment => "treatment",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group name that is neither `control` nor `treatment`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown experiment group: {0:?}")]
pub struct UnknownGroup(pub String);

impl FromStr for Group {
    type Err = UnknownGroup;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "control" => Ok(Self::Control),
            "treatment" => Ok(Self::Treatment),
            _ => Err(UnknownGroup(s.to_string())),
        }
    }
}

/// One metric sample for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Owning experiment
    pub experiment_id: ExperimentId,
    /// Arm the sample belongs to
    pub group: Group,
    /// Measured value
    pub metric_value: f64,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

impl Observation {
    /// Observation stamped with the current time
    #[must_use]
    pub fn now(experiment_id: ExperimentId, group: Group, metric_value: f64) -> Self {
        Self {
            experiment_id,
            group,
            metric_value,
            recorded_at: Utc::now(),
        }
    }
}

/// Which arm performed better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    /// Control mean higher and significant
    Control,
    /// Treatment mean higher and significant
    Treatment,
    /// No significant difference
    Tie,
}

/// Outcome of comparing control against treatment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Mean of the control samples
    pub control_mean: f64,
    /// Mean of the treatment samples
    pub treatment_mean: f64,
    /// Two-tailed Welch t-test p-value
    pub p_value: f64,
    /// Cohen's d (treatment minus control, pooled SD)
    pub effect_size: f64,
    /// 95% confidence interval on `treatment_mean - control_mean`
    pub confidence_interval_95: (f64, f64),
    /// `p_value < significance_level`
    pub is_significant: bool,
    /// Winning arm
    pub winner: Winner,
    /// Number of control samples used
    pub control_n: usize,
    /// Number of treatment samples used
    pub treatment_n: usize,
}

impl ExperimentResult {
    /// `treatment_mean - control_mean`
    #[inline]
    #[must_use]
    pub fn mean_difference(&self) -> f64 {
        self.treatment_mean - self.control_mean
    }

    /// One-line verdict used in decision reasoning
    #[must_use]
    pub fn verdict(&self) -> String {
        format!(
            "{} (p={:.4}, Cohen's d={:.3}, winner={:?})",
            if self.is_significant {
                "significant"
            } else {
                "not significant"
            },
            self.p_value,
            self.effect_size,
            self.winner
        )
    }
}
