//! Orchestrator configuration
//!
//! Loaded from TOML; every section and field is optional and falls back to
//! its default.
//!
//! ```toml
//! [experiment]
//! min_sample_size = 30
//! significance_level = 0.05
//!
//! [decision]
//! minor_drop = 0.02
//! major_drop = 0.05
//!
//! [rollout]
//! probe_timeout_ms = 10000
//! poll_interval_secs = 180
//!
//! [rollout.retry]
//! max_attempts = 3
//!
//! [conflict]
//! enabled_strategies = ["priority_override", "hybrid_negotiation", "sequential"]
//! hybrid_split_percent = 50
//! ```

use rollgate_conflict::ConflictConfig;
use rollgate_decision::DecisionPolicy;
use rollgate_rollout::RetryPolicy;
use rollgate_stats::StatisticalComparator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File requested
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Not valid TOML or wrong field types
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed but out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Experiment tracking section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Samples required per group before a result is computed
    pub min_sample_size: usize,
    /// Welch t-test significance level
    pub significance_level: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 30,
            significance_level: 0.05,
        }
    }
}

/// Rollout section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Per-attempt health probe timeout
    pub probe_timeout_ms: u64,
    /// Backoff for probe and applier calls
    pub retry: RetryPolicy,
    /// Scheduler tick interval
    pub poll_interval_secs: u64,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            poll_interval_secs: 180,
        }
    }
}

impl RolloutConfig {
    /// Probe timeout as a duration
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Scheduler interval as a duration
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Experiment tracking
    pub experiment: ExperimentConfig,
    /// Decision thresholds
    pub decision: DecisionPolicy,
    /// Rollout timing and retries
    pub rollout: RolloutConfig,
    /// Conflict strategy chain
    pub conflict: ConflictConfig,
}

impl OrchestratorConfig {
    /// Defaults for every section
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`]
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`Self::from_toml_str`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] if a value cannot be represented
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Check every section
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first bad value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.experiment.min_sample_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "experiment.min_sample_size must be at least 2, got {}",
                self.experiment.min_sample_size
            )));
        }
        StatisticalComparator::new(self.experiment.significance_level)
            .map_err(|e| ConfigError::Invalid(format!("experiment: {e}")))?;
        self.decision
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("decision: {e}")))?;

        let rollout = &self.rollout;
        if rollout.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("rollout.probe_timeout_ms must be positive".into()));
        }
        if rollout.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("rollout.poll_interval_secs must be positive".into()));
        }
        let retry = &rollout.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("rollout.retry.max_attempts must be at least 1".into()));
        }
        if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "rollout.retry.multiplier must be >= 1, got {}",
                retry.multiplier
            )));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "rollout.retry.base_delay_ms ({}) exceeds max_delay_ms ({})",
                retry.base_delay_ms, retry.max_delay_ms
            )));
        }

        self.conflict
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("conflict: {e}")))?;
        Ok(())
    }

    /// Set the experiment section
    #[must_use]
    pub fn with_experiment(mut self, experiment: ExperimentConfig) -> Self {
        self.experiment = experiment;
        self
    }

    /// Set the minimum sample size per group
    #[must_use]
    pub fn with_min_sample_size(mut self, min_sample_size: usize) -> Self {
        self.experiment.min_sample_size = min_sample_size;
        self
    }

    /// Set the decision thresholds
    #[must_use]
    pub fn with_decision_policy(mut self, policy: DecisionPolicy) -> Self {
        self.decision = policy;
        self
    }

    /// Set the rollout section
    #[must_use]
    pub fn with_rollout(mut self, rollout: RolloutConfig) -> Self {
        self.rollout = rollout;
        self
    }

    /// Set the probe timeout
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.rollout.probe_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the probe and applier retry policy
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.rollout.retry = retry;
        self
    }

    /// Set the conflict chain
    #[must_use]
    pub fn with_conflict(mut self, conflict: ConflictConfig) -> Self {
        self.conflict = conflict;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_model::ResolutionStrategyKind;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.experiment.min_sample_size, 30);
        assert_eq!(config.rollout.poll_interval(), Duration::from_secs(180));
        assert_eq!(config.rollout.retry.max_attempts, 3);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [experiment]
            min_sample_size = 50

            [conflict]
            enabled_strategies = ["sequential"]
            "#,
        )
        .unwrap();
        assert_eq!(config.experiment.min_sample_size, 50);
        assert!((config.experiment.significance_level - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.conflict.enabled_strategies, vec![ResolutionStrategyKind::Sequential]);
        assert_eq!(config.rollout, RolloutConfig::default());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = OrchestratorConfig::from_toml_str("[experiment]\nsignificance_level = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.starts_with("experiment")));

        let config = OrchestratorConfig::default().with_min_sample_size(1);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = OrchestratorConfig::default();
        config.rollout.retry.base_delay_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            OrchestratorConfig::from_toml_str("[rollout]\nprobe_timeout_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn renders_back_to_toml() {
        let config = OrchestratorConfig::default().with_min_sample_size(12);
        let text = config.to_toml_string().unwrap();
        assert_eq!(OrchestratorConfig::from_toml_str(&text).unwrap(), config);
    }
}
