//! SLO predicates over health snapshots
//!
//! The state machine asks an [`SloPolicy`] whether a snapshot violates the
//! service level objective. Three policies ship with the crate:
//! - [`OkFlagPolicy`] trusts the probe's own `ok` flag
//! - [`ThresholdSloPolicy`] caps named numeric details
//! - [`DecisionGatePolicy`] runs the decision table on reported quality
//!
//! Any `Fn(&HealthSnapshot) -> SloVerdict` closure is also a policy.

use rollgate_decision::DecisionEngine;
use rollgate_model::{Decision, HealthSnapshot};
use std::collections::BTreeMap;

/// Outcome of an SLO evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SloVerdict {
    /// Rollout may proceed
    Healthy,
    /// Rollout must roll back, with a reason
    Violated(String),
}

impl SloVerdict {
    /// Whether the verdict is a violation
    #[inline]
    #[must_use]
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Violated(_))
    }
}

/// Caller-supplied violation predicate
pub trait SloPolicy: Send + Sync {
    /// Judge a snapshot
    fn evaluate(&self, snapshot: &HealthSnapshot) -> SloVerdict;
}

impl<F> SloPolicy for F
where
    F: Fn(&HealthSnapshot) -> SloVerdict + Send + Sync,
{
    fn evaluate(&self, snapshot: &HealthSnapshot) -> SloVerdict {
        self(snapshot)
    }
}

/// Reason reported for a snapshot with `ok = false`
fn not_ok_reason(snapshot: &HealthSnapshot) -> String {
    match snapshot.reason() {
        Some(reason) => format!("health check failed: {reason}"),
        None => "health check failed".to_string(),
    }
}

/// Violation iff the probe reported `ok = false`
#[derive(Debug, Clone, Copy, Default)]
pub struct OkFlagPolicy;

impl SloPolicy for OkFlagPolicy {
    fn evaluate(&self, snapshot: &HealthSnapshot) -> SloVerdict {
        if snapshot.ok {
            SloVerdict::Healthy
        } else {
            SloVerdict::Violated(not_ok_reason(snapshot))
        }
    }
}

/// Upper bounds on numeric snapshot details
///
/// A missing metric is not a violation unless `require_all` is set.
#[derive(Debug, Clone, Default)]
pub struct ThresholdSloPolicy {
    maxima: BTreeMap<String, f64>,
    require_all: bool,
}

impl ThresholdSloPolicy {
    /// Empty policy (only the `ok` flag is checked)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap `metric` at `max`
    #[must_use]
    pub fn with_max(mut self, metric: impl Into<String>, max: f64) -> Self {
        self.maxima.insert(metric.into(), max);
        self
    }

    /// Treat a missing capped metric as a violation
    #[must_use]
    pub fn require_all(mut self) -> Self {
        self.require_all = true;
        self
    }
}

impl SloPolicy for ThresholdSloPolicy {
    fn evaluate(&self, snapshot: &HealthSnapshot) -> SloVerdict {
        if !snapshot.ok {
            return SloVerdict::Violated(not_ok_reason(snapshot));
        }
        for (metric, max) in &self.maxima {
            match snapshot.metric(metric) {
                Some(value) if value > *max => {
                    return SloVerdict::Violated(format!("{metric}={value} exceeds {max}"));
                }
                None if self.require_all => {
                    return SloVerdict::Violated(format!("{metric} missing from health snapshot"));
                }
                _ => {}
            }
        }
        SloVerdict::Healthy
    }
}

/// Detail key holding the pre-rollout quality
pub const BASELINE_QUALITY_KEY: &str = "baseline_quality";
/// Detail key holding the quality observed at the current stage
pub const QUALITY_KEY: &str = "quality";

/// Re-runs the decision table on live quality numbers
///
/// A `reject` verdict is a violation. `manual_review` lets the rollout
/// continue. Snapshots without both quality keys fall back to the `ok` flag.
#[derive(Debug, Clone, Default)]
pub struct DecisionGatePolicy {
    engine: DecisionEngine,
}

impl DecisionGatePolicy {
    /// Gate with a specific engine
    #[must_use]
    pub fn new(engine: DecisionEngine) -> Self {
        Self { engine }
    }
}

impl SloPolicy for DecisionGatePolicy {
    fn evaluate(&self, snapshot: &HealthSnapshot) -> SloVerdict {
        if !snapshot.ok {
            return SloVerdict::Violated(not_ok_reason(snapshot));
        }
        let (Some(baseline), Some(quality)) = (
            snapshot.metric(BASELINE_QUALITY_KEY),
            snapshot.metric(QUALITY_KEY),
        ) else {
            return SloVerdict::Healthy;
        };
        match self.engine.evaluate(baseline, quality, None) {
            Ok(verdict) if verdict.decision == Decision::Reject => {
                SloVerdict::Violated(verdict.reasoning.join("; "))
            }
            Ok(_) => SloVerdict::Healthy,
            Err(e) => SloVerdict::Violated(format!("unusable quality metrics: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ok_flag_policy_reports_probe_reason() {
        let verdict = OkFlagPolicy.evaluate(&HealthSnapshot::unhealthy("error rate 9%"));
        assert_eq!(
            verdict,
            SloVerdict::Violated("health check failed: error rate 9%".into())
        );
        assert_eq!(OkFlagPolicy.evaluate(&HealthSnapshot::healthy()), SloVerdict::Healthy);
    }

    #[test]
    fn thresholds_cap_metrics() {
        let policy = ThresholdSloPolicy::new()
            .with_max("p99_latency_ms", 250.0)
            .with_max("error_rate", 0.01);
        let fine = HealthSnapshot::healthy().with_detail("p99_latency_ms", json!(120));
        assert_eq!(policy.evaluate(&fine), SloVerdict::Healthy);

        let slow = HealthSnapshot::healthy().with_detail("p99_latency_ms", json!(400));
        assert!(policy.evaluate(&slow).is_violation());

        let strict = policy.require_all();
        assert!(strict.evaluate(&fine).is_violation());
    }

    #[test]
    fn decision_gate_rejects_large_quality_drop() {
        let gate = DecisionGatePolicy::default();
        let drop = HealthSnapshot::healthy()
            .with_detail(BASELINE_QUALITY_KEY, json!(85.0))
            .with_detail(QUALITY_KEY, json!(80.0));
        assert!(gate.evaluate(&drop).is_violation());

        let small = HealthSnapshot::healthy()
            .with_detail(BASELINE_QUALITY_KEY, json!(85.0))
            .with_detail(QUALITY_KEY, json!(83.5));
        assert_eq!(gate.evaluate(&small), SloVerdict::Healthy);

        assert_eq!(gate.evaluate(&HealthSnapshot::healthy()), SloVerdict::Healthy);
    }

    #[test]
    fn closures_are_policies() {
        let never = |_: &HealthSnapshot| SloVerdict::Healthy;
        assert_eq!(never.evaluate(&HealthSnapshot::unhealthy("x")), SloVerdict::Healthy);
    }
}
