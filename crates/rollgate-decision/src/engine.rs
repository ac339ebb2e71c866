//! Decision table evaluation

use crate::error::DecisionError;
use crate::policy::DecisionPolicy;
use chrono::{DateTime, Utc};
use rollgate_model::{Decision, ExperimentResult, ProposalId, ValidationDecision};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Decision table row that produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    /// Quality held or improved and the experiment is significant
    ImprovedSignificant,
    /// Quality held or improved
    Improved,
    /// Drop below the minor threshold
    MinorDrop,
    /// Drop at or above the major threshold
    MajorDrop,
    /// Moderate drop confirmed by a significant experiment
    ModerateDropSignificant,
    /// Moderate drop without significance
    ModerateDropReview,
    /// Downgraded because the measured effect is negligible
    SmallEffect,
}

/// Pure output of the decision table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Decision
    pub decision: Decision,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// `(new - baseline) / baseline * 100`
    pub quality_change_percent: f64,
    /// Ordered explanation
    pub reasoning: Vec<String>,
    /// Final rule applied
    pub rule: DecisionRule,
}

impl Verdict {
    /// Stamp into an immutable decision record
    #[must_use]
    pub fn into_decision(self, proposal_id: ProposalId, decided_at: DateTime<Utc>) -> ValidationDecision {
        ValidationDecision {
            proposal_id,
            decision: self.decision,
            confidence: self.confidence,
            quality_change_percent: self.quality_change_percent,
            reasoning: self.reasoning,
            decided_at,
        }
    }
}

/// Converts a quality delta and optional experiment result into a decision
#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    policy: DecisionPolicy,
}

impl DecisionEngine {
    /// Engine with a custom policy
    ///
    /// # Errors
    /// [`DecisionError::InvalidPolicy`] if the policy does not validate
    pub fn new(policy: DecisionPolicy) -> Result<Self, DecisionError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    /// Active policy
    #[must_use]
    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    /// Decide on a proposal and stamp the record with the current time
    ///
    /// # Errors
    /// See [`DecisionEngine::evaluate`]
    pub fn decide(
        &self,
        proposal_id: ProposalId,
        baseline_quality: f64,
        new_quality: f64,
        experiment: Option<&ExperimentResult>,
    ) -> Result<ValidationDecision, DecisionError> {
        let verdict = self.evaluate(baseline_quality, new_quality, experiment)?;
        info!(
            %proposal_id,
            decision = %verdict.decision,
            confidence = verdict.confidence,
            rule = ?verdict.rule,
            "validation decision"
        );
        Ok(verdict.into_decision(proposal_id, Utc::now()))
    }

    /// Evaluate the decision table
    ///
    /// Rows are tried top to bottom, first match wins. The small-effect row
    /// is an override: whenever an experiment result is available and its
    /// `|Cohen's d|` is below the policy cutoff, the verdict becomes manual
    /// review regardless of the row that matched.
    ///
    /// # Errors
    /// [`DecisionError::InvalidQuality`] for non-finite inputs or a
    /// non-positive baseline
    pub fn evaluate(
        &self,
        baseline_quality: f64,
        new_quality: f64,
        experiment: Option<&ExperimentResult>,
    ) -> Result<Verdict, DecisionError> {
        if !baseline_quality.is_finite() || !new_quality.is_finite() {
            return Err(DecisionError::InvalidQuality(format!(
                "baseline {baseline_quality} and new {new_quality} must be finite"
            )));
        }
        if baseline_quality <= 0.0 {
            return Err(DecisionError::InvalidQuality(format!(
                "baseline must be positive, got {baseline_quality}"
            )));
        }

        let p = &self.policy;
        let drop = (baseline_quality - new_quality) / baseline_quality;
        let quality_change_percent = -drop * 100.0;
        let significant = experiment.is_some_and(|e| e.is_significant);

        let mut reasoning = vec![format!(
            "quality drop {:.2}% (baseline {baseline_quality:.3}, new {new_quality:.3})",
            drop * 100.0
        )];
        match experiment {
            Some(result) => reasoning.push(format!("experiment {}", result.verdict())),
            None => reasoning.push("no experiment result available".to_string()),
        }

        let (rule, decision, confidence, why) = if new_quality >= baseline_quality && significant {
            (
                DecisionRule::ImprovedSignificant,
                Decision::Approve,
                p.confidence_improved_significant,
                "quality held or improved with significant experiment".to_string(),
            )
        } else if new_quality >= baseline_quality {
            (
                DecisionRule::Improved,
                Decision::Approve,
                p.confidence_improved,
                "quality held or improved without significance data".to_string(),
            )
        } else if drop < p.minor_drop {
            (
                DecisionRule::MinorDrop,
                Decision::Approve,
                p.confidence_minor_drop,
                format!("drop within {:.2}% tolerance", p.minor_drop * 100.0),
            )
        } else if drop >= p.major_drop {
            (
                DecisionRule::MajorDrop,
                Decision::Reject,
                p.confidence_major_drop,
                format!("drop at or above {:.2}% limit", p.major_drop * 100.0),
            )
        } else if significant {
            (
                DecisionRule::ModerateDropSignificant,
                Decision::Reject,
                p.confidence_moderate_significant,
                "moderate drop confirmed by significant experiment".to_string(),
            )
        } else {
            (
                DecisionRule::ModerateDropReview,
                Decision::ManualReview,
                p.confidence_moderate_review,
                "moderate drop without significance, needs review".to_string(),
            )
        };
        reasoning.push(format!("{why}: {decision} ({confidence:.2})"));

        // A matched reject already carries at least 0.85 confidence
        if let Some(result) = experiment.filter(|_| decision != Decision::Reject) {
            if result.effect_size.abs() < p.small_effect {
                reasoning.push(format!(
                    "effect size |d|={:.3} below {:.2}, downgraded to manual_review ({:.2})",
                    result.effect_size.abs(),
                    p.small_effect,
                    p.confidence_small_effect
                ));
                return Ok(Verdict {
                    decision: Decision::ManualReview,
                    confidence: p.confidence_small_effect,
                    quality_change_percent,
                    reasoning,
                    rule: DecisionRule::SmallEffect,
                });
            }
        }

        Ok(Verdict {
            decision,
            confidence,
            quality_change_percent,
            reasoning,
            rule,
        })
    }
}
