//! Validation decisions

use crate::ids::ProposalId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict for a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Proceed to rollout
    Approve,
    /// Do not apply
    Reject,
    /// Hold for a human operator
    ManualReview,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::ManualReview => "manual_review",
        };
        f.write_str(s)
    }
}

/// Immutable decision record for one proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDecision {
    /// Proposal the decision applies to
    pub proposal_id: ProposalId,
    /// Verdict
    pub decision: Decision,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// `(new - baseline) / baseline * 100`
    pub quality_change_percent: f64,
    /// Ordered explanation
    pub reasoning: Vec<String>,
    /// Decision time
    pub decided_at: DateTime<Utc>,
}

impl ValidationDecision {
    /// Whether the verdict is approve
    #[inline]
    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.decision == Decision::Approve
    }

    /// New record carrying an operator's verdict on a held proposal
    ///
    /// The prior record is left untouched; its reasoning is carried over and
    /// the operator note appended.
    #[must_use]
    pub fn operator_override(
        previous: &Self,
        decision: Decision,
        operator_note: impl Into<String>,
    ) -> Self {
        let mut reasoning = previous.reasoning.clone();
        reasoning.push(format!(
            "operator override: {} -> {decision}: {}",
            previous.decision,
            operator_note.into()
        ));
        Self {
            proposal_id: previous.proposal_id,
            decision,
            confidence: 1.0,
            quality_change_percent: previous.quality_change_percent,
            reasoning,
            decided_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_override_creates_new_record() {
        let held = ValidationDecision {
            proposal_id: ProposalId::new(),
            decision: Decision::ManualReview,
            confidence: 0.7,
            quality_change_percent: -3.5,
            reasoning: vec!["quality drop 3.53%".to_string()],
            decided_at: Utc::now(),
        };

        let approved = ValidationDecision::operator_override(&held, Decision::Approve, "ok by oncall");

        assert_eq!(held.decision, Decision::ManualReview);
        assert!(approved.is_approved());
        assert_eq!(approved.proposal_id, held.proposal_id);
        assert_eq!(approved.reasoning.len(), 2);
        assert!(approved.reasoning[1].contains("manual_review -> approve"));
    }

    #[test]
    fn decision_serializes_snake_case() {
        let json = serde_json::to_string(&Decision::ManualReview).unwrap();
        assert_eq!(json, "\"manual_review\"");
    }
}
