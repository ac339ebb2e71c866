//! Conflict records

use crate::ids::{ConflictId, ProposalId, ResourceId};
use crate::proposal::Proposal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Strategy that resolved a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategyKind {
    /// Higher priority class wins outright
    PriorityOverride,
    /// Resources split between both proposals
    HybridNegotiation,
    /// Proposals run one after the other
    Sequential,
}

impl fmt::Display for ResolutionStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PriorityOverride => "priority_override",
            Self::HybridNegotiation => "hybrid_negotiation",
            Self::Sequential => "sequential",
        };
        f.write_str(s)
    }
}

/// Structured outcome of a resolved conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// The loser is discarded
    PriorityOverride {
        /// Higher-priority proposal
        winner: ProposalId,
        /// Discarded proposal
        loser: ProposalId,
    },
    /// A blended proposal replaces both
    Hybrid {
        /// The blended proposal, already validated
        blended: Box<Proposal>,
        /// Resources assigned to each original proposal's configuration
        partition: Vec<(ProposalId, BTreeSet<ResourceId>)>,
    },
    /// Execute in order, first to completion before the next starts
    Sequential {
        /// Execution order
        order: Vec<ProposalId>,
    },
}

impl ResolutionOutcome {
    /// Strategy that produced this outcome
    #[must_use]
    pub fn strategy(&self) -> ResolutionStrategyKind {
        match self {
            Self::PriorityOverride { .. } => ResolutionStrategyKind::PriorityOverride,
            Self::Hybrid { .. } => ResolutionStrategyKind::HybridNegotiation,
            Self::Sequential { .. } => ResolutionStrategyKind::Sequential,
        }
    }
}

/// Detection and resolution of two overlapping pending proposals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Record ID
    pub id: ConflictId,
    /// The proposals in conflict
    pub conflicting_proposal_ids: Vec<ProposalId>,
    /// Resources both proposals touch
    pub shared_resource_ids: BTreeSet<ResourceId>,
    /// Detection time
    pub detected_at: DateTime<Utc>,
    /// Set on resolution
    pub resolution_strategy: Option<ResolutionStrategyKind>,
    /// Set on resolution
    pub resolution_outcome: Option<ResolutionOutcome>,
    /// Set on resolution
    pub resolved_at: Option<DateTime<Utc>>,
    /// Explanation of detection and resolution, in order
    pub reasoning: Vec<String>,
}

impl ConflictRecord {
    /// Unresolved record for a detected pair
    #[must_use]
    pub fn detected(first: &Proposal, second: &Proposal) -> Self {
        let shared = first.shared_resources(second);
        let reasoning = vec![format!(
            "{} and {} both touch {}",
            first.proposal_id,
            second.proposal_id,
            shared
                .iter()
                .map(ResourceId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        )];
        Self {
            id: ConflictId::new(),
            conflicting_proposal_ids: vec![first.proposal_id, second.proposal_id],
            shared_resource_ids: shared,
            detected_at: Utc::now(),
            resolution_strategy: None,
            resolution_outcome: None,
            resolved_at: None,
            reasoning,
        }
    }

    /// Whether resolution has been recorded
    #[inline]
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Whether `proposal_id` is one of the conflicting proposals
    #[must_use]
    pub fn involves(&self, proposal_id: ProposalId) -> bool {
        self.conflicting_proposal_ids.contains(&proposal_id)
    }

    /// Terminal copy of this record carrying `outcome`
    #[must_use]
    pub fn resolved(mut self, outcome: ResolutionOutcome, reason: impl Into<String>) -> Self {
        self.resolution_strategy = Some(outcome.strategy());
        self.resolution_outcome = Some(outcome);
        self.resolved_at = Some(Utc::now());
        self.reasoning.push(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentId;
    use crate::proposal::PriorityClass;

    #[test]
    fn detected_record_lists_shared_resources() {
        let a = Proposal::builder(AgentId::new(), PriorityClass::Cost)
            .resources(["db", "cache"])
            .build();
        let b = Proposal::builder(AgentId::new(), PriorityClass::Safety)
            .resources(["cache"])
            .build();

        let record = ConflictRecord::detected(&a, &b);
        assert!(!record.is_resolved());
        assert!(record.involves(a.proposal_id));
        assert_eq!(record.shared_resource_ids.len(), 1);
        assert!(record.reasoning[0].contains("cache"));
    }

    #[test]
    fn resolved_sets_strategy_from_outcome() {
        let a = Proposal::builder(AgentId::new(), PriorityClass::Cost)
            .resource("db")
            .build();
        let b = Proposal::builder(AgentId::new(), PriorityClass::Cost)
            .resource("db")
            .build();
        let record = ConflictRecord::detected(&a, &b).resolved(
            ResolutionOutcome::Sequential {
                order: vec![a.proposal_id, b.proposal_id],
            },
            "equal priority, opposed impacts",
        );
        assert!(record.is_resolved());
        assert_eq!(
            record.resolution_strategy,
            Some(ResolutionStrategyKind::Sequential)
        );
    }
}
