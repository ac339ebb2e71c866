//! Resolution strategy trait and the built-in strategies
//!
//! Strategies run as a chain. Each either resolves the pair or declines with a
//! reason; the first resolution wins.

use crate::error::ConflictError;
use async_trait::async_trait;
use chrono::Utc;
use rollgate_decision::DecisionEngine;
use rollgate_model::{
    Decision, MetricSource, PriorityClass, Proposal, ProposalId, ResolutionOutcome,
    ResolutionStrategyKind, ResourceId,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Configuration key carrying the hybrid resource partition
pub const HYBRID_PARTITION_KEY: &str = "hybrid_partition";

/// Default share of resources given to the leading proposal in a blend
pub const DEFAULT_HYBRID_SPLIT_PERCENT: u8 = 50;

/// What a strategy made of a conflicting pair
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// Pair resolved
    Resolved {
        /// Structured outcome
        outcome: ResolutionOutcome,
        /// Explanation appended to the record
        reason: String,
    },
    /// Strategy does not apply
    Declined(String),
}

/// Pluggable conflict resolution
///
/// `first` is the earlier submission.
#[async_trait]
pub trait ResolutionStrategy: Send + Sync + std::fmt::Debug {
    /// Strategy kind recorded on resolution
    fn kind(&self) -> ResolutionStrategyKind;

    /// Try to resolve the pair
    ///
    /// # Errors
    /// [`ConflictError::Strategy`] when the strategy fails outright
    async fn attempt(&self, first: &Proposal, second: &Proposal) -> Result<StrategyOutcome, ConflictError>;
}

/// Higher priority class wins outright
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityOverride;

#[async_trait]
impl ResolutionStrategy for PriorityOverride {
    fn kind(&self) -> ResolutionStrategyKind {
        ResolutionStrategyKind::PriorityOverride
    }

    async fn attempt(&self, first: &Proposal, second: &Proposal) -> Result<StrategyOutcome, ConflictError> {
        let (winner, loser) = if first.priority_class.dominates(second.priority_class) {
            (first, second)
        } else if second.priority_class.dominates(first.priority_class) {
            (second, first)
        } else {
            return Ok(StrategyOutcome::Declined(format!(
                "both proposals are {}",
                first.priority_class
            )));
        };
        Ok(StrategyOutcome::Resolved {
            outcome: ResolutionOutcome::PriorityOverride {
                winner: winner.proposal_id,
                loser: loser.proposal_id,
            },
            reason: format!(
                "{} ({}) overrides {} ({})",
                winner.proposal_id, winner.priority_class, loser.proposal_id, loser.priority_class
            ),
        })
    }
}

/// Predicted impacts pull in opposite directions
#[must_use]
pub fn impacts_opposed(a: f64, b: f64) -> bool {
    a * b < 0.0
}

/// Blend both proposals over a partition of their resources
///
/// The leading proposal (higher priority, then earlier submission) gets
/// `split_percent` of the union, rounded, and at least one resource each
/// side. Its configuration wins on key clashes. The blend must earn an
/// approve verdict from the decision engine on samples from the metric
/// source, otherwise the strategy declines.
#[derive(Clone)]
pub struct HybridNegotiation {
    split_percent: u8,
    metrics: Arc<dyn MetricSource>,
    engine: DecisionEngine,
}

impl std::fmt::Debug for HybridNegotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridNegotiation")
            .field("split_percent", &self.split_percent)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl HybridNegotiation {
    /// Hybrid strategy validating blends through `engine`
    ///
    /// # Errors
    /// [`ConflictError::InvalidSplit`] unless `split_percent` is within `1..=99`
    pub fn new(
        split_percent: u8,
        metrics: Arc<dyn MetricSource>,
        engine: DecisionEngine,
    ) -> Result<Self, ConflictError> {
        if !(1..=99).contains(&split_percent) {
            return Err(ConflictError::InvalidSplit(split_percent));
        }
        Ok(Self {
            split_percent,
            metrics,
            engine,
        })
    }

    /// Share of resources given to the leading proposal
    #[must_use]
    pub fn split_percent(&self) -> u8 {
        self.split_percent
    }

    /// Build the blended proposal and its partition without validating it
    ///
    /// Returns `None` when the union has fewer than two resources.
    #[must_use]
    pub fn blend(
        &self,
        first: &Proposal,
        second: &Proposal,
    ) -> Option<(Proposal, Vec<(ProposalId, BTreeSet<ResourceId>)>)> {
        let (lead, other) = if second.sequencing_key() < first.sequencing_key() {
            (second, first)
        } else {
            (first, second)
        };
        let union: Vec<ResourceId> = lead
            .affected_resource_ids
            .union(&other.affected_resource_ids)
            .cloned()
            .collect();
        if union.len() < 2 {
            return None;
        }

        let lead_count = split_count(union.len(), self.split_percent);
        let lead_share: BTreeSet<ResourceId> = union[..lead_count].iter().cloned().collect();
        let other_share: BTreeSet<ResourceId> = union[lead_count..].iter().cloned().collect();

        let mut assignment = JsonMap::new();
        for resource in &lead_share {
            assignment.insert(resource.0.clone(), JsonValue::String(lead.proposal_id.to_string()));
        }
        for resource in &other_share {
            assignment.insert(resource.0.clone(), JsonValue::String(other.proposal_id.to_string()));
        }
        let configuration = lead
            .proposed_configuration
            .merged_over(&other.proposed_configuration)
            .with_extra(HYBRID_PARTITION_KEY, JsonValue::Object(assignment));

        let lead_weight = f64::from(self.split_percent) / 100.0;
        let impact = lead_weight * lead.predicted_impact + (1.0 - lead_weight) * other.predicted_impact;
        let priority: PriorityClass = lead.priority_class.max(other.priority_class);

        let blended = Proposal::builder(lead.originating_agent_id, priority)
            .resources(union)
            .configuration(configuration)
            .predicted_impact(impact)
            .submitted_at(Utc::now())
            .supersedes(vec![lead.proposal_id, other.proposal_id])
            .build();
        let partition = vec![(lead.proposal_id, lead_share), (other.proposal_id, other_share)];
        Some((blended, partition))
    }
}

/// Resources assigned to the leading side: rounded share, clamped so both
/// sides keep at least one
fn split_count(total: usize, percent: u8) -> usize {
    let share = (total * usize::from(percent) + 50) / 100;
    share.clamp(1, total - 1)
}

#[async_trait]
impl ResolutionStrategy for HybridNegotiation {
    fn kind(&self) -> ResolutionStrategyKind {
        ResolutionStrategyKind::HybridNegotiation
    }

    async fn attempt(&self, first: &Proposal, second: &Proposal) -> Result<StrategyOutcome, ConflictError> {
        if impacts_opposed(first.predicted_impact, second.predicted_impact) {
            return Ok(StrategyOutcome::Declined(format!(
                "predicted impacts are opposed ({} vs {})",
                first.predicted_impact, second.predicted_impact
            )));
        }
        let Some((blended, partition)) = self.blend(first, second) else {
            return Ok(StrategyOutcome::Declined(
                "a single resource cannot be partitioned".to_string(),
            ));
        };

        let samples = match self.metrics.sample(&blended).await {
            Ok(samples) => samples,
            Err(e) => return Ok(StrategyOutcome::Declined(format!("blend not validated: {e}"))),
        };
        let (Some(baseline), Some(quality)) = (samples.control_mean(), samples.treatment_mean()) else {
            return Ok(StrategyOutcome::Declined(
                "blend not validated: empty samples".to_string(),
            ));
        };
        let verdict = match self.engine.evaluate(baseline, quality, None) {
            Ok(verdict) => verdict,
            Err(e) => return Ok(StrategyOutcome::Declined(format!("blend not validated: {e}"))),
        };
        debug!(
            blended = %blended.proposal_id,
            decision = %verdict.decision,
            "hybrid blend evaluated"
        );
        if verdict.decision != Decision::Approve {
            return Ok(StrategyOutcome::Declined(format!(
                "blend verdict {}: {}",
                verdict.decision,
                verdict.reasoning.join("; ")
            )));
        }

        let reason = format!(
            "blended {} splits resources {}/{} between {} and {} ({:.2}% quality change)",
            blended.proposal_id,
            partition[0].1.len(),
            partition[1].1.len(),
            partition[0].0,
            partition[1].0,
            verdict.quality_change_percent
        );
        Ok(StrategyOutcome::Resolved {
            outcome: ResolutionOutcome::Hybrid {
                blended: Box::new(blended),
                partition,
            },
            reason,
        })
    }
}

/// Run both, in priority then submission order
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

#[async_trait]
impl ResolutionStrategy for Sequential {
    fn kind(&self) -> ResolutionStrategyKind {
        ResolutionStrategyKind::Sequential
    }

    async fn attempt(&self, first: &Proposal, second: &Proposal) -> Result<StrategyOutcome, ConflictError> {
        let mut order = [first, second];
        order.sort_by_key(|p| p.sequencing_key());
        Ok(StrategyOutcome::Resolved {
            outcome: ResolutionOutcome::Sequential {
                order: order.iter().map(|p| p.proposal_id).collect(),
            },
            reason: format!(
                "{} runs to completion before {} acquires the shared resources",
                order[0].proposal_id, order[1].proposal_id
            ),
        })
    }
}
