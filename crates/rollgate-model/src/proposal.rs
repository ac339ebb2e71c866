//! Proposals and their coordinator-side lifecycle

use crate::config::ProposedConfiguration;
use crate::ids::{AgentId, ExperimentId, ProposalId, ResourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Priority of the concern a proposal addresses
///
/// Ordered lowest to highest, so `CustomerMandated > Safety > Performance > Cost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    /// Cost optimization
    Cost,
    /// Latency / throughput optimization
    Performance,
    /// Risk reduction
    Safety,
    /// Required by a customer agreement
    CustomerMandated,
}

impl PriorityClass {
    /// Whether `self` strictly outranks `other`
    #[inline]
    #[must_use]
    pub fn dominates(self, other: Self) -> bool {
        self > other
    }

    /// All classes, lowest first
    #[must_use]
    pub fn all() -> [Self; 4] {
        [
            Self::Cost,
            Self::Performance,
            Self::Safety,
            Self::CustomerMandated,
        ]
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cost => "cost",
            Self::Performance => "performance",
            Self::Safety => "safety",
            Self::CustomerMandated => "customer_mandated",
        };
        f.write_str(name)
    }
}

/// Candidate configuration change submitted by an agent
///
/// Immutable once created; a modified change is a new proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique ID
    pub proposal_id: ProposalId,
    /// Agent that submitted the change
    pub originating_agent_id: AgentId,
    /// Resources the change touches
    pub affected_resource_ids: BTreeSet<ResourceId>,
    /// The change itself
    pub proposed_configuration: ProposedConfiguration,
    /// Expected impact, e.g. cost delta or latency delta (negative = reduction)
    pub predicted_impact: f64,
    /// Concern addressed
    pub priority_class: PriorityClass,
    /// Submission time
    pub submission_time: DateTime<Utc>,
    /// Experiment that validates the change, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<ExperimentId>,
    /// Proposals this one replaces (set on blended proposals)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<ProposalId>,
}

impl Proposal {
    /// Start building a proposal
    #[inline]
    #[must_use]
    pub fn builder(agent: AgentId, priority_class: PriorityClass) -> ProposalBuilder {
        ProposalBuilder::new(agent, priority_class)
    }

    /// Whether the two proposals touch at least one common resource
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        !self
            .affected_resource_ids
            .is_disjoint(&other.affected_resource_ids)
    }

    /// Resources touched by both proposals
    #[must_use]
    pub fn shared_resources(&self, other: &Self) -> BTreeSet<ResourceId> {
        self.affected_resource_ids
            .intersection(&other.affected_resource_ids)
            .cloned()
            .collect()
    }

    /// Ordering key used for sequential execution: priority first, then age
    #[must_use]
    pub fn sequencing_key(&self) -> (std::cmp::Reverse<PriorityClass>, DateTime<Utc>, ProposalId) {
        (
            std::cmp::Reverse(self.priority_class),
            self.submission_time,
            self.proposal_id,
        )
    }
}

/// Builder for [`Proposal`]
#[derive(Debug, Clone)]
pub struct ProposalBuilder {
    proposal_id: ProposalId,
    agent: AgentId,
    resources: BTreeSet<ResourceId>,
    configuration: ProposedConfiguration,
    predicted_impact: f64,
    priority_class: PriorityClass,
    submission_time: Option<DateTime<Utc>>,
    experiment_id: Option<ExperimentId>,
    supersedes: Vec<ProposalId>,
}

impl ProposalBuilder {
    /// New builder with an empty configuration
    #[must_use]
    pub fn new(agent: AgentId, priority_class: PriorityClass) -> Self {
        Self {
            proposal_id: ProposalId::new(),
            agent,
            resources: BTreeSet::new(),
            configuration: ProposedConfiguration::default(),
            predicted_impact: 0.0,
            priority_class,
            submission_time: None,
            experiment_id: None,
            supersedes: Vec::new(),
        }
    }

    /// Use a fixed ID
    #[must_use]
    pub fn id(mut self, id: ProposalId) -> Self {
        self.proposal_id = id;
        self
    }

    /// Add an affected resource
    #[must_use]
    pub fn resource(mut self, resource: impl Into<ResourceId>) -> Self {
        self.resources.insert(resource.into());
        self
    }

    /// Add several affected resources
    #[must_use]
    pub fn resources<I, R>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ResourceId>,
    {
        self.resources.extend(resources.into_iter().map(Into::into));
        self
    }

    /// Set the configuration change
    #[must_use]
    pub fn configuration(mut self, configuration: ProposedConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Set the predicted impact
    #[must_use]
    pub fn predicted_impact(mut self, impact: f64) -> Self {
        self.predicted_impact = impact;
        self
    }

    /// Set the submission time (defaults to now)
    #[must_use]
    pub fn submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submission_time = Some(at);
        self
    }

    /// Attach an experiment
    #[must_use]
    pub fn experiment(mut self, experiment_id: ExperimentId) -> Self {
        self.experiment_id = Some(experiment_id);
        self
    }

    /// Mark the proposals this one replaces
    #[must_use]
    pub fn supersedes(mut self, ids: Vec<ProposalId>) -> Self {
        self.supersedes = ids;
        self
    }

    /// Finish the proposal
    #[must_use]
    pub fn build(self) -> Proposal {
        Proposal {
            proposal_id: self.proposal_id,
            originating_agent_id: self.agent,
            affected_resource_ids: self.resources,
            proposed_configuration: self.configuration,
            predicted_impact: self.predicted_impact,
            priority_class: self.priority_class,
            submission_time: self.submission_time.unwrap_or_else(Utc::now),
            experiment_id: self.experiment_id,
            supersedes: self.supersedes,
        }
    }
}

/// Where a proposal sits in the coordination pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Registered, not yet decided
    Pending,
    /// Waiting for its experiment to reach the minimum sample size
    Deferred,
    /// Held for a human operator
    ManualReview,
    /// Approved, rollout not yet created
    Approved,
    /// Approved, waiting for resource locks held by another rollout
    Queued,
    /// Rollout in progress
    RollingOut,
    /// Rollout finished at 100%
    Completed,
    /// Rollout reverted
    RolledBack,
    /// Rejected by validation
    Rejected,
    /// Replaced by a higher-priority or blended proposal
    Superseded,
    /// Withdrawn by its agent before a decision
    Withdrawn,
}

impl ProposalStatus {
    /// Still competing for resources (conflict detection looks at these)
    #[inline]
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending | Self::Deferred)
    }

    /// No further coordinator action will happen
    #[inline]
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::RolledBack | Self::Rejected | Self::Superseded | Self::Withdrawn
        )
    }

    /// Whether an agent may still withdraw the proposal
    #[inline]
    #[must_use]
    pub fn is_withdrawable(self) -> bool {
        matches!(self, Self::Pending | Self::Deferred)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Deferred => "deferred",
            Self::ManualReview => "manual_review",
            Self::Approved => "approved",
            Self::Queued => "queued",
            Self::RollingOut => "rolling_out",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
            Self::Superseded => "superseded",
            Self::Withdrawn => "withdrawn",
        };
        f.write_str(s)
    }
}
