//! Orchestrator errors tagged by originating component

use crate::config::ConfigError;
use rollgate_conflict::ConflictError;
use rollgate_decision::DecisionError;
use rollgate_model::{AgentId, Decision, ProposalId, ProposalStatus, SourceError};
use rollgate_rollout::RolloutError;
use rollgate_stats::TrackerError;
use rollgate_store::StoreError;
use std::fmt;
use thiserror::Error;

/// Component an error originated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Orchestrator input checks and lifecycle rules
    Orchestrator,
    /// Experiment tracker
    ExperimentTracker,
    /// Decision engine
    DecisionEngine,
    /// Rollout state machine
    RolloutStateMachine,
    /// Conflict resolver
    ConflictResolver,
    /// Record store
    Store,
    /// Metric source
    MetricSource,
    /// Configuration
    Config,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Orchestrator => "orchestrator",
            Self::ExperimentTracker => "experiment_tracker",
            Self::DecisionEngine => "decision_engine",
            Self::RolloutStateMachine => "rollout_state_machine",
            Self::ConflictResolver => "conflict_resolver",
            Self::Store => "store",
            Self::MetricSource => "metric_source",
            Self::Config => "config",
        };
        f.write_str(s)
    }
}

/// Orchestrator error
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Experiment tracker failure
    #[error("experiment tracker: {0}")]
    Tracker(#[from] TrackerError),

    /// Decision engine failure
    #[error("decision engine: {0}")]
    Decision(#[from] DecisionError),

    /// Rollout state machine failure
    #[error("rollout: {0}")]
    Rollout(#[from] RolloutError),

    /// Conflict resolver failure
    #[error("conflict resolver: {0}")]
    Conflict(#[from] ConflictError),

    /// Store failure
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Metric source failure
    #[error("metric source: {0}")]
    Metrics(#[from] SourceError),

    /// Configuration failure
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Proposal failed input checks
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// Proposal id not registered
    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),

    /// Agent acting on another agent's proposal
    #[error("agent {agent_id} did not submit proposal {proposal_id}")]
    NotOwner {
        /// Proposal
        proposal_id: ProposalId,
        /// Calling agent
        agent_id: AgentId,
    },

    /// Operation not allowed in the proposal's current status
    #[error("cannot {operation} proposal {proposal_id} while it is {status}")]
    InvalidState {
        /// Proposal
        proposal_id: ProposalId,
        /// Current status
        status: ProposalStatus,
        /// Operation attempted
        operation: &'static str,
    },

    /// Operator verdict must be approve or reject
    #[error("operator verdict must be approve or reject, got {0}")]
    InvalidOperatorDecision(Decision),
}

impl OrchestratorError {
    /// Component the error originated in
    #[must_use]
    pub fn component(&self) -> Component {
        match self {
            Self::Tracker(_) => Component::ExperimentTracker,
            Self::Decision(_) => Component::DecisionEngine,
            Self::Rollout(_) => Component::RolloutStateMachine,
            Self::Conflict(_) => Component::ConflictResolver,
            Self::Store(_) => Component::Store,
            Self::Metrics(_) => Component::MetricSource,
            Self::Config(_) => Component::Config,
            Self::InvalidProposal(_)
            | Self::UnknownProposal(_)
            | Self::NotOwner { .. }
            | Self::InvalidState { .. }
            | Self::InvalidOperatorDecision(_) => Component::Orchestrator,
        }
    }

    /// Whether calling again might succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Tracker(e) => e.is_retryable(),
            Self::Rollout(e) => e.is_retryable(),
            Self::Store(e) => matches!(e, StoreError::Io(_)),
            Self::Metrics(e) => matches!(e, SourceError::Unavailable(_)),
            _ => false,
        }
    }

    /// Whether a human has to step in
    #[must_use]
    pub fn requires_human(&self) -> bool {
        match self {
            Self::Conflict(e) => e.requires_human(),
            Self::Store(StoreError::IntegrityViolation { .. }) => true,
            _ => false,
        }
    }
}
