//! Rollout errors

use rollgate_model::{Decision, ProposalId, RolloutStage};
use rollgate_store::StoreError;
use thiserror::Error;

/// State machine errors
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Rollout requested for a proposal without an approve decision
    #[error("proposal {proposal_id} is not approved (latest decision: {decision:?})")]
    NotApproved {
        /// Proposal
        proposal_id: ProposalId,
        /// Latest decision, if any
        decision: Option<Decision>,
    },

    /// Advance or abort on a completed or rolled-back execution
    #[error("rollout of {proposal_id} is already {stage}")]
    TerminalState {
        /// Proposal
        proposal_id: ProposalId,
        /// Terminal stage
        stage: RolloutStage,
    },

    /// Transition not in the stage table
    #[error("illegal rollout transition {from} -> {to}")]
    IllegalTransition {
        /// Current stage
        from: RolloutStage,
        /// Requested stage
        to: RolloutStage,
    },

    /// No execution persisted for the proposal
    #[error("no rollout execution for proposal {0}")]
    UnknownExecution(ProposalId),

    /// Proposal record missing from the store
    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),

    /// Store failure
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl RolloutError {
    /// Invalid transition attempts are rejected, never retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Io(_)))
    }
}

/// Health probe failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// Probe backend unreachable or erroring
    #[error("health probe unavailable: {0}")]
    Unavailable(String),

    /// Probe did not answer within the timeout
    #[error("health probe timed out after {after_ms}ms")]
    Timeout {
        /// Timeout that elapsed
        after_ms: u64,
    },
}

/// Configuration applier failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// Target system temporarily unavailable
    #[error("config applier unavailable: {0}")]
    Unavailable(String),

    /// Target system refused the configuration
    #[error("config rejected: {0}")]
    Rejected(String),
}

/// Errors the retry combinator may retry
pub trait Transient {
    /// Whether another attempt might succeed
    fn is_transient(&self) -> bool;
}

impl Transient for ProbeError {
    fn is_transient(&self) -> bool {
        // Timeouts are fail-closed
        matches!(self, Self::Unavailable(_))
    }
}

impl Transient for ApplyError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
