//! Conflict resolution errors

use rollgate_model::{ConflictRecord, ProposalId, ResolutionStrategyKind};
use rollgate_store::StoreError;
use thiserror::Error;

/// Conflict resolver errors
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Every enabled strategy declined; the record carries each reason
    #[error("conflict {} between {:?} is unresolvable", .record.id, .record.conflicting_proposal_ids)]
    Unresolvable {
        /// Unresolved record with the decline reasons appended
        record: Box<ConflictRecord>,
    },

    /// A conflict record must name exactly two proposals
    #[error("malformed conflict record: {0}")]
    MalformedRecord(String),

    /// Record already resolved
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(rollgate_model::ConflictId),

    /// Referenced proposal missing from the store
    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),

    /// Hybrid split outside `1..=99`
    #[error("hybrid split must be within 1..=99 percent, got {0}")]
    InvalidSplit(u8),

    /// Strategy chain with no entries or duplicates
    #[error("invalid strategy chain: {0}")]
    InvalidChain(String),

    /// Strategy failed outright (as opposed to declining)
    #[error("{strategy} failed: {message}")]
    Strategy {
        /// Failing strategy
        strategy: ResolutionStrategyKind,
        /// Failure description
        message: String,
    },

    /// Store failure
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl ConflictError {
    /// Whether a human has to step in
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::Unresolvable { .. })
    }
}
