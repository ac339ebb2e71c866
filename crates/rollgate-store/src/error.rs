//! Store errors

use rollgate_model::{ProposalId, ProposalStatus};
use thiserror::Error;

/// Record store and log failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Lookup key
        id: String,
    },

    /// Proposal already registered
    #[error("proposal already exists: {0}")]
    Duplicate(ProposalId),

    /// Compare-and-set on a status lost
    #[error("proposal {id} is {found}, expected one of {expected:?}")]
    StatusConflict {
        /// Proposal
        id: ProposalId,
        /// Status actually stored
        found: ProposalStatus,
        /// Statuses the caller accepted
        expected: Vec<ProposalStatus>,
    },

    /// Audit chain broken at an entry
    #[error("audit log integrity violation at sequence {sequence}")]
    IntegrityViolation {
        /// First entry that fails verification
        sequence: u64,
    },

    /// Snapshot file I/O
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot encoding
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Proposal lookup miss
    #[must_use]
    pub fn proposal_not_found(id: ProposalId) -> Self {
        Self::NotFound {
            kind: "proposal",
            id: id.to_string(),
        }
    }
}
