//! Rollgate Store
//!
//! Persistence seams for the coordination core:
//!
//! - [`RecordStore`]: proposals, statuses, decisions, rollout executions and
//!   conflict records keyed by proposal id
//! - [`ObservationLog`]: append-only experiment observations
//! - [`AuditLog`]: SHA-256 hash-chained audit trail
//!
//! Only in-memory implementations ship here. [`InMemoryStore`] can be
//! snapshotted to JSON so a restarted process resumes from persisted state.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod audit;
pub mod error;
pub mod memory;
pub mod observations;

pub use audit::{AuditEntry, AuditKind, AuditLog};
pub use error::StoreError;
pub use memory::{InMemoryStore, StoreSnapshot};
pub use observations::{InMemoryObservationLog, ObservationLog};

use async_trait::async_trait;
use rollgate_model::{
    ConflictRecord, Proposal, ProposalId, ProposalStatus, RolloutExecution, ValidationDecision,
};

/// Durable store keyed by proposal id
///
/// Proposals are written once; decisions and conflict records are appended and
/// never mutated; rollout executions are upserted by their owner.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Register a new proposal with an initial status
    ///
    /// # Errors
    /// [`StoreError::Duplicate`] if the id already exists
    async fn insert_proposal(
        &self,
        proposal: Proposal,
        status: ProposalStatus,
    ) -> Result<(), StoreError>;

    /// Fetch a proposal
    async fn proposal(&self, id: ProposalId) -> Result<Option<Proposal>, StoreError>;

    /// Current status of a proposal
    async fn status(&self, id: ProposalId) -> Result<Option<ProposalStatus>, StoreError>;

    /// Atomically move a proposal to `next` if its status is one of `expected`
    ///
    /// Returns the previous status.
    ///
    /// # Errors
    /// - [`StoreError::NotFound`] for an unknown proposal
    /// - [`StoreError::StatusConflict`] if the current status is not expected
    async fn transition_status(
        &self,
        id: ProposalId,
        expected: &[ProposalStatus],
        next: ProposalStatus,
    ) -> Result<ProposalStatus, StoreError>;

    /// Proposals whose status is one of `statuses`, oldest submission first
    async fn proposals_with_status(
        &self,
        statuses: &[ProposalStatus],
    ) -> Result<Vec<Proposal>, StoreError>;

    /// Append a decision record
    async fn append_decision(&self, decision: ValidationDecision) -> Result<(), StoreError>;

    /// Every decision recorded for a proposal, oldest first
    async fn decisions(&self, id: ProposalId) -> Result<Vec<ValidationDecision>, StoreError>;

    /// Most recent decision for a proposal
    async fn latest_decision(
        &self,
        id: ProposalId,
    ) -> Result<Option<ValidationDecision>, StoreError> {
        Ok(self.decisions(id).await?.pop())
    }

    /// Insert or replace the rollout execution for its proposal
    async fn put_execution(&self, execution: RolloutExecution) -> Result<(), StoreError>;

    /// Rollout execution for a proposal
    async fn execution(&self, id: ProposalId) -> Result<Option<RolloutExecution>, StoreError>;

    /// Executions not yet in a terminal stage
    async fn active_executions(&self) -> Result<Vec<RolloutExecution>, StoreError>;

    /// Append a conflict record
    async fn append_conflict(&self, record: ConflictRecord) -> Result<(), StoreError>;

    /// Conflict records involving a proposal, oldest first
    async fn conflicts_for(&self, id: ProposalId) -> Result<Vec<ConflictRecord>, StoreError>;
}
