//! In-memory [`RecordStore`]

use crate::{RecordStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rollgate_model::{
    ConflictRecord, Proposal, ProposalId, ProposalStatus, RolloutExecution, ValidationDecision,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProposalEntry {
    proposal: Proposal,
    status: ProposalStatus,
}

/// Concurrent in-memory store
///
/// Proposal-keyed maps use `DashMap` so writers on different proposals never
/// contend; conflict records are a single append-only vector.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    proposals: DashMap<ProposalId, ProposalEntry>,
    decisions: DashMap<ProposalId, Vec<ValidationDecision>>,
    executions: DashMap<ProposalId, RolloutExecution>,
    conflicts: RwLock<Vec<ConflictRecord>>,
}

/// Serializable copy of an [`InMemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    proposals: Vec<ProposalEntry>,
    decisions: Vec<ValidationDecision>,
    executions: Vec<RolloutExecution>,
    conflicts: Vec<ConflictRecord>,
}

impl StoreSnapshot {
    /// Number of proposals in the snapshot
    #[must_use]
    pub fn proposal_count(&self) -> usize {
        self.proposals.len()
    }
}

impl InMemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every record
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut proposals: Vec<_> = self.proposals.iter().map(|e| e.value().clone()).collect();
        proposals.sort_by_key(|e| e.proposal.proposal_id);

        let mut decisions: Vec<_> = self
            .decisions
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        decisions.sort_by_key(|d| (d.proposal_id, d.decided_at));

        let mut executions: Vec<_> = self.executions.iter().map(|e| e.value().clone()).collect();
        executions.sort_by_key(|e| e.proposal_id);

        StoreSnapshot {
            proposals,
            decisions,
            executions,
            conflicts: self.conflicts.read().clone(),
        }
    }

    /// Rebuild a store from a snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        for entry in snapshot.proposals {
            store.proposals.insert(entry.proposal.proposal_id, entry);
        }
        for decision in snapshot.decisions {
            store
                .decisions
                .entry(decision.proposal_id)
                .or_default()
                .push(decision);
        }
        for execution in snapshot.executions {
            store.executions.insert(execution.proposal_id, execution);
        }
        *store.conflicts.write() = snapshot.conflicts;
        store
    }

    /// Write a JSON snapshot to `path`
    ///
    /// # Errors
    /// I/O or serialization failure
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        std::fs::write(path.as_ref(), json)?;
        tracing::debug!(path = %path.as_ref().display(), "store snapshot written");
        Ok(())
    }

    /// Load a store from a JSON snapshot at `path`
    ///
    /// # Errors
    /// I/O or deserialization failure
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path.as_ref())?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        Ok(Self::from_snapshot(snapshot))
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn insert_proposal(
        &self,
        proposal: Proposal,
        status: ProposalStatus,
    ) -> Result<(), StoreError> {
        let id = proposal.proposal_id;
        match self.proposals.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Duplicate(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ProposalEntry { proposal, status });
                Ok(())
            }
        }
    }

    async fn proposal(&self, id: ProposalId) -> Result<Option<Proposal>, StoreError> {
        Ok(self.proposals.get(&id).map(|e| e.proposal.clone()))
    }

    async fn status(&self, id: ProposalId) -> Result<Option<ProposalStatus>, StoreError> {
        Ok(self.proposals.get(&id).map(|e| e.status))
    }

    async fn transition_status(
        &self,
        id: ProposalId,
        expected: &[ProposalStatus],
        next: ProposalStatus,
    ) -> Result<ProposalStatus, StoreError> {
        let mut entry = self
            .proposals
            .get_mut(&id)
            .ok_or_else(|| StoreError::proposal_not_found(id))?;
        let found = entry.status;
        if !expected.contains(&found) {
            return Err(StoreError::StatusConflict {
                id,
                found,
                expected: expected.to_vec(),
            });
        }
        entry.status = next;
        Ok(found)
    }

    async fn proposals_with_status(
        &self,
        statuses: &[ProposalStatus],
    ) -> Result<Vec<Proposal>, StoreError> {
        let mut matching: Vec<Proposal> = self
            .proposals
            .iter()
            .filter(|e| statuses.contains(&e.status))
            .map(|e| e.proposal.clone())
            .collect();
        matching.sort_by_key(|p| (p.submission_time, p.proposal_id));
        Ok(matching)
    }

    async fn append_decision(&self, decision: ValidationDecision) -> Result<(), StoreError> {
        if !self.proposals.contains_key(&decision.proposal_id) {
            return Err(StoreError::proposal_not_found(decision.proposal_id));
        }
        self.decisions
            .entry(decision.proposal_id)
            .or_default()
            .push(decision);
        Ok(())
    }

    async fn decisions(&self, id: ProposalId) -> Result<Vec<ValidationDecision>, StoreError> {
        Ok(self
            .decisions
            .get(&id)
            .map(|d| d.value().clone())
            .unwrap_or_default())
    }

    async fn put_execution(&self, execution: RolloutExecution) -> Result<(), StoreError> {
        self.executions.insert(execution.proposal_id, execution);
        Ok(())
    }

    async fn execution(&self, id: ProposalId) -> Result<Option<RolloutExecution>, StoreError> {
        Ok(self.executions.get(&id).map(|e| e.value().clone()))
    }

    async fn active_executions(&self) -> Result<Vec<RolloutExecution>, StoreError> {
        let mut active: Vec<_> = self
            .executions
            .iter()
            .filter(|e| !e.is_terminal())
            .map(|e| e.value().clone())
            .collect();
        active.sort_by_key(|e| e.proposal_id);
        Ok(active)
    }

    async fn append_conflict(&self, record: ConflictRecord) -> Result<(), StoreError> {
        self.conflicts.write().push(record);
        Ok(())
    }

    async fn conflicts_for(&self, id: ProposalId) -> Result<Vec<ConflictRecord>, StoreError> {
        Ok(self
            .conflicts
            .read()
            .iter()
            .filter(|c| c.involves(id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_model::{AgentId, PriorityClass};

    fn proposal() -> Proposal {
        Proposal::builder(AgentId::new(), PriorityClass::Performance)
            .resource("svc-a")
            .build()
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryStore::new();
        let p = proposal();
        store
            .insert_proposal(p.clone(), ProposalStatus::Pending)
            .await
            .unwrap();
        let err = store
            .insert_proposal(p, ProposalStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn transition_status_is_compare_and_set() {
        let store = InMemoryStore::new();
        let p = proposal();
        let id = p.proposal_id;
        store.insert_proposal(p, ProposalStatus::Pending).await.unwrap();

        let prev = store
            .transition_status(id, &[ProposalStatus::Pending], ProposalStatus::Withdrawn)
            .await
            .unwrap();
        assert_eq!(prev, ProposalStatus::Pending);

        let err = store
            .transition_status(id, &[ProposalStatus::Pending], ProposalStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatusConflict {
                found: ProposalStatus::Withdrawn,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn decision_requires_known_proposal() {
        let store = InMemoryStore::new();
        let decision = ValidationDecision {
            proposal_id: ProposalId::new(),
            decision: rollgate_model::Decision::Approve,
            confidence: 0.9,
            quality_change_percent: 0.0,
            reasoning: vec![],
            decided_at: chrono::Utc::now(),
        };
        assert!(matches!(
            store.append_decision(decision).await,
            Err(StoreError::NotFound { kind: "proposal", .. })
        ));
    }

    #[tokio::test]
    async fn active_executions_skip_terminal() {
        let store = InMemoryStore::new();
        let running = RolloutExecution::new(ProposalId::new());
        let mut done = RolloutExecution::new(ProposalId::new());
        done.current_stage = rollgate_model::RolloutStage::Completed;

        store.put_execution(running.clone()).await.unwrap();
        store.put_execution(done).await.unwrap();

        let active = store.active_executions().await.unwrap();
        assert_eq!(active, vec![running]);
    }
}
