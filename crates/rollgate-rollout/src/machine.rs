//! Rollout state machine
//!
//! Every mutation reads the persisted [`RolloutExecution`] first, so an
//! `advance` retried after a crash re-derives its action from
//! `current_stage` instead of trusting in-memory state.

use crate::error::{ApplyError, ProbeError, RolloutError};
use crate::probe::{ConfigApplier, HealthProbe};
use crate::retry::{RetryError, RetryPolicy};
use crate::slo::{OkFlagPolicy, SloPolicy, SloVerdict};
use crate::transitions::validate_transition;
use chrono::Utc;
use dashmap::DashMap;
use rollgate_model::{
    Decision, HealthSnapshot, Proposal, ProposalId, ResourceId, RolloutExecution, RolloutStage,
    StageRecord,
};
use rollgate_store::{AuditKind, AuditLog, RecordStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Default per-attempt health probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Exclusive hold on one proposal's executions
///
/// On drop the per-proposal mutex is forgotten unless another caller is
/// waiting on it.
struct ProposalLock<'a> {
    locks: &'a DashMap<ProposalId, Arc<Mutex<()>>>,
    proposal_id: ProposalId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ProposalLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.proposal_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Drives approved proposals through the canary stages
pub struct RolloutStateMachine {
    store: Arc<dyn RecordStore>,
    probe: Arc<dyn HealthProbe>,
    applier: Arc<dyn ConfigApplier>,
    slo: Arc<dyn SloPolicy>,
    retry: RetryPolicy,
    probe_timeout: Duration,
    audit: Option<Arc<AuditLog>>,
    /// Serializes mutations per proposal
    locks: DashMap<ProposalId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for RolloutStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutStateMachine")
            .field("retry", &self.retry)
            .field("probe_timeout", &self.probe_timeout)
            .field("in_flight", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl RolloutStateMachine {
    /// Machine with the `ok`-flag SLO policy and default retry settings
    #[must_use]
    pub fn new(
        store: Arc<dyn RecordStore>,
        probe: Arc<dyn HealthProbe>,
        applier: Arc<dyn ConfigApplier>,
    ) -> Self {
        Self {
            store,
            probe,
            applier,
            slo: Arc::new(OkFlagPolicy),
            retry: RetryPolicy::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            audit: None,
            locks: DashMap::new(),
        }
    }

    /// Replace the SLO violation predicate
    #[must_use]
    pub fn with_slo_policy(mut self, slo: Arc<dyn SloPolicy>) -> Self {
        self.slo = slo;
        self
    }

    /// Replace the retry policy for probe and applier calls
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-attempt probe timeout
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Record every stage transition in `audit`
    #[must_use]
    pub fn with_audit_log(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Persisted execution for a proposal
    ///
    /// # Errors
    /// Store failures
    pub async fn execution(
        &self,
        proposal_id: ProposalId,
    ) -> Result<Option<RolloutExecution>, RolloutError> {
        Ok(self.store.execution(proposal_id).await?)
    }

    /// Create the execution for an approved proposal
    ///
    /// Calling `start` again returns the existing execution unchanged.
    ///
    /// # Errors
    /// - [`RolloutError::UnknownProposal`] if the proposal was never stored
    /// - [`RolloutError::NotApproved`] unless the latest decision is approve
    pub async fn start(&self, proposal_id: ProposalId) -> Result<RolloutExecution, RolloutError> {
        let _lock = self.lock(proposal_id).await;

        if let Some(existing) = self.store.execution(proposal_id).await? {
            debug!(%proposal_id, stage = %existing.current_stage, "rollout already started");
            return Ok(existing);
        }
        if self.store.proposal(proposal_id).await?.is_none() {
            return Err(RolloutError::UnknownProposal(proposal_id));
        }
        let decision = self
            .store
            .latest_decision(proposal_id)
            .await?
            .map(|d| d.decision);
        if decision != Some(Decision::Approve) {
            return Err(RolloutError::NotApproved {
                proposal_id,
                decision,
            });
        }

        let execution = RolloutExecution::new(proposal_id);
        self.store.put_execution(execution.clone()).await?;
        self.audit(proposal_id, "rollout started at not_started".to_string());
        info!(%proposal_id, stage = %execution.current_stage, "rollout started");
        Ok(execution)
    }

    /// Probe health and move one step forward, or roll back
    ///
    /// Returns the persisted execution after the step. A rollback is a
    /// normal outcome, not an error.
    ///
    /// # Errors
    /// - [`RolloutError::UnknownExecution`] if `start` was never called
    /// - [`RolloutError::TerminalState`] once completed or rolled back
    pub async fn advance(&self, proposal_id: ProposalId) -> Result<RolloutExecution, RolloutError> {
        let _lock = self.lock(proposal_id).await;

        let mut execution = self.load_active(proposal_id).await?;
        let proposal = self
            .store
            .proposal(proposal_id)
            .await?
            .ok_or(RolloutError::UnknownProposal(proposal_id))?;
        let from = execution.current_stage;
        let Some(next) = from.next() else {
            return Err(RolloutError::TerminalState {
                proposal_id,
                stage: from,
            });
        };
        validate_transition(from, next)?;

        let snapshot = self.check_health(&proposal.affected_resource_ids).await;
        let verdict = if snapshot.timed_out {
            SloVerdict::Violated(snapshot.reason().unwrap_or("health probe timed out").to_string())
        } else {
            self.slo.evaluate(&snapshot)
        };
        if let SloVerdict::Violated(reason) = verdict {
            return self
                .roll_back(execution, &proposal.affected_resource_ids, Some(snapshot), reason)
                .await;
        }

        if next != RolloutStage::Completed {
            if let Err(e) = self.apply_stage(&proposal, next).await {
                let reason = format!("failed to apply {next}: {e}");
                return self
                    .roll_back(execution, &proposal.affected_resource_ids, Some(snapshot), reason)
                    .await;
            }
        }

        record_transition(&mut execution, next, Some(snapshot), None);
        self.store.put_execution(execution.clone()).await?;
        self.audit(proposal_id, format!("{from} -> {next}"));
        info!(
            %proposal_id,
            from = %from,
            stage = %next,
            traffic_percent = next.traffic_percent(),
            "rollout advanced"
        );
        Ok(execution)
    }

    /// Force a rollback from any non-terminal stage
    ///
    /// # Errors
    /// - [`RolloutError::UnknownExecution`] if `start` was never called
    /// - [`RolloutError::TerminalState`] once completed or rolled back
    pub async fn abort(
        &self,
        proposal_id: ProposalId,
        reason: impl Into<String>,
    ) -> Result<RolloutExecution, RolloutError> {
        let _lock = self.lock(proposal_id).await;

        let execution = self.load_active(proposal_id).await?;
        let resources = self
            .store
            .proposal(proposal_id)
            .await?
            .map(|p| p.affected_resource_ids)
            .ok_or(RolloutError::UnknownProposal(proposal_id))?;
        self.roll_back(execution, &resources, None, format!("aborted: {}", reason.into()))
            .await
    }

    async fn load_active(&self, proposal_id: ProposalId) -> Result<RolloutExecution, RolloutError> {
        let execution = self
            .store
            .execution(proposal_id)
            .await?
            .ok_or(RolloutError::UnknownExecution(proposal_id))?;
        if execution.is_terminal() {
            return Err(RolloutError::TerminalState {
                proposal_id,
                stage: execution.current_stage,
            });
        }
        Ok(execution)
    }

    /// Probe with per-attempt timeout and retry. Never fails: errors become
    /// unhealthy snapshots.
    async fn check_health(&self, resources: &BTreeSet<ResourceId>) -> HealthSnapshot {
        let probe = &self.probe;
        let timeout = self.probe_timeout;
        let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        let result = self
            .retry
            .run("health_probe", move || async move {
                match tokio::time::timeout(timeout, probe.check(resources)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProbeError::Timeout { after_ms }),
                }
            })
            .await;

        match result {
            Ok(snapshot) => snapshot,
            Err(RetryError {
                error: ProbeError::Timeout { after_ms },
                ..
            }) => {
                warn!(after_ms, "health probe timed out, failing closed");
                HealthSnapshot::timed_out(after_ms)
            }
            Err(err) => {
                warn!(error = %err, "health probe failed, failing closed");
                HealthSnapshot::unhealthy(err.to_string())
            }
        }
    }

    async fn apply_stage(
        &self,
        proposal: &Proposal,
        stage: RolloutStage,
    ) -> Result<(), RetryError<ApplyError>> {
        let applier = &self.applier;
        let resources = &proposal.affected_resource_ids;
        let configuration = &proposal.proposed_configuration;
        let percent = stage.traffic_percent();
        self.retry
            .run("config_apply", move || async move {
                applier.apply(resources, configuration, percent).await
            })
            .await
    }

    async fn roll_back(
        &self,
        mut execution: RolloutExecution,
        resources: &BTreeSet<ResourceId>,
        snapshot: Option<HealthSnapshot>,
        reason: String,
    ) -> Result<RolloutExecution, RolloutError> {
        let proposal_id = execution.proposal_id;
        let from = execution.current_stage;
        validate_transition(from, RolloutStage::RolledBack)?;

        let applier = &self.applier;
        let note = match self
            .retry
            .run("config_revert", move || async move { applier.revert(resources).await })
            .await
        {
            Ok(()) => None,
            Err(e) => {
                error!(%proposal_id, error = %e, "revert failed, operator action required");
                Some(format!("revert failed: {e}"))
            }
        };

        execution.rollback_reason = Some(reason.clone());
        record_transition(&mut execution, RolloutStage::RolledBack, snapshot, note);
        self.store.put_execution(execution.clone()).await?;
        self.audit(proposal_id, format!("{from} -> rolled_back: {reason}"));
        warn!(%proposal_id, from = %from, %reason, "rollout rolled back");
        Ok(execution)
    }

    async fn lock(&self, proposal_id: ProposalId) -> ProposalLock<'_> {
        let mutex = self.locks.entry(proposal_id).or_default().clone();
        ProposalLock {
            locks: &self.locks,
            proposal_id,
            guard: Some(mutex.lock_owned().await),
        }
    }

    fn audit(&self, proposal_id: ProposalId, summary: String) {
        if let Some(audit) = &self.audit {
            audit.append(proposal_id, AuditKind::StageTransition, summary);
        }
    }
}

fn record_transition(
    execution: &mut RolloutExecution,
    to: RolloutStage,
    snapshot: Option<HealthSnapshot>,
    note: Option<String>,
) {
    let at = Utc::now();
    execution.health_snapshot_per_stage.push(StageRecord {
        from: execution.current_stage,
        to,
        snapshot,
        at,
        note,
    });
    execution.current_stage = to;
    execution.stage_started_at = at;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{MockConfigApplier, MockHealthProbe};
    use rollgate_model::{AgentId, PriorityClass, ResourceId, ValidationDecision};
    use rollgate_store::InMemoryStore;

    async fn approved(store: &InMemoryStore) -> ProposalId {
        let proposal = Proposal::builder(AgentId::new(), PriorityClass::Performance)
            .resource(ResourceId::new("db-1"))
            .build();
        let id = proposal.proposal_id;
        store
            .insert_proposal(proposal, rollgate_model::ProposalStatus::Approved)
            .await
            .unwrap();
        store
            .append_decision(ValidationDecision {
                proposal_id: id,
                decision: Decision::Approve,
                confidence: 0.9,
                quality_change_percent: 1.0,
                reasoning: vec!["test".into()],
                decided_at: Utc::now(),
            })
            .await
            .unwrap();
        id
    }

    fn machine(
        store: Arc<InMemoryStore>,
        probe: MockHealthProbe,
        applier: MockConfigApplier,
    ) -> RolloutStateMachine {
        RolloutStateMachine::new(store, Arc::new(probe), Arc::new(applier))
            .with_retry_policy(RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn healthy_advance_applies_canary_traffic() {
        let store = Arc::new(InMemoryStore::new());
        let id = approved(&store).await;

        let mut probe = MockHealthProbe::new();
        probe
            .expect_check()
            .times(1)
            .returning(|_| Ok(HealthSnapshot::healthy()));
        let mut applier = MockConfigApplier::new();
        applier
            .expect_apply()
            .withf(|resources, _, percent| resources.len() == 1 && *percent == 10)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let sm = machine(store, probe, applier);
        sm.start(id).await.unwrap();
        let exec = sm.advance(id).await.unwrap();
        assert_eq!(exec.current_stage, RolloutStage::Canary10);
        assert_eq!(exec.health_snapshot_per_stage.len(), 1);
    }

    #[tokio::test]
    async fn unhealthy_probe_reverts_and_rolls_back() {
        let store = Arc::new(InMemoryStore::new());
        let id = approved(&store).await;

        let mut probe = MockHealthProbe::new();
        probe
            .expect_check()
            .returning(|_| Ok(HealthSnapshot::unhealthy("error rate 12%")));
        let mut applier = MockConfigApplier::new();
        applier.expect_apply().never();
        applier.expect_revert().times(1).returning(|_| Ok(()));

        let sm = machine(store, probe, applier);
        sm.start(id).await.unwrap();
        let exec = sm.advance(id).await.unwrap();
        assert_eq!(exec.current_stage, RolloutStage::RolledBack);
        assert!(exec.rollback_reason.unwrap().contains("error rate 12%"));
    }

    #[tokio::test]
    async fn rejected_apply_rolls_back() {
        let store = Arc::new(InMemoryStore::new());
        let id = approved(&store).await;

        let mut probe = MockHealthProbe::new();
        probe.expect_check().returning(|_| Ok(HealthSnapshot::healthy()));
        let mut applier = MockConfigApplier::new();
        applier
            .expect_apply()
            .returning(|_, _, _| Err(ApplyError::Rejected("quota".into())));
        applier.expect_revert().times(1).returning(|_| Ok(()));

        let sm = machine(store, probe, applier);
        sm.start(id).await.unwrap();
        let exec = sm.advance(id).await.unwrap();
        assert_eq!(exec.current_stage, RolloutStage::RolledBack);
        assert!(exec.rollback_reason.unwrap().contains("quota"));
    }

    #[tokio::test]
    async fn failed_revert_is_noted_but_still_rolls_back() {
        let store = Arc::new(InMemoryStore::new());
        let id = approved(&store).await;

        let probe = MockHealthProbe::new();
        let mut applier = MockConfigApplier::new();
        applier
            .expect_revert()
            .returning(|_| Err(ApplyError::Rejected("locked".into())));

        let sm = machine(store, probe, applier);
        sm.start(id).await.unwrap();
        let exec = sm.abort(id, "operator").await.unwrap();
        assert_eq!(exec.current_stage, RolloutStage::RolledBack);
        let last = exec.health_snapshot_per_stage.last().unwrap();
        assert!(last.note.as_deref().unwrap().contains("revert failed"));
        assert_eq!(exec.rollback_reason.as_deref(), Some("aborted: operator"));
    }

    #[tokio::test]
    async fn start_requires_approval() {
        let store = Arc::new(InMemoryStore::new());
        let proposal = Proposal::builder(AgentId::new(), PriorityClass::Cost)
            .resource(ResourceId::new("db-1"))
            .build();
        let id = proposal.proposal_id;
        store
            .insert_proposal(proposal, rollgate_model::ProposalStatus::Pending)
            .await
            .unwrap();

        let sm = machine(store, MockHealthProbe::new(), MockConfigApplier::new());
        assert!(matches!(
            sm.start(id).await,
            Err(RolloutError::NotApproved { decision: None, .. })
        ));
        assert!(matches!(
            sm.advance(id).await,
            Err(RolloutError::UnknownExecution(_))
        ));
    }

    #[tokio::test]
    async fn finished_rollout_leaves_no_proposal_lock_behind() {
        let store = Arc::new(InMemoryStore::new());
        let id = approved(&store).await;

        let mut probe = MockHealthProbe::new();
        probe.expect_check().returning(|_| Ok(HealthSnapshot::healthy()));
        let mut applier = MockConfigApplier::new();
        applier.expect_apply().times(3).returning(|_, _, _| Ok(()));

        let sm = machine(store, probe, applier);
        sm.start(id).await.unwrap();
        let mut stage = RolloutStage::NotStarted;
        while !stage.is_terminal() {
            stage = sm.advance(id).await.unwrap().current_stage;
            assert!(sm.locks.is_empty());
        }
        assert_eq!(stage, RolloutStage::Completed);
        assert!(sm.advance(id).await.is_err());
        assert!(sm.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_advances_take_distinct_stages() {
        let store = Arc::new(InMemoryStore::new());
        let id = approved(&store).await;

        let mut probe = MockHealthProbe::new();
        probe.expect_check().returning(|_| Ok(HealthSnapshot::healthy()));
        let mut applier = MockConfigApplier::new();
        applier.expect_apply().times(2).returning(|_, _, _| Ok(()));

        let sm = Arc::new(machine(store, probe, applier));
        sm.start(id).await.unwrap();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let sm = Arc::clone(&sm);
                tokio::spawn(async move { sm.advance(id).await })
            })
            .collect();
        let mut stages = Vec::new();
        for handle in handles {
            stages.push(handle.await.unwrap().unwrap().current_stage);
        }
        stages.sort_by_key(|s| s.traffic_percent());
        assert_eq!(stages, vec![RolloutStage::Canary10, RolloutStage::Canary50]);
        assert!(sm.locks.is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let id = approved(&store).await;
        let sm = machine(store, MockHealthProbe::new(), MockConfigApplier::new());
        let first = sm.start(id).await.unwrap();
        let second = sm.start(id).await.unwrap();
        assert_eq!(first, second);
    }
}
