//! Coordination orchestrator
//!
//! Single entry point for agents. A submission moves through:
//!
//! 1. registration (`Pending`)
//! 2. conflict settlement against other pending proposals, under a
//!    per-resource gate
//! 3. validation: experiment result or metric samples fed to the decision
//!    engine (`Deferred` while an experiment is short of samples)
//! 4. decision persistence and notification
//! 5. on approve, resource lock acquisition and rollout start (`RollingOut`),
//!    or a place in the lock queue (`Queued`)
//!
//! Rollouts advance on [`CoordinationOrchestrator::tick`], normally driven by
//! [`CoordinationOrchestrator::spawn_scheduler`].

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rollgate_conflict::{ConflictError, ConflictResolver, LockOutcome, ResourceGate, ResourceLockTable};
use rollgate_decision::DecisionEngine;
use rollgate_model::{
    AgentId, ConflictRecord, Decision, ExperimentId, Group, MetricSource, Notification,
    NotificationSink, Proposal, ProposalId, ProposalStatus, ResolutionOutcome, ResourceId,
    RolloutExecution, RolloutStage, SourceError, ValidationDecision,
};
use rollgate_rollout::{ConfigApplier, HealthProbe, RolloutStateMachine, SloPolicy};
use rollgate_stats::{ExperimentStatus, ExperimentTracker, PendingCounts, StatisticalComparator};
use rollgate_store::{
    AuditEntry, AuditKind, AuditLog, InMemoryStore, ObservationLog, RecordStore, StoreError,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Statuses that still compete for resources during conflict detection
const CONTENDING: [ProposalStatus; 2] = [ProposalStatus::Pending, ProposalStatus::Deferred];

/// Result of [`CoordinationOrchestrator::submit`] and
/// [`CoordinationOrchestrator::poll`]
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// A decision was recorded
    ///
    /// After a hybrid blend the decision concerns the blended proposal, whose
    /// `supersedes` list names the submitted one.
    Decided(ValidationDecision),
    /// The linked experiment is still collecting; poll later
    Deferred {
        /// Proposal waiting on its experiment
        proposal_id: ProposalId,
        /// Samples collected so far
        pending: PendingCounts,
    },
}

impl SubmitOutcome {
    /// The decision, if one was recorded
    #[must_use]
    pub fn decision(&self) -> Option<&ValidationDecision> {
        match self {
            Self::Decided(decision) => Some(decision),
            Self::Deferred { .. } => None,
        }
    }

    /// Proposal the outcome concerns
    #[must_use]
    pub fn proposal_id(&self) -> ProposalId {
        match self {
            Self::Decided(decision) => decision.proposal_id,
            Self::Deferred { proposal_id, .. } => *proposal_id,
        }
    }

    /// Whether validation is waiting on an experiment
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred { .. })
    }
}

/// Everything recorded about one proposal
#[derive(Debug, Clone, PartialEq)]
pub struct AuditTrail {
    /// The proposal as submitted
    pub proposal: Proposal,
    /// Current status
    pub status: ProposalStatus,
    /// Decisions, oldest first
    pub decisions: Vec<ValidationDecision>,
    /// Conflict records involving the proposal
    pub conflicts: Vec<ConflictRecord>,
    /// Rollout execution, once started
    pub execution: Option<RolloutExecution>,
    /// Audit log entries for the proposal
    pub entries: Vec<AuditEntry>,
}

/// Summary of one scheduler tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rollouts stepped
    pub advanced: usize,
    /// Rollouts that reached `completed`
    pub completed: Vec<ProposalId>,
    /// Rollouts that reached `rolled_back`
    pub rolled_back: Vec<ProposalId>,
    /// Queued proposals whose rollout started
    pub started: Vec<ProposalId>,
    /// Advances that failed, with the error text
    pub failed: Vec<(ProposalId, String)>,
    /// Restored rollouts held back because another rollout holds their resources
    pub contended: Vec<ProposalId>,
}

/// Notification sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, agent_id: AgentId, payload: Notification) {
        let kind = match &payload {
            Notification::Decision(_) => "decision",
            Notification::ConflictResolved(_) => "conflict_resolved",
            Notification::RolloutFinished { .. } => "rollout_finished",
        };
        debug!(%agent_id, kind, "notification");
    }
}

/// Handle to a running scheduler loop
#[derive(Debug)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Token that stops the loop when cancelled
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether shutdown was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the loop and wait for the in-flight tick to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}

enum Settled {
    Proceed(Proposal),
    Decided(ValidationDecision),
}

/// Builder for [`CoordinationOrchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    metrics: Arc<dyn MetricSource>,
    probe: Arc<dyn HealthProbe>,
    applier: Arc<dyn ConfigApplier>,
    store: Option<Arc<dyn RecordStore>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    slo: Option<Arc<dyn SloPolicy>>,
    observation_log: Option<Arc<dyn ObservationLog>>,
    audit: Option<Arc<AuditLog>>,
}

impl OrchestratorBuilder {
    /// Use `config` instead of the defaults
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist records in `store` (default: a fresh [`InMemoryStore`])
    #[must_use]
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deliver agent notifications through `notifier` (default: [`TracingSink`])
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// SLO predicate for rollout health checks
    #[must_use]
    pub fn slo_policy(mut self, slo: Arc<dyn SloPolicy>) -> Self {
        self.slo = Some(slo);
        self
    }

    /// Mirror experiment observations into `log`
    #[must_use]
    pub fn observation_log(mut self, log: Arc<dyn ObservationLog>) -> Self {
        self.observation_log = Some(log);
        self
    }

    /// Share an existing audit log
    #[must_use]
    pub fn audit_log(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate the configuration and wire the components
    ///
    /// # Errors
    /// [`OrchestratorError::Config`] for an invalid configuration, or the
    /// component error rejecting its section
    pub fn build(self) -> Result<CoordinationOrchestrator, OrchestratorError> {
        let config = self.config;
        config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn RecordStore>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingSink) as Arc<dyn NotificationSink>);
        let audit = self.audit.unwrap_or_default();

        let comparator = StatisticalComparator::new(config.experiment.significance_level)
            .map_err(rollgate_stats::TrackerError::from)?;
        let mut tracker = ExperimentTracker::new(comparator)
            .with_default_min_sample_size(config.experiment.min_sample_size);
        if let Some(log) = self.observation_log {
            tracker = tracker.with_observation_log(log);
        }

        let engine = DecisionEngine::new(config.decision.clone())?;
        let resolver = ConflictResolver::from_config(
            &config.conflict,
            Arc::clone(&store),
            Arc::clone(&self.metrics),
            engine.clone(),
        )?
        .with_notifier(Arc::clone(&notifier));

        let mut rollout = RolloutStateMachine::new(Arc::clone(&store), self.probe, self.applier)
            .with_retry_policy(config.rollout.retry.clone())
            .with_probe_timeout(config.rollout.probe_timeout())
            .with_audit_log(Arc::clone(&audit));
        if let Some(slo) = self.slo {
            rollout = rollout.with_slo_policy(slo);
        }

        info!(
            strategies = ?resolver.strategies(),
            min_sample_size = config.experiment.min_sample_size,
            poll_interval_secs = config.rollout.poll_interval_secs,
            "orchestrator ready"
        );
        Ok(CoordinationOrchestrator {
            config,
            store,
            tracker,
            engine,
            resolver,
            rollout,
            metrics: self.metrics,
            notifier,
            audit,
            locks: ResourceLockTable::new(),
            gate: ResourceGate::new(),
        })
    }
}

/// Top-level coordinator for agent proposals
pub struct CoordinationOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn RecordStore>,
    tracker: ExperimentTracker,
    engine: DecisionEngine,
    resolver: ConflictResolver,
    rollout: RolloutStateMachine,
    metrics: Arc<dyn MetricSource>,
    notifier: Arc<dyn NotificationSink>,
    audit: Arc<AuditLog>,
    locks: ResourceLockTable,
    gate: ResourceGate,
}

impl std::fmt::Debug for CoordinationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationOrchestrator")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("rollout", &self.rollout)
            .field("lock_holders", &self.locks.holder_count())
            .finish_non_exhaustive()
    }
}

impl CoordinationOrchestrator {
    /// Start building an orchestrator around the three external systems
    #[must_use]
    pub fn builder(
        metrics: Arc<dyn MetricSource>,
        probe: Arc<dyn HealthProbe>,
        applier: Arc<dyn ConfigApplier>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: OrchestratorConfig::default(),
            metrics,
            probe,
            applier,
            store: None,
            notifier: None,
            slo: None,
            observation_log: None,
            audit: None,
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Experiment registry
    #[must_use]
    pub fn tracker(&self) -> &ExperimentTracker {
        &self.tracker
    }

    /// Shared audit log
    #[must_use]
    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Proposal currently holding `resource` for a rollout
    #[must_use]
    pub fn lock_holder(&self, resource: &ResourceId) -> Option<ProposalId> {
        self.locks.holder_of(resource)
    }

    /// Submit a proposal and carry it as far as it can go
    ///
    /// # Errors
    /// - [`OrchestratorError::InvalidProposal`] for an empty resource set,
    ///   non-finite impact or malformed configuration
    /// - the tagged error of whichever component failed; the proposal and any
    ///   resolved conflicts stay recorded
    pub async fn submit(&self, proposal: Proposal) -> Result<SubmitOutcome, OrchestratorError> {
        check_proposal(&proposal)?;
        let proposal_id = proposal.proposal_id;
        self.store
            .insert_proposal(proposal.clone(), ProposalStatus::Pending)
            .await?;
        self.audit.append(
            proposal_id,
            AuditKind::Submission,
            format!(
                "submitted by {} as {} on {} resource(s)",
                proposal.originating_agent_id,
                proposal.priority_class,
                proposal.affected_resource_ids.len()
            ),
        );
        info!(
            %proposal_id,
            agent_id = %proposal.originating_agent_id,
            priority = %proposal.priority_class,
            resources = proposal.affected_resource_ids.len(),
            "proposal submitted"
        );

        match self.settle_conflicts(proposal).await? {
            Settled::Proceed(candidate) => self.validate(&candidate).await,
            Settled::Decided(decision) => Ok(SubmitOutcome::Decided(decision)),
        }
    }

    /// Re-run validation for a deferred (or still pending) proposal
    ///
    /// A proposal that already has a decision returns its latest one.
    ///
    /// # Errors
    /// - [`OrchestratorError::UnknownProposal`]
    /// - [`OrchestratorError::InvalidState`] for a proposal that left the
    ///   pipeline without a decision (withdrawn or superseded)
    pub async fn poll(&self, proposal_id: ProposalId) -> Result<SubmitOutcome, OrchestratorError> {
        let proposal = self.load(proposal_id).await?;
        let status = self.status_of(proposal_id).await?;
        if CONTENDING.contains(&status) {
            return self.validate(&proposal).await;
        }
        match self.store.latest_decision(proposal_id).await? {
            Some(decision) => Ok(SubmitOutcome::Decided(decision)),
            None => Err(OrchestratorError::InvalidState {
                proposal_id,
                status,
                operation: "poll",
            }),
        }
    }

    /// Withdraw a proposal that has no decision yet
    ///
    /// # Errors
    /// - [`OrchestratorError::NotOwner`] unless `agent_id` submitted it
    /// - [`OrchestratorError::InvalidState`] once a decision exists or the
    ///   proposal was superseded; only rollback is possible after a decision
    pub async fn withdraw(
        &self,
        proposal_id: ProposalId,
        agent_id: AgentId,
    ) -> Result<(), OrchestratorError> {
        let proposal = self.load(proposal_id).await?;
        if proposal.originating_agent_id != agent_id {
            return Err(OrchestratorError::NotOwner {
                proposal_id,
                agent_id,
            });
        }
        match self
            .store
            .transition_status(proposal_id, &CONTENDING, ProposalStatus::Withdrawn)
            .await
        {
            Ok(_) => {}
            Err(StoreError::StatusConflict { found, .. }) => {
                return Err(OrchestratorError::InvalidState {
                    proposal_id,
                    status: found,
                    operation: "withdraw",
                })
            }
            Err(e) => return Err(e.into()),
        }
        self.audit.append(
            proposal_id,
            AuditKind::Withdrawal,
            format!("withdrawn by {agent_id}"),
        );
        info!(%proposal_id, %agent_id, "proposal withdrawn");
        Ok(())
    }

    /// Register an experiment with the tracker
    ///
    /// `min_sample_size` falls back to the configured default.
    ///
    /// # Errors
    /// Tracker registration errors
    pub fn register_experiment(
        &self,
        experiment_id: ExperimentId,
        metric_name: impl Into<String>,
        min_sample_size: Option<usize>,
    ) -> Result<(), OrchestratorError> {
        match min_sample_size {
            Some(n) => self.tracker.register(experiment_id, metric_name, n)?,
            None => self.tracker.register_default(experiment_id, metric_name)?,
        }
        Ok(())
    }

    /// Ingest one experiment observation
    ///
    /// # Errors
    /// Tracker errors (unknown experiment, non-finite value)
    pub fn record_observation(
        &self,
        experiment_id: ExperimentId,
        group: Group,
        value: f64,
    ) -> Result<(), OrchestratorError> {
        Ok(self.tracker.add_observation(experiment_id, group, value)?)
    }

    /// Ingest one observation with a textual group name
    ///
    /// # Errors
    /// Tracker errors, including an unrecognized group
    pub fn record_named_observation(
        &self,
        experiment_id: ExperimentId,
        group: &str,
        value: f64,
    ) -> Result<(), OrchestratorError> {
        Ok(self.tracker.add_named_observation(experiment_id, group, value)?)
    }

    /// Advance every active rollout once
    ///
    /// Terminal rollouts release their resource locks and queued proposals
    /// start in priority order. A failed advance is reported, not raised;
    /// the next tick retries it from the persisted stage.
    ///
    /// # Errors
    /// Store failures
    pub async fn tick(&self) -> Result<TickReport, OrchestratorError> {
        let mut report = TickReport::default();
        let mut active = self.store.active_executions().await?;

        // Locks live in memory; reclaim them for executions loaded from a store
        let mut contended = HashSet::new();
        for execution in &active {
            let proposal_id = execution.proposal_id;
            if self.locks.holds(proposal_id) {
                continue;
            }
            let proposal = self.load(proposal_id).await?;
            let was_waiting = self.locks.waiting().contains(&proposal_id);
            if let LockOutcome::Queued { blocked_by, .. } = self.locks.try_acquire(&proposal) {
                if !was_waiting {
                    warn!(
                        %proposal_id,
                        ?blocked_by,
                        "active rollout could not reclaim its resources, advance held back"
                    );
                }
                contended.insert(proposal_id);
            }
        }
        active.retain(|execution| !contended.contains(&execution.proposal_id));
        report.contended = contended.into_iter().collect();
        report.contended.sort();

        let steps = join_all(active.iter().map(|execution| {
            let proposal_id = execution.proposal_id;
            async move { (proposal_id, self.rollout.advance(proposal_id).await) }
        }))
        .await;

        for (proposal_id, step) in steps {
            match step {
                Ok(execution) => {
                    report.advanced += 1;
                    if execution.is_terminal() {
                        self.finish_rollout(&execution, &mut report).await?;
                    }
                }
                Err(e) => {
                    warn!(%proposal_id, error = %e, "rollout advance failed");
                    report.failed.push((proposal_id, e.to_string()));
                }
            }
        }

        self.start_queued(&mut report).await?;
        debug!(
            advanced = report.advanced,
            completed = report.completed.len(),
            rolled_back = report.rolled_back.len(),
            started = report.started.len(),
            "tick finished"
        );
        Ok(report)
    }

    /// Run [`Self::tick`] every `interval` until the handle is shut down
    ///
    /// The first tick runs immediately.
    #[must_use]
    pub fn spawn_scheduler(self: &Arc<Self>, interval: Duration) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let orchestrator = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?interval, "scheduler started");
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = orchestrator.tick().await {
                            warn!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
            info!("scheduler stopped");
        });

        SchedulerHandle { cancel, task }
    }

    /// Scheduler on the configured poll interval
    #[must_use]
    pub fn spawn_default_scheduler(self: &Arc<Self>) -> SchedulerHandle {
        self.spawn_scheduler(self.config.rollout.poll_interval())
    }

    /// Force a rollout back from any non-terminal stage
    ///
    /// # Errors
    /// Rollout errors ([`rollgate_rollout::RolloutError::TerminalState`] once
    /// finished) and store failures
    pub async fn rollback(
        &self,
        proposal_id: ProposalId,
        reason: impl Into<String>,
    ) -> Result<RolloutExecution, OrchestratorError> {
        let execution = self.rollout.abort(proposal_id, reason).await?;
        let mut report = TickReport::default();
        self.finish_rollout(&execution, &mut report).await?;
        self.start_queued(&mut report).await?;
        Ok(execution)
    }

    /// Proposals held for an operator, oldest first
    ///
    /// # Errors
    /// Store failures
    pub async fn manual_review_queue(&self) -> Result<Vec<Proposal>, OrchestratorError> {
        Ok(self
            .store
            .proposals_with_status(&[ProposalStatus::ManualReview])
            .await?)
    }

    /// Record an operator verdict on a held proposal and carry on
    ///
    /// The held decision stays in the record; the override is appended.
    ///
    /// # Errors
    /// - [`OrchestratorError::InvalidOperatorDecision`] for `manual_review`
    /// - [`OrchestratorError::InvalidState`] unless the proposal is held
    pub async fn resolve_manual_review(
        &self,
        proposal_id: ProposalId,
        decision: Decision,
        operator_note: impl Into<String>,
    ) -> Result<ValidationDecision, OrchestratorError> {
        let next = match decision {
            Decision::Approve => ProposalStatus::Approved,
            Decision::Reject => ProposalStatus::Rejected,
            Decision::ManualReview => return Err(OrchestratorError::InvalidOperatorDecision(decision)),
        };
        let proposal = self.load(proposal_id).await?;
        let previous = self.store.latest_decision(proposal_id).await?;

        match self
            .store
            .transition_status(proposal_id, &[ProposalStatus::ManualReview], next)
            .await
        {
            Ok(_) => {}
            Err(StoreError::StatusConflict { found, .. }) => {
                return Err(OrchestratorError::InvalidState {
                    proposal_id,
                    status: found,
                    operation: "resolve manual review of",
                })
            }
            Err(e) => return Err(e.into()),
        }

        let note = operator_note.into();
        let record = match &previous {
            Some(previous) => ValidationDecision::operator_override(previous, decision, note),
            None => ValidationDecision {
                proposal_id,
                decision,
                confidence: 1.0,
                quality_change_percent: 0.0,
                reasoning: vec![format!("operator decision: {decision}: {note}")],
                decided_at: Utc::now(),
            },
        };
        self.store.append_decision(record.clone()).await?;
        self.audit.append(
            proposal_id,
            AuditKind::OperatorOverride,
            format!("operator resolved manual review as {decision}"),
        );
        info!(%proposal_id, %decision, "manual review resolved");
        self.notifier
            .notify(proposal.originating_agent_id, Notification::Decision(record.clone()))
            .await;

        if record.is_approved() {
            self.launch(&proposal).await?;
        }
        Ok(record)
    }

    /// Decisions, conflicts, rollout state and audit entries for a proposal
    ///
    /// # Errors
    /// [`OrchestratorError::UnknownProposal`] and store failures
    pub async fn audit_trail(&self, proposal_id: ProposalId) -> Result<AuditTrail, OrchestratorError> {
        let proposal = self.load(proposal_id).await?;
        Ok(AuditTrail {
            proposal,
            status: self.status_of(proposal_id).await?,
            decisions: self.store.decisions(proposal_id).await?,
            conflicts: self.store.conflicts_for(proposal_id).await?,
            execution: self.store.execution(proposal_id).await?,
            entries: self.audit.entries_for(proposal_id),
        })
    }

    /// Current status of a proposal
    ///
    /// # Errors
    /// [`OrchestratorError::UnknownProposal`] and store failures
    pub async fn status(&self, proposal_id: ProposalId) -> Result<ProposalStatus, OrchestratorError> {
        self.status_of(proposal_id).await
    }

    // -----------------------------------------------------------------------
    // Conflict settlement
    // -----------------------------------------------------------------------

    /// Resolve every conflict between `candidate` and the pending set
    ///
    /// The gate covers the candidate's resources plus those of every
    /// overlapping pending proposal, so concurrent submissions touching any of
    /// them see a consistent pending set.
    async fn settle_conflicts(&self, mut candidate: Proposal) -> Result<Settled, OrchestratorError> {
        let mut scope = candidate.affected_resource_ids.clone();
        let _guard = loop {
            let guard = self.gate.lock(&scope).await;
            let rivals = self.rivals(&candidate, &HashSet::new()).await?;
            let mut needed = scope.clone();
            needed.extend(resources_of(&rivals));
            if needed == scope {
                break guard;
            }
            drop(guard);
            scope = needed;
        };

        let mut sequenced: HashSet<ProposalId> = HashSet::new();
        loop {
            let rivals = self.rivals(&candidate, &sequenced).await?;
            let Some(conflict) = self
                .resolver
                .detect_against(&candidate, &rivals)
                .into_iter()
                .next()
            else {
                return Ok(Settled::Proceed(candidate));
            };

            let record = match self.resolver.resolve(conflict).await {
                Ok(record) => record,
                Err(ConflictError::Unresolvable { record }) => {
                    self.store.append_conflict((*record).clone()).await?;
                    self.audit_conflict(&record, "unresolved, held for operator");
                    let decision = self.hold_for_review(&candidate, &record).await?;
                    return Ok(Settled::Decided(decision));
                }
                Err(e) => return Err(e.into()),
            };
            self.store.append_conflict(record.clone()).await?;
            let strategy = record
                .resolution_strategy
                .map_or_else(|| "unknown".to_string(), |s| s.to_string());
            self.audit_conflict(&record, &format!("resolved by {strategy}"));

            match record.resolution_outcome.clone() {
                Some(ResolutionOutcome::PriorityOverride { winner, loser }) => {
                    self.supersede(loser, winner).await?;
                    if loser == candidate.proposal_id {
                        let decision = self.discard(&candidate, winner, &record).await?;
                        return Ok(Settled::Decided(decision));
                    }
                }
                Some(ResolutionOutcome::Hybrid { blended, .. }) => {
                    let blended = *blended;
                    for original in &blended.supersedes {
                        self.supersede(*original, blended.proposal_id).await?;
                    }
                    self.store
                        .insert_proposal(blended.clone(), ProposalStatus::Pending)
                        .await?;
                    self.audit.append(
                        blended.proposal_id,
                        AuditKind::Submission,
                        format!("blended from {:?}", blended.supersedes),
                    );
                    info!(
                        proposal_id = %blended.proposal_id,
                        supersedes = ?blended.supersedes,
                        "blended proposal registered"
                    );
                    candidate = blended;
                }
                // Persisted order is enforced at launch
                Some(ResolutionOutcome::Sequential { order }) => {
                    debug!(?order, "proposals sequenced");
                    sequenced.extend(order.into_iter().filter(|id| *id != candidate.proposal_id));
                }
                None => {
                    sequenced.extend(
                        record
                            .conflicting_proposal_ids
                            .iter()
                            .copied()
                            .filter(|id| *id != candidate.proposal_id),
                    );
                }
            }
        }
    }

    /// Pending proposals overlapping `candidate`, minus `skip`
    async fn rivals(
        &self,
        candidate: &Proposal,
        skip: &HashSet<ProposalId>,
    ) -> Result<Vec<Proposal>, OrchestratorError> {
        Ok(self
            .store
            .proposals_with_status(&CONTENDING)
            .await?
            .into_iter()
            .filter(|p| {
                p.proposal_id != candidate.proposal_id
                    && !skip.contains(&p.proposal_id)
                    && p.overlaps(candidate)
            })
            .collect())
    }

    async fn supersede(&self, proposal_id: ProposalId, by: ProposalId) -> Result<(), OrchestratorError> {
        match self
            .store
            .transition_status(proposal_id, &CONTENDING, ProposalStatus::Superseded)
            .await
        {
            Ok(_) => {
                info!(%proposal_id, superseded_by = %by, "proposal superseded");
                Ok(())
            }
            // Withdrawn or decided concurrently; nothing left to supersede
            Err(StoreError::StatusConflict { found, .. }) => {
                warn!(%proposal_id, status = %found, "proposal left the pending set before it was superseded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn audit_conflict(&self, record: &ConflictRecord, summary: &str) {
        for proposal_id in &record.conflicting_proposal_ids {
            self.audit.append(
                *proposal_id,
                AuditKind::ConflictResolution,
                format!("conflict {} {summary}", record.id),
            );
        }
    }

    /// Reject decision for a submission that lost a priority override
    async fn discard(
        &self,
        candidate: &Proposal,
        winner: ProposalId,
        record: &ConflictRecord,
    ) -> Result<ValidationDecision, OrchestratorError> {
        let mut reasoning = record.reasoning.clone();
        reasoning.push(format!("superseded by higher-priority proposal {winner}"));
        let decision = ValidationDecision {
            proposal_id: candidate.proposal_id,
            decision: Decision::Reject,
            confidence: 1.0,
            quality_change_percent: 0.0,
            reasoning,
            decided_at: Utc::now(),
        };
        self.publish_decision(candidate, &decision).await?;
        Ok(decision)
    }

    /// Park a submission whose conflict no strategy could resolve
    async fn hold_for_review(
        &self,
        candidate: &Proposal,
        record: &ConflictRecord,
    ) -> Result<ValidationDecision, OrchestratorError> {
        self.store
            .transition_status(
                candidate.proposal_id,
                &CONTENDING,
                ProposalStatus::ManualReview,
            )
            .await?;
        let mut reasoning = record.reasoning.clone();
        reasoning.push("no resolution strategy applied; held for operator review".to_string());
        let decision = ValidationDecision {
            proposal_id: candidate.proposal_id,
            decision: Decision::ManualReview,
            confidence: 0.0,
            quality_change_percent: 0.0,
            reasoning,
            decided_at: Utc::now(),
        };
        warn!(
            proposal_id = %candidate.proposal_id,
            conflict_id = %record.id,
            "unresolvable conflict, proposal held for manual review"
        );
        self.publish_decision(candidate, &decision).await?;
        Ok(decision)
    }

    // -----------------------------------------------------------------------
    // Validation and launch
    // -----------------------------------------------------------------------

    async fn validate(&self, proposal: &Proposal) -> Result<SubmitOutcome, OrchestratorError> {
        let proposal_id = proposal.proposal_id;
        let (baseline, new, experiment) = match proposal.experiment_id {
            Some(experiment_id) => match self.tracker.get_result(experiment_id)? {
                ExperimentStatus::Pending(pending) => {
                    let previous = self
                        .store
                        .transition_status(proposal_id, &CONTENDING, ProposalStatus::Deferred)
                        .await?;
                    if previous != ProposalStatus::Deferred {
                        info!(
                            %proposal_id,
                            %experiment_id,
                            control_n = pending.control_n,
                            treatment_n = pending.treatment_n,
                            min_sample_size = pending.min_sample_size,
                            "decision deferred until the experiment has enough samples"
                        );
                    }
                    return Ok(SubmitOutcome::Deferred {
                        proposal_id,
                        pending,
                    });
                }
                ExperimentStatus::Ready(result) => {
                    (result.control_mean, result.treatment_mean, Some(result))
                }
            },
            None => {
                let samples = self.metrics.sample(proposal).await?;
                match (samples.control_mean(), samples.treatment_mean()) {
                    (Some(baseline), Some(new)) => (baseline, new, None),
                    _ => return Err(SourceError::NoData(proposal_id).into()),
                }
            }
        };

        let decision = self
            .engine
            .decide(proposal_id, baseline, new, experiment.as_ref())?;
        let next = match decision.decision {
            Decision::Approve => ProposalStatus::Approved,
            Decision::Reject => ProposalStatus::Rejected,
            Decision::ManualReview => ProposalStatus::ManualReview,
        };
        // Status first: a concurrent withdrawal wins or loses here, not after
        // the decision is on record
        self.store
            .transition_status(proposal_id, &CONTENDING, next)
            .await?;
        self.publish_decision(proposal, &decision).await?;

        if decision.is_approved() {
            self.launch(proposal).await?;
        }
        Ok(SubmitOutcome::Decided(decision))
    }

    async fn publish_decision(
        &self,
        proposal: &Proposal,
        decision: &ValidationDecision,
    ) -> Result<(), OrchestratorError> {
        self.store.append_decision(decision.clone()).await?;
        self.audit.append(
            proposal.proposal_id,
            AuditKind::Decision,
            format!(
                "{} with confidence {:.2} ({:+.2}% quality)",
                decision.decision, decision.confidence, decision.quality_change_percent
            ),
        );
        self.notifier
            .notify(
                proposal.originating_agent_id,
                Notification::Decision(decision.clone()),
            )
            .await;
        Ok(())
    }

    /// Take the proposal's resource locks and start its rollout, or queue it
    ///
    /// Returns whether the rollout started.
    async fn launch(&self, proposal: &Proposal) -> Result<bool, OrchestratorError> {
        let proposal_id = proposal.proposal_id;
        let waiting_on = self.unfinished_predecessors(proposal).await?;
        if !waiting_on.is_empty() {
            let previous = self
                .store
                .transition_status(
                    proposal_id,
                    &[ProposalStatus::Approved, ProposalStatus::Queued],
                    ProposalStatus::Queued,
                )
                .await?;
            if previous == ProposalStatus::Approved {
                info!(%proposal_id, ?waiting_on, "sequenced behind unfinished proposals, rollout queued");
            }
            return Ok(false);
        }
        match self.locks.try_acquire(proposal) {
            LockOutcome::Acquired => {
                if let Err(e) = self.rollout.start(proposal_id).await {
                    self.locks.release(proposal_id);
                    return Err(e.into());
                }
                self.store
                    .transition_status(
                        proposal_id,
                        &[ProposalStatus::Approved, ProposalStatus::Queued],
                        ProposalStatus::RollingOut,
                    )
                    .await?;
                info!(%proposal_id, "rollout scheduled");
                Ok(true)
            }
            LockOutcome::Queued {
                blocked_by,
                position,
            } => {
                let previous = self
                    .store
                    .transition_status(
                        proposal_id,
                        &[ProposalStatus::Approved, ProposalStatus::Queued],
                        ProposalStatus::Queued,
                    )
                    .await?;
                if previous == ProposalStatus::Approved {
                    info!(%proposal_id, ?blocked_by, position, "resources busy, rollout queued");
                }
                Ok(false)
            }
        }
    }

    async fn finish_rollout(
        &self,
        execution: &RolloutExecution,
        report: &mut TickReport,
    ) -> Result<(), OrchestratorError> {
        let proposal_id = execution.proposal_id;
        let status = if execution.current_stage == RolloutStage::Completed {
            report.completed.push(proposal_id);
            ProposalStatus::Completed
        } else {
            report.rolled_back.push(proposal_id);
            ProposalStatus::RolledBack
        };
        self.store
            .transition_status(proposal_id, &[ProposalStatus::RollingOut], status)
            .await?;
        let granted = self.locks.release(proposal_id);
        info!(
            %proposal_id,
            stage = %execution.current_stage,
            granted = granted.len(),
            "rollout finished, resources released"
        );

        let proposal = self.load(proposal_id).await?;
        self.notifier
            .notify(
                proposal.originating_agent_id,
                Notification::RolloutFinished {
                    proposal_id,
                    stage: execution.current_stage,
                    rollback_reason: execution.rollback_reason.clone(),
                },
            )
            .await;
        Ok(())
    }

    /// Start queued proposals whose resources are free and whose sequenced
    /// predecessors are done, highest priority first
    async fn start_queued(&self, report: &mut TickReport) -> Result<(), OrchestratorError> {
        let mut queued = self
            .store
            .proposals_with_status(&[ProposalStatus::Queued])
            .await?;
        queued.sort_by_key(Proposal::sequencing_key);
        for proposal in &queued {
            if self.launch(proposal).await? {
                report.started.push(proposal.proposal_id);
            }
        }
        Ok(())
    }

    /// Proposals ordered before this one by a sequential resolution that
    /// have not reached a final status yet
    ///
    /// A blended proposal inherits the ordering of the originals it replaces.
    async fn unfinished_predecessors(
        &self,
        proposal: &Proposal,
    ) -> Result<Vec<ProposalId>, OrchestratorError> {
        let mut unfinished = Vec::new();
        let subjects = std::iter::once(proposal.proposal_id).chain(proposal.supersedes.iter().copied());
        for subject in subjects {
            for record in self.store.conflicts_for(subject).await? {
                let Some(ResolutionOutcome::Sequential { order }) = record.resolution_outcome else {
                    continue;
                };
                for earlier in order.into_iter().take_while(|id| *id != subject) {
                    if !unfinished.contains(&earlier) && !self.status_of(earlier).await?.is_final() {
                        unfinished.push(earlier);
                    }
                }
            }
        }
        Ok(unfinished)
    }

    async fn load(&self, proposal_id: ProposalId) -> Result<Proposal, OrchestratorError> {
        self.store
            .proposal(proposal_id)
            .await?
            .ok_or(OrchestratorError::UnknownProposal(proposal_id))
    }

    async fn status_of(&self, proposal_id: ProposalId) -> Result<ProposalStatus, OrchestratorError> {
        self.store
            .status(proposal_id)
            .await?
            .ok_or(OrchestratorError::UnknownProposal(proposal_id))
    }
}

fn check_proposal(proposal: &Proposal) -> Result<(), OrchestratorError> {
    if proposal.affected_resource_ids.is_empty() {
        return Err(OrchestratorError::InvalidProposal(
            "affected_resource_ids must not be empty".into(),
        ));
    }
    if !proposal.predicted_impact.is_finite() {
        return Err(OrchestratorError::InvalidProposal(format!(
            "predicted_impact must be finite, got {}",
            proposal.predicted_impact
        )));
    }
    proposal
        .proposed_configuration
        .validate()
        .map_err(|e| OrchestratorError::InvalidProposal(e.to_string()))
}

/// Union of the resources of `proposals`
#[must_use]
pub fn resources_of<'a>(proposals: impl IntoIterator<Item = &'a Proposal>) -> BTreeSet<ResourceId> {
    proposals
        .into_iter()
        .flat_map(|p| p.affected_resource_ids.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_model::{AgentId, PriorityClass};

    fn p(resources: &[&str]) -> Proposal {
        Proposal::builder(AgentId::new(), PriorityClass::Cost)
            .resources(resources.iter().copied())
            .build()
    }

    #[test]
    fn empty_resource_set_is_rejected() {
        let err = check_proposal(&p(&[])).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidProposal(_)));
    }

    #[test]
    fn non_finite_impact_is_rejected() {
        let mut proposal = p(&["web-1"]);
        proposal.predicted_impact = f64::NAN;
        assert!(check_proposal(&proposal).is_err());
    }

    #[test]
    fn resources_of_unions_sets() {
        let all = resources_of(&[p(&["a", "b"]), p(&["b", "c"])]);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn outcome_accessors() {
        let id = ProposalId::new();
        let deferred = SubmitOutcome::Deferred {
            proposal_id: id,
            pending: PendingCounts {
                control_n: 3,
                treatment_n: 1,
                min_sample_size: 30,
            },
        };
        assert!(deferred.is_deferred());
        assert_eq!(deferred.proposal_id(), id);
        assert!(deferred.decision().is_none());
    }
}
