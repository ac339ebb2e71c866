//! Seeded multi-agent simulation
//!
//! Several agents submit proposals against a small resource pool so that
//! conflicts, experiments, operator reviews and staged rollouts all occur in
//! one run. After every scheduler tick and once the run has drained, the
//! simulator checks the properties the pipeline promises:
//!
//! - no resource is touched by two rollouts at once
//! - every rollout visits stages in forward order, ending at most once in
//!   `rolled_back`
//! - every decision confidence lies in `[0, 1]`
//! - nothing is left mid-flight after the drain and no lock leaks
//! - the audit chain verifies

use crate::normal;
use crate::probe::SeededProbe;
use anyhow::ensure;
use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rollgate_core::{CoordinationOrchestrator, OrchestratorConfig};
use rollgate_model::{
    AgentId, ConflictId, Decision, ExperimentId, Group, MetricSamples, PriorityClass, Proposal,
    ProposalId, ProposalStatus, ProposedConfiguration, ResourceId, RolloutExecution, RolloutStage,
};
use rollgate_rollout::RetryPolicy;
use rollgate_store::{InMemoryStore, RecordStore};
use rollgate_test_utils::{RecordingApplier, RecordingSink, StaticMetricSource};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::{debug, info};

const BASELINE_QUALITY: f64 = 85.0;
const PROBE_SEED_OFFSET: u64 = 0x9e37_79b9_7f4a_7c15;

const ALL_STATUSES: [ProposalStatus; 11] = [
    ProposalStatus::Pending,
    ProposalStatus::Deferred,
    ProposalStatus::ManualReview,
    ProposalStatus::Approved,
    ProposalStatus::Queued,
    ProposalStatus::RollingOut,
    ProposalStatus::Completed,
    ProposalStatus::RolledBack,
    ProposalStatus::Rejected,
    ProposalStatus::Superseded,
    ProposalStatus::Withdrawn,
];

/// Statuses nothing may be left in once the run has drained
const UNSETTLED: [ProposalStatus; 6] = [
    ProposalStatus::Pending,
    ProposalStatus::Deferred,
    ProposalStatus::ManualReview,
    ProposalStatus::Approved,
    ProposalStatus::Queued,
    ProposalStatus::RollingOut,
];

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Proposals to submit
    pub proposals: usize,
    /// Distinct submitting agents
    pub agents: usize,
    /// Resources proposals draw from; smaller pools mean more conflicts
    pub resource_pool: usize,
    /// Share of proposals validated through an experiment
    pub experiment_rate: f64,
    /// Share of deferred proposals their agent withdraws
    pub withdraw_rate: f64,
    /// Probability that a single health check fails
    pub unhealthy_rate: f64,
    /// Observations per group before an experiment is evaluated
    pub min_sample_size: usize,
    /// Submissions between scheduler ticks
    pub tick_every: usize,
    /// Upper bound on ticks spent draining queued rollouts
    pub max_drain_ticks: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            proposals: 200,
            agents: 6,
            resource_pool: 12,
            experiment_rate: 0.25,
            withdraw_rate: 0.1,
            unhealthy_rate: 0.05,
            min_sample_size: 10,
            tick_every: 4,
            max_drain_ticks: 10_000,
        }
    }
}

impl SimulatorConfig {
    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.agents >= 1, "at least one agent is required");
        ensure!(
            self.resource_pool >= 3,
            "resource_pool must hold at least 3 resources, got {}",
            self.resource_pool
        );
        for (name, rate) in [
            ("experiment_rate", self.experiment_rate),
            ("withdraw_rate", self.withdraw_rate),
            ("unhealthy_rate", self.unhealthy_rate),
        ] {
            ensure!(
                (0.0..=1.0).contains(&rate),
                "{name} must lie in [0, 1], got {rate}"
            );
        }
        ensure!(
            self.min_sample_size >= 2,
            "min_sample_size must be at least 2, got {}",
            self.min_sample_size
        );
        ensure!(self.tick_every >= 1, "tick_every must be at least 1");
        Ok(())
    }
}

/// A broken property found during simulation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Two rollouts touched one resource at the same time
    OverlappingRollouts {
        /// Contended resource
        resource: ResourceId,
        /// Rollouts on it
        proposals: Vec<ProposalId>,
    },
    /// Stages out of forward order
    StageRegression {
        /// Proposal
        proposal_id: ProposalId,
        /// Stages as visited
        stages: Vec<RolloutStage>,
    },
    /// Decision confidence outside `[0, 1]`
    ConfidenceOutOfRange {
        /// Proposal
        proposal_id: ProposalId,
        /// Recorded confidence
        confidence: f64,
    },
    /// Proposal still in flight after the drain
    Unsettled {
        /// Proposal
        proposal_id: ProposalId,
        /// Its status
        status: ProposalStatus,
    },
    /// Resource lock still held after the drain
    LeakedLock {
        /// Resource
        resource: ResourceId,
        /// Holder
        holder: ProposalId,
    },
    /// Audit log failed verification
    AuditChainBroken {
        /// Verification error
        error: String,
    },
    /// An orchestrator call failed
    OperationFailed {
        /// Call name
        operation: String,
        /// Proposal involved
        proposal_id: ProposalId,
        /// Error text
        error: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverlappingRollouts {
                resource,
                proposals,
            } => write!(f, "{} rollouts overlap on {resource}", proposals.len()),
            Self::StageRegression {
                proposal_id,
                stages,
            } => write!(f, "{proposal_id} visited stages out of order: {stages:?}"),
            Self::ConfidenceOutOfRange {
                proposal_id,
                confidence,
            } => write!(f, "{proposal_id} decided with confidence {confidence}"),
            Self::Unsettled {
                proposal_id,
                status,
            } => write!(f, "{proposal_id} left {status} after drain"),
            Self::LeakedLock { resource, holder } => {
                write!(f, "{resource} still locked by {holder}")
            }
            Self::AuditChainBroken { error } => write!(f, "audit chain broken: {error}"),
            Self::OperationFailed {
                operation,
                proposal_id,
                error,
            } => write!(f, "{operation} {proposal_id} failed: {error}"),
        }
    }
}

/// Counters collected during a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SimulationStats {
    /// Accepted submissions
    pub submitted: usize,
    /// Submissions deferred on an experiment
    pub deferred: usize,
    /// Proposals withdrawn by their agent
    pub withdrawn: usize,
    /// Operator verdicts on held proposals
    pub operator_reviews: usize,
    /// Scheduler ticks run
    pub ticks: usize,
    /// Health checks answered
    pub probe_checks: u64,
    /// Health checks answered unhealthy
    pub probe_failures: u64,
    /// Notifications delivered to agents
    pub notifications: usize,
    /// Audit log entries
    pub audit_entries: usize,
    /// Decision records by verdict
    pub decisions: BTreeMap<String, usize>,
    /// Conflict records by resolution strategy
    pub conflicts: BTreeMap<String, usize>,
    /// Proposals by final status
    pub final_status: BTreeMap<String, usize>,
}

/// Simulation outcome
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Parameters used
    pub config: SimulatorConfig,
    /// Counters
    pub stats: SimulationStats,
    /// Broken properties, empty on success
    pub violations: Vec<Violation>,
}

impl SimulationReport {
    /// Whether no property was broken
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        let _ = writeln!(out, "=== Rollgate Simulation Report ===");
        let _ = writeln!(out, "Seed: {}", self.config.seed);
        let _ = writeln!(
            out,
            "Proposals: {} submitted by {} agents over {} resources",
            s.submitted, self.config.agents, self.config.resource_pool
        );
        let _ = writeln!(
            out,
            "Deferred: {}  Withdrawn: {}  Operator reviews: {}",
            s.deferred, s.withdrawn, s.operator_reviews
        );
        let _ = writeln!(
            out,
            "Ticks: {}  Health checks: {} ({} unhealthy)",
            s.ticks, s.probe_checks, s.probe_failures
        );
        let _ = writeln!(
            out,
            "Notifications: {}  Audit entries: {}",
            s.notifications, s.audit_entries
        );
        write_counts(&mut out, "Decisions", &s.decisions);
        write_counts(&mut out, "Conflicts", &s.conflicts);
        write_counts(&mut out, "Final status", &s.final_status);

        if !self.violations.is_empty() {
            let _ = writeln!(out, "\nViolations ({}):", self.violations.len());
            for violation in self.violations.iter().take(20) {
                let _ = writeln!(out, "  - {violation}");
            }
            if self.violations.len() > 20 {
                let _ = writeln!(out, "  ... and {} more", self.violations.len() - 20);
            }
        }
        let _ = writeln!(
            out,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        out
    }
}

fn write_counts(out: &mut String, title: &str, counts: &BTreeMap<String, usize>) {
    let _ = writeln!(out, "\n{title}:");
    if counts.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for (key, count) in counts {
        let _ = writeln!(out, "  {key}: {count}");
    }
}

struct PendingExperiment {
    proposal_id: ProposalId,
    agent: AgentId,
    experiment_id: ExperimentId,
    quality_shift: f64,
}

struct Run {
    orchestrator: CoordinationOrchestrator,
    store: Arc<InMemoryStore>,
    stats: SimulationStats,
    violations: Vec<Violation>,
}

impl Run {
    async fn tick(&mut self) -> anyhow::Result<()> {
        let report = self.orchestrator.tick().await?;
        self.stats.ticks += 1;
        for (proposal_id, error) in report.failed {
            self.violations.push(Violation::OperationFailed {
                operation: "advance".to_string(),
                proposal_id,
                error,
            });
        }
        self.check_exclusive_rollouts().await
    }

    async fn check_exclusive_rollouts(&mut self) -> anyhow::Result<()> {
        let rolling = self
            .store
            .proposals_with_status(&[ProposalStatus::RollingOut])
            .await?;
        let mut holders: BTreeMap<&ResourceId, Vec<ProposalId>> = BTreeMap::new();
        for proposal in &rolling {
            for resource in &proposal.affected_resource_ids {
                holders.entry(resource).or_default().push(proposal.proposal_id);
            }
        }
        for (resource, proposals) in holders {
            if proposals.len() > 1 {
                self.violations.push(Violation::OverlappingRollouts {
                    resource: resource.clone(),
                    proposals,
                });
            }
        }
        Ok(())
    }

    fn failed(&mut self, operation: &str, proposal_id: ProposalId, error: impl fmt::Display) {
        self.violations.push(Violation::OperationFailed {
            operation: operation.to_string(),
            proposal_id,
            error: error.to_string(),
        });
    }

    async fn status(&self, proposal_id: ProposalId) -> anyhow::Result<Option<ProposalStatus>> {
        Ok(self.store.status(proposal_id).await?)
    }
}

/// Forward ranks strictly increase; `rolled_back` may only come last
fn stages_in_order(execution: &RolloutExecution) -> bool {
    let stages = execution.visited_stages();
    let mut last_rank = None;
    for (i, stage) in stages.iter().enumerate() {
        match stage.rank() {
            Some(rank) => {
                if last_rank.is_some_and(|prev| rank <= prev) {
                    return false;
                }
                last_rank = Some(rank);
            }
            None => return i + 1 == stages.len(),
        }
    }
    true
}

/// Run one seeded simulation
///
/// Orchestrator call failures and broken properties are reported as
/// [`Violation`]s; only infrastructure failures (store errors, invalid
/// parameters) end the run early.
///
/// # Errors
/// Invalid configuration or store failures
pub async fn run_simulation(config: SimulatorConfig) -> anyhow::Result<SimulationReport> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    // Blended proposals have no table entry and sample from the fallback
    let metrics = Arc::new(StaticMetricSource::uniform(
        vec![BASELINE_QUALITY; 5],
        vec![BASELINE_QUALITY + 0.5; 5],
    ));
    let probe = Arc::new(SeededProbe::new(
        config.seed.wrapping_add(PROBE_SEED_OFFSET),
        config.unhealthy_rate,
    ));
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = CoordinationOrchestrator::builder(
        metrics.clone(),
        probe.clone(),
        Arc::new(RecordingApplier::new()),
    )
    .config(
        OrchestratorConfig::default()
            .with_min_sample_size(config.min_sample_size)
            .with_retry_policy(RetryPolicy::no_retry()),
    )
    .store(store.clone())
    .notifier(sink.clone())
    .build()?;

    let mut run = Run {
        orchestrator,
        store,
        stats: SimulationStats::default(),
        violations: Vec::new(),
    };

    let agents: Vec<AgentId> = (0..config.agents)
        .map(|_| AgentId::from_u128(rng.random()))
        .collect();
    let pool: Vec<ResourceId> = (0..config.resource_pool)
        .map(|i| ResourceId::new(format!("res-{i:02}")))
        .collect();
    // Synthetic submissions predate any blended proposal created during the run
    let base_time = Utc::now() - ChronoDuration::days(1);
    let mut experiments = Vec::new();

    info!(seed = config.seed, proposals = config.proposals, "simulation started");

    for i in 0..config.proposals {
        let agent = agents[rng.random_range(0..agents.len())];
        let priority = PriorityClass::all()[rng.random_range(0..4)];
        let width = rng.random_range(1..=3);
        let resources: Vec<ResourceId> = pool.choose_multiple(&mut rng, width).cloned().collect();
        let proposal_id = ProposalId::from_u128(rng.random());
        let new_quality = BASELINE_QUALITY + rng.random_range(-6.0..4.0);
        let offset = i64::try_from(i).unwrap_or(i64::MAX);

        let mut builder = Proposal::builder(agent, priority)
            .id(proposal_id)
            .resources(resources)
            .configuration(ProposedConfiguration::new().with_replicas(rng.random_range(1..=3)))
            .predicted_impact(rng.random_range(-3.0..3.0))
            .submitted_at(base_time + ChronoDuration::seconds(offset));

        if rng.random_bool(config.experiment_rate) {
            let experiment_id = ExperimentId::from_u128(rng.random());
            run.orchestrator
                .register_experiment(experiment_id, "quality", None)?;
            builder = builder.experiment(experiment_id);
            experiments.push(PendingExperiment {
                proposal_id,
                agent,
                experiment_id,
                quality_shift: new_quality - BASELINE_QUALITY,
            });
        } else {
            metrics.set(
                proposal_id,
                MetricSamples::new(vec![BASELINE_QUALITY; 5], vec![new_quality; 5]),
            );
        }

        match run.orchestrator.submit(builder.build()).await {
            Ok(outcome) => {
                run.stats.submitted += 1;
                if outcome.is_deferred() {
                    run.stats.deferred += 1;
                }
            }
            Err(e) => run.failed("submit", proposal_id, e),
        }

        if (i + 1) % config.tick_every == 0 {
            run.tick().await?;
        }
    }

    for experiment in &experiments {
        if run.status(experiment.proposal_id).await? != Some(ProposalStatus::Deferred) {
            continue;
        }
        if rng.random_bool(config.withdraw_rate) {
            match run
                .orchestrator
                .withdraw(experiment.proposal_id, experiment.agent)
                .await
            {
                Ok(()) => run.stats.withdrawn += 1,
                Err(e) => run.failed("withdraw", experiment.proposal_id, e),
            }
            continue;
        }

        for _ in 0..config.min_sample_size {
            let control = normal(&mut rng, BASELINE_QUALITY, 1.0);
            let treatment = normal(
                &mut rng,
                BASELINE_QUALITY + experiment.quality_shift,
                1.0,
            );
            run.orchestrator
                .record_observation(experiment.experiment_id, Group::Control, control)?;
            run.orchestrator
                .record_observation(experiment.experiment_id, Group::Treatment, treatment)?;
        }
        if let Err(e) = run.orchestrator.poll(experiment.proposal_id).await {
            run.failed("poll", experiment.proposal_id, e);
        }
    }

    let held = run.orchestrator.manual_review_queue().await?;
    for proposal in held {
        let verdict = if rng.random_bool(0.5) {
            Decision::Approve
        } else {
            Decision::Reject
        };
        match run
            .orchestrator
            .resolve_manual_review(proposal.proposal_id, verdict, "simulated operator")
            .await
        {
            Ok(_) => run.stats.operator_reviews += 1,
            Err(e) => run.failed("resolve_manual_review", proposal.proposal_id, e),
        }
    }

    for _ in 0..config.max_drain_ticks {
        let busy = run
            .store
            .proposals_with_status(&[ProposalStatus::Queued, ProposalStatus::RollingOut])
            .await?;
        if busy.is_empty() {
            break;
        }
        run.tick().await?;
    }

    audit_final_state(&mut run, &pool).await?;
    run.stats.probe_checks = probe.checks();
    run.stats.probe_failures = probe.failures();
    run.stats.notifications = sink.len();
    run.stats.audit_entries = run.orchestrator.audit_log().len();

    let report = SimulationReport {
        config,
        stats: run.stats,
        violations: run.violations,
    };
    info!(
        passed = report.passed(),
        violations = report.violations.len(),
        ticks = report.stats.ticks,
        "simulation finished"
    );
    Ok(report)
}

async fn audit_final_state(run: &mut Run, pool: &[ResourceId]) -> anyhow::Result<()> {
    let proposals = run.store.proposals_with_status(&ALL_STATUSES).await?;
    let mut seen_conflicts = BTreeSet::<ConflictId>::new();

    for proposal in &proposals {
        let id = proposal.proposal_id;
        let Some(status) = run.status(id).await? else {
            continue;
        };
        *run.stats.final_status.entry(status.to_string()).or_default() += 1;
        if UNSETTLED.contains(&status) {
            run.violations.push(Violation::Unsettled {
                proposal_id: id,
                status,
            });
        }

        for decision in run.store.decisions(id).await? {
            *run
                .stats
                .decisions
                .entry(decision.decision.to_string())
                .or_default() += 1;
            if !(0.0..=1.0).contains(&decision.confidence) {
                run.violations.push(Violation::ConfidenceOutOfRange {
                    proposal_id: id,
                    confidence: decision.confidence,
                });
            }
        }

        if let Some(execution) = run.store.execution(id).await? {
            if !stages_in_order(&execution) {
                run.violations.push(Violation::StageRegression {
                    proposal_id: id,
                    stages: execution.visited_stages(),
                });
            }
        }

        for record in run.store.conflicts_for(id).await? {
            if !seen_conflicts.insert(record.id) {
                continue;
            }
            let strategy = record
                .resolution_strategy
                .map_or_else(|| "unresolved".to_string(), |s| s.to_string());
            *run.stats.conflicts.entry(strategy).or_default() += 1;
        }
    }

    for resource in pool {
        if let Some(holder) = run.orchestrator.lock_holder(resource) {
            run.violations.push(Violation::LeakedLock {
                resource: resource.clone(),
                holder,
            });
        }
    }

    if let Err(e) = run.orchestrator.audit_log().verify_integrity() {
        run.violations.push(Violation::AuditChainBroken {
            error: e.to_string(),
        });
    }
    debug!(proposals = proposals.len(), "final state audited");
    Ok(())
}
