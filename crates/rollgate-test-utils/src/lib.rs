//! Testing utilities for the Rollgate workspace
//!
//! Shared fixtures and in-memory fakes for every boundary trait.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use rollgate_model::{
    AgentId, Decision, HealthSnapshot, MetricSamples, MetricSource, Notification,
    NotificationSink, PriorityClass, Proposal, ProposalId, ProposalStatus, ProposedConfiguration,
    ResourceId, SourceError, ValidationDecision,
};
use rollgate_rollout::{ApplyError, ConfigApplier, HealthProbe, ProbeError};
use rollgate_store::{InMemoryStore, RecordStore};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Fixed epoch so submission ordering in tests is deterministic
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn resources(names: &[&str]) -> BTreeSet<ResourceId> {
    names.iter().map(|n| ResourceId::new(*n)).collect()
}

pub fn proposal(priority: PriorityClass, names: &[&str]) -> Proposal {
    Proposal::builder(AgentId::new(), priority)
        .resources(names.iter().copied())
        .configuration(ProposedConfiguration::new().with_replicas(3))
        .predicted_impact(-1.0)
        .build()
}

/// Proposal submitted `offset_secs` after [`epoch`]
pub fn proposal_at(priority: PriorityClass, names: &[&str], offset_secs: i64) -> Proposal {
    Proposal::builder(AgentId::new(), priority)
        .resources(names.iter().copied())
        .configuration(ProposedConfiguration::new().with_replicas(3))
        .predicted_impact(-1.0)
        .submitted_at(epoch() + ChronoDuration::seconds(offset_secs))
        .build()
}

pub fn decision(proposal_id: ProposalId, decision: Decision) -> ValidationDecision {
    ValidationDecision {
        proposal_id,
        decision,
        confidence: 0.9,
        quality_change_percent: 0.0,
        reasoning: vec!["fixture".to_string()],
        decided_at: Utc::now(),
    }
}

/// Store holding `proposal` with an approve decision, ready for rollout
pub async fn approved_in_store(proposal: Proposal) -> (Arc<InMemoryStore>, ProposalId) {
    let store = Arc::new(InMemoryStore::new());
    let id = proposal.proposal_id;
    store
        .insert_proposal(proposal, ProposalStatus::Approved)
        .await
        .unwrap();
    store
        .append_decision(decision(id, Decision::Approve))
        .await
        .unwrap();
    (store, id)
}

// ---------------------------------------------------------------------------
// HealthProbe
// ---------------------------------------------------------------------------

/// One scripted probe response
#[derive(Debug, Clone)]
pub enum ProbeStep {
    Respond(HealthSnapshot),
    Fail(ProbeError),
    /// Sleep before answering healthy; pair with a short probe timeout
    Hang(Duration),
}

/// Probe that replays a script, then answers healthy
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeStep>>,
    calls: Mutex<Vec<BTreeSet<ResourceId>>>,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn new(steps: impl IntoIterator<Item = ProbeStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: ProbeStep) {
        self.script.lock().push_back(step);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, resource_ids: &BTreeSet<ResourceId>) -> Result<HealthSnapshot, ProbeError> {
        self.calls.lock().push(resource_ids.clone());
        let step = self.script.lock().pop_front();
        match step {
            None => Ok(HealthSnapshot::healthy()),
            Some(ProbeStep::Respond(snapshot)) => Ok(snapshot),
            Some(ProbeStep::Fail(error)) => Err(error),
            Some(ProbeStep::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(HealthSnapshot::healthy())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigApplier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplierCall {
    Apply {
        resources: BTreeSet<ResourceId>,
        traffic_percent: u8,
    },
    Revert {
        resources: BTreeSet<ResourceId>,
    },
}

/// Applier that records every call and can be told to fail
#[derive(Debug, Default)]
pub struct RecordingApplier {
    calls: Mutex<Vec<ApplierCall>>,
    apply_failures: Mutex<VecDeque<ApplyError>>,
    revert_failures: Mutex<VecDeque<ApplyError>>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `apply` calls fail with these errors, in order
    pub fn fail_apply_with(self, errors: impl IntoIterator<Item = ApplyError>) -> Self {
        self.apply_failures.lock().extend(errors);
        self
    }

    pub fn fail_revert_with(self, errors: impl IntoIterator<Item = ApplyError>) -> Self {
        self.revert_failures.lock().extend(errors);
        self
    }

    pub fn calls(&self) -> Vec<ApplierCall> {
        self.calls.lock().clone()
    }

    /// Traffic percentages applied, in order
    pub fn applied_percents(&self) -> Vec<u8> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ApplierCall::Apply { traffic_percent, .. } => Some(*traffic_percent),
                ApplierCall::Revert { .. } => None,
            })
            .collect()
    }

    pub fn revert_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, ApplierCall::Revert { .. }))
            .count()
    }
}

#[async_trait]
impl ConfigApplier for RecordingApplier {
    async fn apply(
        &self,
        resource_ids: &BTreeSet<ResourceId>,
        _configuration: &ProposedConfiguration,
        traffic_percent: u8,
    ) -> Result<(), ApplyError> {
        self.calls.lock().push(ApplierCall::Apply {
            resources: resource_ids.clone(),
            traffic_percent,
        });
        match self.apply_failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn revert(&self, resource_ids: &BTreeSet<ResourceId>) -> Result<(), ApplyError> {
        self.calls.lock().push(ApplierCall::Revert {
            resources: resource_ids.clone(),
        });
        match self.revert_failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricSource
// ---------------------------------------------------------------------------

/// Metric source answering from a per-proposal table with a fallback
#[derive(Debug, Default)]
pub struct StaticMetricSource {
    by_proposal: Mutex<HashMap<ProposalId, MetricSamples>>,
    fallback: Option<MetricSamples>,
}

impl StaticMetricSource {
    /// Every proposal samples as `control` vs `treatment`
    pub fn uniform(control: Vec<f64>, treatment: Vec<f64>) -> Self {
        Self {
            by_proposal: Mutex::new(HashMap::new()),
            fallback: Some(MetricSamples::new(control, treatment)),
        }
    }

    /// Baseline 85.0, new quality `new_quality`, constant samples
    pub fn quality(new_quality: f64) -> Self {
        Self::uniform(vec![85.0; 5], vec![new_quality; 5])
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, proposal_id: ProposalId, samples: MetricSamples) {
        self.by_proposal.lock().insert(proposal_id, samples);
    }
}

#[async_trait]
impl MetricSource for StaticMetricSource {
    async fn sample(&self, proposal: &Proposal) -> Result<MetricSamples, SourceError> {
        if let Some(samples) = self.by_proposal.lock().get(&proposal.proposal_id) {
            return Ok(samples.clone());
        }
        self.fallback
            .clone()
            .ok_or(SourceError::NoData(proposal.proposal_id))
    }
}

// ---------------------------------------------------------------------------
// NotificationSink
// ---------------------------------------------------------------------------

/// Sink that keeps every notification
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(AgentId, Notification)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(AgentId, Notification)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, agent_id: AgentId) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|(a, _)| *a == agent_id)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, agent_id: AgentId, payload: Notification) {
        self.sent.lock().push((agent_id, payload));
    }
}
