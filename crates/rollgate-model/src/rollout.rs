//! Staged rollout records

use crate::ids::ProposalId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Rollout stage
///
/// Forward order is `NotStarted < Canary10 < Canary50 < Full100 < Completed`.
/// `RolledBack` sits outside that order; use [`RolloutStage::rank`] for
/// monotonicity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStage {
    /// Approved, nothing applied yet
    NotStarted,
    /// 10% of traffic
    Canary10,
    /// 50% of traffic
    Canary50,
    /// All traffic, awaiting final health check
    Full100,
    /// Done
    Completed,
    /// Reverted
    RolledBack,
}

impl RolloutStage {
    /// Position in the forward sequence, `None` for `RolledBack`
    #[must_use]
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::NotStarted => Some(0),
            Self::Canary10 => Some(1),
            Self::Canary50 => Some(2),
            Self::Full100 => Some(3),
            Self::Completed => Some(4),
            Self::RolledBack => None,
        }
    }

    /// Next stage on the forward path
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::NotStarted => Some(Self::Canary10),
            Self::Canary10 => Some(Self::Canary50),
            Self::Canary50 => Some(Self::Full100),
            Self::Full100 => Some(Self::Completed),
            Self::Completed | Self::RolledBack => None,
        }
    }

    /// Share of traffic exposed to the change while in this stage
    #[must_use]
    pub fn traffic_percent(self) -> u8 {
        match self {
            Self::NotStarted | Self::RolledBack => 0,
            Self::Canary10 => 10,
            Self::Canary50 => 50,
            Self::Full100 | Self::Completed => 100,
        }
    }

    /// `Completed` or `RolledBack`
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }

    /// Every stage, forward path first
    #[must_use]
    pub fn all() -> [Self; 6] {
        [
            Self::NotStarted,
            Self::Canary10,
            Self::Canary50,
            Self::Full100,
            Self::Completed,
            Self::RolledBack,
        ]
    }
}

impl fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Canary10 => "canary_10",
            Self::Canary50 => "canary_50",
            Self::Full100 => "full_100",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Result of one health probe call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Probe verdict
    pub ok: bool,
    /// Probe-specific details (latency, error rate, quality, ...)
    #[serde(default)]
    pub details: BTreeMap<String, JsonValue>,
    /// When the probe answered (or gave up)
    pub checked_at: DateTime<Utc>,
    /// Probe did not answer in time
    #[serde(default)]
    pub timed_out: bool,
}

impl HealthSnapshot {
    /// Healthy snapshot with no details
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            ok: true,
            details: BTreeMap::new(),
            checked_at: Utc::now(),
            timed_out: false,
        }
    }

    /// Unhealthy snapshot with a reason under `"reason"`
    #[must_use]
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::healthy()
            .with_ok(false)
            .with_detail("reason", JsonValue::String(reason.into()))
    }

    /// Fail-closed snapshot for a probe that did not answer within `timeout_ms`
    #[must_use]
    pub fn timed_out(timeout_ms: u64) -> Self {
        let mut snapshot = Self::unhealthy(format!("health probe timed out after {timeout_ms}ms"));
        snapshot.timed_out = true;
        snapshot
    }

    /// Override the verdict
    #[must_use]
    pub fn with_ok(mut self, ok: bool) -> Self {
        self.ok = ok;
        self
    }

    /// Add a detail entry
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Numeric detail, if present
    #[must_use]
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.details.get(key).and_then(JsonValue::as_f64)
    }

    /// Human-readable reason recorded on the snapshot, if any
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.details.get("reason").and_then(JsonValue::as_str)
    }
}

/// Audit entry for one stage transition attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage before the transition
    pub from: RolloutStage,
    /// Stage after the transition
    pub to: RolloutStage,
    /// Health snapshot that gated the transition, if a probe ran
    pub snapshot: Option<HealthSnapshot>,
    /// Transition time
    pub at: DateTime<Utc>,
    /// Free-form note (retry counts, abort reason)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Staged deployment of one approved proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutExecution {
    /// Proposal being rolled out
    pub proposal_id: ProposalId,
    /// Persisted current stage
    pub current_stage: RolloutStage,
    /// When the current stage was entered
    pub stage_started_at: DateTime<Utc>,
    /// One record per transition, oldest first
    pub health_snapshot_per_stage: Vec<StageRecord>,
    /// Set once rolled back
    pub rollback_reason: Option<String>,
}

impl RolloutExecution {
    /// Fresh execution at `NotStarted`
    #[must_use]
    pub fn new(proposal_id: ProposalId) -> Self {
        Self {
            proposal_id,
            current_stage: RolloutStage::NotStarted,
            stage_started_at: Utc::now(),
            health_snapshot_per_stage: Vec::new(),
            rollback_reason: None,
        }
    }

    /// Whether the execution reached a terminal stage
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    /// Stages visited, in order, starting with `NotStarted`
    #[must_use]
    pub fn visited_stages(&self) -> Vec<RolloutStage> {
        let mut stages = vec![RolloutStage::NotStarted];
        stages.extend(self.health_snapshot_per_stage.iter().map(|r| r.to));
        stages
    }
}
