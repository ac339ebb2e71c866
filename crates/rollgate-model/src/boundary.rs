//! Boundary traits shared across components
//!
//! Metric collection and notification delivery are external systems. The
//! core only sees numeric sample sequences and fire-and-forget notifications.

use crate::conflict::ConflictRecord;
use crate::decision::ValidationDecision;
use crate::ids::{AgentId, ProposalId};
use crate::proposal::Proposal;
use crate::rollout::RolloutStage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Control and treatment samples for one proposal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSamples {
    /// Samples under the current configuration
    pub control: Vec<f64>,
    /// Samples under the proposed configuration
    pub treatment: Vec<f64>,
}

impl MetricSamples {
    /// Build from two sequences
    #[must_use]
    pub fn new(control: Vec<f64>, treatment: Vec<f64>) -> Self {
        Self { control, treatment }
    }

    /// Arithmetic mean of the control samples, `None` when empty
    #[must_use]
    pub fn control_mean(&self) -> Option<f64> {
        mean(&self.control)
    }

    /// Arithmetic mean of the treatment samples, `None` when empty
    #[must_use]
    pub fn treatment_mean(&self) -> Option<f64> {
        mean(&self.treatment)
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Failure of an external data source
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Source could not be reached or refused the request
    #[error("metric source unavailable: {0}")]
    Unavailable(String),

    /// Source has no data for the proposal
    #[error("no samples for proposal {0}")]
    NoData(ProposalId),
}

/// Supplier of quality samples for a proposal
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Fetch control and treatment samples
    async fn sample(&self, proposal: &Proposal) -> Result<MetricSamples, SourceError>;
}

/// Payload broadcast to agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A decision was recorded for the agent's proposal
    Decision(ValidationDecision),
    /// A conflict involving the agent's proposal was resolved
    ConflictResolved(ConflictRecord),
    /// A rollout reached a terminal stage
    RolloutFinished {
        /// Proposal rolled out
        proposal_id: ProposalId,
        /// `Completed` or `RolledBack`
        stage: RolloutStage,
        /// Set when rolled back
        rollback_reason: Option<String>,
    },
}

/// Delivery channel for agent notifications
///
/// Delivery is best effort; implementations log and swallow their own errors.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `payload` to `agent_id`
    async fn notify(&self, agent_id: AgentId, payload: Notification);
}
