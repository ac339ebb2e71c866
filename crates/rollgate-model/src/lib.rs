//! Rollgate Model
//!
//! Record types shared by every Rollgate component:
//!
//! - [`Proposal`]: an immutable configuration change submitted by an agent
//! - [`Observation`] / [`ExperimentResult`]: A/B experiment samples and verdicts
//! - [`ValidationDecision`]: approve / reject / manual review for one proposal
//! - [`RolloutExecution`]: staged deployment progress of an approved proposal
//! - [`ConflictRecord`]: detection and resolution of overlapping proposals
//!
//! The boundary traits [`MetricSource`] and [`NotificationSink`] live here as
//! well, since more than one component consumes them.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod boundary;
pub mod config;
pub mod conflict;
pub mod decision;
pub mod experiment;
pub mod ids;
pub mod proposal;
pub mod rollout;

pub use boundary::{MetricSamples, MetricSource, Notification, NotificationSink, SourceError};
pub use config::{ConfigError, ProposedConfiguration, CONFIG_SCHEMA_VERSION};
pub use conflict::{ConflictRecord, ResolutionOutcome, ResolutionStrategyKind};
pub use decision::{Decision, ValidationDecision};
pub use experiment::{ExperimentResult, Group, Observation, UnknownGroup, Winner};
pub use ids::{AgentId, ConflictId, ExperimentId, ProposalId, ResourceId};
pub use proposal::{PriorityClass, Proposal, ProposalBuilder, ProposalStatus};
pub use rollout::{HealthSnapshot, RolloutExecution, RolloutStage, StageRecord};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports for working with Rollgate records
pub mod prelude {
    pub use crate::{
        AgentId, ConflictRecord, Decision, ExperimentId, ExperimentResult, Group,
        HealthSnapshot, PriorityClass, Proposal, ProposalId, ProposalStatus,
        ProposedConfiguration, ResourceId, RolloutExecution, RolloutStage, ValidationDecision,
    };
}
