//! External collaborators of the state machine
//!
//! Implement these to connect the rollout engine to a real target system.

use crate::error::{ApplyError, ProbeError};
use async_trait::async_trait;
use rollgate_model::{HealthSnapshot, ProposedConfiguration, ResourceId};
use std::collections::BTreeSet;

/// Reports the health of a set of resources
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Current health of `resource_ids`
    async fn check(&self, resource_ids: &BTreeSet<ResourceId>) -> Result<HealthSnapshot, ProbeError>;
}

/// Stages and reverts configuration on the target system
///
/// Both calls must be idempotent: a retried advance after a crash may repeat
/// the last `apply`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigApplier: Send + Sync {
    /// Route `traffic_percent` of traffic on `resource_ids` to `configuration`
    async fn apply(
        &self,
        resource_ids: &BTreeSet<ResourceId>,
        configuration: &ProposedConfiguration,
        traffic_percent: u8,
    ) -> Result<(), ApplyError>;

    /// Restore the prior configuration on `resource_ids`
    async fn revert(&self, resource_ids: &BTreeSet<ResourceId>) -> Result<(), ApplyError>;
}
