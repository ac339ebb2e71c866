//! Identifier newtypes
//!
//! Proposal, agent, experiment and conflict identifiers are ULIDs so that
//! they sort by creation time. Resources are named by the external system.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a new identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Build from raw ULID parts, mainly for deterministic fixtures
            #[inline]
            #[must_use]
            pub fn from_u128(value: u128) -> Self {
                Self(Ulid(value))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s).map(Self)
            }
        }
    };
}

ulid_id!(
    /// Unique proposal identifier
    ProposalId
);
ulid_id!(
    /// Identifier of the agent that originated a proposal
    AgentId
);
ulid_id!(
    /// A/B experiment identifier
    ExperimentId
);
ulid_id!(
    /// Conflict record identifier
    ConflictId
);

/// Name of a resource on the target system (instance group, service, bucket)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub String);

impl ResourceId {
    /// Create a resource identifier
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the underlying name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(ProposalId::new(), ProposalId::new());
    }

    #[test]
    fn id_display_roundtrips_through_from_str() {
        let id = ExperimentId::new();
        let parsed: ExperimentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_u128_orders_by_value() {
        assert!(ProposalId::from_u128(1) < ProposalId::from_u128(2));
    }

    #[test]
    fn resource_id_display() {
        assert_eq!(ResourceId::from("db-primary").to_string(), "db-primary");
    }
}
