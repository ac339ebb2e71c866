//! Rollgate Conflict
//!
//! Detection and resolution of pending proposals that touch the same
//! resources.
//!
//! - [`detect`] / [`detect_against`]: overlapping pairs
//! - [`ConflictResolver`]: configurable chain of [`ResolutionStrategy`]
//!   implementations ([`PriorityOverride`], [`HybridNegotiation`],
//!   [`Sequential`])
//! - [`ResourceLockTable`]: rollout-lifetime resource ownership
//! - [`ResourceGate`]: per-resource critical sections

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod detect;
pub mod error;
pub mod locks;
pub mod resolver;
pub mod strategy;

pub use detect::{detect, detect_against};
pub use error::ConflictError;
pub use locks::{GateGuard, LockOutcome, ResourceGate, ResourceLockTable};
pub use resolver::{ConflictConfig, ConflictResolver};
pub use strategy::{
    impacts_opposed, HybridNegotiation, PriorityOverride, ResolutionStrategy, Sequential,
    StrategyOutcome, DEFAULT_HYBRID_SPLIT_PERCENT, HYBRID_PARTITION_KEY,
};
