//! Rollgate Rollout
//!
//! Staged deployment of approved proposals:
//! `not_started -> canary_10 -> canary_50 -> full_100 -> completed`, with a
//! rollback edge from every non-terminal stage.
//!
//! - [`RolloutStateMachine`]: `start` / `advance` / `abort` over persisted
//!   executions
//! - [`HealthProbe`] / [`ConfigApplier`]: the target-system boundary
//! - [`SloPolicy`]: caller-supplied violation predicate
//! - [`RetryPolicy`]: bounded exponential backoff for boundary calls
//!
//! Probe timeouts fail closed and roll the change back.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod error;
pub mod machine;
pub mod probe;
pub mod retry;
pub mod slo;
pub mod transitions;

pub use error::{ApplyError, ProbeError, RolloutError, Transient};
pub use machine::{RolloutStateMachine, DEFAULT_PROBE_TIMEOUT};
pub use probe::{ConfigApplier, HealthProbe};
pub use retry::{RetryError, RetryPolicy};
pub use slo::{
    DecisionGatePolicy, OkFlagPolicy, SloPolicy, SloVerdict, ThresholdSloPolicy,
    BASELINE_QUALITY_KEY, QUALITY_KEY,
};
pub use transitions::{allowed_transitions, validate_transition};
