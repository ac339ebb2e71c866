//! Rollgate Decision
//!
//! Deterministic approve / reject / manual-review table over a quality delta
//! and an optional experiment result. Pure: persistence is the caller's job.
//!
//! # Example
//!
//! ```
//! use rollgate_decision::DecisionEngine;
//! use rollgate_model::{Decision, ProposalId};
//!
//! let engine = DecisionEngine::default();
//! let decision = engine.decide(ProposalId::new(), 85.0, 87.0, None).unwrap();
//! assert_eq!(decision.decision, Decision::Approve);
//! assert_eq!(decision.confidence, 0.85);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod engine;
pub mod error;
pub mod policy;

pub use engine::{DecisionEngine, DecisionRule, Verdict};
pub use error::DecisionError;
pub use policy::DecisionPolicy;
