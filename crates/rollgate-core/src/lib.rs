//! Rollgate Core
//!
//! Coordinates configuration proposals from independent optimization agents:
//!
//! - [`CoordinationOrchestrator`]: submission, conflict settlement,
//!   validation, rollout scheduling and operator review
//! - [`OrchestratorConfig`]: TOML configuration for every component
//! - [`telemetry::init_tracing`]: structured logging setup
//!
//! ```no_run
//! use rollgate_core::prelude::*;
//! # async fn run(
//! #     metrics: std::sync::Arc<dyn rollgate_model::MetricSource>,
//! #     probe: std::sync::Arc<dyn rollgate_rollout::HealthProbe>,
//! #     applier: std::sync::Arc<dyn rollgate_rollout::ConfigApplier>,
//! #     proposal: Proposal,
//! # ) -> Result<(), OrchestratorError> {
//! let orchestrator = std::sync::Arc::new(
//!     CoordinationOrchestrator::builder(metrics, probe, applier)
//!         .config(OrchestratorConfig::load("rollgate.toml")?)
//!         .build()?,
//! );
//! let scheduler = orchestrator.spawn_default_scheduler();
//! let outcome = orchestrator.submit(proposal).await?;
//! # let _ = outcome;
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod telemetry;

pub use config::{ConfigError, ExperimentConfig, OrchestratorConfig, RolloutConfig};
pub use error::{Component, OrchestratorError};
pub use orchestrator::{
    resources_of, AuditTrail, CoordinationOrchestrator, OrchestratorBuilder, SchedulerHandle,
    SubmitOutcome, TickReport, TracingSink,
};
pub use telemetry::{init_tracing, init_tracing_with_default, LogFormat};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports for driving the orchestrator
pub mod prelude {
    pub use crate::{
        CoordinationOrchestrator, OrchestratorConfig, OrchestratorError, SubmitOutcome,
        TickReport,
    };
    pub use rollgate_model::prelude::*;
}
