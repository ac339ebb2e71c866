//! Rollgate Simulator
//!
//! Seeded, reproducible workloads for the coordination pipeline:
//!
//! - [`run_simulation`]: many agents submitting overlapping proposals, with
//!   invariant checks after every scheduler tick
//! - [`run_sanity`]: false-positive rate of the statistical comparator on
//!   identically distributed samples

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod probe;
pub mod sanity;
pub mod simulator;

pub use probe::SeededProbe;
pub use sanity::{run_sanity, SanityConfig, SanityReport};
pub use simulator::{run_simulation, SimulationReport, SimulationStats, SimulatorConfig, Violation};

use rand::Rng;
use std::f64::consts::PI;

/// Box-Muller draw from N(mean, sd)
pub(crate) fn normal<R: Rng + ?Sized>(rng: &mut R, mean: f64, sd: f64) -> f64 {
    let u1: f64 = rng.random();
    let u2: f64 = rng.random();
    let z = (-2.0 * (1.0 - u1).ln()).sqrt() * (2.0 * PI * u2).cos();
    mean + sd * z
}
