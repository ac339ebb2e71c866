//! Comparator false-positive check
//!
//! Draws both groups from the same normal distribution; at significance
//! level `alpha` the comparator should call at most about `alpha` of the
//! trials significant.

use crate::normal;
use anyhow::{ensure, Context};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rollgate_stats::compare;
use serde::Serialize;
use std::fmt::Write as _;

/// Sanity run parameters
#[derive(Debug, Clone, Serialize)]
pub struct SanityConfig {
    /// Random seed
    pub seed: u64,
    /// Independent comparisons
    pub trials: usize,
    /// Samples per group and trial
    pub samples_per_group: usize,
    /// Comparator significance level
    pub significance_level: f64,
    /// Share of trials that must come out not significant
    pub required_rate: f64,
}

impl Default for SanityConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            trials: 1_000,
            samples_per_group: 30,
            significance_level: 0.05,
            required_rate: 0.95,
        }
    }
}

/// Sanity run outcome
#[derive(Debug, Clone, Serialize)]
pub struct SanityReport {
    /// Parameters used
    pub config: SanityConfig,
    /// Trials the comparator did not call significant
    pub not_significant: usize,
}

impl SanityReport {
    /// Share of trials that were not significant
    #[must_use]
    pub fn rate(&self) -> f64 {
        if self.config.trials == 0 {
            return 1.0;
        }
        self.not_significant as f64 / self.config.trials as f64
    }

    /// Whether the rate meets the requirement
    #[must_use]
    pub fn passed(&self) -> bool {
        self.rate() >= self.config.required_rate
    }

    /// Human-readable summary
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Comparator Sanity Report ===");
        let _ = writeln!(out, "Seed: {}", self.config.seed);
        let _ = writeln!(
            out,
            "Trials: {} x {} samples per group, alpha {}",
            self.config.trials, self.config.samples_per_group, self.config.significance_level
        );
        let _ = writeln!(
            out,
            "Not significant: {} ({:.1}%, required {:.1}%)",
            self.not_significant,
            self.rate() * 100.0,
            self.config.required_rate * 100.0
        );
        let _ = writeln!(
            out,
            "=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        out
    }
}

/// Run `config.trials` comparisons of N(100, 15) against itself
///
/// # Errors
/// Invalid parameters, or a comparator failure on a trial
pub fn run_sanity(config: SanityConfig) -> anyhow::Result<SanityReport> {
    ensure!(
        config.samples_per_group >= 2,
        "samples_per_group must be at least 2, got {}",
        config.samples_per_group
    );
    ensure!(
        (0.0..=1.0).contains(&config.required_rate),
        "required_rate must lie in [0, 1], got {}",
        config.required_rate
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut not_significant = 0usize;
    for trial in 0..config.trials {
        let control: Vec<f64> = (0..config.samples_per_group)
            .map(|_| normal(&mut rng, 100.0, 15.0))
            .collect();
        let treatment: Vec<f64> = (0..config.samples_per_group)
            .map(|_| normal(&mut rng, 100.0, 15.0))
            .collect();
        let result = compare(&control, &treatment, config.significance_level)
            .with_context(|| format!("trial {trial}"))?;
        if !result.is_significant {
            not_significant += 1;
        }
    }
    tracing::info!(
        trials = config.trials,
        not_significant,
        "comparator sanity run finished"
    );

    Ok(SanityReport {
        config,
        not_significant,
    })
}
