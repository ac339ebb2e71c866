//! Seeded health probe

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rollgate_model::{HealthSnapshot, ResourceId};
use rollgate_rollout::{HealthProbe, ProbeError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Probe that reports unhealthy with a fixed probability
///
/// Draws come from its own generator so the failure pattern depends only on
/// the seed and the order of checks.
#[derive(Debug)]
pub struct SeededProbe {
    rng: Mutex<StdRng>,
    unhealthy_rate: f64,
    checks: AtomicU64,
    failures: AtomicU64,
}

impl SeededProbe {
    /// `unhealthy_rate` is clamped to `[0, 1]`
    #[must_use]
    pub fn new(seed: u64, unhealthy_rate: f64) -> Self {
        let unhealthy_rate = if unhealthy_rate.is_finite() {
            unhealthy_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            unhealthy_rate,
            checks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Checks answered so far
    #[must_use]
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    /// Checks answered unhealthy so far
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HealthProbe for SeededProbe {
    async fn check(&self, resource_ids: &BTreeSet<ResourceId>) -> Result<HealthSnapshot, ProbeError> {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let unhealthy = self.rng.lock().random_bool(self.unhealthy_rate);
        if unhealthy {
            self.failures.fetch_add(1, Ordering::Relaxed);
            let names: Vec<&str> = resource_ids.iter().map(ResourceId::as_str).collect();
            return Ok(HealthSnapshot::unhealthy(format!(
                "synthetic error spike on {}",
                names.join(", ")
            )));
        }
        Ok(HealthSnapshot::healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_bounds_are_respected() {
        let resources: BTreeSet<_> = [ResourceId::new("db-1")].into_iter().collect();

        let never = SeededProbe::new(1, 0.0);
        let always = SeededProbe::new(1, 1.5);
        for _ in 0..20 {
            assert!(never.check(&resources).await.unwrap().ok);
            assert!(!always.check(&resources).await.unwrap().ok);
        }
        assert_eq!(never.failures(), 0);
        assert_eq!(always.failures(), 20);
        assert_eq!(always.checks(), 20);
    }
}
