//! End-to-end simulation runs

use pretty_assertions::assert_eq;
use rollgate_sim::{run_sanity, run_simulation, SanityConfig, SimulatorConfig};

fn small(seed: u64) -> SimulatorConfig {
    SimulatorConfig {
        seed,
        proposals: 60,
        agents: 4,
        resource_pool: 6,
        ..SimulatorConfig::default()
    }
}

#[tokio::test]
async fn small_run_keeps_every_invariant() {
    let report = run_simulation(small(7)).await.unwrap();
    assert!(report.passed(), "{}", report.generate_text());
    assert_eq!(report.stats.submitted, 60);
    let settled: usize = report.stats.final_status.values().sum();
    assert!(settled >= 60, "blended proposals only add to the count");
    assert!(report.stats.ticks > 0);
    assert!(report.generate_text().contains("=== Result: PASS ==="));
}

#[tokio::test]
async fn crowded_pool_produces_conflicts() {
    let report = run_simulation(SimulatorConfig {
        resource_pool: 3,
        ..small(11)
    })
    .await
    .unwrap();
    assert!(report.passed(), "{}", report.generate_text());
    assert!(!report.stats.conflicts.is_empty());
}

#[tokio::test]
async fn healthy_targets_never_roll_back() {
    let report = run_simulation(SimulatorConfig {
        unhealthy_rate: 0.0,
        ..small(3)
    })
    .await
    .unwrap();
    assert!(report.passed(), "{}", report.generate_text());
    assert_eq!(report.stats.probe_failures, 0);
    assert_eq!(report.stats.final_status.get("rolled_back"), None);
}

#[tokio::test]
async fn same_seed_gives_the_same_outcome() {
    let first = run_simulation(small(21)).await.unwrap();
    let second = run_simulation(small(21)).await.unwrap();
    assert_eq!(first.stats.decisions, second.stats.decisions);
    assert_eq!(first.stats.final_status, second.stats.final_status);
    assert_eq!(first.stats.conflicts, second.stats.conflicts);
}

#[tokio::test]
async fn invalid_parameters_end_the_run() {
    let err = run_simulation(SimulatorConfig {
        agents: 0,
        ..SimulatorConfig::default()
    })
    .await
    .unwrap_err();
    assert!(err.to_string().contains("agent"));
}

#[test]
fn comparator_rarely_flags_identical_distributions() {
    let report = run_sanity(SanityConfig {
        trials: 400,
        seed: 11,
        ..SanityConfig::default()
    })
    .unwrap();
    assert!(report.rate() > 0.9, "rate was {}", report.rate());
    assert!(report.generate_text().contains("Not significant"));
}
