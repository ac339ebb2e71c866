//! Experiment tracker under concurrent ingestion

use pretty_assertions::assert_eq;
use rollgate_model::{ExperimentId, Group, Winner};
use rollgate_stats::{ExperimentStatus, ExperimentTracker, StatisticalComparator};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_lose_no_observations() {
    let tracker = Arc::new(ExperimentTracker::default());
    let id = ExperimentId::new();
    tracker.register(id, "error_rate", 30).unwrap();

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                for i in 0..50 {
                    let group = if (w + i) % 2 == 0 {
                        Group::Control
                    } else {
                        Group::Treatment
                    };
                    tracker
                        .add_observation(id, group, f64::from(i % 7))
                        .unwrap();
                    if i % 10 == 0 {
                        // Readers interleave with writers
                        let _ = tracker.get_result(id).unwrap();
                    }
                }
            })
        })
        .collect();

    for result in futures::future::join_all(writers).await {
        result.unwrap();
    }

    let snapshot = tracker.snapshot(id).unwrap();
    assert_eq!(snapshot.control_n + snapshot.treatment_n, 400);
    assert_eq!(snapshot.version, 400);
    assert_eq!(snapshot.control_n, 200);
}

#[test]
fn result_recomputes_identically_for_same_observations() {
    let tracker = ExperimentTracker::new(StatisticalComparator::new(0.05).unwrap());
    let id = ExperimentId::new();
    tracker.register(id, "quality", 30).unwrap();
    for i in 0..30 {
        let v = f64::from(i);
        tracker.add_observation(id, Group::Control, 50.0 + v * 0.1).unwrap();
        tracker.add_observation(id, Group::Treatment, 55.0 + v * 0.1).unwrap();
    }

    let first = tracker.get_result(id).unwrap().ready().unwrap();

    // Same observation set in a fresh tracker, different arrival order
    let other = ExperimentTracker::default();
    other.register(id, "quality", 30).unwrap();
    for i in (0..30).rev() {
        let v = f64::from(i);
        other.add_observation(id, Group::Treatment, 55.0 + v * 0.1).unwrap();
        other.add_observation(id, Group::Control, 50.0 + v * 0.1).unwrap();
    }
    let second = other.get_result(id).unwrap().ready().unwrap();

    assert_eq!(first.p_value.to_bits(), second.p_value.to_bits());
    assert_eq!(first.effect_size.to_bits(), second.effect_size.to_bits());
    assert_eq!(first.winner, Winner::Treatment);
    assert_eq!(first.winner, second.winner);
}

#[test]
fn default_min_sample_size_is_thirty() {
    let tracker = ExperimentTracker::default();
    let id = ExperimentId::new();
    tracker.register_default(id, "cost").unwrap();
    for _ in 0..29 {
        tracker.add_observation(id, Group::Control, 1.0).unwrap();
        tracker.add_observation(id, Group::Treatment, 1.0).unwrap();
    }
    match tracker.get_result(id).unwrap() {
        ExperimentStatus::Pending(counts) => assert_eq!(counts.min_sample_size, 30),
        ExperimentStatus::Ready(_) => panic!("29 samples must stay pending"),
    }
}
