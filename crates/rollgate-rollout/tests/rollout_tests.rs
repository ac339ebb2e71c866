//! Rollout state machine integration tests

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rollgate_model::{HealthSnapshot, PriorityClass, RolloutStage};
use rollgate_rollout::{
    ApplyError, ProbeError, RetryPolicy, RolloutError, RolloutStateMachine, ThresholdSloPolicy,
};
use rollgate_store::{AuditLog, InMemoryStore};
use rollgate_test_utils::{approved_in_store, proposal, ProbeStep, RecordingApplier, ScriptedProbe};
use std::sync::Arc;
use std::time::Duration;

fn machine(
    store: Arc<InMemoryStore>,
    probe: Arc<ScriptedProbe>,
    applier: Arc<RecordingApplier>,
) -> RolloutStateMachine {
    RolloutStateMachine::new(store, probe, applier)
}

#[tokio::test]
async fn happy_path_reaches_completed() {
    let (store, id) = approved_in_store(proposal(PriorityClass::Performance, &["web-1", "web-2"])).await;
    let probe = Arc::new(ScriptedProbe::healthy());
    let applier = Arc::new(RecordingApplier::new());
    let audit = Arc::new(AuditLog::new());
    let sm = machine(store, probe.clone(), applier.clone()).with_audit_log(audit.clone());

    sm.start(id).await.unwrap();
    let mut stages = Vec::new();
    for _ in 0..4 {
        stages.push(sm.advance(id).await.unwrap().current_stage);
    }

    assert_eq!(
        stages,
        vec![
            RolloutStage::Canary10,
            RolloutStage::Canary50,
            RolloutStage::Full100,
            RolloutStage::Completed
        ]
    );
    assert_eq!(applier.applied_percents(), vec![10, 50, 100]);
    assert_eq!(applier.revert_count(), 0);
    assert_eq!(probe.call_count(), 4);

    let exec = sm.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.health_snapshot_per_stage.len(), 4);
    assert!(exec.health_snapshot_per_stage.iter().all(|r| r.snapshot.is_some()));
    assert_eq!(audit.entries_for(id).len(), 5);
    audit.verify_integrity().unwrap();

    assert!(matches!(
        sm.advance(id).await,
        Err(RolloutError::TerminalState {
            stage: RolloutStage::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn unhealthy_at_canary_50_rolls_back_and_stays_terminal() {
    let (store, id) = approved_in_store(proposal(PriorityClass::Safety, &["db-1"])).await;
    let probe = Arc::new(ScriptedProbe::new([
        ProbeStep::Respond(HealthSnapshot::healthy()),
        ProbeStep::Respond(HealthSnapshot::healthy()),
        ProbeStep::Respond(HealthSnapshot::unhealthy("p99 latency 900ms")),
    ]));
    let applier = Arc::new(RecordingApplier::new());
    let sm = machine(store, probe, applier.clone());

    sm.start(id).await.unwrap();
    sm.advance(id).await.unwrap();
    let at_50 = sm.advance(id).await.unwrap();
    assert_eq!(at_50.current_stage, RolloutStage::Canary50);

    let exec = sm.advance(id).await.unwrap();
    assert_eq!(exec.current_stage, RolloutStage::RolledBack);
    let reason = exec.rollback_reason.clone().unwrap();
    assert!(reason.contains("p99 latency 900ms"), "{reason}");
    assert_eq!(applier.revert_count(), 1);

    let last = exec.health_snapshot_per_stage.last().unwrap();
    assert_eq!(last.from, RolloutStage::Canary50);
    assert_eq!(last.to, RolloutStage::RolledBack);
    assert!(!last.snapshot.as_ref().unwrap().ok);

    assert!(matches!(
        sm.advance(id).await,
        Err(RolloutError::TerminalState {
            stage: RolloutStage::RolledBack,
            ..
        })
    ));
    assert!(matches!(
        sm.abort(id, "again").await,
        Err(RolloutError::TerminalState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn probe_timeout_fails_closed() {
    let (store, id) = approved_in_store(proposal(PriorityClass::Cost, &["cache-1"])).await;
    let probe = Arc::new(ScriptedProbe::new([ProbeStep::Hang(Duration::from_secs(600))]));
    let applier = Arc::new(RecordingApplier::new());
    let sm = machine(store, probe.clone(), applier.clone())
        .with_probe_timeout(Duration::from_millis(250));

    sm.start(id).await.unwrap();
    let exec = sm.advance(id).await.unwrap();

    assert_eq!(exec.current_stage, RolloutStage::RolledBack);
    assert_eq!(probe.call_count(), 1);
    assert!(applier.applied_percents().is_empty());
    let snapshot = exec.health_snapshot_per_stage[0].snapshot.clone().unwrap();
    assert!(snapshot.timed_out);
    assert!(exec.rollback_reason.unwrap().contains("timed out after 250ms"));
}

#[tokio::test(start_paused = true)]
async fn transient_probe_failures_are_retried() {
    let (store, id) = approved_in_store(proposal(PriorityClass::Cost, &["cache-1"])).await;
    let probe = Arc::new(ScriptedProbe::new([
        ProbeStep::Fail(ProbeError::Unavailable("connection refused".into())),
        ProbeStep::Fail(ProbeError::Unavailable("connection refused".into())),
    ]));
    let sm = machine(store, probe.clone(), Arc::new(RecordingApplier::new()));

    sm.start(id).await.unwrap();
    let exec = sm.advance(id).await.unwrap();
    assert_eq!(exec.current_stage, RolloutStage::Canary10);
    assert_eq!(probe.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn persistent_probe_failure_rolls_back() {
    let (store, id) = approved_in_store(proposal(PriorityClass::Cost, &["cache-1"])).await;
    let down = || ProbeStep::Fail(ProbeError::Unavailable("503".into()));
    let probe = Arc::new(ScriptedProbe::new([down(), down(), down()]));
    let applier = Arc::new(RecordingApplier::new());
    let sm = machine(store, probe.clone(), applier.clone());

    sm.start(id).await.unwrap();
    let exec = sm.advance(id).await.unwrap();
    assert_eq!(exec.current_stage, RolloutStage::RolledBack);
    assert_eq!(probe.call_count(), 3);
    assert!(exec.rollback_reason.unwrap().contains("after 3 attempt(s)"));
    assert_eq!(applier.revert_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_apply_failure_is_retried_then_applied() {
    let (store, id) = approved_in_store(proposal(PriorityClass::Cost, &["cache-1"])).await;
    let applier = Arc::new(
        RecordingApplier::new().fail_apply_with([ApplyError::Unavailable("throttled".into())]),
    );
    let sm = machine(store, Arc::new(ScriptedProbe::healthy()), applier.clone());

    sm.start(id).await.unwrap();
    let exec = sm.advance(id).await.unwrap();
    assert_eq!(exec.current_stage, RolloutStage::Canary10);
    assert_eq!(applier.applied_percents(), vec![10, 10]);
}

#[tokio::test]
async fn slo_thresholds_gate_advance() {
    let (store, id) = approved_in_store(proposal(PriorityClass::Cost, &["api-1"])).await;
    let probe = Arc::new(ScriptedProbe::new([ProbeStep::Respond(
        HealthSnapshot::healthy().with_detail("error_rate", serde_json::json!(0.2)),
    )]));
    let sm = machine(store, probe, Arc::new(RecordingApplier::new()))
        .with_slo_policy(Arc::new(ThresholdSloPolicy::new().with_max("error_rate", 0.05)));

    sm.start(id).await.unwrap();
    let exec = sm.advance(id).await.unwrap();
    assert_eq!(exec.current_stage, RolloutStage::RolledBack);
    assert!(exec.rollback_reason.unwrap().contains("error_rate"));
}

#[tokio::test]
async fn advance_resumes_from_persisted_stage() {
    let (store, id) = approved_in_store(proposal(PriorityClass::Performance, &["web-1"])).await;
    let applier = Arc::new(RecordingApplier::new());
    let first = machine(store.clone(), Arc::new(ScriptedProbe::healthy()), applier.clone());
    first.start(id).await.unwrap();
    first.advance(id).await.unwrap();
    drop(first);

    // Fresh machine over a reloaded store, as after a restart
    let reloaded = Arc::new(InMemoryStore::from_snapshot(store.snapshot()));
    let second = machine(reloaded, Arc::new(ScriptedProbe::healthy()), applier.clone());
    let exec = second.advance(id).await.unwrap();

    assert_eq!(exec.current_stage, RolloutStage::Canary50);
    assert_eq!(applier.applied_percents(), vec![10, 50]);
    assert_eq!(
        exec.visited_stages(),
        vec![
            RolloutStage::NotStarted,
            RolloutStage::Canary10,
            RolloutStage::Canary50
        ]
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stages_only_move_forward_or_roll_back(health in prop::collection::vec(any::<bool>(), 1..8)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (store, id) = approved_in_store(proposal(PriorityClass::Cost, &["r"])).await;
            let steps = health.iter().map(|ok| {
                ProbeStep::Respond(if *ok {
                    HealthSnapshot::healthy()
                } else {
                    HealthSnapshot::unhealthy("bad")
                })
            });
            let sm = machine(store, Arc::new(ScriptedProbe::new(steps)), Arc::new(RecordingApplier::new()))
                .with_retry_policy(RetryPolicy::no_retry());
            sm.start(id).await.unwrap();

            let mut last_rank = RolloutStage::NotStarted.rank();
            for _ in 0..health.len() {
                match sm.advance(id).await {
                    Ok(exec) if exec.current_stage == RolloutStage::RolledBack => {
                        assert!(exec.rollback_reason.is_some());
                        break;
                    }
                    Ok(exec) => {
                        let rank = exec.current_stage.rank();
                        assert!(rank > last_rank);
                        last_rank = rank;
                    }
                    Err(RolloutError::TerminalState { stage, .. }) => {
                        assert_eq!(stage, RolloutStage::Completed);
                        break;
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }

            let exec = sm.execution(id).await.unwrap().unwrap();
            let visited = exec.visited_stages();
            let mut seen = std::collections::HashSet::new();
            assert!(visited.iter().all(|s| seen.insert(*s)), "stage revisited: {visited:?}");
        });
    }
}
