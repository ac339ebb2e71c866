//! Conflict resolver integration tests

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rollgate_conflict::{ConflictConfig, ConflictError, ConflictResolver};
use rollgate_decision::DecisionEngine;
use rollgate_model::{
    Notification, PriorityClass, Proposal, ProposalStatus, ResolutionOutcome,
    ResolutionStrategyKind,
};
use rollgate_store::{InMemoryStore, RecordStore};
use rollgate_test_utils::{proposal, proposal_at, RecordingSink, StaticMetricSource};
use std::sync::Arc;

async fn stored(store: &InMemoryStore, proposals: &[&Proposal]) {
    for p in proposals {
        store
            .insert_proposal((*p).clone(), ProposalStatus::Pending)
            .await
            .unwrap();
    }
}

fn resolver(store: Arc<InMemoryStore>, config: &ConflictConfig, new_quality: f64) -> ConflictResolver {
    ConflictResolver::from_config(
        config,
        store,
        Arc::new(StaticMetricSource::quality(new_quality)),
        DecisionEngine::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn disjoint_proposals_produce_no_conflict_record() {
    let store = Arc::new(InMemoryStore::new());
    let a = proposal(PriorityClass::Cost, &["web-1", "web-2"]);
    let b = proposal(PriorityClass::Cost, &["db-1"]);
    stored(&store, &[&a, &b]).await;

    let resolver = resolver(store, &ConflictConfig::default(), 86.0);
    assert!(resolver.detect(&[a.clone(), b.clone()]).is_empty());
    assert!(resolver.detect_against(&a, &[b]).is_empty());
}

#[tokio::test]
async fn dominant_priority_overrides_and_notifies_both_agents() {
    let store = Arc::new(InMemoryStore::new());
    let a = proposal_at(PriorityClass::Performance, &["db-1"], 0);
    let b = proposal_at(PriorityClass::CustomerMandated, &["db-1", "db-2"], 5);
    stored(&store, &[&a, &b]).await;

    let sink = Arc::new(RecordingSink::new());
    let resolver = resolver(store, &ConflictConfig::default(), 86.0).with_notifier(sink.clone());
    let conflict = resolver.detect(&[a.clone(), b.clone()]).remove(0);
    let record = resolver.resolve(conflict).await.unwrap();

    assert_eq!(record.resolution_strategy, Some(ResolutionStrategyKind::PriorityOverride));
    assert_eq!(
        record.resolution_outcome,
        Some(ResolutionOutcome::PriorityOverride {
            winner: b.proposal_id,
            loser: a.proposal_id
        })
    );
    assert!(record.resolved_at.is_some());
    assert_eq!(sink.len(), 2);
    assert!(matches!(
        &sink.sent_to(a.originating_agent_id)[0],
        Notification::ConflictResolved(r) if r.id == record.id
    ));
}

#[tokio::test]
async fn equal_priority_with_aligned_impacts_blends() {
    let store = Arc::new(InMemoryStore::new());
    let a = proposal_at(PriorityClass::Performance, &["web-1", "web-2"], 0);
    let b = proposal_at(PriorityClass::Performance, &["web-2", "web-3"], 1);
    stored(&store, &[&a, &b]).await;

    let resolver = resolver(store, &ConflictConfig::default(), 86.0);
    let conflict = resolver.detect(&[a.clone(), b.clone()]).remove(0);
    let record = resolver.resolve(conflict).await.unwrap();

    assert_eq!(record.resolution_strategy, Some(ResolutionStrategyKind::HybridNegotiation));
    let Some(ResolutionOutcome::Hybrid { blended, partition }) = record.resolution_outcome else {
        panic!("expected hybrid outcome");
    };
    assert_eq!(blended.affected_resource_ids.len(), 3);
    assert_eq!(partition.len(), 2);
    assert!(record.reasoning.iter().any(|r| r.starts_with("priority_override declined")));
}

#[tokio::test]
async fn rejected_blend_falls_through_to_sequential() {
    let store = Arc::new(InMemoryStore::new());
    let a = proposal_at(PriorityClass::Cost, &["web-1", "web-2"], 0);
    let b = proposal_at(PriorityClass::Cost, &["web-2", "web-3"], 1);
    stored(&store, &[&a, &b]).await;

    let resolver = resolver(store, &ConflictConfig::default(), 70.0);
    let conflict = resolver.detect(&[a.clone(), b.clone()]).remove(0);
    let record = resolver.resolve(conflict).await.unwrap();

    assert_eq!(
        record.resolution_outcome,
        Some(ResolutionOutcome::Sequential {
            order: vec![a.proposal_id, b.proposal_id]
        })
    );
    assert!(record.reasoning.iter().any(|r| r.starts_with("hybrid_negotiation declined")));
}

#[tokio::test]
async fn exhausted_chain_is_unresolvable() {
    let store = Arc::new(InMemoryStore::new());
    let a = proposal_at(PriorityClass::Safety, &["db-1"], 0);
    let b = proposal_at(PriorityClass::Safety, &["db-1"], 1);
    stored(&store, &[&a, &b]).await;

    let config = ConflictConfig {
        enabled_strategies: vec![
            ResolutionStrategyKind::PriorityOverride,
            ResolutionStrategyKind::HybridNegotiation,
        ],
        ..ConflictConfig::default()
    };
    let resolver = resolver(store, &config, 86.0);
    let conflict = resolver.detect(&[a, b]).remove(0);
    let err = resolver.resolve(conflict).await.unwrap_err();

    assert!(err.requires_human());
    let ConflictError::Unresolvable { record } = err else {
        panic!("expected unresolvable");
    };
    assert!(!record.is_resolved());
    // Detection line plus one decline per strategy
    assert_eq!(record.reasoning.len(), 3);
}

#[tokio::test]
async fn resolved_records_are_not_reopened() {
    let store = Arc::new(InMemoryStore::new());
    let a = proposal_at(PriorityClass::Cost, &["db-1"], 0);
    let b = proposal_at(PriorityClass::Safety, &["db-1"], 1);
    stored(&store, &[&a, &b]).await;

    let resolver = resolver(store, &ConflictConfig::default(), 86.0);
    let conflict = resolver.detect(&[a, b]).remove(0);
    let record = resolver.resolve(conflict).await.unwrap();
    assert!(matches!(
        resolver.resolve(record).await,
        Err(ConflictError::AlreadyResolved(_))
    ));
}

fn priority() -> impl Strategy<Value = PriorityClass> {
    prop::sample::select(PriorityClass::all().to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn equal_priority_never_overrides(
        class in priority(),
        impact_a in -5.0f64..5.0,
        impact_b in -5.0f64..5.0,
        extra in 0usize..3,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let record = rt.block_on(async {
            let store = Arc::new(InMemoryStore::new());
            let names: Vec<String> = (0..extra).map(|i| format!("x{i}")).collect();
            let mut a_resources = vec!["shared"];
            a_resources.extend(names.iter().map(String::as_str));
            let mut a = proposal_at(class, &a_resources, 0);
            let mut b = proposal_at(class, &["shared", "other"], 1);
            a.predicted_impact = impact_a;
            b.predicted_impact = impact_b;
            store.insert_proposal(a.clone(), ProposalStatus::Pending).await.unwrap();
            store.insert_proposal(b.clone(), ProposalStatus::Pending).await.unwrap();

            let resolver = resolver(store.clone(), &ConflictConfig::default(), 86.0);
            let conflict = resolver.detect(&[a, b]).remove(0);
            resolver.resolve(conflict).await.unwrap()
        });
        prop_assert_ne!(record.resolution_strategy, Some(ResolutionStrategyKind::PriorityOverride));
    }
}
