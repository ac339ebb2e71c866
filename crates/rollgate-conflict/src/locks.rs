//! Resource locks
//!
//! Two layers:
//! - [`ResourceLockTable`] holds resources for the lifetime of a rollout.
//!   Acquisition is all-or-nothing; blocked proposals wait in priority order
//!   and are granted on release.
//! - [`ResourceGate`] serializes short critical sections (conflict detection
//!   and resolution) per resource. Guards are taken in sorted order.

use parking_lot::Mutex;
use rollgate_model::{PriorityClass, Proposal, ProposalId, ResourceId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type WaitKey = (Reverse<PriorityClass>, chrono::DateTime<chrono::Utc>, ProposalId);

#[derive(Debug, Clone)]
struct Waiter {
    key: WaitKey,
    proposal_id: ProposalId,
    resources: BTreeSet<ResourceId>,
}

#[derive(Debug, Default)]
struct LockState {
    holders: BTreeMap<ResourceId, ProposalId>,
    held: HashMap<ProposalId, BTreeSet<ResourceId>>,
    /// Sorted by `key`
    waiters: Vec<Waiter>,
}

impl LockState {
    fn blockers(&self, resources: &BTreeSet<ResourceId>) -> BTreeSet<ProposalId> {
        resources
            .iter()
            .filter_map(|r| self.holders.get(r).copied())
            .collect()
    }

    fn grant(&mut self, proposal_id: ProposalId, resources: BTreeSet<ResourceId>) {
        for r in &resources {
            self.holders.insert(r.clone(), proposal_id);
        }
        self.held.insert(proposal_id, resources);
    }

    /// Whether a waiter ahead of `key` wants any of `resources`
    fn waiter_ahead(&self, key: &WaitKey, resources: &BTreeSet<ResourceId>) -> bool {
        self.waiters
            .iter()
            .take_while(|w| &w.key < key)
            .any(|w| !w.resources.is_disjoint(resources))
    }
}

/// Result of [`ResourceLockTable::try_acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// Every resource is now held by the proposal
    Acquired,
    /// Proposal is queued behind current holders or higher-ranked waiters
    Queued {
        /// Proposals currently holding a wanted resource
        blocked_by: Vec<ProposalId>,
        /// Zero-based position among all waiters
        position: usize,
    },
}

/// Rollout-lifetime resource ownership
///
/// No two proposals ever hold overlapping resource sets.
#[derive(Debug, Default)]
pub struct ResourceLockTable {
    state: Mutex<LockState>,
}

impl ResourceLockTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every resource of `proposal` or queue it
    ///
    /// Idempotent for a holder. A queued proposal calling again keeps its
    /// place.
    pub fn try_acquire(&self, proposal: &Proposal) -> LockOutcome {
        let mut state = self.state.lock();
        let id = proposal.proposal_id;
        if state.held.contains_key(&id) {
            return LockOutcome::Acquired;
        }

        let key = proposal.sequencing_key();
        let resources = proposal.affected_resource_ids.clone();
        let blockers = state.blockers(&resources);
        let already_waiting = state.waiters.iter().any(|w| w.proposal_id == id);

        if blockers.is_empty() && !state.waiter_ahead(&key, &resources) {
            state.waiters.retain(|w| w.proposal_id != id);
            state.grant(id, resources);
            debug!(proposal_id = %id, "resources acquired");
            return LockOutcome::Acquired;
        }

        if !already_waiting {
            let at = state.waiters.partition_point(|w| w.key < key);
            state.waiters.insert(
                at,
                Waiter {
                    key,
                    proposal_id: id,
                    resources,
                },
            );
        }
        let position = state
            .waiters
            .iter()
            .position(|w| w.proposal_id == id)
            .unwrap_or(0);
        debug!(proposal_id = %id, position, "resources busy, queued");
        LockOutcome::Queued {
            blocked_by: blockers.into_iter().collect(),
            position,
        }
    }

    /// Release everything `proposal_id` holds and drop it from the queue
    ///
    /// Returns the waiters granted their resources as a result, in priority
    /// order.
    pub fn release(&self, proposal_id: ProposalId) -> Vec<ProposalId> {
        let mut state = self.state.lock();
        state.waiters.retain(|w| w.proposal_id != proposal_id);
        let Some(resources) = state.held.remove(&proposal_id) else {
            return Vec::new();
        };
        for r in &resources {
            state.holders.remove(r);
        }

        let mut granted = Vec::new();
        let mut claimed: BTreeSet<ResourceId> = BTreeSet::new();
        let mut remaining = Vec::with_capacity(state.waiters.len());
        for waiter in std::mem::take(&mut state.waiters) {
            let free = state.blockers(&waiter.resources).is_empty()
                && waiter.resources.is_disjoint(&claimed);
            // Earlier waiters keep their claim even when still blocked
            claimed.extend(waiter.resources.iter().cloned());
            if free {
                granted.push(waiter.proposal_id);
                state.grant(waiter.proposal_id, waiter.resources);
            } else {
                remaining.push(waiter);
            }
        }
        state.waiters = remaining;
        debug!(%proposal_id, granted = granted.len(), "resources released");
        granted
    }

    /// Current holder of a resource
    #[must_use]
    pub fn holder_of(&self, resource: &ResourceId) -> Option<ProposalId> {
        self.state.lock().holders.get(resource).copied()
    }

    /// Whether the proposal holds its resources
    #[must_use]
    pub fn holds(&self, proposal_id: ProposalId) -> bool {
        self.state.lock().held.contains_key(&proposal_id)
    }

    /// Queued proposals in grant order
    #[must_use]
    pub fn waiting(&self) -> Vec<ProposalId> {
        self.state.lock().waiters.iter().map(|w| w.proposal_id).collect()
    }

    /// Number of proposals holding resources
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.state.lock().held.len()
    }
}

/// Per-resource async mutexes for short critical sections
#[derive(Debug, Default)]
pub struct ResourceGate {
    locks: Mutex<HashMap<ResourceId, Arc<AsyncMutex<()>>>>,
}

/// Guards for a locked resource set, released on drop
///
/// Dropping the guard also forgets mutexes nobody else is waiting on.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a ResourceGate,
    resources: BTreeSet<ResourceId>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl GateGuard<'_> {
    /// Resources covered by this guard
    #[must_use]
    pub fn resources(&self) -> &BTreeSet<ResourceId> {
        &self.resources
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        let mut locks = self.gate.locks.lock();
        for r in &self.resources {
            if locks.get(r).is_some_and(|m| Arc::strong_count(m) == 1) {
                locks.remove(r);
            }
        }
    }
}

impl ResourceGate {
    /// Empty gate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every resource in `resources`
    ///
    /// Mutexes are taken in sorted order, so overlapping callers cannot
    /// deadlock.
    pub async fn lock(&self, resources: &BTreeSet<ResourceId>) -> GateGuard<'_> {
        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock();
            resources
                .iter()
                .map(|r| locks.entry(r.clone()).or_default().clone())
                .collect()
        };
        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        GateGuard {
            gate: self,
            resources: resources.clone(),
            guards,
        }
    }

    /// Resources with a live mutex
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rollgate_model::AgentId;

    fn p(priority: PriorityClass, resources: &[&str], offset: i64) -> Proposal {
        Proposal::builder(AgentId::new(), priority)
            .resources(resources.iter().copied())
            .submitted_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset))
            .build()
    }

    #[test]
    fn disjoint_sets_are_held_concurrently() {
        let table = ResourceLockTable::new();
        assert_eq!(table.try_acquire(&p(PriorityClass::Cost, &["a"], 0)), LockOutcome::Acquired);
        assert_eq!(table.try_acquire(&p(PriorityClass::Cost, &["b"], 1)), LockOutcome::Acquired);
        assert_eq!(table.holder_count(), 2);
    }

    #[test]
    fn acquisition_is_all_or_nothing() {
        let table = ResourceLockTable::new();
        let first = p(PriorityClass::Cost, &["a"], 0);
        let second = p(PriorityClass::Cost, &["a", "b"], 1);
        table.try_acquire(&first);
        assert!(matches!(
            table.try_acquire(&second),
            LockOutcome::Queued { ref blocked_by, position: 0 } if blocked_by == &vec![first.proposal_id]
        ));
        assert_eq!(table.holder_of(&ResourceId::new("b")), None);

        assert_eq!(table.release(first.proposal_id), vec![second.proposal_id]);
        assert!(table.holds(second.proposal_id));
    }

    #[test]
    fn waiters_are_granted_by_priority() {
        let table = ResourceLockTable::new();
        let holder = p(PriorityClass::Cost, &["a"], 0);
        let low = p(PriorityClass::Cost, &["a"], 1);
        let high = p(PriorityClass::Safety, &["a"], 2);
        table.try_acquire(&holder);
        table.try_acquire(&low);
        table.try_acquire(&high);
        assert_eq!(table.waiting(), vec![high.proposal_id, low.proposal_id]);

        assert_eq!(table.release(holder.proposal_id), vec![high.proposal_id]);
        assert_eq!(table.release(high.proposal_id), vec![low.proposal_id]);
    }

    #[test]
    fn newcomer_cannot_jump_a_higher_ranked_waiter() {
        let table = ResourceLockTable::new();
        let holder = p(PriorityClass::Cost, &["a"], 0);
        let waiting = p(PriorityClass::Safety, &["a", "b"], 1);
        let newcomer = p(PriorityClass::Cost, &["b"], 2);
        table.try_acquire(&holder);
        table.try_acquire(&waiting);
        assert!(matches!(table.try_acquire(&newcomer), LockOutcome::Queued { .. }));

        let granted = table.release(holder.proposal_id);
        assert_eq!(granted, vec![waiting.proposal_id]);
    }

    #[test]
    fn release_of_waiter_just_dequeues() {
        let table = ResourceLockTable::new();
        let holder = p(PriorityClass::Cost, &["a"], 0);
        let waiter = p(PriorityClass::Cost, &["a"], 1);
        table.try_acquire(&holder);
        table.try_acquire(&waiter);
        assert!(table.release(waiter.proposal_id).is_empty());
        assert!(table.waiting().is_empty());
        assert!(table.holds(holder.proposal_id));
    }

    #[tokio::test]
    async fn gate_serializes_overlapping_sets() {
        let gate = Arc::new(ResourceGate::new());
        let set: BTreeSet<ResourceId> = ["a", "b"].iter().map(|s| ResourceId::new(*s)).collect();
        let guard = gate.lock(&set).await;

        let gate2 = gate.clone();
        let overlapping: BTreeSet<ResourceId> = std::iter::once(ResourceId::new("b")).collect();
        let handle = tokio::spawn(async move {
            let _g = gate2.lock(&overlapping).await;
        });
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        drop(guard);
        handle.await.unwrap();
        assert_eq!(gate.tracked(), 0);
    }

    #[tokio::test]
    async fn gate_forgets_idle_resources() {
        let gate = ResourceGate::new();
        for i in 0..50 {
            let set: BTreeSet<ResourceId> = std::iter::once(ResourceId::new(format!("r-{i}"))).collect();
            let guard = gate.lock(&set).await;
            assert_eq!(gate.tracked(), 1);
            drop(guard);
        }
        assert_eq!(gate.tracked(), 0);
    }

    #[tokio::test]
    async fn gate_keeps_a_mutex_someone_waits_on() {
        let gate = Arc::new(ResourceGate::new());
        let set: BTreeSet<ResourceId> = std::iter::once(ResourceId::new("a")).collect();
        let guard = gate.lock(&set).await;

        let waiter = {
            let gate = Arc::clone(&gate);
            let set = set.clone();
            tokio::spawn(async move {
                let _g = gate.lock(&set).await;
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            })
        };
        tokio::task::yield_now().await;
        drop(guard);
        assert_eq!(gate.tracked(), 1);

        let third = gate.lock(&set).await;
        drop(third);
        waiter.await.unwrap();
        assert_eq!(gate.tracked(), 0);
    }
}
