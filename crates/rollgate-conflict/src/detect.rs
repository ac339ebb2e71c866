//! Conflict detection
//!
//! Two proposals conflict iff their affected resource sets intersect.

use rollgate_model::{ConflictRecord, Proposal};

fn submission_order(a: &Proposal, b: &Proposal) -> std::cmp::Ordering {
    (a.submission_time, a.proposal_id).cmp(&(b.submission_time, b.proposal_id))
}

/// Every overlapping pair among `pending`, one unresolved record per pair
///
/// Records list the earlier submission first. Output order is deterministic
/// regardless of input order.
#[must_use]
pub fn detect(pending: &[Proposal]) -> Vec<ConflictRecord> {
    let mut sorted: Vec<&Proposal> = pending.iter().collect();
    sorted.sort_by(|a, b| submission_order(a, b));
    sorted.dedup_by_key(|p| p.proposal_id);

    let mut records = Vec::new();
    for (i, first) in sorted.iter().enumerate() {
        for second in &sorted[i + 1..] {
            if first.overlaps(second) {
                records.push(ConflictRecord::detected(first, second));
            }
        }
    }
    records
}

/// Conflicts between `candidate` and each of `others`
#[must_use]
pub fn detect_against(candidate: &Proposal, others: &[Proposal]) -> Vec<ConflictRecord> {
    let mut overlapping: Vec<&Proposal> = others
        .iter()
        .filter(|o| o.proposal_id != candidate.proposal_id && o.overlaps(candidate))
        .collect();
    overlapping.sort_by(|a, b| submission_order(a, b));

    overlapping
        .into_iter()
        .map(|other| {
            if submission_order(other, candidate).is_le() {
                ConflictRecord::detected(other, candidate)
            } else {
                ConflictRecord::detected(candidate, other)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_model::{AgentId, PriorityClass};

    fn p(resources: &[&str]) -> Proposal {
        Proposal::builder(AgentId::new(), PriorityClass::Cost)
            .resources(resources.iter().copied())
            .build()
    }

    #[test]
    fn disjoint_sets_never_conflict() {
        let pending = vec![p(&["a", "b"]), p(&["c"]), p(&["d", "e"])];
        assert!(detect(&pending).is_empty());
    }

    #[test]
    fn overlap_produces_one_record_per_pair() {
        let pending = vec![p(&["a", "b"]), p(&["b", "c"]), p(&["c"])];
        let records = detect(&pending);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.conflicting_proposal_ids.len() == 2));
        assert!(records.iter().all(|r| !r.is_resolved()));
    }

    #[test]
    fn subset_still_conflicts() {
        let pending = vec![p(&["a", "b", "c"]), p(&["b"])];
        let records = detect(&pending);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].shared_resource_ids.len(), 1);
    }

    #[test]
    fn detect_against_skips_self() {
        let candidate = p(&["a"]);
        let others = vec![candidate.clone(), p(&["a"]), p(&["z"])];
        let records = detect_against(&candidate, &others);
        assert_eq!(records.len(), 1);
        assert!(records[0].involves(candidate.proposal_id));
    }
}
