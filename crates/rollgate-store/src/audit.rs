//! Hash-chained audit log
//!
//! Each entry stores the SHA-256 of its predecessor, so any in-place edit or
//! removal breaks [`AuditLog::verify_integrity`].

use crate::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rollgate_model::ProposalId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// What an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Proposal registered
    Submission,
    /// Validation decision recorded
    Decision,
    /// Conflict detected and resolved (or escalated)
    ConflictResolution,
    /// Rollout stage transition
    StageTransition,
    /// Proposal withdrawn by its agent
    Withdrawal,
    /// Operator resolved a manual review
    OperatorOverride,
}

impl AuditKind {
    fn as_u8(self) -> u8 {
        match self {
            Self::Submission => 0,
            Self::Decision => 1,
            Self::ConflictResolution => 2,
            Self::StageTransition => 3,
            Self::Withdrawal => 4,
            Self::OperatorOverride => 5,
        }
    }
}

/// One audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, starting at 0
    pub sequence: u64,
    /// Append time
    pub recorded_at: DateTime<Utc>,
    /// Proposal the entry concerns
    pub proposal_id: ProposalId,
    /// Entry kind
    pub kind: AuditKind,
    /// Human-readable summary
    pub summary: String,
    /// Hash of the previous entry
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    pub hash: [u8; 32],
}

impl AuditEntry {
    /// Hex form of the entry hash
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Append-only, hash-chained audit log
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number
    pub fn append(&self, proposal_id: ProposalId, kind: AuditKind, summary: impl Into<String>) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or(GENESIS_HASH, |e| e.hash);
        let mut entry = AuditEntry {
            sequence: guard.len() as u64,
            recorded_at: Utc::now(),
            proposal_id,
            kind,
            summary: summary.into(),
            prev_hash,
            hash: GENESIS_HASH,
        };
        entry.hash = compute_hash(&entry);
        let sequence = entry.sequence;
        tracing::trace!(sequence, %proposal_id, ?kind, hash = %entry.hash_hex(), "audit entry appended");
        guard.push(entry);
        sequence
    }

    /// Every entry, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().clone()
    }

    /// Entries concerning one proposal, oldest first
    #[must_use]
    pub fn entries_for(&self, proposal_id: ProposalId) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.proposal_id == proposal_id)
            .cloned()
            .collect()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Recompute the chain
    ///
    /// # Errors
    /// [`StoreError::IntegrityViolation`] at the first entry whose link or
    /// hash does not match
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        verify_chain(&self.inner.lock())
    }

    #[cfg(test)]
    fn tamper(&self, sequence: usize, summary: &str) {
        if let Some(entry) = self.inner.lock().get_mut(sequence) {
            entry.summary = summary.to_string();
        }
    }
}

/// Verify an exported chain of entries
///
/// # Errors
/// [`StoreError::IntegrityViolation`] at the first broken entry
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), StoreError> {
    let mut prev = GENESIS_HASH;
    for entry in entries {
        if entry.prev_hash != prev || entry.hash != compute_hash(entry) {
            return Err(StoreError::IntegrityViolation {
                sequence: entry.sequence,
            });
        }
        prev = entry.hash;
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.sequence.to_le_bytes());
    hasher.update(entry.recorded_at.timestamp_micros().to_le_bytes());
    hasher.update(entry.proposal_id.0.to_bytes());
    hasher.update([entry.kind.as_u8()]);
    hasher.update(entry.summary.as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_verifies_after_appends() {
        let log = AuditLog::new();
        let id = ProposalId::new();
        assert_eq!(log.append(id, AuditKind::Submission, "submitted"), 0);
        assert_eq!(log.append(id, AuditKind::Decision, "approve (0.85)"), 1);
        log.append(ProposalId::new(), AuditKind::Submission, "other");

        assert!(log.verify_integrity().is_ok());
        assert_eq!(log.entries_for(id).len(), 2);
        let entries = log.entries();
        assert_eq!(entries[1].prev_hash, entries[0].hash);
    }

    #[test]
    fn tampering_is_detected() {
        let log = AuditLog::new();
        let id = ProposalId::new();
        log.append(id, AuditKind::Submission, "submitted");
        log.append(id, AuditKind::Decision, "reject (0.95)");
        log.append(id, AuditKind::Withdrawal, "withdrawn");

        log.tamper(1, "approve (0.95)");
        assert!(matches!(
            log.verify_integrity(),
            Err(StoreError::IntegrityViolation { sequence: 1 })
        ));
    }

    #[test]
    fn removing_an_entry_breaks_the_chain() {
        let log = AuditLog::new();
        let id = ProposalId::new();
        log.append(id, AuditKind::Submission, "a");
        log.append(id, AuditKind::Decision, "b");
        log.append(id, AuditKind::StageTransition, "c");

        let mut entries = log.entries();
        entries.remove(1);
        assert!(verify_chain(&entries).is_err());
    }
}
