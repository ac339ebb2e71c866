//! Conflict resolver: strategy chain over stored proposals

use crate::detect;
use crate::error::ConflictError;
use crate::strategy::{
    HybridNegotiation, PriorityOverride, ResolutionStrategy, Sequential, StrategyOutcome,
    DEFAULT_HYBRID_SPLIT_PERCENT,
};
use rollgate_decision::DecisionEngine;
use rollgate_model::{
    ConflictRecord, MetricSource, Notification, NotificationSink, Proposal, ProposalId,
    ResolutionStrategyKind,
};
use rollgate_store::RecordStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Strategy chain configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Strategies tried, in order
    pub enabled_strategies: Vec<ResolutionStrategyKind>,
    /// Share of resources the leading proposal keeps in a hybrid blend
    pub hybrid_split_percent: u8,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            enabled_strategies: vec![
                ResolutionStrategyKind::PriorityOverride,
                ResolutionStrategyKind::HybridNegotiation,
                ResolutionStrategyKind::Sequential,
            ],
            hybrid_split_percent: DEFAULT_HYBRID_SPLIT_PERCENT,
        }
    }
}

impl ConflictConfig {
    /// Check the chain and split
    ///
    /// # Errors
    /// - [`ConflictError::InvalidChain`] for an empty chain or duplicates
    /// - [`ConflictError::InvalidSplit`] for a split outside `1..=99`
    pub fn validate(&self) -> Result<(), ConflictError> {
        if self.enabled_strategies.is_empty() {
            return Err(ConflictError::InvalidChain("no strategies enabled".into()));
        }
        let mut seen = HashSet::new();
        for kind in &self.enabled_strategies {
            if !seen.insert(*kind) {
                return Err(ConflictError::InvalidChain(format!("{kind} listed twice")));
            }
        }
        if !(1..=99).contains(&self.hybrid_split_percent) {
            return Err(ConflictError::InvalidSplit(self.hybrid_split_percent));
        }
        Ok(())
    }
}

/// Detects and resolves conflicts between pending proposals
pub struct ConflictResolver {
    chain: Vec<Arc<dyn ResolutionStrategy>>,
    store: Arc<dyn RecordStore>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("chain", &self.strategies())
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Resolver with an explicit chain
    ///
    /// # Errors
    /// [`ConflictError::InvalidChain`] for an empty chain
    pub fn new(
        chain: Vec<Arc<dyn ResolutionStrategy>>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, ConflictError> {
        if chain.is_empty() {
            return Err(ConflictError::InvalidChain("no strategies enabled".into()));
        }
        Ok(Self {
            chain,
            store,
            notifier: None,
        })
    }

    /// Resolver built from configuration
    ///
    /// # Errors
    /// See [`ConflictConfig::validate`]
    pub fn from_config(
        config: &ConflictConfig,
        store: Arc<dyn RecordStore>,
        metrics: Arc<dyn MetricSource>,
        engine: DecisionEngine,
    ) -> Result<Self, ConflictError> {
        config.validate()?;
        let mut chain: Vec<Arc<dyn ResolutionStrategy>> = Vec::new();
        for kind in &config.enabled_strategies {
            let strategy: Arc<dyn ResolutionStrategy> = match kind {
                ResolutionStrategyKind::PriorityOverride => Arc::new(PriorityOverride),
                ResolutionStrategyKind::HybridNegotiation => Arc::new(HybridNegotiation::new(
                    config.hybrid_split_percent,
                    metrics.clone(),
                    engine.clone(),
                )?),
                ResolutionStrategyKind::Sequential => Arc::new(Sequential),
            };
            chain.push(strategy);
        }
        Self::new(chain, store)
    }

    /// Notify originating agents of every resolution
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Strategy kinds in chain order
    #[must_use]
    pub fn strategies(&self) -> Vec<ResolutionStrategyKind> {
        self.chain.iter().map(|s| s.kind()).collect()
    }

    /// Every overlapping pair among `pending`
    #[must_use]
    pub fn detect(&self, pending: &[Proposal]) -> Vec<ConflictRecord> {
        detect::detect(pending)
    }

    /// Conflicts between `candidate` and `others`
    #[must_use]
    pub fn detect_against(&self, candidate: &Proposal, others: &[Proposal]) -> Vec<ConflictRecord> {
        detect::detect_against(candidate, others)
    }

    /// Run the strategy chain on a detected conflict
    ///
    /// Each declining strategy appends its reason to the record. The resolved
    /// record is returned but not persisted; the caller owns the record
    /// lifecycle.
    ///
    /// # Errors
    /// - [`ConflictError::Unresolvable`] when every strategy declines
    /// - [`ConflictError::MalformedRecord`] / [`ConflictError::AlreadyResolved`]
    /// - [`ConflictError::UnknownProposal`] if a proposal is not stored
    pub async fn resolve(&self, mut conflict: ConflictRecord) -> Result<ConflictRecord, ConflictError> {
        if conflict.is_resolved() {
            return Err(ConflictError::AlreadyResolved(conflict.id));
        }
        let [first_id, second_id] = conflict.conflicting_proposal_ids[..] else {
            return Err(ConflictError::MalformedRecord(format!(
                "expected two proposals, found {}",
                conflict.conflicting_proposal_ids.len()
            )));
        };
        let first = self.load(first_id).await?;
        let second = self.load(second_id).await?;

        for strategy in &self.chain {
            match strategy.attempt(&first, &second).await? {
                StrategyOutcome::Resolved { outcome, reason } => {
                    let record = conflict.resolved(outcome, format!("{}: {reason}", strategy.kind()));
                    info!(
                        conflict_id = %record.id,
                        strategy = %strategy.kind(),
                        first = %first_id,
                        second = %second_id,
                        "conflict resolved"
                    );
                    self.notify(&[&first, &second], &record).await;
                    return Ok(record);
                }
                StrategyOutcome::Declined(reason) => {
                    conflict
                        .reasoning
                        .push(format!("{} declined: {reason}", strategy.kind()));
                }
            }
        }

        warn!(
            conflict_id = %conflict.id,
            first = %first_id,
            second = %second_id,
            "no strategy resolved the conflict"
        );
        Err(ConflictError::Unresolvable {
            record: Box::new(conflict),
        })
    }

    async fn load(&self, id: ProposalId) -> Result<Proposal, ConflictError> {
        self.store
            .proposal(id)
            .await?
            .ok_or(ConflictError::UnknownProposal(id))
    }

    async fn notify(&self, proposals: &[&Proposal], record: &ConflictRecord) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let mut agents = Vec::new();
        for p in proposals {
            if !agents.contains(&p.originating_agent_id) {
                agents.push(p.originating_agent_id);
            }
        }
        for agent in agents {
            notifier
                .notify(agent, Notification::ConflictResolved(record.clone()))
                .await;
        }
    }
}
