//! Append-only observation log

use crate::StoreError;
use dashmap::DashMap;
use rollgate_model::{ExperimentId, Observation};

/// Append-only store of experiment observations keyed by experiment id
///
/// Ingestion is the hottest path in the system, so the trait is synchronous
/// and implementations must not block on other experiments.
pub trait ObservationLog: Send + Sync {
    /// Append one observation
    ///
    /// # Errors
    /// Backend failure
    fn append(&self, observation: &Observation) -> Result<(), StoreError>;

    /// All observations of an experiment in append order
    ///
    /// # Errors
    /// Backend failure
    fn observations(&self, experiment_id: ExperimentId) -> Result<Vec<Observation>, StoreError>;
}

/// `DashMap`-backed [`ObservationLog`]
#[derive(Debug, Default)]
pub struct InMemoryObservationLog {
    entries: DashMap<ExperimentId, Vec<Observation>>,
}

impl InMemoryObservationLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of observations stored for an experiment
    #[must_use]
    pub fn len(&self, experiment_id: ExperimentId) -> usize {
        self.entries.get(&experiment_id).map_or(0, |v| v.len())
    }
}

impl ObservationLog for InMemoryObservationLog {
    fn append(&self, observation: &Observation) -> Result<(), StoreError> {
        self.entries
            .entry(observation.experiment_id)
            .or_default()
            .push(observation.clone());
        Ok(())
    }

    fn observations(&self, experiment_id: ExperimentId) -> Result<Vec<Observation>, StoreError> {
        Ok(self
            .entries
            .get(&experiment_id)
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }
}
