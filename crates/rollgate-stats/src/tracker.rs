//! A/B experiment lifecycle
//!
//! Ingestion only appends under a short per-experiment write lock. Results
//! are computed lazily on read, outside any lock, and cached against the
//! experiment's observation version.

use crate::comparator::{StatisticalComparator, MIN_SAMPLES_FOR_VARIANCE};
use crate::error::TrackerError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rollgate_model::{ExperimentId, ExperimentResult, Group, Observation};
use rollgate_store::ObservationLog;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Default minimum samples per group
pub const DEFAULT_MIN_SAMPLE_SIZE: usize = 30;

/// Result of [`ExperimentTracker::get_result`]
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentStatus {
    /// Both groups reached the minimum sample size
    Ready(ExperimentResult),
    /// Still collecting
    Pending(PendingCounts),
}

impl ExperimentStatus {
    /// The result, if ready
    #[must_use]
    pub fn ready(self) -> Option<ExperimentResult> {
        match self {
            Self::Ready(result) => Some(result),
            Self::Pending(_) => None,
        }
    }

    /// Whether still collecting
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Sample counts of an experiment that is not ready yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    /// Control samples so far
    pub control_n: usize,
    /// Treatment samples so far
    pub treatment_n: usize,
    /// Required per group
    pub min_sample_size: usize,
}

/// Point-in-time view of an experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    /// Experiment id
    pub experiment_id: ExperimentId,
    /// Metric being compared
    pub metric_name: String,
    /// Required per group
    pub min_sample_size: usize,
    /// Control samples so far
    pub control_n: usize,
    /// Treatment samples so far
    pub treatment_n: usize,
    /// Bumped on every accepted observation
    pub version: u64,
    /// Whether a result for this version is cached
    pub cached: bool,
    /// Registration time
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Samples {
    control: Vec<f64>,
    treatment: Vec<f64>,
    version: u64,
}

#[derive(Debug)]
struct Experiment {
    metric_name: String,
    min_sample_size: usize,
    registered_at: DateTime<Utc>,
    samples: RwLock<Samples>,
    cache: Mutex<Option<(u64, ExperimentResult)>>,
}

/// Registry of running experiments
pub struct ExperimentTracker {
    experiments: DashMap<ExperimentId, Arc<Experiment>>,
    comparator: StatisticalComparator,
    default_min_sample_size: usize,
    log: Option<Arc<dyn ObservationLog>>,
}

impl std::fmt::Debug for ExperimentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentTracker")
            .field("experiments", &self.experiments.len())
            .field("comparator", &self.comparator)
            .field("default_min_sample_size", &self.default_min_sample_size)
            .field("log", &self.log.is_some())
            .finish()
    }
}

impl Default for ExperimentTracker {
    fn default() -> Self {
        Self::new(StatisticalComparator::default())
    }
}

impl ExperimentTracker {
    /// Tracker using `comparator` for results
    #[must_use]
    pub fn new(comparator: StatisticalComparator) -> Self {
        Self {
            experiments: DashMap::new(),
            comparator,
            default_min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            log: None,
        }
    }

    /// Set the minimum sample size used by [`Self::register_default`]
    #[must_use]
    pub fn with_default_min_sample_size(mut self, min_sample_size: usize) -> Self {
        self.default_min_sample_size = min_sample_size;
        self
    }

    /// Mirror every accepted observation into `log`
    #[must_use]
    pub fn with_observation_log(mut self, log: Arc<dyn ObservationLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Register an experiment
    ///
    /// # Errors
    /// - [`TrackerError::DuplicateExperiment`] if already registered
    /// - [`TrackerError::InvalidMinSampleSize`] if below 2
    pub fn register(
        &self,
        experiment_id: ExperimentId,
        metric_name: impl Into<String>,
        min_sample_size: usize,
    ) -> Result<(), TrackerError> {
        if min_sample_size < MIN_SAMPLES_FOR_VARIANCE {
            return Err(TrackerError::InvalidMinSampleSize(min_sample_size));
        }
        let metric_name = metric_name.into();
        match self.experiments.entry(experiment_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TrackerError::DuplicateExperiment(experiment_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(%experiment_id, metric = %metric_name, min_sample_size, "experiment registered");
                slot.insert(Arc::new(Experiment {
                    metric_name,
                    min_sample_size,
                    registered_at: Utc::now(),
                    samples: RwLock::new(Samples::default()),
                    cache: Mutex::new(None),
                }));
                Ok(())
            }
        }
    }

    /// Register with the tracker's default minimum sample size
    ///
    /// # Errors
    /// See [`Self::register`]
    pub fn register_default(
        &self,
        experiment_id: ExperimentId,
        metric_name: impl Into<String>,
    ) -> Result<(), TrackerError> {
        self.register(experiment_id, metric_name, self.default_min_sample_size)
    }

    /// Whether `experiment_id` is registered
    #[must_use]
    pub fn contains(&self, experiment_id: ExperimentId) -> bool {
        self.experiments.contains_key(&experiment_id)
    }

    fn experiment(&self, experiment_id: ExperimentId) -> Result<Arc<Experiment>, TrackerError> {
        self.experiments
            .get(&experiment_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(TrackerError::UnknownExperiment(experiment_id))
    }

    /// Ingest one observation
    ///
    /// # Errors
    /// - [`TrackerError::UnknownExperiment`] if not registered
    /// - [`TrackerError::InvalidValue`] for NaN or infinite values
    /// - [`TrackerError::Store`] if the observation log rejects the append
    pub fn add_observation(
        &self,
        experiment_id: ExperimentId,
        group: Group,
        value: f64,
    ) -> Result<(), TrackerError> {
        let experiment = self.experiment(experiment_id)?;
        if !value.is_finite() {
            return Err(TrackerError::InvalidValue(value));
        }
        if let Some(log) = &self.log {
            log.append(&Observation::now(experiment_id, group, value))?;
        }

        let mut samples = experiment.samples.write();
        match group {
            Group::Control => samples.control.push(value),
            Group::Treatment => samples.treatment.push(value),
        }
        samples.version += 1;
        Ok(())
    }

    /// Ingest one observation with a textual group name
    ///
    /// # Errors
    /// [`TrackerError::InvalidGroup`] unless the name is `control` or
    /// `treatment`, plus everything [`Self::add_observation`] returns
    pub fn add_named_observation(
        &self,
        experiment_id: ExperimentId,
        group: &str,
        value: f64,
    ) -> Result<(), TrackerError> {
        // Unknown experiment takes precedence over a bad group name
        self.experiment(experiment_id)?;
        let group: Group = group
            .parse()
            .map_err(|e: rollgate_model::UnknownGroup| TrackerError::InvalidGroup(e.0))?;
        self.add_observation(experiment_id, group, value)
    }

    /// Current result, or the counts collected so far
    ///
    /// # Errors
    /// - [`TrackerError::UnknownExperiment`] if not registered
    /// - [`TrackerError::Stats`] if the comparator rejects the samples
    pub fn get_result(&self, experiment_id: ExperimentId) -> Result<ExperimentStatus, TrackerError> {
        let experiment = self.experiment(experiment_id)?;

        let (control, treatment, version) = {
            let samples = experiment.samples.read();
            let pending = PendingCounts {
                control_n: samples.control.len(),
                treatment_n: samples.treatment.len(),
                min_sample_size: experiment.min_sample_size,
            };
            if pending.control_n < pending.min_sample_size
                || pending.treatment_n < pending.min_sample_size
            {
                return Ok(ExperimentStatus::Pending(pending));
            }
            if let Some((cached_version, result)) = experiment.cache.lock().as_ref() {
                if *cached_version == samples.version {
                    return Ok(ExperimentStatus::Ready(result.clone()));
                }
            }
            (
                samples.control.clone(),
                samples.treatment.clone(),
                samples.version,
            )
        };

        let result = self.comparator.compare(&control, &treatment)?;
        debug!(
            %experiment_id,
            version,
            p_value = result.p_value,
            effect_size = result.effect_size,
            "experiment result recomputed"
        );

        let mut cache = experiment.cache.lock();
        if cache.as_ref().map_or(true, |(v, _)| *v < version) {
            *cache = Some((version, result.clone()));
        }
        Ok(ExperimentStatus::Ready(result))
    }

    /// Counts and cache state for an experiment
    ///
    /// # Errors
    /// [`TrackerError::UnknownExperiment`] if not registered
    pub fn snapshot(&self, experiment_id: ExperimentId) -> Result<ExperimentSnapshot, TrackerError> {
        let experiment = self.experiment(experiment_id)?;
        let samples = experiment.samples.read();
        let cached = experiment
            .cache
            .lock()
            .as_ref()
            .is_some_and(|(v, _)| *v == samples.version);
        Ok(ExperimentSnapshot {
            experiment_id,
            metric_name: experiment.metric_name.clone(),
            min_sample_size: experiment.min_sample_size,
            control_n: samples.control.len(),
            treatment_n: samples.treatment.len(),
            version: samples.version,
            cached,
            registered_at: experiment.registered_at,
        })
    }

    /// Reload a registered experiment's samples from the observation log
    ///
    /// Returns the number of observations loaded. Used after a restart, when
    /// the in-memory samples are gone but the log survived.
    ///
    /// # Errors
    /// - [`TrackerError::UnknownExperiment`] if not registered
    /// - [`TrackerError::Store`] if the log cannot be read
    pub fn rehydrate(&self, experiment_id: ExperimentId) -> Result<usize, TrackerError> {
        let experiment = self.experiment(experiment_id)?;
        let Some(log) = &self.log else {
            return Ok(0);
        };
        let observations = log.observations(experiment_id)?;

        let mut samples = experiment.samples.write();
        samples.control.clear();
        samples.treatment.clear();
        for observation in &observations {
            match observation.group {
                Group::Control => samples.control.push(observation.metric_value),
                Group::Treatment => samples.treatment.push(observation.metric_value),
            }
        }
        samples.version += 1;
        info!(%experiment_id, loaded = observations.len(), "experiment rehydrated from log");
        Ok(observations.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_store::InMemoryObservationLog;

    fn tracker_with(min: usize) -> (ExperimentTracker, ExperimentId) {
        let tracker = ExperimentTracker::default();
        let id = ExperimentId::new();
        tracker.register(id, "latency_p99_ms", min).unwrap();
        (tracker, id)
    }

    #[test]
    fn duplicate_registration_fails() {
        let (tracker, id) = tracker_with(5);
        assert!(matches!(
            tracker.register(id, "other", 5),
            Err(TrackerError::DuplicateExperiment(_))
        ));
    }

    #[test]
    fn min_sample_size_below_two_is_rejected() {
        let tracker = ExperimentTracker::default();
        assert!(matches!(
            tracker.register(ExperimentId::new(), "m", 1),
            Err(TrackerError::InvalidMinSampleSize(1))
        ));
    }

    #[test]
    fn unknown_experiment_is_rejected() {
        let tracker = ExperimentTracker::default();
        let id = ExperimentId::new();
        assert!(matches!(
            tracker.add_observation(id, Group::Control, 1.0),
            Err(TrackerError::UnknownExperiment(_))
        ));
        assert!(matches!(
            tracker.get_result(id),
            Err(TrackerError::UnknownExperiment(_))
        ));
    }

    #[test]
    fn invalid_group_name_is_rejected() {
        let (tracker, id) = tracker_with(5);
        assert!(matches!(
            tracker.add_named_observation(id, "holdout", 1.0),
            Err(TrackerError::InvalidGroup(name)) if name == "holdout"
        ));
        tracker.add_named_observation(id, "treatment", 1.0).unwrap();
        assert_eq!(tracker.snapshot(id).unwrap().treatment_n, 1);
    }

    #[test]
    fn non_finite_value_is_rejected() {
        let (tracker, id) = tracker_with(5);
        assert!(matches!(
            tracker.add_observation(id, Group::Control, f64::INFINITY),
            Err(TrackerError::InvalidValue(_))
        ));
    }

    #[test]
    fn pending_until_both_groups_reach_minimum() {
        let (tracker, id) = tracker_with(3);
        for v in [1.0, 2.0, 3.0] {
            tracker.add_observation(id, Group::Control, v).unwrap();
        }
        tracker.add_observation(id, Group::Treatment, 2.0).unwrap();

        match tracker.get_result(id).unwrap() {
            ExperimentStatus::Pending(counts) => {
                assert_eq!(counts.control_n, 3);
                assert_eq!(counts.treatment_n, 1);
                assert_eq!(counts.min_sample_size, 3);
            }
            ExperimentStatus::Ready(_) => panic!("should still be pending"),
        }

        tracker.add_observation(id, Group::Treatment, 3.0).unwrap();
        tracker.add_observation(id, Group::Treatment, 4.0).unwrap();
        assert!(!tracker.get_result(id).unwrap().is_pending());
    }

    #[test]
    fn result_is_cached_until_new_observation() {
        let (tracker, id) = tracker_with(2);
        for v in [1.0, 2.0] {
            tracker.add_observation(id, Group::Control, v).unwrap();
            tracker.add_observation(id, Group::Treatment, v + 1.0).unwrap();
        }
        assert!(!tracker.snapshot(id).unwrap().cached);

        let first = tracker.get_result(id).unwrap().ready().unwrap();
        assert!(tracker.snapshot(id).unwrap().cached);

        tracker.add_observation(id, Group::Treatment, 9.0).unwrap();
        assert!(!tracker.snapshot(id).unwrap().cached);

        let second = tracker.get_result(id).unwrap().ready().unwrap();
        assert_eq!(second.treatment_n, 3);
        assert_ne!(first.treatment_mean, second.treatment_mean);
    }

    #[test]
    fn observations_are_mirrored_and_rehydrated() {
        let log = Arc::new(InMemoryObservationLog::new());
        let tracker = ExperimentTracker::default().with_observation_log(log.clone());
        let id = ExperimentId::new();
        tracker.register(id, "cost", 2).unwrap();
        tracker.add_observation(id, Group::Control, 1.0).unwrap();
        tracker.add_observation(id, Group::Treatment, 2.0).unwrap();
        assert_eq!(log.len(id), 2);

        // Fresh tracker over the same log, as after a restart
        let restarted = ExperimentTracker::default().with_observation_log(log);
        restarted.register(id, "cost", 2).unwrap();
        assert_eq!(restarted.rehydrate(id).unwrap(), 2);
        let snapshot = restarted.snapshot(id).unwrap();
        assert_eq!((snapshot.control_n, snapshot.treatment_n), (1, 1));
    }
}
