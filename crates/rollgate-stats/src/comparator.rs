//! Welch two-sample comparison

use crate::distribution;
use crate::error::StatsError;
use rollgate_model::{ExperimentResult, Group, Winner};

/// Default significance level
pub const DEFAULT_SIGNIFICANCE_LEVEL: f64 = 0.05;

/// Fewest samples per group for which variance is defined
pub const MIN_SAMPLES_FOR_VARIANCE: usize = 2;

/// Mean, unbiased variance and size of one sample set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleSummary {
    /// Arithmetic mean
    pub mean: f64,
    /// Unbiased (n - 1) variance
    pub variance: f64,
    /// Number of samples
    pub n: usize,
}

impl SampleSummary {
    /// Summarize `samples`
    ///
    /// Summation runs over a sorted copy so the result does not depend on
    /// arrival order.
    ///
    /// # Errors
    /// - [`StatsError::InsufficientData`] for fewer than two samples
    /// - [`StatsError::NonFiniteSample`] for NaN or infinite values
    pub fn from_samples(group: Group, samples: &[f64]) -> Result<Self, StatsError> {
        if samples.len() < MIN_SAMPLES_FOR_VARIANCE {
            return Err(StatsError::InsufficientData {
                group,
                found: samples.len(),
                required: MIN_SAMPLES_FOR_VARIANCE,
            });
        }
        if let Some(&value) = samples.iter().find(|v| !v.is_finite()) {
            return Err(StatsError::NonFiniteSample { group, value });
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        #[allow(clippy::cast_precision_loss)]
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);

        Ok(Self {
            mean,
            variance,
            n: sorted.len(),
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn n_f64(&self) -> f64 {
        self.n as f64
    }
}

/// Welch t-test comparator with a fixed significance level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticalComparator {
    significance_level: f64,
}

impl Default for StatisticalComparator {
    fn default() -> Self {
        Self {
            significance_level: DEFAULT_SIGNIFICANCE_LEVEL,
        }
    }
}

impl StatisticalComparator {
    /// Comparator at `significance_level`
    ///
    /// # Errors
    /// [`StatsError::InvalidSignificanceLevel`] unless `0 < level < 1`
    pub fn new(significance_level: f64) -> Result<Self, StatsError> {
        if !(significance_level > 0.0 && significance_level < 1.0) {
            return Err(StatsError::InvalidSignificanceLevel(significance_level));
        }
        Ok(Self { significance_level })
    }

    /// Configured significance level
    #[must_use]
    pub fn significance_level(&self) -> f64 {
        self.significance_level
    }

    /// Compare control against treatment
    ///
    /// # Errors
    /// See [`compare`]
    pub fn compare(&self, control: &[f64], treatment: &[f64]) -> Result<ExperimentResult, StatsError> {
        compare(control, treatment, self.significance_level)
    }
}

/// Welch two-sample t-test of `treatment` against `control`
///
/// Produces a two-tailed p-value (Welch–Satterthwaite degrees of freedom),
/// Cohen's d on the pooled standard deviation and a 95% confidence interval
/// on `treatment_mean - control_mean`.
///
/// Zero variance in both groups is handled exactly: identical means give
/// `p = 1`, different means give `p = 0` and an infinite effect size.
///
/// # Errors
/// - [`StatsError::InsufficientData`] if either group has fewer than 2 samples
/// - [`StatsError::NonFiniteSample`] for NaN or infinite samples
/// - [`StatsError::InvalidSignificanceLevel`] unless `0 < significance_level < 1`
pub fn compare(
    control: &[f64],
    treatment: &[f64],
    significance_level: f64,
) -> Result<ExperimentResult, StatsError> {
    if !(significance_level > 0.0 && significance_level < 1.0) {
        return Err(StatsError::InvalidSignificanceLevel(significance_level));
    }
    let c = SampleSummary::from_samples(Group::Control, control)?;
    let t = SampleSummary::from_samples(Group::Treatment, treatment)?;

    let diff = t.mean - c.mean;
    let c_term = c.variance / c.n_f64();
    let t_term = t.variance / t.n_f64();
    let se2 = c_term + t_term;

    let pooled_df = c.n_f64() + t.n_f64() - 2.0;
    let pooled_sd = (((c.n_f64() - 1.0) * c.variance + (t.n_f64() - 1.0) * t.variance) / pooled_df).sqrt();

    let (p_value, confidence_interval_95, effect_size) = if se2 > 0.0 {
        let df = se2 * se2 / (c_term * c_term / (c.n_f64() - 1.0) + t_term * t_term / (t.n_f64() - 1.0));
        let se = se2.sqrt();
        let t_stat = diff / se;
        let p = distribution::two_tailed_p_value(t_stat, df);
        let t_crit = distribution::quantile(0.975, df);
        let ci = (diff - t_crit * se, diff + t_crit * se);
        (p, ci, diff / pooled_sd)
    } else if diff == 0.0 {
        (1.0, (0.0, 0.0), 0.0)
    } else {
        (0.0, (diff, diff), f64::INFINITY.copysign(diff))
    };

    let is_significant = p_value < significance_level;
    let winner = match (is_significant, diff.partial_cmp(&0.0)) {
        (true, Some(std::cmp::Ordering::Greater)) => Winner::Treatment,
        (true, Some(std::cmp::Ordering::Less)) => Winner::Control,
        _ => Winner::Tie,
    };

    Ok(ExperimentResult {
        control_mean: c.mean,
        treatment_mean: t.mean,
        p_value,
        effect_size,
        confidence_interval_95,
        is_significant,
        winner,
        control_n: c.n,
        treatment_n: t.n,
    })
}
