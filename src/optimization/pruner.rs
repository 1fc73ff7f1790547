//! Early stopping of unpromising trials.
use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::{ConfigurationError, TrialId};

/// Intermediate values reported so far, grouped by step.
///
/// Values are only ever appended.
#[derive(Clone, Debug, Default)]
pub struct PruningStore {
    by_step: BTreeMap<usize, Vec<(TrialId, f64)>>,
}

impl PruningStore {
    /// An empty store.
    pub fn new() -> Self {
        PruningStore::default()
    }

    /// Record that `trial_id` reported `value` at `step`.
    pub fn record(&mut self, trial_id: TrialId, step: usize, value: f64) {
        self.by_step
            .entry(step)
            .or_default()
            .push((trial_id, value));
    }

    /// Every `(trial, value)` reported at `step`.
    pub fn values_at(&self, step: usize) -> &[(TrialId, f64)] {
        self.by_step
            .get(&step)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Values other trials reported at `step`, NaNs excluded.
    pub fn others_at(&self, step: usize, trial_id: TrialId) -> Vec<f64> {
        self.values_at(step)
            .iter()
            .filter(|(other, value)| *other != trial_id && !value.is_nan())
            .map(|(_, value)| *value)
            .collect()
    }
}

/// Decides whether a trial should stop at a reporting point.
pub trait Pruner: Send + Debug {
    /// `value` is what `trial_id` reported at `step`; `store` holds what
    /// every trial, this one included, has reported so far.
    fn should_prune(&self, trial_id: TrialId, step: usize, value: f64, store: &PruningStore) -> bool;
}

/// Never prunes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn should_prune(&self, _: TrialId, _: usize, _: f64, _: &PruningStore) -> bool {
        false
    }
}

impl Pruner for Box<dyn Pruner> {
    fn should_prune(&self, trial_id: TrialId, step: usize, value: f64, store: &PruningStore) -> bool {
        (**self).should_prune(trial_id, step, value, store)
    }
}

/// Prunes a trial whose value falls below a percentile of the values other
/// trials reported at the same step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PercentilePruner {
    /// Percentile in `[0, 100]`; 50 is the median rule.
    pub percentile: f64,
    /// Steps `1..=n_warmup_steps` are never pruned.
    pub n_warmup_steps: usize,
    /// Minimum number of other trials that must have reached the step.
    pub n_min_trials: usize,
}

impl Default for PercentilePruner {
    fn default() -> Self {
        PercentilePruner {
            percentile: 50.0,
            n_warmup_steps: 0,
            n_min_trials: 1,
        }
    }
}

impl PercentilePruner {
    /// A pruner with the given percentile.
    pub fn new(percentile: f64) -> Self {
        PercentilePruner {
            percentile,
            ..PercentilePruner::default()
        }
    }

    /// The median rule.
    pub fn median() -> Self {
        PercentilePruner::default()
    }

    /// Set the number of warm-up steps.
    pub fn n_warmup_steps(mut self, n_warmup_steps: usize) -> Self {
        self.n_warmup_steps = n_warmup_steps;
        self
    }

    /// Set the minimum number of other trials.
    pub fn n_min_trials(mut self, n_min_trials: usize) -> Self {
        self.n_min_trials = n_min_trials;
        self
    }

    /// Check the percentile lies in `[0, 100]`.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0..=100.0).contains(&self.percentile) {
            return Err(ConfigurationError::InvalidOptimizerConfig(format!(
                "percentile must lie in [0, 100], got {}",
                self.percentile
            )));
        }
        Ok(())
    }
}

/// Linear-interpolation percentile of ascending `sorted`.
fn percentile(sorted: &[f64], percentile: f64) -> f64 {
    let rank = percentile / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

impl Pruner for PercentilePruner {
    fn should_prune(&self, trial_id: TrialId, step: usize, value: f64, store: &PruningStore) -> bool {
        if step <= self.n_warmup_steps {
            return false;
        }

        let mut others = store.others_at(step, trial_id);
        if others.is_empty() || others.len() < self.n_min_trials {
            return false;
        }

        others.sort_by(|x, y| x.total_cmp(y));

        value < percentile(&others, self.percentile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn interpolated_percentiles() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(percentile(&values, 0.0), 1.0);
        assert_relative_eq!(percentile(&values, 50.0), 2.5);
        assert_relative_eq!(percentile(&values, 100.0), 4.0);
        assert_relative_eq!(percentile(&[7.0], 30.0), 7.0);
    }

    #[test]
    fn median_rule() {
        let mut store = PruningStore::new();
        store.record(0, 1, 0.5);
        store.record(1, 1, 0.7);
        store.record(2, 1, 0.4);

        let pruner = PercentilePruner::median();
        assert!(pruner.should_prune(2, 1, 0.4, &store));
        assert!(!pruner.should_prune(1, 1, 0.7, &store));
        // No one else reached step 2.
        store.record(2, 2, 0.1);
        assert!(!pruner.should_prune(2, 2, 0.1, &store));
    }

    #[test]
    fn warmup_and_minimum_trials() {
        let mut store = PruningStore::new();
        for trial_id in 0..3 {
            store.record(trial_id, 1, 1.0);
            store.record(trial_id, 2, 1.0);
        }
        store.record(3, 1, 0.0);
        store.record(3, 2, 0.0);

        let warm = PercentilePruner::median().n_warmup_steps(1);
        assert!(!warm.should_prune(3, 1, 0.0, &store));
        assert!(warm.should_prune(3, 2, 0.0, &store));

        let strict = PercentilePruner::median().n_min_trials(4);
        assert!(!strict.should_prune(3, 2, 0.0, &store));

        assert!(!NopPruner.should_prune(3, 2, 0.0, &store));
    }

    #[test]
    fn store_is_per_step() {
        let mut store = PruningStore::new();
        store.record(0, 1, 0.5);
        store.record(1, 1, f64::NAN);
        store.record(1, 2, 0.2);

        assert_eq!(store.values_at(1).len(), 2);
        assert_eq!(store.others_at(1, 0), Vec::<f64>::new());
        assert_eq!(store.others_at(2, 0), vec![0.2]);
        assert!(store.values_at(3).is_empty());
    }

    #[test]
    fn percentile_bounds_are_checked() {
        assert!(PercentilePruner::new(25.0).validate().is_ok());
        assert!(PercentilePruner::new(120.0).validate().is_err());
        assert!(PercentilePruner::new(f64::NAN).validate().is_err());
    }
}
