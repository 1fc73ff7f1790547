//! Hyperparameter samplers.
//!
//! A sampler proposes assignments, receives intermediate values through
//! [`Sampler::report`] (answering with a pruning decision) and learns the
//! final outcome of every trial through [`Sampler::tell`].
use std::f64::consts::PI;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pruner::{NopPruner, Pruner, PruningStore};
use super::space::{Assignment, ParamValue, ParameterDomain, SearchSpace};
use super::trial::{best_of, TrialRecord, TrialStatus};
use crate::{ConfigurationError, TrialId};

/// Answer to an intermediate report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PruneDecision {
    /// Keep training.
    Continue,
    /// Stop the trial now.
    Prune,
}

/// Capability of proposing hyperparameters and judging trial progress.
pub trait Sampler: Send {
    /// Propose an assignment for `trial_id`.
    fn suggest(&mut self, trial_id: TrialId, space: &SearchSpace) -> Assignment;
    /// Record an intermediate value and decide whether to prune.
    fn report(&mut self, trial_id: TrialId, step: usize, value: f64) -> PruneDecision;
    /// Learn the outcome of a finished trial.
    fn tell(&mut self, record: &TrialRecord);
    /// Best completed trial seen so far.
    fn best(&self) -> Option<&TrialRecord>;
}

/// Finished trials and pruning state shared by the samplers.
#[derive(Debug)]
struct Observations {
    finished: Vec<TrialRecord>,
    store: PruningStore,
    pruner: Box<dyn Pruner>,
}

impl Observations {
    fn new() -> Self {
        Observations {
            finished: Vec::new(),
            store: PruningStore::new(),
            pruner: Box::new(NopPruner),
        }
    }

    fn report(&mut self, trial_id: TrialId, step: usize, value: f64) -> PruneDecision {
        self.store.record(trial_id, step, value);

        if self.pruner.should_prune(trial_id, step, value, &self.store) {
            PruneDecision::Prune
        } else {
            PruneDecision::Continue
        }
    }

    fn tell(&mut self, record: &TrialRecord) {
        self.finished.push(record.clone());
    }

    fn best(&self) -> Option<&TrialRecord> {
        best_of(&self.finished)
    }
}

/// Independent uniform draws from the search space.
#[derive(Debug)]
pub struct RandomSampler {
    rng: XorShiftRng,
    observations: Observations,
}

impl RandomSampler {
    /// A sampler drawing from a stream seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        RandomSampler {
            rng: XorShiftRng::seed_from_u64(seed),
            observations: Observations::new(),
        }
    }

    /// Use `pruner` to answer reports.
    pub fn with_pruner<P: Pruner + 'static>(mut self, pruner: P) -> Self {
        self.observations.pruner = Box::new(pruner);
        self
    }
}

impl Sampler for RandomSampler {
    fn suggest(&mut self, _: TrialId, space: &SearchSpace) -> Assignment {
        space.sample(&mut self.rng)
    }

    fn report(&mut self, trial_id: TrialId, step: usize, value: f64) -> PruneDecision {
        self.observations.report(trial_id, step, value)
    }

    fn tell(&mut self, record: &TrialRecord) {
        self.observations.tell(record)
    }

    fn best(&self) -> Option<&TrialRecord> {
        self.observations.best()
    }
}

/// Settings of the Tree-structured Parzen Estimator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpeConfig {
    /// Fraction of completed trials forming the good group.
    pub gamma: f64,
    /// Completed trials needed before modelling starts.
    pub n_startup_trials: usize,
    /// Candidates scored per numeric parameter.
    pub n_candidates: usize,
}

impl Default for TpeConfig {
    fn default() -> Self {
        TpeConfig {
            gamma: 0.25,
            n_startup_trials: 10,
            n_candidates: 24,
        }
    }
}

impl TpeConfig {
    /// Check `gamma` lies in `(0, 1)` and at least one candidate is drawn.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.gamma > 0.0 && self.gamma < 1.0) {
            return Err(ConfigurationError::InvalidOptimizerConfig(format!(
                "gamma must lie in (0, 1), got {}",
                self.gamma
            )));
        }
        if self.n_candidates == 0 {
            return Err(ConfigurationError::InvalidOptimizerConfig(
                "n_candidates must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Tree-structured Parzen Estimator, maximizing the target.
///
/// Completed trials are ranked by value; the top `gamma` fraction forms the
/// good group and the rest, together with every pruned trial, the bad
/// group. Numeric parameters take the candidate maximizing the ratio of the
/// good and bad kernel density estimates; categorical ones are drawn in
/// proportion to smoothed count ratios.
#[derive(Debug)]
pub struct TpeSampler {
    rng: XorShiftRng,
    observations: Observations,
    config: TpeConfig,
}

impl TpeSampler {
    /// A sampler with default settings seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        TpeSampler {
            rng: XorShiftRng::seed_from_u64(seed),
            observations: Observations::new(),
            config: TpeConfig::default(),
        }
    }

    /// Replace the settings.
    pub fn with_config(mut self, config: TpeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `pruner` to answer reports.
    pub fn with_pruner<P: Pruner + 'static>(mut self, pruner: P) -> Self {
        self.observations.pruner = Box::new(pruner);
        self
    }
}

impl Sampler for TpeSampler {
    fn suggest(&mut self, trial_id: TrialId, space: &SearchSpace) -> Assignment {
        let finished = &self.observations.finished;
        let mut completed: Vec<&TrialRecord> = finished
            .iter()
            .filter(|record| record.is_completed())
            .collect();

        if completed.len() < self.config.n_startup_trials.max(2) {
            return space.sample(&mut self.rng);
        }

        completed.sort_by(|x, y| {
            let x_value = x.value.unwrap_or(f64::NEG_INFINITY);
            let y_value = y.value.unwrap_or(f64::NEG_INFINITY);
            y_value
                .total_cmp(&x_value)
                .then(x.trial_id.cmp(&y.trial_id))
        });

        let n_good = ((self.config.gamma * completed.len() as f64).ceil() as usize)
            .clamp(1, completed.len() - 1);
        let (good, rest) = completed.split_at(n_good);
        let bad: Vec<&TrialRecord> = rest
            .iter()
            .cloned()
            .chain(
                finished
                    .iter()
                    .filter(|record| record.status == TrialStatus::Pruned),
            )
            .collect();

        debug!(
            trial_id,
            n_good = good.len(),
            n_bad = bad.len(),
            "Sampling from Parzen estimators"
        );

        space
            .iter()
            .map(|(name, domain)| {
                let value = match domain {
                    ParameterDomain::Categorical { choices } => {
                        sample_categorical(name, choices, good, &bad, &mut self.rng)
                    }
                    _ => sample_numeric(
                        name,
                        domain,
                        good,
                        &bad,
                        self.config.n_candidates,
                        &mut self.rng,
                    ),
                };
                (name.to_owned(), value)
            })
            .collect()
    }

    fn report(&mut self, trial_id: TrialId, step: usize, value: f64) -> PruneDecision {
        self.observations.report(trial_id, step, value)
    }

    fn tell(&mut self, record: &TrialRecord) {
        self.observations.tell(record)
    }

    fn best(&self) -> Option<&TrialRecord> {
        self.observations.best()
    }
}

fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-12);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Scott's rule, kept within 1% and 50% of the working width.
fn bandwidth(values: &[f64], width: f64) -> f64 {
    let n = values.len() as f64;
    let std = if values.len() < 2 {
        width
    } else {
        let mean = values.iter().sum::<f64>() / n;
        (values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    };

    (std * n.max(1.0).powf(-0.2)).clamp(width * 0.01, width * 0.5)
}

/// Gaussian mixture over `values` plus one uniform prior component.
fn density(x: f64, values: &[f64], bandwidth: f64, width: f64) -> f64 {
    let norm = bandwidth * (2.0 * PI).sqrt();
    let kernels: f64 = values
        .iter()
        .map(|v| (-(x - v).powi(2) / (2.0 * bandwidth.powi(2))).exp() / norm)
        .sum();

    (kernels + 1.0 / width) / (values.len() + 1) as f64
}

fn sample_numeric<R: Rng>(
    name: &str,
    domain: &ParameterDomain,
    good: &[&TrialRecord],
    bad: &[&TrialRecord],
    n_candidates: usize,
    rng: &mut R,
) -> ParamValue {
    let (low, high) = domain.internal_bounds();
    let observed = |trials: &[&TrialRecord]| -> Vec<f64> {
        trials
            .iter()
            .filter_map(|record| record.params.get(name))
            .filter_map(|value| domain.to_internal(value))
            .filter(|x| x.is_finite())
            .collect()
    };
    let good_values = observed(good);
    let bad_values = observed(bad);

    let width = high - low;
    if good_values.is_empty() || width <= 0.0 {
        return domain.sample(rng);
    }

    let good_bandwidth = bandwidth(&good_values, width);
    let bad_bandwidth = bandwidth(&bad_values, width);

    let mut best_candidate = low;
    let mut best_ratio = f64::NEG_INFINITY;

    for _ in 0..n_candidates {
        let base = good_values[rng.gen_range(0..good_values.len())];
        let candidate = (base + good_bandwidth * standard_normal(rng)).clamp(low, high);

        let ratio = density(candidate, &good_values, good_bandwidth, width)
            / (density(candidate, &bad_values, bad_bandwidth, width) + 1e-12);

        if ratio > best_ratio {
            best_ratio = ratio;
            best_candidate = candidate;
        }
    }

    domain.from_internal(best_candidate)
}

fn sample_categorical<R: Rng>(
    name: &str,
    choices: &[String],
    good: &[&TrialRecord],
    bad: &[&TrialRecord],
    rng: &mut R,
) -> ParamValue {
    let count = |trials: &[&TrialRecord]| {
        let mut counts = vec![0usize; choices.len()];
        for record in trials {
            if let Some(ParamValue::Categorical(choice)) = record.params.get(name) {
                if let Some(idx) = choices.iter().position(|c| c == choice) {
                    counts[idx] += 1;
                }
            }
        }
        counts
    };
    let good_counts = count(good);
    let bad_counts = count(bad);

    let weights: Vec<f64> = good_counts
        .iter()
        .zip(bad_counts.iter())
        .map(|(l, g)| (l + 1) as f64 / (g + 1) as f64)
        .collect();
    let total: f64 = weights.iter().sum();

    let threshold = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for (choice, weight) in choices.iter().zip(weights) {
        cumulative += weight;
        if threshold < cumulative {
            return ParamValue::Categorical(choice.clone());
        }
    }

    ParamValue::Categorical(choices[choices.len() - 1].clone())
}
