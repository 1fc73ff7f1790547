//! Trial-based hyperparameter search.
//!
//! The [`Optimizer`] asks a [`Sampler`] for assignments, builds a fresh
//! recommender for each through a [`RecommenderBuilder`], drives its
//! training step by step and reports validation values back to the sampler,
//! which may prune the trial. Failures are contained within their trial.
//!
//! ```rust
//! use std::ops::Range;
//! use std::sync::Arc;
//!
//! use rectune::data::InteractionMatrix;
//! use rectune::evaluation::{Evaluator, EvaluatorConfig, Metric};
//! use rectune::optimization::{
//!     Assignment, Optimizer, OptimizerConfig, ParameterDomain, RandomSampler, SearchSpace,
//! };
//! use rectune::{FittingError, PredictionError, Recommender, ScoreMatrix, StepStatus, TrialContext};
//!
//! /// Ranks item 0 first when `boost` is large.
//! struct Toy {
//!     train: Arc<InteractionMatrix>,
//!     boost: f64,
//! }
//!
//! impl Recommender for Toy {
//!     fn num_users(&self) -> usize { self.train.num_users() }
//!     fn num_items(&self) -> usize { self.train.num_items() }
//!     fn training_matrix(&self) -> &InteractionMatrix { &self.train }
//!     fn step(&mut self) -> Result<StepStatus, FittingError> { Ok(StepStatus::finished()) }
//!     fn get_score_block(&self, users: Range<usize>) -> Result<ScoreMatrix, PredictionError> {
//!         let boost = self.boost;
//!         Ok(ScoreMatrix::from_shape_fn((users.len(), 2), |(_, item)| {
//!             if item == 0 { boost } else { 0.5 }
//!         }))
//!     }
//!     fn get_score_cold_user(&self, input: &InteractionMatrix) -> Result<ScoreMatrix, PredictionError> {
//!         self.get_score_block(0..input.num_users())
//!     }
//! }
//!
//! let train = InteractionMatrix::zeros(1, 2);
//! let truth = InteractionMatrix::from_triplets(
//!     1, 2, vec![rectune::data::Interaction::new(0, 0, 1.0)],
//! ).unwrap();
//! let evaluator = Evaluator::new(truth, 0, EvaluatorConfig {
//!     cutoffs: vec![1],
//!     target_metric: Metric::Hit,
//!     target_cutoff: 1,
//!     n_threads: 1,
//! }).unwrap();
//!
//! let builder = |train: Arc<InteractionMatrix>, params: &Assignment, _: &TrialContext| {
//!     Ok::<_, FittingError>(Toy { train, boost: params["boost"].as_float().unwrap_or(0.0) })
//! };
//! let mut optimizer = Optimizer::new(builder, train, &evaluator, RandomSampler::new(0))
//!     .search_space(SearchSpace::new().add("boost", ParameterDomain::float(0.0, 1.0)))
//!     .config(OptimizerConfig { n_trials: 10, ..OptimizerConfig::default() });
//!
//! let result = optimizer.optimize().unwrap();
//! assert!(result.best_params["boost"].as_float().unwrap() > 0.5);
//! ```
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod pruner;
pub mod sampler;
pub mod space;
pub mod trial;

pub use self::pruner::{NopPruner, PercentilePruner, Pruner, PruningStore};
pub use self::sampler::{PruneDecision, RandomSampler, Sampler, TpeConfig, TpeSampler};
pub use self::space::{Assignment, ParamValue, ParameterDomain, SearchSpace};
pub use self::trial::{SearchHistory, TrialRecord, TrialStatus};

use crate::config::{thread_pool, RuntimeConfig};
use crate::data::InteractionMatrix;
use crate::evaluation::Evaluator;
use crate::{
    derive_seed, ConfigurationError, OptimizationError, Recommender, RecommenderBuilder, TrialContext,
    TrialError, TrialId,
};

/// Search budget and trial-level settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Number of trials to run.
    pub n_trials: usize,
    /// Seed of the per-trial random streams.
    pub seed: u64,
    /// Maximum training steps per trial.
    pub max_steps: usize,
    /// Stop a trial after this many validations without improvement.
    pub patience: Option<usize>,
    /// Wall-clock budget of the whole run.
    pub timeout_secs: Option<f64>,
    /// Trials run concurrently.
    pub n_workers: usize,
    /// Hyperparameters applied to every trial on top of the suggestion.
    pub fixed_params: Assignment,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            n_trials: 20,
            seed: 42,
            max_steps: 100,
            patience: None,
            timeout_secs: None,
            n_workers: 1,
            fixed_params: Assignment::new(),
        }
    }
}

impl OptimizerConfig {
    /// Check the budget values are usable.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| Err(ConfigurationError::InvalidOptimizerConfig(reason));

        if self.n_trials == 0 {
            return invalid("n_trials must be positive".to_owned());
        }
        if self.max_steps == 0 {
            return invalid("max_steps must be positive".to_owned());
        }
        if self.n_workers == 0 {
            return invalid("n_workers must be positive".to_owned());
        }
        if self.patience == Some(0) {
            return invalid("patience must be positive".to_owned());
        }
        if let Some(timeout) = self.timeout_secs {
            if !(timeout.is_finite() && timeout > 0.0) {
                return invalid(format!("timeout_secs must be positive, got {}", timeout));
            }
        }
        Ok(())
    }
}

/// Outcome of a search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Id of the best completed trial.
    pub best_trial_id: TrialId,
    /// Its hyperparameters.
    pub best_params: Assignment,
    /// Its target value.
    pub best_value: f64,
    /// Training step at which it reached that value.
    pub best_step: Option<usize>,
    /// Seed its recommender was built with; refitting with it reproduces
    /// the trial.
    pub best_seed: u64,
    /// Every trial, in id order.
    pub validation_results: SearchHistory,
}

/// What the driver loop knows about a running trial.
#[derive(Default)]
struct TrialProgress {
    n_steps: usize,
    intermediate_values: Vec<(usize, f64)>,
    best: Option<(usize, f64)>,
    last: Option<f64>,
}

impl TrialProgress {
    /// Record a validation; returns whether it improved on the best value.
    fn observe(&mut self, step: usize, value: f64) -> bool {
        self.last = Some(value);
        match self.best {
            Some((_, best)) if value <= best => false,
            _ => {
                self.best = Some((step, value));
                true
            }
        }
    }
}

/// Drives trials of one recommender family against one evaluator.
pub struct Optimizer<'a, B, S> {
    builder: B,
    train: Arc<InteractionMatrix>,
    evaluator: &'a Evaluator,
    sampler: Mutex<S>,
    space: SearchSpace,
    config: OptimizerConfig,
    runtime: RuntimeConfig,
    next_trial_id: AtomicUsize,
    history: Mutex<SearchHistory>,
}

impl<'a, B, S> Optimizer<'a, B, S>
where
    B: RecommenderBuilder,
    S: Sampler,
{
    /// An optimizer with an empty search space and default settings.
    pub fn new<T: Into<Arc<InteractionMatrix>>>(
        builder: B,
        train: T,
        evaluator: &'a Evaluator,
        sampler: S,
    ) -> Self {
        Optimizer {
            builder,
            train: train.into(),
            evaluator,
            sampler: Mutex::new(sampler),
            space: SearchSpace::new(),
            config: OptimizerConfig::default(),
            runtime: RuntimeConfig::default(),
            next_trial_id: AtomicUsize::new(0),
            history: Mutex::new(SearchHistory::new()),
        }
    }

    /// Set the search space.
    pub fn search_space(mut self, space: SearchSpace) -> Self {
        self.space = space;
        self
    }

    /// Set the search settings.
    pub fn config(mut self, config: OptimizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the runtime settings passed to recommenders.
    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// The trials run so far.
    pub fn history(&self) -> SearchHistory {
        self.history.lock().clone()
    }

    /// Best completed trial according to the sampler.
    pub fn best_trial(&self) -> Option<TrialRecord> {
        self.sampler.lock().best().cloned()
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        self.config.validate()?;
        self.space.validate()?;

        if let Some(name) = self
            .config
            .fixed_params
            .keys()
            .find(|name| self.space.contains(name))
        {
            return Err(ConfigurationError::FixedParamConflict(name.clone()));
        }

        Ok(())
    }

    /// Run `n_trials` more trials and report the best completed one.
    pub fn optimize(&mut self) -> Result<OptimizationResult, OptimizationError> {
        self.validate()?;

        let deadline = self
            .config
            .timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs_f64(secs));

        info!(
            n_trials = self.config.n_trials,
            n_workers = self.config.n_workers,
            n_params = self.space.len(),
            "Starting hyperparameter search"
        );

        if self.config.n_workers <= 1 {
            for _ in 0..self.config.n_trials {
                if expired(deadline) {
                    info!("Search timed out; no further trials start");
                    break;
                }
                self.run_trial(deadline);
            }
        } else {
            let pool = thread_pool(self.config.n_workers)?;
            let this = &*self;
            pool.install(|| {
                (0..this.config.n_trials).into_par_iter().for_each(|_| {
                    if !expired(deadline) {
                        this.run_trial(deadline);
                    }
                })
            });
        }

        self.summarize()
    }

    fn summarize(&self) -> Result<OptimizationResult, OptimizationError> {
        let history = self.history();
        let best = history
            .best()
            .cloned()
            .ok_or(OptimizationError::NoSuccessfulTrial {
                n_trials: history.len(),
            })?;
        let best_value = best.value.unwrap_or(f64::NAN);

        info!(
            best_trial_id = best.trial_id,
            best_value,
            completed = history.count(TrialStatus::Completed),
            pruned = history.count(TrialStatus::Pruned),
            failed = history.count(TrialStatus::Failed),
            "Hyperparameter search finished"
        );

        Ok(OptimizationResult {
            best_trial_id: best.trial_id,
            best_params: best.params,
            best_value,
            best_step: best.best_step,
            best_seed: best.seed,
            validation_results: history,
        })
    }

    fn run_trial(&self, deadline: Option<Instant>) -> TrialRecord {
        let (trial_id, mut params) = {
            let mut sampler = self.sampler.lock();
            let trial_id = self.next_trial_id.fetch_add(1, Ordering::SeqCst);
            (trial_id, sampler.suggest(trial_id, &self.space))
        };
        params.extend(self.config.fixed_params.clone());

        let context = TrialContext {
            trial_id,
            seed: derive_seed(self.config.seed, trial_id as u64),
            n_threads: self.runtime.n_threads,
        };

        debug!(trial_id, params = ?params, "Starting trial");

        let start = Instant::now();
        let mut progress = TrialProgress::default();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.drive(&params, &context, deadline, &mut progress)
        }));

        let (status, error) = match outcome {
            Ok(Ok(status)) => (status, None),
            Ok(Err(err)) => (TrialStatus::Failed, Some(err)),
            Err(payload) => (
                TrialStatus::Failed,
                Some(TrialError::Panicked(panic_message(payload))),
            ),
        };

        let value = match status {
            TrialStatus::Completed => progress.best.map(|(_, value)| value),
            TrialStatus::Pruned => progress.last,
            TrialStatus::Failed => None,
        };
        let record = TrialRecord {
            trial_id,
            params,
            seed: context.seed,
            status,
            value,
            intermediate_values: progress.intermediate_values,
            best_step: match status {
                TrialStatus::Completed => progress.best.map(|(step, _)| step),
                _ => None,
            },
            n_steps: progress.n_steps,
            elapsed: start.elapsed(),
            error: error.as_ref().map(ToString::to_string),
        };

        match &error {
            Some(err) => warn!(trial_id, error = %err, "Trial failed"),
            None => info!(
                trial_id,
                status = %record.status,
                value = record.value.unwrap_or(f64::NAN),
                n_steps = record.n_steps,
                "Trial finished"
            ),
        }

        self.sampler.lock().tell(&record);
        self.history.lock().push(record.clone());

        record
    }

    fn drive(
        &self,
        params: &Assignment,
        context: &TrialContext,
        deadline: Option<Instant>,
        progress: &mut TrialProgress,
    ) -> Result<TrialStatus, TrialError> {
        let mut model = self
            .builder
            .build(Arc::clone(&self.train), params, context)?;
        let mut stale_validations = 0;

        loop {
            let status = model.step()?;
            progress.n_steps += 1;
            let step = progress.n_steps;

            let single_shot = status.done && step == 1;
            let out_of_steps = step >= self.config.max_steps;
            let finished = status.done || out_of_steps;

            if !(status.intermediate_metric_ready || finished) {
                continue;
            }

            let value = self.evaluator.get_score(&model)?;
            if value.is_nan() {
                return Err(TrialError::NanTarget);
            }
            let improved = progress.observe(step, value);

            if single_shot {
                return Ok(TrialStatus::Completed);
            }

            progress.intermediate_values.push((step, value));
            let decision = self.sampler.lock().report(context.trial_id, step, value);
            debug!(trial_id = context.trial_id, step, value, decision = ?decision, "Reported intermediate value");

            if finished {
                return Ok(TrialStatus::Completed);
            }
            if decision == PruneDecision::Prune {
                return Ok(TrialStatus::Pruned);
            }

            if improved {
                stale_validations = 0;
            } else {
                stale_validations += 1;
                if let Some(patience) = self.config.patience {
                    if stale_validations >= patience {
                        debug!(trial_id = context.trial_id, step, "Stopping early: no improvement");
                        return Ok(TrialStatus::Completed);
                    }
                }
            }

            if expired(deadline) {
                debug!(trial_id = context.trial_id, step, "Stopping trial: search timed out");
                return Ok(TrialStatus::Completed);
            }
        }
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |deadline| Instant::now() >= deadline)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Fit a fresh recommender with `params` to completion and compute every
/// metric `evaluator` is configured with.
pub fn refit_and_score<B: RecommenderBuilder>(
    builder: &B,
    train: Arc<InteractionMatrix>,
    params: &Assignment,
    context: &TrialContext,
    evaluator: &Evaluator,
) -> Result<crate::evaluation::MetricResult, TrialError> {
    let mut model = builder.build(train, params, context)?;
    model.fit()?;

    Ok(evaluator.get_scores_default(&model)?)
}
