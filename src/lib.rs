#![deny(missing_docs)]
//! # rectune
//!
//! `rectune` evaluates and tunes implicit-feedback recommenders offline:
//! it splits sparse interaction data into seeded holdout blocks, scores
//! recommenders with ranking and diversity metrics at several cutoffs, and
//! runs a pruning-aware hyperparameter search over any model implementing
//! the [`Recommender`] capability.
//!
//! ## Example
//! Tune nothing (the popularity baseline has no hyperparameters) but run the
//! whole pipeline on a toy table:
//!
//! ```rust
//! use rectune::data::{Block, InteractionTable};
//! use rectune::evaluation::{Evaluator, EvaluatorConfig};
//! use rectune::models::popularity::TopPopBuilder;
//! use rectune::optimization::{Optimizer, OptimizerConfig, RandomSampler, SearchSpace};
//! use rectune::split::{user_holdout_split, HoldoutRatios};
//!
//! let mut table = InteractionTable::new();
//! for user in 0..20 {
//!     for item in 0..(user % 7 + 3) {
//!         table.push(format!("u{}", user), format!("i{}", item));
//!     }
//! }
//!
//! let ratios = HoldoutRatios {
//!     val_user_ratio: 0.2,
//!     test_user_ratio: 0.2,
//!     heldout_ratio_val: 0.5,
//!     heldout_ratio_test: 0.5,
//! };
//! let dataset = user_holdout_split(&table, &ratios, 42).unwrap();
//!
//! let evaluator = Evaluator::new(
//!     dataset.val().x_test().clone(),
//!     dataset.offset(Block::Val),
//!     EvaluatorConfig::default(),
//! )
//! .unwrap();
//!
//! let mut optimizer = Optimizer::new(
//!     TopPopBuilder,
//!     dataset.training_matrix(Block::Val),
//!     &evaluator,
//!     RandomSampler::new(42),
//! )
//! .search_space(SearchSpace::new())
//! .config(OptimizerConfig {
//!     n_trials: 1,
//!     ..OptimizerConfig::default()
//! });
//!
//! let result = optimizer.optimize().unwrap();
//! println!("Best ndcg@10 {}", result.best_value);
//! ```
use std::hash::Hasher;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher;
use thiserror::Error;

pub mod config;
pub mod data;
pub mod evaluation;
pub mod models;
pub mod optimization;
pub mod split;

use data::{Block, InteractionMatrix};
use optimization::Assignment;

/// Alias for user (row) indices.
pub type UserId = usize;
/// Alias for item (column) indices.
pub type ItemId = usize;
/// Alias for trial identifiers.
pub type TrialId = usize;
/// Dense score matrix: one row per user, one column per item.
pub type ScoreMatrix = ndarray::Array2<f64>;

/// Invalid arguments supplied by the caller. Never retried.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A ratio outside `[0, 1)` or not finite.
    #[error("Invalid ratio {name} = {value}: expected a finite value in [0, 1).")]
    InvalidRatio {
        /// Name of the offending ratio.
        name: &'static str,
        /// The value supplied.
        value: f64,
    },
    /// Validation and test user ratios leave no room for training users.
    #[error("User ratios sum to {sum}, which must be below 1.")]
    RatioSumTooLarge {
        /// Sum of the user ratios.
        sum: f64,
    },
    /// A block was requested with a positive ratio but rounds to zero users.
    #[error("The {block} block would contain 0 of {n_users} users, but ratio {ratio} asks for a nonempty block.")]
    EmptyBlock {
        /// The block that came out empty.
        block: Block,
        /// Requested user ratio.
        ratio: f64,
        /// Total number of users available.
        n_users: usize,
    },
    /// The interaction table has no rows.
    #[error("The interaction table is empty.")]
    EmptyTable,
    /// A cutoff of zero.
    #[error("Cutoffs must be positive, got {0}.")]
    InvalidCutoff(usize),
    /// A malformed search-space entry.
    #[error("Invalid search space for parameter `{name}`: {reason}")]
    InvalidSearchSpace {
        /// Parameter name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
    /// A parameter that is both fixed and searched over.
    #[error("Parameter `{0}` is both fixed and part of the search space.")]
    FixedParamConflict(String),
    /// Invalid optimizer or pruner settings.
    #[error("Invalid optimizer configuration: {0}")]
    InvalidOptimizerConfig(String),
    /// The rayon thread pool could not be created.
    #[error("Cannot build thread pool: {0}")]
    ThreadPool(String),
}

/// Errors raised while building or combining interaction data.
#[derive(Debug, Error)]
pub enum DataError {
    /// A triplet addresses a cell outside the matrix shape.
    #[error("Entry ({row}, {col}) lies outside a {n_rows}x{n_cols} matrix.")]
    OutOfBounds {
        /// Row index.
        row: usize,
        /// Column index.
        col: usize,
        /// Number of rows of the matrix.
        n_rows: usize,
        /// Number of columns of the matrix.
        n_cols: usize,
    },
    /// Interaction weights must be finite and nonnegative.
    #[error("Invalid interaction weight {value} at ({row}, {col}).")]
    InvalidValue {
        /// Row index.
        row: usize,
        /// Column index.
        col: usize,
        /// The rejected weight.
        value: f64,
    },
    /// Two operands do not have compatible shapes.
    #[error("Shape mismatch: expected {expected}, got {actual}.")]
    ShapeMismatch {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        actual: String,
    },
    /// Train and test parts of a holdout pair overlap.
    #[error("Train and test interactions overlap.")]
    OverlappingSupport,
    /// A requested CSV column is absent.
    #[error("Column `{0}` not found in CSV header.")]
    MissingColumn(String),
    /// CSV parsing failure.
    #[error(transparent)]
    Csv(#[from] csv::Error),
    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Prediction error types.
#[derive(Debug, Error)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[error("Invalid prediction value: not a number.")]
    InvalidPredictionValue,
    /// Scores were requested before the model was fitted.
    #[error("Model must be fitted first.")]
    NotFitted,
    /// Users outside the model's training rows were requested.
    #[error("Users {start}..{end} are outside the {num_users} users known to the model.")]
    UnknownUsers {
        /// First requested user.
        start: UserId,
        /// One past the last requested user.
        end: UserId,
        /// Number of users the model was trained on.
        num_users: usize,
    },
    /// Input has a different item count from the model.
    #[error("Input has {actual} items but the model knows {expected}.")]
    ItemCountMismatch {
        /// Number of items known to the model.
        expected: usize,
        /// Number of items in the input.
        actual: usize,
    },
}

/// Fitting error types.
#[derive(Debug, Error)]
pub enum FittingError {
    /// No interactions to learn from.
    #[error("No interactions to fit on.")]
    NoInteractions,
    /// The training loss stopped being finite.
    #[error("Training diverged: loss is no longer finite.")]
    Diverged,
    /// A hyperparameter is missing its expected type or range.
    #[error("Invalid hyperparameter `{name}`: {reason}")]
    InvalidHyperparameter {
        /// Parameter name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Errors raised while scoring a recommender against ground truth.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// Score and ground-truth column spaces differ.
    #[error("Scores have {actual} columns but the ground truth has {expected}.")]
    ColumnMismatch {
        /// Ground-truth column count.
        expected: usize,
        /// Score column count.
        actual: usize,
    },
    /// The evaluated block does not fit inside the scored rows.
    #[error("Rows {offset}..{end} exceed the {n_rows} rows available for scoring.")]
    RowRangeOutOfBounds {
        /// First evaluated row.
        offset: usize,
        /// One past the last evaluated row.
        end: usize,
        /// Rows available.
        n_rows: usize,
    },
    /// The recommender returned a block of the wrong shape.
    #[error("Expected a {expected_rows}x{expected_cols} score block, got {rows}x{cols}.")]
    ScoreShape {
        /// Expected rows.
        expected_rows: usize,
        /// Expected columns.
        expected_cols: usize,
        /// Rows returned.
        rows: usize,
        /// Columns returned.
        cols: usize,
    },
    /// Invalid evaluation settings.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Inconsistent evaluation inputs.
    #[error(transparent)]
    Data(#[from] DataError),
    /// The recommender could not produce scores.
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

/// Failure of a single trial. Isolated by the optimizer.
#[derive(Debug, Error)]
pub enum TrialError {
    /// Model construction or fitting failed.
    #[error("fitting failed: {0}")]
    Fitting(#[from] FittingError),
    /// Scoring the model failed.
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
    /// The recommender panicked.
    #[error("recommender panicked: {0}")]
    Panicked(String),
    /// The target metric came out as not-a-number.
    #[error("target metric is NaN")]
    NanTarget,
}

/// Errors that abort a whole optimization run.
#[derive(Debug, Error)]
pub enum OptimizationError {
    /// The run was misconfigured.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Every trial was pruned or failed.
    #[error("No successful trial among {n_trials} trials: every trial was pruned or failed.")]
    NoSuccessfulTrial {
        /// Number of trials that ran.
        n_trials: usize,
    },
}

/// Outcome of one training step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    /// Training has reached its natural end.
    pub done: bool,
    /// The model is in a state worth validating.
    pub intermediate_metric_ready: bool,
}

impl StepStatus {
    /// Training finished; the model is ready to be scored.
    pub fn finished() -> Self {
        StepStatus {
            done: true,
            intermediate_metric_ready: true,
        }
    }

    /// Training continues and the current state should be validated.
    pub fn validate() -> Self {
        StepStatus {
            done: false,
            intermediate_metric_ready: true,
        }
    }

    /// Training continues without validation at this step.
    pub fn running() -> Self {
        StepStatus {
            done: false,
            intermediate_metric_ready: false,
        }
    }
}

/// Per-trial information handed to a [`RecommenderBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialContext {
    /// Identifier of the trial being built.
    pub trial_id: TrialId,
    /// Seed of the trial's own random stream.
    pub seed: u64,
    /// Number of threads the recommender may use.
    pub n_threads: usize,
}

/// Trait describing recommenders that can be fitted and scored.
///
/// Training goes through [`Recommender::step`]: single-shot models do all
/// their work in the first step and report `done`, iterative models advance
/// by one unit (an epoch, say) per step. Scoring goes through
/// [`Recommender::get_score_block`]; the remaining scoring methods derive
/// from it.
pub trait Recommender {
    /// Rows of the training matrix.
    fn num_users(&self) -> usize;
    /// Columns of the training matrix.
    fn num_items(&self) -> usize;
    /// The matrix the model is trained on.
    fn training_matrix(&self) -> &InteractionMatrix;
    /// Advance training by one step.
    fn step(&mut self) -> Result<StepStatus, FittingError>;
    /// Raw scores for the training users in `users`.
    fn get_score_block(&self, users: Range<UserId>) -> Result<ScoreMatrix, PredictionError>;
    /// Raw scores for users absent from the training matrix, given their
    /// known interactions.
    fn get_score_cold_user(&self, input: &InteractionMatrix)
        -> Result<ScoreMatrix, PredictionError>;

    /// Train to completion.
    fn fit(&mut self) -> Result<(), FittingError> {
        while !self.step()?.done {}
        Ok(())
    }

    /// Raw scores for every training user.
    fn get_score(&self) -> Result<ScoreMatrix, PredictionError> {
        self.get_score_block(0..self.num_users())
    }

    /// Scores for `users`, with items they were trained on set to negative
    /// infinity.
    fn get_score_remove_seen_block(
        &self,
        users: Range<UserId>,
    ) -> Result<ScoreMatrix, PredictionError> {
        let mut scores = self.get_score_block(users.clone())?;
        check_block_shape(&scores, users.len(), self.num_items())?;
        self.training_matrix().mask_scores(&mut scores, users.start);
        Ok(scores)
    }

    /// Scores for every training user with seen items masked.
    fn get_score_remove_seen(&self) -> Result<ScoreMatrix, PredictionError> {
        self.get_score_remove_seen_block(0..self.num_users())
    }

    /// Cold-user scores with the input interactions masked.
    fn get_score_cold_user_remove_seen(
        &self,
        input: &InteractionMatrix,
    ) -> Result<ScoreMatrix, PredictionError> {
        let mut scores = self.get_score_cold_user(input)?;
        check_block_shape(&scores, input.num_users(), input.num_items())?;
        input.mask_scores(&mut scores, 0);
        Ok(scores)
    }
}

fn check_block_shape(
    scores: &ScoreMatrix,
    rows: usize,
    cols: usize,
) -> Result<(), PredictionError> {
    if scores.ncols() != cols {
        return Err(PredictionError::ItemCountMismatch {
            expected: cols,
            actual: scores.ncols(),
        });
    }
    if scores.nrows() != rows {
        return Err(PredictionError::UnknownUsers {
            start: 0,
            end: rows,
            num_users: scores.nrows(),
        });
    }
    Ok(())
}

/// Factory building a fresh [`Recommender`] for each trial.
pub trait RecommenderBuilder: Sync {
    /// The recommender type built.
    type Model: Recommender;
    /// Build an unfitted model over `train` with hyperparameters `params`.
    fn build(
        &self,
        train: Arc<InteractionMatrix>,
        params: &Assignment,
        context: &TrialContext,
    ) -> Result<Self::Model, FittingError>;
}

impl<F, M> RecommenderBuilder for F
where
    F: Fn(Arc<InteractionMatrix>, &Assignment, &TrialContext) -> Result<M, FittingError> + Sync,
    M: Recommender,
{
    type Model = M;

    fn build(
        &self,
        train: Arc<InteractionMatrix>,
        params: &Assignment,
        context: &TrialContext,
    ) -> Result<M, FittingError> {
        self(train, params, context)
    }
}

/// Derive an independent seed for `stream` from a run seed.
pub(crate) fn derive_seed(seed: u64, stream: u64) -> u64 {
    let mut hasher = SipHasher::new_with_keys(seed, 0x7265_6374_756e_6521);
    hasher.write_u64(stream);
    hasher.finish()
}
