//! Implicit matrix factorization trained with the BPR loss.
//!
//! Users and items are embedded in a shared `latent_dim`-dimensional space
//! and items carry a bias. Each training step runs one epoch of plain SGD
//! over the training interactions in shuffled order, pairing every positive
//! item with a uniformly sampled negative. Users absent from the training
//! matrix are folded in: their embedding is fitted against the frozen item
//! parameters.
use std::ops::Range;
use std::sync::Arc;

use derive_builder::Builder;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::thread_pool;
use crate::data::InteractionMatrix;
use crate::optimization::{Assignment, ParamValue};
use crate::{
    derive_seed, FittingError, ItemId, PredictionError, Recommender, RecommenderBuilder,
    ScoreMatrix, StepStatus, TrialContext, UserId,
};

/// Hyperparameters of [`ImplicitFactorizationModel`].
#[derive(Builder, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    /// Embedding dimension.
    #[builder(default = "16")]
    latent_dim: usize,
    /// SGD step size.
    #[builder(default = "0.05")]
    learning_rate: f64,
    /// L2 penalty on the embeddings touched by each update.
    #[builder(default = "0.0")]
    l2_penalty: f64,
    /// Training epochs; one epoch per step.
    #[builder(default = "20")]
    num_epochs: usize,
    /// Epochs spent fitting the embedding of a cold user.
    #[builder(default = "5")]
    fold_in_epochs: usize,
    /// Seed of the initialisation and shuffling streams.
    #[builder(default = "42")]
    seed: u64,
}

fn invalid(name: &str, reason: impl Into<String>) -> FittingError {
    FittingError::InvalidHyperparameter {
        name: name.to_owned(),
        reason: reason.into(),
    }
}

fn count_param(name: &str, value: &ParamValue) -> Result<usize, FittingError> {
    match value.as_int() {
        Some(count) if count > 0 => Ok(count as usize),
        _ => Err(invalid(name, format!("expected a positive integer, got {}", value))),
    }
}

fn float_param(name: &str, value: &ParamValue) -> Result<f64, FittingError> {
    value
        .as_float()
        .ok_or_else(|| invalid(name, format!("expected a number, got {}", value)))
}

impl Hyperparameters {
    /// Read hyperparameters from a trial assignment, leaving unnamed ones
    /// at their defaults.
    pub fn from_assignment(params: &Assignment, seed: u64) -> Result<Self, FittingError> {
        let mut builder = HyperparametersBuilder::default();
        builder.seed(seed);

        for (name, value) in params {
            match name.as_str() {
                "latent_dim" => {
                    builder.latent_dim(count_param(name, value)?);
                }
                "num_epochs" => {
                    builder.num_epochs(count_param(name, value)?);
                }
                "fold_in_epochs" => {
                    builder.fold_in_epochs(count_param(name, value)?);
                }
                "learning_rate" => {
                    builder.learning_rate(float_param(name, value)?);
                }
                "l2_penalty" => {
                    builder.l2_penalty(float_param(name, value)?);
                }
                _ => return Err(invalid(name, "unknown hyperparameter")),
            }
        }

        let hyper = builder
            .build()
            .map_err(|err| invalid("hyperparameters", err.to_string()))?;
        hyper.validate()?;

        Ok(hyper)
    }

    /// Check every value is in range.
    pub fn validate(&self) -> Result<(), FittingError> {
        if self.latent_dim == 0 {
            return Err(invalid("latent_dim", "must be positive"));
        }
        if self.num_epochs == 0 {
            return Err(invalid("num_epochs", "must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(invalid("learning_rate", "must be positive and finite"));
        }
        if !(self.l2_penalty.is_finite() && self.l2_penalty >= 0.0) {
            return Err(invalid("l2_penalty", "must be nonnegative and finite"));
        }
        Ok(())
    }

    /// Number of training epochs.
    pub fn num_epochs(&self) -> usize {
        self.num_epochs
    }

    /// Same hyperparameters with a different epoch budget.
    pub fn with_num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }
}

fn embedding_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    let scale = 1.0 / (cols as f64).sqrt();
    Array2::from_shape_fn((rows, cols), |_| (rng.gen::<f64>() - 0.5) * scale)
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug)]
struct ModelData {
    user_embedding: Array2<f64>,
    item_embedding: Array2<f64>,
    item_biases: Array1<f64>,
}

impl ModelData {
    fn new<R: Rng>(num_users: usize, num_items: usize, latent_dim: usize, rng: &mut R) -> Self {
        ModelData {
            user_embedding: embedding_init(num_users, latent_dim, rng),
            item_embedding: embedding_init(num_items, latent_dim, rng),
            item_biases: Array1::zeros(num_items),
        }
    }

    fn is_finite(&self) -> bool {
        self.user_embedding.iter().all(|x| x.is_finite())
            && self.item_embedding.iter().all(|x| x.is_finite())
            && self.item_biases.iter().all(|x| x.is_finite())
    }

    fn score_users(&self, user_embedding: ArrayView2<'_, f64>) -> ScoreMatrix {
        let mut scores = user_embedding.dot(&self.item_embedding.t());
        scores += &self.item_biases;
        scores
    }

    /// Item difference vector, BPR gradient scale and loss of one
    /// `(user, positive, negative)` triple.
    fn pair_gradient(
        &self,
        user: ArrayView1<'_, f64>,
        positive: ItemId,
        negative: ItemId,
    ) -> (Array1<f64>, f64, f64) {
        let diff = &self.item_embedding.row(positive) - &self.item_embedding.row(negative);
        let x = user.dot(&diff) + self.item_biases[positive] - self.item_biases[negative];

        // -ln(sigmoid(x)), written to stay finite for large positive x.
        (diff, sigmoid(-x), (-x).exp().ln_1p())
    }
}

#[derive(Clone, Copy, Debug)]
struct Sgd {
    learning_rate: f64,
    l2_penalty: f64,
}

impl Sgd {
    fn update_user(&self, mut user: ArrayViewMut1<'_, f64>, diff: &Array1<f64>, gradient: f64) {
        let (lr, l2) = (self.learning_rate, self.l2_penalty);
        user.zip_mut_with(diff, |u, &d| *u += lr * (gradient * d - l2 * *u));
    }

    fn update_items(
        &self,
        model: &mut ModelData,
        user_id: UserId,
        positive: ItemId,
        negative: ItemId,
        gradient: f64,
    ) {
        let (lr, l2) = (self.learning_rate, self.l2_penalty);
        let user = model.user_embedding.row(user_id);

        for (item_id, sign) in [(positive, 1.0), (negative, -1.0)] {
            model
                .item_embedding
                .row_mut(item_id)
                .zip_mut_with(&user, |i, &u| *i += lr * (sign * gradient * u - l2 * *i));
            let bias = &mut model.item_biases[item_id];
            *bias += lr * (sign * gradient - l2 * *bias);
        }
    }
}

/// A BPR matrix factorization model.
#[derive(Debug)]
pub struct ImplicitFactorizationModel {
    hyper: Hyperparameters,
    train: Arc<InteractionMatrix>,
    model: Option<ModelData>,
    rng: XorShiftRng,
    epoch: usize,
    last_loss: Option<f64>,
    pool: rayon::ThreadPool,
}

impl ImplicitFactorizationModel {
    /// An unfitted model over `train`; cold-user fold-in runs on `n_threads`
    /// threads.
    pub fn new(
        hyper: Hyperparameters,
        train: Arc<InteractionMatrix>,
        n_threads: usize,
    ) -> Result<Self, FittingError> {
        hyper.validate()?;
        let pool = thread_pool(n_threads).map_err(|err| invalid("n_threads", err.to_string()))?;

        Ok(ImplicitFactorizationModel {
            rng: XorShiftRng::seed_from_u64(hyper.seed),
            hyper,
            train,
            model: None,
            epoch: 0,
            last_loss: None,
            pool,
        })
    }

    /// The hyperparameters in use.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Number of epochs run so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Mean BPR loss of the last epoch.
    pub fn last_loss(&self) -> Option<f64> {
        self.last_loss
    }

    fn fitted(&self) -> Result<&ModelData, PredictionError> {
        self.model.as_ref().ok_or(PredictionError::NotFitted)
    }

    fn run_epoch(&mut self) -> Result<f64, FittingError> {
        let (num_users, num_items) = self.train.shape();
        let latent_dim = self.hyper.latent_dim;
        let sgd = self.sgd();

        let mut pairs: Vec<(UserId, ItemId)> = self
            .train
            .triplets()
            .map(|interaction| (interaction.user_id(), interaction.item_id()))
            .collect();
        pairs.shuffle(&mut self.rng);

        let rng = &mut self.rng;
        let model = self
            .model
            .get_or_insert_with(|| ModelData::new(num_users, num_items, latent_dim, rng));

        let mut loss = 0.0;
        for &(user_id, positive) in &pairs {
            let negative = rng.gen_range(0..num_items);
            if negative == positive {
                continue;
            }

            let (diff, gradient, pair_loss) =
                model.pair_gradient(model.user_embedding.row(user_id), positive, negative);
            sgd.update_items(model, user_id, positive, negative, gradient);
            sgd.update_user(model.user_embedding.row_mut(user_id), &diff, gradient);
            loss += pair_loss;
        }

        let loss = loss / pairs.len() as f64;
        if !(loss.is_finite() && model.is_finite()) {
            return Err(FittingError::Diverged);
        }

        Ok(loss)
    }

    fn sgd(&self) -> Sgd {
        Sgd {
            learning_rate: self.hyper.learning_rate,
            l2_penalty: self.hyper.l2_penalty,
        }
    }

    /// Fit a fresh embedding for a user with interactions `item_ids`.
    fn fold_in_user(&self, model: &ModelData, item_ids: &[ItemId], seed: u64) -> Array1<f64> {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let mut user = embedding_init(1, self.hyper.latent_dim, &mut rng)
            .index_axis_move(Axis(0), 0);

        if item_ids.is_empty() {
            return user;
        }

        let sgd = self.sgd();
        let num_items = model.item_biases.len();

        for _ in 0..self.hyper.fold_in_epochs {
            for &positive in item_ids {
                let negative = rng.gen_range(0..num_items);
                if negative == positive {
                    continue;
                }

                let (diff, gradient, _) = model.pair_gradient(user.view(), positive, negative);
                sgd.update_user(user.view_mut(), &diff, gradient);
            }
        }

        user
    }
}

impl Recommender for ImplicitFactorizationModel {
    fn num_users(&self) -> usize {
        self.train.num_users()
    }

    fn num_items(&self) -> usize {
        self.train.num_items()
    }

    fn training_matrix(&self) -> &InteractionMatrix {
        &self.train
    }

    fn step(&mut self) -> Result<StepStatus, FittingError> {
        if self.train.nnz() == 0 || self.train.num_items() < 2 {
            return Err(FittingError::NoInteractions);
        }

        let loss = self.run_epoch()?;
        self.epoch += 1;
        self.last_loss = Some(loss);

        debug!(epoch = self.epoch, loss, "Finished epoch");

        if self.epoch >= self.hyper.num_epochs {
            Ok(StepStatus::finished())
        } else {
            Ok(StepStatus::validate())
        }
    }

    fn get_score_block(&self, users: Range<UserId>) -> Result<ScoreMatrix, PredictionError> {
        let model = self.fitted()?;

        if users.end > self.num_users() || users.start > users.end {
            return Err(PredictionError::UnknownUsers {
                start: users.start,
                end: users.end,
                num_users: self.num_users(),
            });
        }

        Ok(model.score_users(model.user_embedding.slice(s![users, ..])))
    }

    fn get_score_cold_user(&self, input: &InteractionMatrix) -> Result<ScoreMatrix, PredictionError> {
        let model = self.fitted()?;

        if input.num_items() != self.num_items() {
            return Err(PredictionError::ItemCountMismatch {
                expected: self.num_items(),
                actual: input.num_items(),
            });
        }

        let seed = derive_seed(self.hyper.seed, u64::MAX);
        let embeddings: Vec<Array1<f64>> = self.pool.install(|| {
            (0..input.num_users())
                .into_par_iter()
                .map(|user_id| {
                    self.fold_in_user(model, input.row_items(user_id), derive_seed(seed, user_id as u64))
                })
                .collect()
        });

        let mut users = Array2::zeros((input.num_users(), self.hyper.latent_dim));
        for (mut row, embedding) in users.outer_iter_mut().zip(&embeddings) {
            row.assign(embedding);
        }

        Ok(model.score_users(users.view()))
    }
}

/// Builds [`ImplicitFactorizationModel`]s from trial assignments.
///
/// Recognised names: `latent_dim`, `num_epochs` and `fold_in_epochs`
/// (integers), `learning_rate` and `l2_penalty` (numbers).
#[derive(Clone, Copy, Debug, Default)]
pub struct FactorizationBuilder;

impl RecommenderBuilder for FactorizationBuilder {
    type Model = ImplicitFactorizationModel;

    fn build(
        &self,
        train: Arc<InteractionMatrix>,
        params: &Assignment,
        context: &TrialContext,
    ) -> Result<ImplicitFactorizationModel, FittingError> {
        if train.nnz() == 0 {
            return Err(FittingError::NoInteractions);
        }

        let hyper = Hyperparameters::from_assignment(params, context.seed)?;

        ImplicitFactorizationModel::new(hyper, train, context.n_threads)
    }
}
