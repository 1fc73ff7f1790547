//! Item-popularity baseline.
//!
//! Every user receives the same scores: the number of training users who
//! interacted with each item. It has no hyperparameters and fits in a
//! single step.
use std::ops::Range;
use std::sync::Arc;

use ndarray::Array1;

use crate::data::InteractionMatrix;
use crate::optimization::Assignment;
use crate::{
    FittingError, PredictionError, Recommender, RecommenderBuilder, ScoreMatrix, StepStatus,
    TrialContext, UserId,
};

/// Recommends the most popular items to everyone.
#[derive(Clone, Debug)]
pub struct TopPopRecommender {
    train: Arc<InteractionMatrix>,
    popularity: Option<Array1<f64>>,
}

impl TopPopRecommender {
    /// An unfitted model over `train`.
    pub fn new(train: Arc<InteractionMatrix>) -> Self {
        TopPopRecommender {
            train,
            popularity: None,
        }
    }

    /// Per-item user counts, once fitted.
    pub fn popularity(&self) -> Option<&Array1<f64>> {
        self.popularity.as_ref()
    }

    fn broadcast(&self, n_rows: usize) -> Result<ScoreMatrix, PredictionError> {
        let popularity = self.popularity.as_ref().ok_or(PredictionError::NotFitted)?;

        Ok(popularity
            .broadcast((n_rows, popularity.len()))
            .map(|view| view.to_owned())
            .unwrap_or_else(|| ScoreMatrix::zeros((n_rows, popularity.len()))))
    }
}

impl Recommender for TopPopRecommender {
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
        let mut popularity = Array1::<f64>::zeros(self.train.num_items());
        for interaction in self.train.triplets() {
            popularity[interaction.item_id()] += 1.0;
        }

        self.popularity = Some(popularity);

        Ok(StepStatus::finished())
    }

    fn get_score_block(&self, users: Range<UserId>) -> Result<ScoreMatrix, PredictionError> {
        if users.end > self.num_users() || users.start > users.end {
            return Err(PredictionError::UnknownUsers {
                start: users.start,
                end: users.end,
                num_users: self.num_users(),
            });
        }

        self.broadcast(users.len())
    }

    fn get_score_cold_user(&self, input: &InteractionMatrix) -> Result<ScoreMatrix, PredictionError> {
        if input.num_items() != self.num_items() {
            return Err(PredictionError::ItemCountMismatch {
                expected: self.num_items(),
                actual: input.num_items(),
            });
        }

        self.broadcast(input.num_users())
    }
}

/// Builds [`TopPopRecommender`]s; ignores every hyperparameter.
#[derive(Clone, Copy, Debug, Default)]
pub struct TopPopBuilder;

impl RecommenderBuilder for TopPopBuilder {
    type Model = TopPopRecommender;

    fn build(
        &self,
        train: Arc<InteractionMatrix>,
        _: &Assignment,
        _: &TrialContext,
    ) -> Result<TopPopRecommender, FittingError> {
        if train.nnz() == 0 {
            return Err(FittingError::NoInteractions);
        }

        Ok(TopPopRecommender::new(train))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Interaction;

    fn train() -> Arc<InteractionMatrix> {
        Arc::new(
            InteractionMatrix::from_triplets(
                3,
                4,
                vec![
                    Interaction::new(0, 1, 1.0),
                    Interaction::new(1, 1, 3.0),
                    Interaction::new(1, 2, 1.0),
                    Interaction::new(2, 1, 1.0),
                    Interaction::new(2, 3, 1.0),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn counts_users_per_item() {
        let mut model = TopPopRecommender::new(train());
        assert!(matches!(model.get_score(), Err(PredictionError::NotFitted)));

        model.fit().unwrap();

        assert_eq!(
            model.popularity().unwrap().to_vec(),
            vec![0.0, 3.0, 1.0, 1.0]
        );
        let scores = model.get_score().unwrap();
        assert_eq!(scores.shape(), &[3, 4]);
        assert_eq!(scores.row(2).to_vec(), vec![0.0, 3.0, 1.0, 1.0]);
    }

    #[test]
    fn seen_items_are_masked() {
        let mut model = TopPopRecommender::new(train());
        model.fit().unwrap();

        let scores = model.get_score_remove_seen_block(1..3).unwrap();
        assert_eq!(scores[[0, 1]], f64::NEG_INFINITY);
        assert_eq!(scores[[0, 2]], f64::NEG_INFINITY);
        assert_eq!(scores[[0, 3]], 1.0);
        assert_eq!(scores[[1, 3]], f64::NEG_INFINITY);

        assert!(matches!(
            model.get_score_block(2..5),
            Err(PredictionError::UnknownUsers { .. })
        ));
    }

    #[test]
    fn cold_users_get_popularity() {
        let mut model = TopPopRecommender::new(train());
        model.fit().unwrap();

        let input = InteractionMatrix::from_triplets(2, 4, vec![Interaction::new(0, 1, 1.0)]).unwrap();
        let scores = model.get_score_cold_user_remove_seen(&input).unwrap();
        assert_eq!(scores[[0, 1]], f64::NEG_INFINITY);
        assert_eq!(scores[[1, 1]], 3.0);

        let wrong = InteractionMatrix::zeros(1, 5);
        assert!(matches!(
            model.get_score_cold_user(&wrong),
            Err(PredictionError::ItemCountMismatch { expected: 4, actual: 5 })
        ));
    }

    #[test]
    fn builder_rejects_empty_training_data() {
        let context = TrialContext {
            trial_id: 0,
            seed: 0,
            n_threads: 1,
        };
        let empty = Arc::new(InteractionMatrix::zeros(2, 2));

        assert!(matches!(
            TopPopBuilder.build(empty, &Assignment::new(), &context),
            Err(FittingError::NoInteractions)
        ));
        assert!(TopPopBuilder.build(train(), &Assignment::new(), &context).is_ok());
    }
}
