//! Ranking and diversity metrics over held-out interactions.
//!
//! An [`Evaluator`] owns the held-out block of one user group together with
//! the row `offset` at which that group starts in the joint training matrix.
//! Scoring a recommender asks it for the masked scores of exactly those
//! rows and reduces every user's top-K list to the metrics in [`Metric`].
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::thread_pool;
use super::data::InteractionMatrix;
use super::{ConfigurationError, DataError, EvaluationError, ItemId, PredictionError, Recommender, ScoreMatrix};

/// Metrics reported at every cutoff, in reporting order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Fraction of eligible users with at least one hit.
    Hit,
    /// Mean fraction of held-out items retrieved.
    Recall,
    /// Normalized discounted cumulative gain.
    Ndcg,
    /// Mean average precision.
    Map,
    /// Mean fraction of recommended items that are hits.
    Precision,
    /// Gini coefficient of item appearance counts.
    GiniIndex,
    /// Shannon entropy of item appearance counts.
    Entropy,
    /// Number of distinct recommended items.
    AppearedItem,
}

impl Metric {
    /// Every metric in reporting order.
    pub const ALL: [Metric; 8] = [
        Metric::Hit,
        Metric::Recall,
        Metric::Ndcg,
        Metric::Map,
        Metric::Precision,
        Metric::GiniIndex,
        Metric::Entropy,
        Metric::AppearedItem,
    ];

    /// Name used in result keys.
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Hit => "hit",
            Metric::Recall => "recall",
            Metric::Ndcg => "ndcg",
            Metric::Map => "map",
            Metric::Precision => "precision",
            Metric::GiniIndex => "gini_index",
            Metric::Entropy => "entropy",
            Metric::AppearedItem => "appeared_item",
        }
    }

    /// Result key of this metric at `cutoff`.
    pub fn key(&self, cutoff: usize) -> String {
        format!("{}@{}", self.name(), cutoff)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = ConfigurationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .find(|metric| metric.name() == value)
            .copied()
            .ok_or_else(|| {
                ConfigurationError::InvalidOptimizerConfig(format!("unknown metric `{}`", value))
            })
    }
}

/// Evaluator settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Cutoffs reported by `get_scores_default`.
    pub cutoffs: Vec<usize>,
    /// Metric used as the optimization objective.
    pub target_metric: Metric,
    /// Cutoff of the objective.
    pub target_cutoff: usize,
    /// Threads used for per-user metric computation.
    pub n_threads: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        EvaluatorConfig {
            cutoffs: vec![5, 10, 20],
            target_metric: Metric::Ndcg,
            target_cutoff: 10,
            n_threads: 1,
        }
    }
}

fn normalize_cutoffs(cutoffs: &[usize]) -> Result<Vec<usize>, ConfigurationError> {
    if let Some(&bad) = cutoffs.iter().find(|&&cutoff| cutoff == 0) {
        return Err(ConfigurationError::InvalidCutoff(bad));
    }

    let mut cutoffs = cutoffs.to_vec();
    cutoffs.sort_unstable();
    cutoffs.dedup();

    Ok(cutoffs)
}

/// Ordered `"<metric>@<cutoff>"` to value mapping.
///
/// Entries are metric-major in [`Metric::ALL`] order, cutoffs ascending
/// within a metric. Serializes as a map in the same order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricResult {
    entries: Vec<(String, f64)>,
}

impl MetricResult {
    fn push(&mut self, metric: Metric, cutoff: usize, value: f64) {
        self.entries.push((metric.key(cutoff), value));
    }

    /// Value stored under `key`, e.g. `"ndcg@10"`.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| *value)
    }

    /// Value of `metric` at `cutoff`.
    pub fn get_metric(&self, metric: Metric, cutoff: usize) -> Option<f64> {
        self.get(&metric.key(cutoff))
    }

    /// Entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for MetricResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Column indices of `scores` by descending score, ties by ascending index.
///
/// Negative infinity marks masked items, which are left out.
pub fn rank(scores: ArrayView1<f64>) -> Result<Vec<ItemId>, PredictionError> {
    top_k(scores, usize::MAX)
}

fn top_k(scores: ArrayView1<f64>, k: usize) -> Result<Vec<ItemId>, PredictionError> {
    let mut candidates = Vec::with_capacity(scores.len());
    for (item_id, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            return Err(PredictionError::InvalidPredictionValue);
        }
        if score != f64::NEG_INFINITY {
            candidates.push(item_id);
        }
    }

    let by_rank = |x: &ItemId, y: &ItemId| {
        scores[*y]
            .partial_cmp(&scores[*x])
            .unwrap_or(Ordering::Equal)
            .then(x.cmp(y))
    };

    if k < candidates.len() {
        candidates.select_nth_unstable_by(k, by_rank);
        candidates.truncate(k);
    }
    candidates.sort_unstable_by(by_rank);

    Ok(candidates)
}

#[derive(Clone, Copy, Debug, Default)]
struct Accuracy {
    hit: f64,
    recall: f64,
    ndcg: f64,
    map: f64,
    precision: f64,
}

fn discount(rank: usize) -> f64 {
    1.0 / ((rank + 2) as f64).log2()
}

impl Accuracy {
    fn compute(top: &[ItemId], relevant: &[ItemId], cutoff: usize) -> Self {
        let recommended = &top[..cutoff.min(top.len())];

        let mut num_hits = 0;
        let mut precision_sum = 0.0;
        let mut dcg = 0.0;

        for (rank, item_id) in recommended.iter().enumerate() {
            if relevant.binary_search(item_id).is_ok() {
                num_hits += 1;
                precision_sum += num_hits as f64 / (rank + 1) as f64;
                dcg += discount(rank);
            }
        }

        let num_ideal = relevant.len().min(cutoff);
        let idcg: f64 = (0..num_ideal).map(discount).sum();

        Accuracy {
            hit: if num_hits > 0 { 1.0 } else { 0.0 },
            recall: num_hits as f64 / relevant.len() as f64,
            ndcg: dcg / idcg,
            map: precision_sum / num_ideal as f64,
            precision: num_hits as f64 / cutoff as f64,
        }
    }
}

struct UserOutcome {
    eligible: bool,
    accuracy: Vec<Accuracy>,
    top: Vec<ItemId>,
}

fn evaluate_user(
    scores: ArrayView1<f64>,
    relevant: &[ItemId],
    cutoffs: &[usize],
    max_cutoff: usize,
) -> Result<UserOutcome, PredictionError> {
    let top = top_k(scores, max_cutoff)?;
    let eligible = !relevant.is_empty();
    let accuracy = if eligible {
        cutoffs
            .iter()
            .map(|&cutoff| Accuracy::compute(&top, relevant, cutoff))
            .collect()
    } else {
        Vec::new()
    };

    Ok(UserOutcome {
        eligible,
        accuracy,
        top,
    })
}

struct Diversity {
    gini_index: f64,
    entropy: f64,
    appeared_item: f64,
}

impl Diversity {
    fn compute(outcomes: &[UserOutcome], cutoff: usize, num_items: usize) -> Self {
        let mut counts = vec![0usize; num_items];
        for outcome in outcomes {
            for &item_id in outcome.top.iter().take(cutoff) {
                counts[item_id] += 1;
            }
        }

        let appeared_item = counts.iter().filter(|&&count| count > 0).count() as f64;
        let total: usize = counts.iter().sum();

        if total == 0 {
            warn!(cutoff, "No item was recommended; gini_index and entropy are NaN");
            return Diversity {
                gini_index: f64::NAN,
                entropy: f64::NAN,
                appeared_item,
            };
        }

        counts.sort_unstable();
        let n = num_items as f64;
        let total = total as f64;

        let gini_index = counts
            .iter()
            .enumerate()
            .map(|(idx, &count)| (2.0 * (idx + 1) as f64 - n - 1.0) * count as f64)
            .sum::<f64>()
            / (n * total);
        let entropy = counts
            .iter()
            .filter(|&&count| count > 0)
            .map(|&count| {
                let p = count as f64 / total;
                -p * p.ln()
            })
            .sum::<f64>();

        Diversity {
            gini_index,
            entropy,
            appeared_item,
        }
    }
}

fn mean_accuracy<F: Fn(&Accuracy) -> f64>(
    outcomes: &[UserOutcome],
    num_eligible: usize,
    cutoff_idx: usize,
    field: F,
) -> f64 {
    if num_eligible == 0 {
        return f64::NAN;
    }

    let sum: f64 = outcomes
        .iter()
        .filter(|outcome| outcome.eligible)
        .map(|outcome| field(&outcome.accuracy[cutoff_idx]))
        .sum();

    sum / num_eligible as f64
}

fn aggregate(outcomes: &[UserOutcome], cutoffs: &[usize], num_items: usize) -> MetricResult {
    let num_eligible = outcomes.iter().filter(|outcome| outcome.eligible).count();
    if num_eligible == 0 {
        warn!(
            n_users = outcomes.len(),
            "No user has held-out interactions; ranking metrics are NaN"
        );
    }

    let diversity: Vec<Diversity> = cutoffs
        .iter()
        .map(|&cutoff| Diversity::compute(outcomes, cutoff, num_items))
        .collect();

    let mut result = MetricResult::default();
    for metric in Metric::ALL.iter() {
        for (idx, &cutoff) in cutoffs.iter().enumerate() {
            let value = match metric {
                Metric::Hit => mean_accuracy(outcomes, num_eligible, idx, |x| x.hit),
                Metric::Recall => mean_accuracy(outcomes, num_eligible, idx, |x| x.recall),
                Metric::Ndcg => mean_accuracy(outcomes, num_eligible, idx, |x| x.ndcg),
                Metric::Map => mean_accuracy(outcomes, num_eligible, idx, |x| x.map),
                Metric::Precision => mean_accuracy(outcomes, num_eligible, idx, |x| x.precision),
                Metric::GiniIndex => diversity[idx].gini_index,
                Metric::Entropy => diversity[idx].entropy,
                Metric::AppearedItem => diversity[idx].appeared_item,
            };
            result.push(*metric, cutoff, value);
        }
    }

    result
}

/// Cutoffs, objective and worker pool shared by both evaluators.
#[derive(Debug)]
struct MetricSettings {
    cutoffs: Vec<usize>,
    target_metric: Metric,
    target_cutoff: usize,
    pool: ThreadPool,
}

impl MetricSettings {
    fn new(config: &EvaluatorConfig) -> Result<Self, ConfigurationError> {
        let mut cutoffs = config.cutoffs.clone();
        cutoffs.push(config.target_cutoff);

        Ok(MetricSettings {
            cutoffs: normalize_cutoffs(&cutoffs)?,
            target_metric: config.target_metric,
            target_cutoff: config.target_cutoff,
            pool: thread_pool(config.n_threads)?,
        })
    }

    fn compute(
        &self,
        scores: ArrayView2<f64>,
        ground_truth: &InteractionMatrix,
        cutoffs: &[usize],
    ) -> Result<MetricResult, EvaluationError> {
        check_shape(scores, ground_truth.num_users(), ground_truth.num_items())?;
        let cutoffs = normalize_cutoffs(cutoffs)?;
        let max_cutoff = cutoffs.last().copied().unwrap_or(0);

        let rows: Vec<ArrayView1<f64>> = scores.outer_iter().collect();
        let relevant: Vec<&[ItemId]> = ground_truth.iter_users().map(|user| user.item_ids).collect();

        let outcomes = self.pool.install(|| {
            rows.par_iter()
                .zip(relevant.par_iter())
                .map(|(row, relevant)| evaluate_user(*row, relevant, &cutoffs, max_cutoff))
                .collect::<Result<Vec<_>, _>>()
        })?;

        Ok(aggregate(&outcomes, &cutoffs, ground_truth.num_items()))
    }

    fn target(&self, scores: ArrayView2<f64>, ground_truth: &InteractionMatrix) -> Result<f64, EvaluationError> {
        let result = self.compute(scores, ground_truth, &[self.target_cutoff])?;
        let value = result
            .get_metric(self.target_metric, self.target_cutoff)
            .unwrap_or(f64::NAN);

        debug!(
            metric = %self.target_metric,
            cutoff = self.target_cutoff,
            value,
            "Computed target metric"
        );

        Ok(value)
    }
}

fn check_shape(scores: ArrayView2<f64>, rows: usize, cols: usize) -> Result<(), EvaluationError> {
    if scores.ncols() != cols {
        return Err(EvaluationError::ColumnMismatch {
            expected: cols,
            actual: scores.ncols(),
        });
    }
    if scores.nrows() != rows {
        return Err(EvaluationError::ScoreShape {
            expected_rows: rows,
            expected_cols: cols,
            rows: scores.nrows(),
            cols: scores.ncols(),
        });
    }
    Ok(())
}

/// Scores a block of warm users against their held-out interactions.
#[derive(Debug)]
pub struct Evaluator {
    ground_truth: InteractionMatrix,
    offset: usize,
    settings: MetricSettings,
}

impl Evaluator {
    /// Build an evaluator for `ground_truth`, whose first row is row
    /// `offset` of the joint training matrix.
    pub fn new(
        ground_truth: InteractionMatrix,
        offset: usize,
        config: EvaluatorConfig,
    ) -> Result<Self, ConfigurationError> {
        Ok(Evaluator {
            ground_truth,
            offset,
            settings: MetricSettings::new(&config)?,
        })
    }

    /// Number of evaluated users.
    pub fn n_users(&self) -> usize {
        self.ground_truth.num_users()
    }

    /// First evaluated row of the joint matrix.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Configured cutoffs, target cutoff included.
    pub fn cutoffs(&self) -> &[usize] {
        &self.settings.cutoffs
    }

    /// The objective metric and its cutoff.
    pub fn target(&self) -> (Metric, usize) {
        (self.settings.target_metric, self.settings.target_cutoff)
    }

    /// Masked scores of the evaluated rows.
    pub fn score<R: Recommender + ?Sized>(&self, recommender: &R) -> Result<ScoreMatrix, EvaluationError> {
        if recommender.num_items() != self.ground_truth.num_items() {
            return Err(EvaluationError::ColumnMismatch {
                expected: self.ground_truth.num_items(),
                actual: recommender.num_items(),
            });
        }

        let end = self.offset + self.n_users();
        if end > recommender.num_users() {
            return Err(EvaluationError::RowRangeOutOfBounds {
                offset: self.offset,
                end,
                n_rows: recommender.num_users(),
            });
        }

        let scores = recommender.get_score_remove_seen_block(self.offset..end)?;
        check_shape(scores.view(), self.n_users(), self.ground_truth.num_items())?;

        Ok(scores)
    }

    /// Metrics of a score block already restricted to the evaluated rows.
    pub fn evaluate_scores(&self, scores: ArrayView2<f64>, cutoffs: &[usize]) -> Result<MetricResult, EvaluationError> {
        self.settings.compute(scores, &self.ground_truth, cutoffs)
    }

    /// Metrics of a joint score matrix; only rows from `offset` on are read.
    pub fn evaluate_full_scores(
        &self,
        scores: ArrayView2<f64>,
        cutoffs: &[usize],
    ) -> Result<MetricResult, EvaluationError> {
        let end = self.offset + self.n_users();
        if end > scores.nrows() {
            return Err(EvaluationError::RowRangeOutOfBounds {
                offset: self.offset,
                end,
                n_rows: scores.nrows(),
            });
        }

        self.evaluate_scores(scores.slice(ndarray::s![self.offset..end, ..]), cutoffs)
    }

    /// Metrics at `cutoffs`.
    pub fn get_scores<R: Recommender + ?Sized>(
        &self,
        recommender: &R,
        cutoffs: &[usize],
    ) -> Result<MetricResult, EvaluationError> {
        let scores = self.score(recommender)?;
        self.evaluate_scores(scores.view(), cutoffs)
    }

    /// Metrics at the configured cutoffs.
    pub fn get_scores_default<R: Recommender + ?Sized>(&self, recommender: &R) -> Result<MetricResult, EvaluationError> {
        self.get_scores(recommender, &self.settings.cutoffs)
    }

    /// The objective value.
    pub fn get_score<R: Recommender + ?Sized>(&self, recommender: &R) -> Result<f64, EvaluationError> {
        let scores = self.score(recommender)?;
        self.settings.target(scores.view(), &self.ground_truth)
    }
}

/// Scores users absent from the training matrix from their known
/// interactions.
#[derive(Debug)]
pub struct EvaluatorWithColdUser {
    input: InteractionMatrix,
    ground_truth: InteractionMatrix,
    settings: MetricSettings,
}

impl EvaluatorWithColdUser {
    /// Build from the cold users' known interactions and their held-out
    /// interactions, row-aligned.
    pub fn new(
        input: InteractionMatrix,
        ground_truth: InteractionMatrix,
        config: EvaluatorConfig,
    ) -> Result<Self, EvaluationError> {
        if input.shape() != ground_truth.shape() {
            return Err(DataError::ShapeMismatch {
                expected: format!("{:?}", ground_truth.shape()),
                actual: format!("{:?}", input.shape()),
            }
            .into());
        }

        Ok(EvaluatorWithColdUser {
            input,
            ground_truth,
            settings: MetricSettings::new(&config)?,
        })
    }

    /// Number of evaluated users.
    pub fn n_users(&self) -> usize {
        self.ground_truth.num_users()
    }

    /// Cold-user scores with the known interactions masked.
    pub fn score<R: Recommender + ?Sized>(&self, recommender: &R) -> Result<ScoreMatrix, EvaluationError> {
        if recommender.num_items() != self.ground_truth.num_items() {
            return Err(EvaluationError::ColumnMismatch {
                expected: self.ground_truth.num_items(),
                actual: recommender.num_items(),
            });
        }

        let scores = recommender.get_score_cold_user_remove_seen(&self.input)?;
        check_shape(scores.view(), self.n_users(), self.ground_truth.num_items())?;

        Ok(scores)
    }

    /// Metrics at `cutoffs`.
    pub fn get_scores<R: Recommender + ?Sized>(
        &self,
        recommender: &R,
        cutoffs: &[usize],
    ) -> Result<MetricResult, EvaluationError> {
        let scores = self.score(recommender)?;
        self.settings.compute(scores.view(), &self.ground_truth, cutoffs)
    }

    /// Metrics at the configured cutoffs.
    pub fn get_scores_default<R: Recommender + ?Sized>(&self, recommender: &R) -> Result<MetricResult, EvaluationError> {
        self.get_scores(recommender, &self.settings.cutoffs)
    }

    /// The objective value.
    pub fn get_score<R: Recommender + ?Sized>(&self, recommender: &R) -> Result<f64, EvaluationError> {
        let scores = self.score(recommender)?;
        self.settings.target(scores.view(), &self.ground_truth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Range;

    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2, Array2};
    use proptest::prelude::*;

    use crate::data::Interaction;
    use crate::{FittingError, StepStatus, UserId};

    fn truth(num_items: usize, rows: &[&[usize]]) -> InteractionMatrix {
        let triplets = rows
            .iter()
            .enumerate()
            .flat_map(|(user, items)| items.iter().map(move |&item| Interaction::new(user, item, 1.0)));
        InteractionMatrix::from_triplets(rows.len(), num_items, triplets).unwrap()
    }

    fn scenario() -> (InteractionMatrix, Array2<f64>) {
        let ground_truth = truth(5, &[&[2], &[], &[0, 4], &[1]]);
        let scores = arr2(&[
            [0.1, 0.9, 0.8, 0.2, 0.3],
            [0.3, 0.2, 0.1, 0.9, 0.8],
            [0.5, 0.1, 0.2, 0.3, 0.4],
            [0.9, 0.1, 0.8, 0.7, 0.6],
        ]);
        (ground_truth, scores)
    }

    fn evaluator(ground_truth: InteractionMatrix, offset: usize) -> Evaluator {
        Evaluator::new(ground_truth, offset, EvaluatorConfig::default()).unwrap()
    }

    /// Serves a fixed score matrix.
    struct FixedScores {
        train: InteractionMatrix,
        scores: Array2<f64>,
    }

    impl Recommender for FixedScores {
        fn num_users(&self) -> usize {
            self.scores.nrows()
        }
        fn num_items(&self) -> usize {
            self.scores.ncols()
        }
        fn training_matrix(&self) -> &InteractionMatrix {
            &self.train
        }
        fn step(&mut self) -> Result<StepStatus, FittingError> {
            Ok(StepStatus::finished())
        }
        fn get_score_block(&self, users: Range<UserId>) -> Result<ScoreMatrix, PredictionError> {
            Ok(self.scores.slice(ndarray::s![users, ..]).to_owned())
        }
        fn get_score_cold_user(&self, input: &InteractionMatrix) -> Result<ScoreMatrix, PredictionError> {
            Ok(self.scores.slice(ndarray::s![..input.num_users(), ..]).to_owned())
        }
    }

    #[test]
    fn rank_breaks_ties_by_index_and_skips_masked() {
        let scores = arr1(&[0.5, f64::NEG_INFINITY, 0.7, 0.5, 0.7]);
        assert_eq!(rank(scores.view()).unwrap(), vec![2, 4, 0, 3]);
        assert_eq!(top_k(scores.view(), 3).unwrap(), vec![2, 4, 0]);
    }

    #[test]
    fn rank_rejects_nan() {
        let scores = arr1(&[0.5, f64::NAN]);
        assert!(matches!(
            rank(scores.view()),
            Err(PredictionError::InvalidPredictionValue)
        ));
    }

    #[test]
    fn four_user_scenario() {
        let (ground_truth, scores) = scenario();
        let result = evaluator(ground_truth, 0)
            .evaluate_scores(scores.view(), &[2])
            .unwrap();

        assert_relative_eq!(result.get("hit@2").unwrap(), 2.0 / 3.0);
        assert_relative_eq!(result.get("recall@2").unwrap(), 2.0 / 3.0);
        assert_relative_eq!(result.get("precision@2").unwrap(), 0.5);
        assert_relative_eq!(result.get("map@2").unwrap(), 0.5);
        assert_relative_eq!(
            result.get("ndcg@2").unwrap(),
            (1.0 / 3f64.log2() + 1.0) / 3.0
        );

        // Top-2 lists: [1, 2], [3, 4], [0, 4], [0, 2].
        assert_relative_eq!(result.get("appeared_item@2").unwrap(), 5.0);
        assert_relative_eq!(result.get("gini_index@2").unwrap(), 6.0 / 40.0);
        let entropy = -(2.0 * 0.125 * 0.125f64.ln() + 3.0 * 0.25 * 0.25f64.ln());
        assert_relative_eq!(result.get("entropy@2").unwrap(), entropy);
    }

    #[test]
    fn result_order_is_metric_major() {
        let (ground_truth, scores) = scenario();
        let result = evaluator(ground_truth, 0)
            .evaluate_scores(scores.view(), &[3, 1])
            .unwrap();
        let keys: Vec<&str> = result.iter().map(|(key, _)| key).collect();

        assert_eq!(
            keys,
            vec![
                "hit@1",
                "hit@3",
                "recall@1",
                "recall@3",
                "ndcg@1",
                "ndcg@3",
                "map@1",
                "map@3",
                "precision@1",
                "precision@3",
                "gini_index@1",
                "gini_index@3",
                "entropy@1",
                "entropy@3",
                "appeared_item@1",
                "appeared_item@3",
            ]
        );

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.starts_with("{\"hit@1\":"));
    }

    #[test]
    fn repeated_evaluation_is_bit_identical() {
        let (ground_truth, scores) = scenario();
        let evaluator = Evaluator::new(
            ground_truth,
            0,
            EvaluatorConfig {
                n_threads: 3,
                ..EvaluatorConfig::default()
            },
        )
        .unwrap();

        let first = evaluator.evaluate_scores(scores.view(), &[1, 2, 3]).unwrap();
        let second = evaluator.evaluate_scores(scores.view(), &[1, 2, 3]).unwrap();

        for ((k1, v1), (k2, v2)) in first.iter().zip(second.iter()) {
            assert_eq!(k1, k2);
            assert_eq!(v1.to_bits(), v2.to_bits());
        }
    }

    #[test]
    fn no_eligible_user_gives_nan() {
        let ground_truth = truth(3, &[&[], &[]]);
        let scores = arr2(&[[0.1, 0.2, 0.3], [0.3, 0.2, 0.1]]);
        let result = evaluator(ground_truth, 0)
            .evaluate_scores(scores.view(), &[2])
            .unwrap();

        assert!(result.get("ndcg@2").unwrap().is_nan());
        assert!(result.get("hit@2").unwrap().is_nan());
        assert_relative_eq!(result.get("appeared_item@2").unwrap(), 3.0);
        assert!(!result.get("gini_index@2").unwrap().is_nan());
    }

    #[test]
    fn fully_masked_scores_give_nan_diversity() {
        let ground_truth = truth(2, &[&[0]]);
        let scores = arr2(&[[f64::NEG_INFINITY, f64::NEG_INFINITY]]);
        let result = evaluator(ground_truth, 0)
            .evaluate_scores(scores.view(), &[1])
            .unwrap();

        assert_eq!(result.get("hit@1").unwrap(), 0.0);
        assert!(result.get("entropy@1").unwrap().is_nan());
        assert_eq!(result.get("appeared_item@1").unwrap(), 0.0);
    }

    #[test]
    fn offset_selects_rows_and_masks_seen() {
        let (ground_truth, block_scores) = scenario();
        let mut scores = Array2::zeros((6, 5));
        scores
            .slice_mut(ndarray::s![2..6, ..])
            .assign(&block_scores);

        // User 2 (first evaluated) has item 1 in training, so item 2 and 4 lead.
        let train = truth(5, &[&[0], &[1], &[1], &[], &[], &[]]);
        let recommender = FixedScores { train, scores };
        let evaluator = evaluator(ground_truth, 2);

        let masked = evaluator.score(&recommender).unwrap();
        assert_eq!(masked.nrows(), 4);
        assert_eq!(masked[[0, 1]], f64::NEG_INFINITY);

        let result = evaluator.get_scores(&recommender, &[1]).unwrap();
        // Row 0 now ranks item 2 first, a hit.
        assert_relative_eq!(result.get("hit@1").unwrap(), 2.0 / 3.0);

        let full = evaluator
            .evaluate_full_scores(recommender.scores.view(), &[2])
            .unwrap();
        let direct = evaluator.evaluate_scores(block_scores.view(), &[2]).unwrap();
        assert_eq!(full, direct);
    }

    #[test]
    fn shape_errors() {
        let (ground_truth, scores) = scenario();
        let evaluator = evaluator(ground_truth, 3);

        let recommender = FixedScores {
            train: InteractionMatrix::zeros(4, 5),
            scores: scores.clone(),
        };
        assert!(matches!(
            evaluator.score(&recommender),
            Err(EvaluationError::RowRangeOutOfBounds { offset: 3, end: 7, n_rows: 4 })
        ));

        let narrow = FixedScores {
            train: InteractionMatrix::zeros(4, 4),
            scores: Array2::zeros((4, 4)),
        };
        assert!(matches!(
            evaluator.score(&narrow),
            Err(EvaluationError::ColumnMismatch { expected: 5, actual: 4 })
        ));

        assert!(matches!(
            evaluator.evaluate_scores(scores.slice(ndarray::s![..2, ..]), &[2]),
            Err(EvaluationError::ScoreShape { .. })
        ));
        assert!(matches!(
            evaluator.evaluate_scores(scores.view(), &[0]),
            Err(EvaluationError::Configuration(ConfigurationError::InvalidCutoff(0)))
        ));
    }

    #[test]
    fn target_cutoff_is_added() {
        let config = EvaluatorConfig {
            cutoffs: vec![20, 5, 5],
            target_metric: Metric::Recall,
            target_cutoff: 3,
            n_threads: 1,
        };
        let evaluator = Evaluator::new(truth(5, &[&[1]]), 0, config).unwrap();
        assert_eq!(evaluator.cutoffs(), &[3, 5, 20]);
        assert_eq!(evaluator.target(), (Metric::Recall, 3));
    }

    #[test]
    fn target_score_matches_metric() {
        let (ground_truth, scores) = scenario();
        let recommender = FixedScores {
            train: InteractionMatrix::zeros(4, 5),
            scores,
        };
        let evaluator = Evaluator::new(
            ground_truth,
            0,
            EvaluatorConfig {
                target_metric: Metric::Hit,
                target_cutoff: 2,
                ..EvaluatorConfig::default()
            },
        )
        .unwrap();

        assert_relative_eq!(evaluator.get_score(&recommender).unwrap(), 2.0 / 3.0);
        let all = evaluator.get_scores_default(&recommender).unwrap();
        assert_eq!(all.len(), Metric::ALL.len() * 4);
    }

    #[test]
    fn cold_user_evaluation_masks_input() {
        let (ground_truth, scores) = scenario();
        let input = truth(5, &[&[1], &[], &[], &[]]);
        let recommender = FixedScores {
            train: InteractionMatrix::zeros(4, 5),
            scores,
        };
        let evaluator =
            EvaluatorWithColdUser::new(input, ground_truth, EvaluatorConfig::default()).unwrap();

        let result = evaluator.get_scores(&recommender, &[1]).unwrap();
        assert_relative_eq!(result.get("hit@1").unwrap(), 2.0 / 3.0);

        let mismatched = EvaluatorWithColdUser::new(
            InteractionMatrix::zeros(2, 5),
            truth(5, &[&[1]]),
            EvaluatorConfig::default(),
        );
        assert!(matches!(mismatched, Err(EvaluationError::Data(_))));
    }

    #[test]
    fn metric_names_round_trip() {
        for metric in Metric::ALL.iter() {
            assert_eq!(metric.name().parse::<Metric>().unwrap(), *metric);
        }
        assert!("auc".parse::<Metric>().is_err());
    }

    proptest! {
        #[test]
        fn metrics_are_bounded(
            scores in proptest::collection::vec(-10.0f64..10.0, 6 * 8),
            relevant in proptest::collection::vec(proptest::collection::btree_set(0usize..8, 0..4), 6),
            cutoff in 1usize..10,
        ) {
            let rows: Vec<Vec<usize>> = relevant.iter().map(|set| set.iter().cloned().collect()).collect();
            let row_refs: Vec<&[usize]> = rows.iter().map(|row| row.as_slice()).collect();
            let ground_truth = truth(8, &row_refs);
            let scores = Array2::from_shape_vec((6, 8), scores).unwrap();
            let result = evaluator(ground_truth, 0)
                .evaluate_scores(scores.view(), &[cutoff])
                .unwrap();

            for metric in &[Metric::Hit, Metric::Recall, Metric::Precision, Metric::Ndcg, Metric::Map, Metric::GiniIndex] {
                let value = result.get_metric(*metric, cutoff).unwrap();
                prop_assert!(value.is_nan() || (-1e-12..=1.0 + 1e-12).contains(&value), "{} = {}", metric, value);
            }
            prop_assert!(result.get_metric(Metric::Entropy, cutoff).unwrap() >= 0.0);
            let appeared = result.get_metric(Metric::AppearedItem, cutoff).unwrap();
            prop_assert!(appeared <= 8f64.min((cutoff * 6) as f64));
        }

        #[test]
        fn promoting_a_relevant_item_never_lowers_ndcg(
            scores in proptest::collection::vec(0.0f64..1.0, 10),
            relevant in proptest::collection::btree_set(0usize..10, 1..4),
            cutoff in 1usize..10,
        ) {
            let relevant: Vec<usize> = relevant.into_iter().collect();
            let ground_truth = truth(10, &[&relevant]);
            let evaluator = evaluator(ground_truth, 0);

            let before = Array2::from_shape_vec((1, 10), scores.clone()).unwrap();
            let ndcg_before = evaluator
                .evaluate_scores(before.view(), &[cutoff])
                .unwrap()
                .get_metric(Metric::Ndcg, cutoff)
                .unwrap();

            let mut promoted = scores;
            promoted[relevant[0]] = 2.0;
            let after = Array2::from_shape_vec((1, 10), promoted).unwrap();
            let ndcg_after = evaluator
                .evaluate_scores(after.view(), &[cutoff])
                .unwrap()
                .get_metric(Metric::Ndcg, cutoff)
                .unwrap();

            prop_assert!(ndcg_after >= ndcg_before - 1e-12);
        }
    }
}
