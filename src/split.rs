//! Seeded holdout splits of interaction data.
//!
//! Users are partitioned into train, validation and test blocks; within
//! the validation and test blocks each row's interactions are further split
//! into a learning part and a held-out part.
use std::collections::HashMap;

use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::data::{Block, Dataset, InteractionMatrix, InteractionTable, UserRow, UserTrainTestInteractionPair};
use super::{derive_seed, ConfigurationError, ItemId};

/// User and interaction ratios of a user holdout split.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldoutRatios {
    /// Fraction of users placed in the validation block.
    pub val_user_ratio: f64,
    /// Fraction of users placed in the test block.
    pub test_user_ratio: f64,
    /// Fraction of each validation user's interactions held out.
    pub heldout_ratio_val: f64,
    /// Fraction of each test user's interactions held out.
    pub heldout_ratio_test: f64,
}

impl Default for HoldoutRatios {
    fn default() -> Self {
        HoldoutRatios {
            val_user_ratio: 0.1,
            test_user_ratio: 0.1,
            heldout_ratio_val: 0.5,
            heldout_ratio_test: 0.5,
        }
    }
}

impl HoldoutRatios {
    /// Check every ratio lies in `[0, 1)` and the user ratios leave room
    /// for training users.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_ratio("val_user_ratio", self.val_user_ratio)?;
        check_ratio("test_user_ratio", self.test_user_ratio)?;
        check_ratio("heldout_ratio_val", self.heldout_ratio_val)?;
        check_ratio("heldout_ratio_test", self.heldout_ratio_test)?;

        let sum = self.val_user_ratio + self.test_user_ratio;
        if sum >= 1.0 {
            return Err(ConfigurationError::RatioSumTooLarge { sum });
        }

        Ok(())
    }
}

fn check_ratio(name: &'static str, value: f64) -> Result<(), ConfigurationError> {
    if value.is_finite() && (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidRatio { name, value })
    }
}

/// Split every row of `interactions` into a learning part and a held-out
/// part of `floor(test_ratio * row_nnz)` entries.
///
/// Rows draw their permutation from independent streams keyed by `seed`
/// and the row index, so the result does not depend on thread scheduling.
/// The two returned matrices have the shape of `interactions`, disjoint
/// supports, and sum to `interactions`.
pub fn rowwise_split(
    interactions: &InteractionMatrix,
    test_ratio: f64,
    seed: u64,
) -> Result<(InteractionMatrix, InteractionMatrix), ConfigurationError> {
    check_ratio("test_ratio", test_ratio)?;

    let rows: Vec<UserRow> = interactions.iter_users().collect();
    let (train_rows, test_rows): (Vec<_>, Vec<_>) = rows
        .par_iter()
        .map(|row| split_row(row, test_ratio, seed))
        .collect::<Vec<_>>()
        .into_iter()
        .unzip();

    let num_items = interactions.num_items();

    Ok((
        InteractionMatrix::from_sorted_rows(num_items, train_rows),
        InteractionMatrix::from_sorted_rows(num_items, test_rows),
    ))
}

type Row = Vec<(ItemId, f64)>;

fn split_row(row: &UserRow, test_ratio: f64, seed: u64) -> (Row, Row) {
    let nnz = row.len();
    let num_test = (test_ratio * nnz as f64).floor() as usize;

    if num_test == 0 {
        return (row.entries().collect(), Vec::new());
    }

    let mut rng = XorShiftRng::seed_from_u64(derive_seed(seed, row.user_id as u64));
    let mut positions: Vec<usize> = (0..nnz).collect();
    positions.shuffle(&mut rng);

    let mut is_test = vec![false; nnz];
    for &position in &positions[..num_test] {
        is_test[position] = true;
    }

    let (test, train): (Row, Row) = row
        .entries()
        .zip(is_test)
        .partition_map(|(entry, test)| {
            if test {
                itertools::Either::Left(entry)
            } else {
                itertools::Either::Right(entry)
            }
        });

    (train, test)
}

/// Partition the users of `table` into train, validation and test blocks
/// and hold out part of each validation and test user's interactions.
///
/// Items are indexed by their sorted-unique external ids, shared by all
/// blocks and available as [`Dataset::item_ids`]. Repeated `(user, item)`
/// records are summed.
pub fn user_holdout_split(
    table: &InteractionTable,
    ratios: &HoldoutRatios,
    seed: u64,
) -> Result<Dataset, ConfigurationError> {
    ratios.validate()?;

    if table.is_empty() {
        return Err(ConfigurationError::EmptyTable);
    }

    let item_ids: Vec<String> = table
        .iter()
        .map(|(_, item)| item)
        .sorted()
        .dedup()
        .map(str::to_owned)
        .collect();
    let item_index: HashMap<&str, ItemId> = item_ids
        .iter()
        .enumerate()
        .map(|(idx, item)| (item.as_str(), idx))
        .collect();

    let mut user_rows: HashMap<&str, Row> = HashMap::new();
    for (user, item) in table.iter() {
        user_rows
            .entry(user)
            .or_default()
            .push((item_index[item], 1.0));
    }

    let mut users: Vec<&str> = user_rows.keys().cloned().sorted().collect();
    let mut rng = XorShiftRng::seed_from_u64(seed);
    users.shuffle(&mut rng);

    let n_users = users.len();
    let n_val = block_size(Block::Val, ratios.val_user_ratio, n_users)?;
    let n_test = block_size(Block::Test, ratios.test_user_ratio, n_users)?.min(n_users - n_val);

    let (val_users, rest) = users.split_at(n_val);
    let (test_users, train_users) = rest.split_at(n_test);

    let block_matrix = |block_users: &[&str]| -> InteractionMatrix {
        let rows = block_users
            .iter()
            .map(|user| {
                let mut row = user_rows.get(user).cloned().unwrap_or_default();
                row.sort_by_key(|entry| entry.0);
                row.into_iter()
                    .coalesce(|x, y| {
                        if x.0 == y.0 {
                            Ok((x.0, x.1 + y.1))
                        } else {
                            Err((x, y))
                        }
                    })
                    .collect()
            })
            .collect();
        InteractionMatrix::from_sorted_rows(item_ids.len(), rows)
    };
    let owned_ids = |block_users: &[&str]| -> Vec<String> {
        block_users.iter().map(|user| user.to_string()).collect()
    };

    // Train users keep everything as learning input.
    let train = UserTrainTestInteractionPair::from_parts(
        owned_ids(train_users),
        block_matrix(train_users),
        InteractionMatrix::zeros(train_users.len(), item_ids.len()),
    );

    let (val_train, val_test) = rowwise_split(
        &block_matrix(val_users),
        ratios.heldout_ratio_val,
        derive_seed(seed, 1),
    )?;
    let val = UserTrainTestInteractionPair::from_parts(owned_ids(val_users), val_train, val_test);

    let (test_train, test_test) = rowwise_split(
        &block_matrix(test_users),
        ratios.heldout_ratio_test,
        derive_seed(seed, 2),
    )?;
    let test = UserTrainTestInteractionPair::from_parts(owned_ids(test_users), test_train, test_test);

    debug!(
        n_users,
        n_items = item_ids.len(),
        n_train_users = train.n_users(),
        n_val_users = val.n_users(),
        n_test_users = test.n_users(),
        val_heldout = val.x_test().nnz(),
        test_heldout = test.x_test().nnz(),
        "Split interactions by user"
    );

    Ok(Dataset::from_parts(train, val, test, item_ids))
}

fn block_size(block: Block, ratio: f64, n_users: usize) -> Result<usize, ConfigurationError> {
    let size = (ratio * n_users as f64).round() as usize;

    if ratio > 0.0 && size == 0 {
        return Err(ConfigurationError::EmptyBlock {
            block,
            ratio,
            n_users,
        });
    }

    Ok(size.min(n_users))
}
