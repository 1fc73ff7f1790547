//! Sparse interaction data: compressed matrices, raw tables and holdout blocks.
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

use itertools::{izip, EitherOrBoth, Itertools};
use serde::{Deserialize, Serialize};

use super::{DataError, ItemId, ScoreMatrix, UserId};

/// A single weighted user-item interaction.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
    weight: f64,
}

impl Interaction {
    /// Create a new interaction.
    pub fn new(user_id: UserId, item_id: ItemId, weight: f64) -> Self {
        Interaction {
            user_id,
            item_id,
            weight,
        }
    }

    /// Row of the interaction.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Column of the interaction.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// Implicit-feedback weight.
    pub fn weight(&self) -> f64 {
        self.weight
    }
}

/// Sparse nonnegative user-item matrix in compressed-row form.
///
/// Within each row item ids are strictly ascending and every stored weight
/// is positive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractionMatrix {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
    values: Vec<f64>,
}

impl InteractionMatrix {
    /// An all-zero matrix.
    pub fn zeros(num_users: usize, num_items: usize) -> Self {
        InteractionMatrix {
            num_users,
            num_items,
            user_pointers: vec![0; num_users + 1],
            item_ids: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build a matrix from interactions. Duplicate cells are summed and
    /// cells summing to zero are dropped.
    pub fn from_triplets<I>(num_users: usize, num_items: usize, triplets: I) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = Interaction>,
    {
        let mut data = Vec::new();

        for datum in triplets {
            if datum.user_id >= num_users || datum.item_id >= num_items {
                return Err(DataError::OutOfBounds {
                    row: datum.user_id,
                    col: datum.item_id,
                    n_rows: num_users,
                    n_cols: num_items,
                });
            }
            if !datum.weight.is_finite() || datum.weight < 0.0 {
                return Err(DataError::InvalidValue {
                    row: datum.user_id,
                    col: datum.item_id,
                    value: datum.weight,
                });
            }
            data.push(datum);
        }

        data.sort_by_key(|x| (x.user_id, x.item_id));

        let mut user_pointers = vec![0; num_users + 1];
        let mut item_ids = Vec::with_capacity(data.len());
        let mut values = Vec::with_capacity(data.len());

        for ((user_id, item_id), group) in &data.iter().chunk_by(|x| (x.user_id, x.item_id)) {
            let weight: f64 = group.map(|x| x.weight).sum();
            if weight > 0.0 {
                item_ids.push(item_id);
                values.push(weight);
                user_pointers[user_id + 1] += 1;
            }
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        Ok(InteractionMatrix {
            num_users,
            num_items,
            user_pointers,
            item_ids,
            values,
        })
    }

    /// Build from rows that are already sorted, deduplicated and positive.
    pub(crate) fn from_sorted_rows(num_items: usize, rows: Vec<Vec<(ItemId, f64)>>) -> Self {
        let mut user_pointers = Vec::with_capacity(rows.len() + 1);
        let nnz = rows.iter().map(|row| row.len()).sum();
        let mut item_ids = Vec::with_capacity(nnz);
        let mut values = Vec::with_capacity(nnz);

        user_pointers.push(0);
        for row in &rows {
            for &(item_id, value) in row {
                item_ids.push(item_id);
                values.push(value);
            }
            user_pointers.push(item_ids.len());
        }

        InteractionMatrix {
            num_users: rows.len(),
            num_items,
            user_pointers,
            item_ids,
            values,
        }
    }

    /// All stored entries, row-major.
    pub fn triplets(&self) -> impl Iterator<Item = Interaction> + '_ {
        self.iter_users().flat_map(|user| {
            let user_id = user.user_id;
            user.entries()
                .map(move |(item_id, weight)| Interaction::new(user_id, item_id, weight))
        })
    }

    /// Iterate over rows.
    pub fn iter_users(&self) -> UserRowIterator<'_> {
        UserRowIterator {
            interactions: self,
            idx: 0,
        }
    }

    /// A single row, or `None` past the last row.
    pub fn get_user(&self, user_id: UserId) -> Option<UserRow<'_>> {
        if user_id >= self.num_users {
            return None;
        }

        Some(self.row_unchecked(user_id))
    }

    /// Item ids of a row; empty past the last row.
    pub fn row_items(&self, user_id: UserId) -> &[ItemId] {
        self.get_user(user_id).map(|row| row.item_ids).unwrap_or(&[])
    }

    fn row_unchecked(&self, user_id: UserId) -> UserRow<'_> {
        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        UserRow {
            user_id,
            item_ids: &self.item_ids[start..stop],
            values: &self.values[start..stop],
        }
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.item_ids.len()
    }

    /// Number of rows.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of columns.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(rows, columns)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }

    /// Stack `other` below `self`.
    pub fn vstack(&self, other: &InteractionMatrix) -> Result<Self, DataError> {
        if self.num_items != other.num_items {
            return Err(DataError::ShapeMismatch {
                expected: format!("{} columns", self.num_items),
                actual: format!("{} columns", other.num_items),
            });
        }

        Ok(stack_rows(self.num_items, &[self, other]))
    }

    /// Elementwise sum of two matrices of the same shape.
    pub fn add(&self, other: &InteractionMatrix) -> Result<Self, DataError> {
        self.check_same_shape(other)?;

        Ok(self.merge(other))
    }

    fn merge(&self, other: &InteractionMatrix) -> Self {
        let rows = izip!(self.iter_users(), other.iter_users())
            .map(|(left, right)| {
                left.entries()
                    .merge_join_by(right.entries(), |x, y| x.0.cmp(&y.0))
                    .map(|either| match either {
                        EitherOrBoth::Both(x, y) => (x.0, x.1 + y.1),
                        EitherOrBoth::Left(x) | EitherOrBoth::Right(x) => x,
                    })
                    .collect()
            })
            .collect();

        InteractionMatrix::from_sorted_rows(self.num_items, rows)
    }

    /// Whether the two matrices share no nonzero cell.
    pub fn is_disjoint(&self, other: &InteractionMatrix) -> bool {
        izip!(self.iter_users(), other.iter_users()).all(|(left, right)| {
            !left
                .item_ids
                .iter()
                .merge_join_by(right.item_ids.iter(), |x, y| x.cmp(y))
                .any(|either| either.is_both())
        })
    }

    /// A new matrix holding rows `users`.
    pub fn slice_rows(&self, users: Range<UserId>) -> Result<Self, DataError> {
        if users.start > users.end || users.end > self.num_users {
            return Err(DataError::ShapeMismatch {
                expected: format!("rows within 0..{}", self.num_users),
                actual: format!("rows {}..{}", users.start, users.end),
            });
        }

        let start = self.user_pointers[users.start];
        let stop = self.user_pointers[users.end];

        Ok(InteractionMatrix {
            num_users: users.len(),
            num_items: self.num_items,
            user_pointers: self.user_pointers[users.start..=users.end]
                .iter()
                .map(|pointer| pointer - start)
                .collect(),
            item_ids: self.item_ids[start..stop].to_vec(),
            values: self.values[start..stop].to_vec(),
        })
    }

    /// Set `scores[r, i]` to negative infinity for every stored cell
    /// `(first_user + r, i)`. Rows beyond the matrix are left alone.
    pub fn mask_scores(&self, scores: &mut ScoreMatrix, first_user: UserId) {
        let num_cols = scores.ncols();
        for (row_idx, mut row) in scores.outer_iter_mut().enumerate() {
            for &item_id in self.row_items(first_user + row_idx) {
                if item_id < num_cols {
                    row[item_id] = f64::NEG_INFINITY;
                }
            }
        }
    }

    fn check_same_shape(&self, other: &InteractionMatrix) -> Result<(), DataError> {
        if self.shape() != other.shape() {
            return Err(DataError::ShapeMismatch {
                expected: format!("{:?}", self.shape()),
                actual: format!("{:?}", other.shape()),
            });
        }
        Ok(())
    }
}

fn stack_rows(num_items: usize, parts: &[&InteractionMatrix]) -> InteractionMatrix {
    let mut user_pointers = vec![0];
    let mut item_ids = Vec::new();
    let mut values = Vec::new();

    for part in parts {
        let base = item_ids.len();
        user_pointers.extend(part.user_pointers[1..].iter().map(|pointer| pointer + base));
        item_ids.extend_from_slice(&part.item_ids);
        values.extend_from_slice(&part.values);
    }

    InteractionMatrix {
        num_users: parts.iter().map(|part| part.num_users).sum(),
        num_items,
        user_pointers,
        item_ids,
        values,
    }
}

/// Iterator over the rows of an [`InteractionMatrix`].
pub struct UserRowIterator<'a> {
    interactions: &'a InteractionMatrix,
    idx: usize,
}

/// Borrowed view of one matrix row.
#[derive(Clone, Copy, Debug)]
pub struct UserRow<'a> {
    /// Row index.
    pub user_id: UserId,
    /// Ascending item ids.
    pub item_ids: &'a [ItemId],
    /// Weights aligned with `item_ids`.
    pub values: &'a [f64],
}

impl<'a> UserRow<'a> {
    /// `(item_id, weight)` pairs in ascending item order.
    pub fn entries(&self) -> impl Iterator<Item = (ItemId, f64)> + 'a {
        self.item_ids.iter().cloned().zip(self.values.iter().cloned())
    }

    /// Number of stored entries in the row.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether the row has no entries.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

impl<'a> Iterator for UserRowIterator<'a> {
    type Item = UserRow<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = if self.idx >= self.interactions.num_users {
            None
        } else {
            Some(self.interactions.row_unchecked(self.idx))
        };

        self.idx += 1;

        value
    }
}

/// Raw `(user, item)` records with external string ids.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionTable {
    records: Vec<(String, String)>,
}

impl InteractionTable {
    /// An empty table.
    pub fn new() -> Self {
        InteractionTable::default()
    }

    /// Append a record.
    pub fn push<U: Into<String>, I: Into<String>>(&mut self, user: U, item: I) {
        self.records.push((user.into(), item.into()));
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.records
            .iter()
            .map(|(user, item)| (user.as_str(), item.as_str()))
    }

    /// Read a headed CSV, taking users from `user_col` and items from
    /// `item_col`. Other columns are ignored.
    pub fn from_csv<R: Read>(reader: R, user_col: &str, item_col: &str) -> Result<Self, DataError> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        let find = |name: &str| {
            headers
                .iter()
                .position(|header| header == name)
                .ok_or_else(|| DataError::MissingColumn(name.to_owned()))
        };
        let user_idx = find(user_col)?;
        let item_idx = find(item_col)?;

        let mut table = InteractionTable::new();
        for record in reader.records() {
            let record = record?;
            match (record.get(user_idx), record.get(item_idx)) {
                (Some(user), Some(item)) => table.push(user, item),
                (None, _) => return Err(DataError::MissingColumn(user_col.to_owned())),
                (_, None) => return Err(DataError::MissingColumn(item_col.to_owned())),
            }
        }

        Ok(table)
    }

    /// Read a CSV file from disk.
    pub fn from_path<P: AsRef<Path>>(path: P, user_col: &str, item_col: &str) -> Result<Self, DataError> {
        InteractionTable::from_csv(File::open(path)?, user_col, item_col)
    }
}

impl<U: Into<String>, I: Into<String>> FromIterator<(U, I)> for InteractionTable {
    fn from_iter<T: IntoIterator<Item = (U, I)>>(iter: T) -> Self {
        let mut table = InteractionTable::new();
        for (user, item) in iter {
            table.push(user, item);
        }
        table
    }
}

/// Learning input and held-out truth for one block of users.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserTrainTestInteractionPair {
    user_ids: Vec<String>,
    x_train: InteractionMatrix,
    x_test: InteractionMatrix,
}

impl UserTrainTestInteractionPair {
    /// Pair up `x_train` and `x_test`, which must have equal shapes,
    /// disjoint supports and one row per entry of `user_ids`.
    pub fn new(
        user_ids: Vec<String>,
        x_train: InteractionMatrix,
        x_test: InteractionMatrix,
    ) -> Result<Self, DataError> {
        x_train.check_same_shape(&x_test)?;
        if user_ids.len() != x_train.num_users() {
            return Err(DataError::ShapeMismatch {
                expected: format!("{} user ids", x_train.num_users()),
                actual: format!("{} user ids", user_ids.len()),
            });
        }
        if !x_train.is_disjoint(&x_test) {
            return Err(DataError::OverlappingSupport);
        }

        Ok(UserTrainTestInteractionPair::from_parts(user_ids, x_train, x_test))
    }

    pub(crate) fn from_parts(
        user_ids: Vec<String>,
        x_train: InteractionMatrix,
        x_test: InteractionMatrix,
    ) -> Self {
        UserTrainTestInteractionPair {
            user_ids,
            x_train,
            x_test,
        }
    }

    /// Number of users in the block.
    pub fn n_users(&self) -> usize {
        self.x_train.num_users()
    }

    /// Number of items.
    pub fn n_items(&self) -> usize {
        self.x_train.num_items()
    }

    /// External ids of the rows.
    pub fn user_ids(&self) -> &[String] {
        &self.user_ids
    }

    /// Learning input.
    pub fn x_train(&self) -> &InteractionMatrix {
        &self.x_train
    }

    /// Held-out truth.
    pub fn x_test(&self) -> &InteractionMatrix {
        &self.x_test
    }

    /// `x_train + x_test`.
    pub fn x_all(&self) -> InteractionMatrix {
        self.x_train.merge(&self.x_test)
    }

    /// Stack `other`'s users below this pair's users.
    pub fn concat(&self, other: &UserTrainTestInteractionPair) -> Result<Self, DataError> {
        let x_train = self.x_train.vstack(&other.x_train)?;
        let x_test = self.x_test.vstack(&other.x_test)?;
        let user_ids = self
            .user_ids
            .iter()
            .chain(other.user_ids.iter())
            .cloned()
            .collect();

        Ok(UserTrainTestInteractionPair::from_parts(user_ids, x_train, x_test))
    }
}

/// Names of the user blocks, in concatenation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Block {
    /// Users whose data is only ever learned from.
    Train,
    /// Users held out for hyperparameter selection.
    Val,
    /// Users held out for the final estimate.
    Test,
}

impl Block {
    /// All blocks in concatenation order.
    pub const ALL: [Block; 3] = [Block::Train, Block::Val, Block::Test];

    /// Lowercase block name.
    pub fn name(&self) -> &'static str {
        match self {
            Block::Train => "train",
            Block::Val => "val",
            Block::Test => "test",
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A user-partitioned dataset sharing one item index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    train: UserTrainTestInteractionPair,
    val: UserTrainTestInteractionPair,
    test: UserTrainTestInteractionPair,
    item_ids: Vec<String>,
}

impl Dataset {
    /// Assemble a dataset. Every block must have one column per item id.
    pub fn new(
        train: UserTrainTestInteractionPair,
        val: UserTrainTestInteractionPair,
        test: UserTrainTestInteractionPair,
        item_ids: Vec<String>,
    ) -> Result<Self, DataError> {
        for pair in &[&train, &val, &test] {
            if pair.n_items() != item_ids.len() {
                return Err(DataError::ShapeMismatch {
                    expected: format!("{} columns", item_ids.len()),
                    actual: format!("{} columns", pair.n_items()),
                });
            }
        }

        Ok(Dataset::from_parts(train, val, test, item_ids))
    }

    pub(crate) fn from_parts(
        train: UserTrainTestInteractionPair,
        val: UserTrainTestInteractionPair,
        test: UserTrainTestInteractionPair,
        item_ids: Vec<String>,
    ) -> Self {
        Dataset {
            train,
            val,
            test,
            item_ids,
        }
    }

    /// The pair for `block`.
    pub fn block(&self, block: Block) -> &UserTrainTestInteractionPair {
        match block {
            Block::Train => &self.train,
            Block::Val => &self.val,
            Block::Test => &self.test,
        }
    }

    /// Training users.
    pub fn train(&self) -> &UserTrainTestInteractionPair {
        &self.train
    }

    /// Validation users.
    pub fn val(&self) -> &UserTrainTestInteractionPair {
        &self.val
    }

    /// Test users.
    pub fn test(&self) -> &UserTrainTestInteractionPair {
        &self.test
    }

    /// External item ids, indexed by column.
    pub fn item_ids(&self) -> &[String] {
        &self.item_ids
    }

    /// Number of items.
    pub fn n_items(&self) -> usize {
        self.item_ids.len()
    }

    /// Row where `block` starts in the joint training matrix.
    pub fn offset(&self, block: Block) -> usize {
        Block::ALL
            .iter()
            .take_while(|other| **other != block)
            .map(|other| self.block(*other).n_users())
            .sum()
    }

    /// Joint matrix to train on before evaluating `block`: earlier blocks
    /// contribute everything, `block` contributes its learning input.
    pub fn training_matrix(&self, block: Block) -> InteractionMatrix {
        let earlier: Vec<InteractionMatrix> = Block::ALL
            .iter()
            .take_while(|other| **other != block)
            .map(|other| self.block(*other).x_all())
            .collect();

        let mut parts: Vec<&InteractionMatrix> = earlier.iter().collect();
        parts.push(self.block(block).x_train());

        stack_rows(self.n_items(), &parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(num_users: usize, num_items: usize, cells: &[(usize, usize, f64)]) -> InteractionMatrix {
        InteractionMatrix::from_triplets(
            num_users,
            num_items,
            cells.iter().map(|&(u, i, w)| Interaction::new(u, i, w)),
        )
        .unwrap()
    }

    #[test]
    fn triplets_are_sorted_and_summed() {
        let x = matrix(
            3,
            4,
            &[(2, 1, 1.0), (0, 3, 1.0), (0, 1, 2.0), (0, 3, 0.5), (1, 0, 0.0)],
        );

        assert_eq!(x.nnz(), 3);
        assert_eq!(x.row_items(0), &[1, 3]);
        assert_eq!(x.get_user(0).unwrap().values, &[2.0, 1.5]);
        assert!(x.get_user(1).unwrap().is_empty());
        assert_eq!(x.row_items(2), &[1]);
        assert!(x.get_user(3).is_none());
    }

    #[test]
    fn invalid_triplets_are_rejected() {
        let out_of_bounds =
            InteractionMatrix::from_triplets(2, 2, vec![Interaction::new(2, 0, 1.0)]);
        assert!(matches!(out_of_bounds, Err(DataError::OutOfBounds { .. })));

        let negative = InteractionMatrix::from_triplets(2, 2, vec![Interaction::new(0, 0, -1.0)]);
        assert!(matches!(negative, Err(DataError::InvalidValue { .. })));

        let nan = InteractionMatrix::from_triplets(2, 2, vec![Interaction::new(0, 0, f64::NAN)]);
        assert!(matches!(nan, Err(DataError::InvalidValue { .. })));
    }

    #[test]
    fn vstack_and_slice() {
        let top = matrix(2, 3, &[(0, 0, 1.0), (1, 2, 1.0)]);
        let bottom = matrix(1, 3, &[(0, 1, 1.0)]);
        let stacked = top.vstack(&bottom).unwrap();

        assert_eq!(stacked.shape(), (3, 3));
        assert_eq!(stacked.row_items(2), &[1]);
        assert_eq!(stacked.slice_rows(0..2).unwrap(), top);
        assert_eq!(stacked.slice_rows(2..3).unwrap(), bottom);
        assert!(stacked.slice_rows(2..4).is_err());

        let wrong = InteractionMatrix::zeros(1, 4);
        assert!(matches!(
            top.vstack(&wrong),
            Err(DataError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn add_and_disjointness() {
        let a = matrix(2, 3, &[(0, 0, 1.0), (1, 2, 1.0)]);
        let b = matrix(2, 3, &[(0, 1, 1.0), (1, 2, 2.0)]);
        let sum = a.add(&b).unwrap();

        assert_eq!(sum.row_items(0), &[0, 1]);
        assert_eq!(sum.get_user(1).unwrap().values, &[3.0]);
        assert!(!a.is_disjoint(&b));
        assert!(a.is_disjoint(&matrix(2, 3, &[(0, 2, 1.0)])));
        assert!(a.add(&InteractionMatrix::zeros(3, 3)).is_err());
    }

    #[test]
    fn masking_uses_row_offset() {
        let x = matrix(3, 3, &[(1, 0, 1.0), (2, 2, 1.0)]);
        let mut scores = ScoreMatrix::zeros((2, 3));
        x.mask_scores(&mut scores, 1);

        assert_eq!(scores[[0, 0]], f64::NEG_INFINITY);
        assert_eq!(scores[[1, 2]], f64::NEG_INFINITY);
        assert_eq!(scores[[0, 1]], 0.0);
    }

    #[test]
    fn table_from_csv() {
        let csv = "rating,user,item\n5,alice,x\n3,bob,y\n1,alice,y\n";
        let table = InteractionTable::from_csv(csv.as_bytes(), "user", "item").unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.iter().collect::<Vec<_>>(),
            vec![("alice", "x"), ("bob", "y"), ("alice", "y")]
        );

        let missing = InteractionTable::from_csv(csv.as_bytes(), "user_id", "item");
        assert!(matches!(missing, Err(DataError::MissingColumn(ref col)) if col == "user_id"));
    }

    #[test]
    fn pair_concat_preserves_inputs() {
        let a = UserTrainTestInteractionPair::new(
            vec!["a".to_owned()],
            matrix(1, 2, &[(0, 0, 1.0)]),
            matrix(1, 2, &[(0, 1, 1.0)]),
        )
        .unwrap();
        let b = UserTrainTestInteractionPair::new(
            vec!["b".to_owned(), "c".to_owned()],
            matrix(2, 2, &[(1, 1, 1.0)]),
            InteractionMatrix::zeros(2, 2),
        )
        .unwrap();
        let a_before = a.clone();

        let joined = a.concat(&b).unwrap();

        assert_eq!(a, a_before);
        assert_eq!(joined.n_users(), 3);
        assert_eq!(joined.user_ids(), &["a", "b", "c"]);
        assert_eq!(joined.x_train().row_items(2), &[1]);
        assert_eq!(joined.x_test().row_items(0), &[1]);
        assert_eq!(joined.x_all().nnz(), 3);
    }

    #[test]
    fn overlapping_pair_is_rejected() {
        let x = matrix(1, 2, &[(0, 0, 1.0)]);
        let pair = UserTrainTestInteractionPair::new(vec!["a".to_owned()], x.clone(), x);
        assert!(matches!(pair, Err(DataError::OverlappingSupport)));
    }

    #[test]
    fn dataset_offsets_and_training_matrix() {
        let pair = |n: usize, train: &[(usize, usize, f64)], test: &[(usize, usize, f64)]| {
            UserTrainTestInteractionPair::new(
                (0..n).map(|u| u.to_string()).collect(),
                matrix(n, 2, train),
                matrix(n, 2, test),
            )
            .unwrap()
        };
        let dataset = Dataset::new(
            pair(2, &[(0, 0, 1.0), (1, 1, 1.0)], &[]),
            pair(1, &[(0, 0, 1.0)], &[(0, 1, 1.0)]),
            pair(3, &[(2, 1, 1.0)], &[(2, 0, 1.0)]),
            vec!["x".to_owned(), "y".to_owned()],
        )
        .unwrap();

        assert_eq!(dataset.offset(Block::Train), 0);
        assert_eq!(dataset.offset(Block::Val), 2);
        assert_eq!(dataset.offset(Block::Test), 3);

        let for_val = dataset.training_matrix(Block::Val);
        assert_eq!(for_val.shape(), (3, 2));
        assert_eq!(for_val.row_items(2), &[0]);

        let for_test = dataset.training_matrix(Block::Test);
        assert_eq!(for_test.shape(), (6, 2));
        assert_eq!(for_test.row_items(2), &[0, 1]);
        assert_eq!(for_test.row_items(5), &[1]);
    }
}
