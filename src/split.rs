use std::collections::BTreeMap;

use log::info;
use ndarray::{Array2, Array3, ArrayView2, ArrayView4, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    config::BalanceMode,
    data::{Dataset, Emotion, PIXELS},
    error::{FerError, Result},
};

/// A subset of the dataset: images, labels, and the dataset rows they came from.
#[derive(Debug, Clone)]
pub struct Partition {
    pub images: Array3<u8>,
    pub labels: Vec<Emotion>,
    pub rows: Vec<usize>,
}

impl Partition {
    pub fn gather(dataset: &Dataset, rows: Vec<usize>) -> Self {
        Self {
            images: dataset.images.select(Axis(0), &rows),
            labels: rows.iter().map(|&r| dataset.records[r].emotion).collect(),
            rows,
        }
    }

    /// Sub-partition by position within this partition.
    pub fn select(&self, positions: &[usize]) -> Self {
        Self {
            images: self.images.select(Axis(0), positions),
            labels: positions.iter().map(|&p| self.labels[p]).collect(),
            rows: positions.iter().map(|&p| self.rows[p]).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `n × 2304` view for the classical estimators.
    pub fn flat(&self) -> ArrayView2<'_, u8> {
        self.images
            .view()
            .into_shape_with_order((self.len(), PIXELS))
            .expect("partition images are built in standard layout")
    }

    /// `n × 1 × 48 × 48` view for the CNN.
    pub fn channels(&self) -> ArrayView4<'_, u8> {
        self.images.view().insert_axis(Axis(1))
    }

    pub fn label_indices(&self) -> Vec<usize> {
        self.labels.iter().map(|e| e.index()).collect()
    }

    pub fn one_hot(&self, width: usize) -> Array2<f32> {
        let mut out = Array2::zeros((self.len(), width));
        for (i, label) in self.labels.iter().enumerate() {
            out[[i, label.index()]] = 1.0;
        }
        out
    }

    pub fn class_counts(&self) -> BTreeMap<Emotion, usize> {
        let mut counts = BTreeMap::new();
        for &label in &self.labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }
}

/// Row indices of the train and held-out partitions, in dataset order.
pub fn partition_rows(dataset: &Dataset) -> (Vec<usize>, Vec<usize>) {
    (0..dataset.len()).partition(|&i| !dataset.records[i].usage.is_held_out())
}

/// Train/test split by usage tag.
#[derive(Debug, Clone)]
pub struct Split {
    pub train: Partition,
    pub test: Partition,
    /// Distinct labels seen in train.
    pub num_classes: usize,
    /// Columns of the one-hot matrices and outputs of the CNN.
    pub one_hot_width: usize,
}

impl Split {
    pub fn new(dataset: &Dataset) -> Result<Self> {
        let (train_rows, test_rows) = partition_rows(dataset);
        if train_rows.is_empty() {
            return Err(FerError::Empty("no training rows"));
        }
        if test_rows.is_empty() {
            return Err(FerError::Empty("no PrivateTest rows"));
        }

        let train = Partition::gather(dataset, train_rows);
        let test = Partition::gather(dataset, test_rows);

        let num_classes = train.class_counts().len();
        let highest = train
            .labels
            .iter()
            .chain(&test.labels)
            .map(|e| e.index() + 1)
            .max()
            .unwrap_or(0);
        let one_hot_width = num_classes.max(highest);

        info!(
            "Split {} rows into {} train / {} test, {num_classes} classes",
            dataset.len(),
            train.len(),
            test.len()
        );

        Ok(Self {
            train,
            test,
            num_classes,
            one_hot_width,
        })
    }

    pub fn train_one_hot(&self) -> Array2<f32> {
        self.train.one_hot(self.one_hot_width)
    }

    pub fn test_one_hot(&self) -> Array2<f32> {
        self.test.one_hot(self.one_hot_width)
    }

    /// Training partition for the requested balance condition.
    pub fn train_set<'a>(&'a self, balanced: &'a BalancedSplit, mode: BalanceMode) -> &'a Partition {
        match mode {
            BalanceMode::Unbalanced => &self.train,
            BalanceMode::Balanced => &balanced.train,
        }
    }
}

/// Train partition downsampled to the size of its smallest class.
#[derive(Debug, Clone)]
pub struct BalancedSplit {
    pub train: Partition,
    pub per_class: usize,
}

impl BalancedSplit {
    /// Every class present in `train` keeps exactly `m` rows, where `m` is the
    /// smallest class count. Each class is sampled without replacement from a
    /// fresh generator seeded with `seed`, classes in label order.
    pub fn new(train: &Partition, seed: u64) -> Result<Self> {
        let mut groups: BTreeMap<Emotion, Vec<usize>> = BTreeMap::new();
        for (pos, &label) in train.labels.iter().enumerate() {
            groups.entry(label).or_default().push(pos);
        }

        let per_class = groups
            .values()
            .map(Vec::len)
            .min()
            .ok_or(FerError::Empty("cannot balance an empty partition"))?;

        let mut picked = Vec::with_capacity(per_class * groups.len());
        for group in groups.values() {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            picked.extend(
                rand::seq::index::sample(&mut rng, group.len(), per_class)
                    .into_iter()
                    .map(|i| group[i]),
            );
        }

        info!(
            "Balanced {} train rows to {per_class} per class ({} total)",
            train.len(),
            picked.len()
        );

        Ok(Self {
            train: train.select(&picked),
            per_class,
        })
    }

    pub fn one_hot(&self, width: usize) -> Array2<f32> {
        self.train.one_hot(width)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::data::fixtures;

    #[test]
    fn partitions_cover_dataset_without_overlap() {
        let ds = fixtures::dataset([3, 1, 4, 1, 5, 9, 2], [1, 0, 2, 0, 1, 0, 3]);
        let (train, test) = partition_rows(&ds);

        let train_set: HashSet<_> = train.iter().copied().collect();
        let test_set: HashSet<_> = test.iter().copied().collect();
        assert!(train_set.is_disjoint(&test_set));
        assert_eq!(train_set.len() + test_set.len(), ds.len());
        for &r in &test {
            assert!(ds.records[r].usage.is_held_out());
        }
        for &r in &train {
            assert!(!ds.records[r].usage.is_held_out());
        }
    }

    #[test]
    fn ten_per_class_with_one_held_out() {
        let ds = fixtures::dataset([9; Emotion::COUNT], [1; Emotion::COUNT]);
        assert_eq!(ds.len(), 70);

        let split = Split::new(&ds).unwrap();
        assert_eq!(split.test.len(), 7);
        assert_eq!(split.train.len(), 63);
        assert_eq!(split.num_classes, 7);
        assert_eq!(split.one_hot_width, 7);

        let balanced = BalancedSplit::new(&split.train, 99).unwrap();
        assert_eq!(balanced.per_class, 9);
        assert_eq!(balanced.train.len(), 63);
    }

    #[test]
    fn skewed_train_balances_to_minority() {
        let ds = fixtures::dataset([5, 2, 7, 12, 3, 4, 6], [1; Emotion::COUNT]);
        let split = Split::new(&ds).unwrap();
        let balanced = BalancedSplit::new(&split.train, 99).unwrap();

        assert_eq!(balanced.per_class, 2);
        assert_eq!(balanced.train.len(), 2 * 7);
        for count in balanced.train.class_counts().values() {
            assert_eq!(*count, 2);
        }
        let unique: HashSet<_> = balanced.train.rows.iter().collect();
        assert_eq!(unique.len(), balanced.train.len());
    }

    #[test]
    fn balancing_only_counts_present_classes() {
        let ds = fixtures::dataset([4, 0, 3, 6, 0, 0, 5], [1, 0, 0, 1, 0, 0, 0]);
        let split = Split::new(&ds).unwrap();
        assert_eq!(split.num_classes, 4);
        assert_eq!(split.one_hot_width, 7);

        let balanced = BalancedSplit::new(&split.train, 99).unwrap();
        assert_eq!(balanced.per_class, 3);
        assert_eq!(balanced.train.len(), 12);
    }

    #[test]
    fn balancing_is_deterministic() {
        let ds = fixtures::dataset([20, 8, 15, 30, 11, 9, 25], [2; Emotion::COUNT]);
        let split = Split::new(&ds).unwrap();
        let a = BalancedSplit::new(&split.train, 99).unwrap();
        let b = BalancedSplit::new(&split.train, 99).unwrap();
        assert_eq!(a.train.rows, b.train.rows);
        assert_eq!(a.train.images, b.train.images);
        assert_eq!(a.train.labels, b.train.labels);
    }

    #[test]
    fn views_share_layout() {
        let ds = fixtures::dataset([2; Emotion::COUNT], [1; Emotion::COUNT]);
        let split = Split::new(&ds).unwrap();

        let flat = split.train.flat();
        assert_eq!(flat.shape(), &[14, PIXELS]);
        assert_eq!(split.train.channels().shape(), &[14, 1, 48, 48]);

        let first_row: Vec<u8> = flat.row(0).iter().copied().collect();
        let first_image: Vec<u8> = split.train.images.index_axis(Axis(0), 0).iter().copied().collect();
        assert_eq!(first_row, first_image);
    }

    #[test]
    fn one_hot_matches_labels() {
        let ds = fixtures::dataset([1, 1, 0, 0, 0, 0, 1], [1, 0, 0, 0, 0, 0, 0]);
        let split = Split::new(&ds).unwrap();
        let y = split.train_one_hot();
        assert_eq!(y.shape(), &[3, 7]);
        for (row, label) in y.rows().into_iter().zip(&split.train.labels) {
            assert_eq!(row.sum(), 1.0);
            assert_eq!(row[label.index()], 1.0);
        }
    }

    #[test]
    fn split_requires_both_partitions() {
        let ds = fixtures::dataset([2; Emotion::COUNT], [0; Emotion::COUNT]);
        assert!(matches!(Split::new(&ds), Err(FerError::Empty(_))));
    }
}
