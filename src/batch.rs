use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::{Int, Shape, TensorData},
};
use ndarray::{Array2, ArrayView4, Axis};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    config::BalanceMode,
    data::{PIXELS, SIDE},
    error::{FerError, Result},
    split::{BalancedSplit, Partition, Split},
};

/// Maps an 8-bit intensity into `[-1, 1]`.
pub fn preprocess_input(value: u8) -> f32 {
    f32::from(value) / 127.5 - 1.0
}

/// One position drawn by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    pub index: usize,
    pub flip: bool,
}

/// Endless batch source over `0..len`: every pass visits each index once in
/// a freshly shuffled order, and the last batch of a pass may be short.
#[derive(Debug, Clone)]
pub struct FaceGenerator {
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    horizontal_flip: bool,
    rng: ChaCha8Rng,
}

impl FaceGenerator {
    pub fn new(len: usize, batch_size: usize, seed: u64, horizontal_flip: bool) -> Result<Self> {
        if len == 0 {
            return Err(FerError::Empty("generator over an empty partition"));
        }
        if batch_size == 0 {
            return Err(FerError::InvalidConfig("batch_size must be positive".into()));
        }
        Ok(Self {
            order: (0..len).collect(),
            cursor: 0,
            batch_size,
            horizontal_flip,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Batches in one pass, counting the short final one.
    pub fn batches_per_pass(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    pub fn next_batch(&mut self) -> Vec<Draw> {
        if self.cursor == 0 {
            self.order.shuffle(&mut self.rng);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = if end == self.order.len() { 0 } else { end };

        indices
            .into_iter()
            .map(|index| Draw {
                index,
                flip: self.horizontal_flip && self.rng.random_bool(0.5),
            })
            .collect()
    }
}

/// Consecutive `[start, end)` ranges covering `0..len` in order.
pub fn sequential_batches(len: usize, batch_size: usize) -> impl Iterator<Item = (usize, usize)> {
    let step = batch_size.max(1);
    (0..len).step_by(step).map(move |start| (start, (start + step).min(len)))
}

#[derive(Debug, Clone)]
pub struct FaceItem {
    pub pixels: Vec<u8>,
    pub label: usize,
    pub one_hot: Vec<f32>,
}

/// CNN view of a partition: `n × 1 × 48 × 48` images paired with their
/// one-hot target rows.
#[derive(Debug, Clone)]
pub struct FaceSource<'a> {
    partition: &'a Partition,
    images: ArrayView4<'a, u8>,
    one_hot: Array2<f32>,
}

impl<'a> FaceSource<'a> {
    pub fn new(partition: &'a Partition, one_hot: Array2<f32>) -> Result<Self> {
        if one_hot.nrows() != partition.len() {
            return Err(FerError::InvalidConfig(format!(
                "{} one-hot rows for {} images",
                one_hot.nrows(),
                partition.len()
            )));
        }
        Ok(Self {
            partition,
            images: partition.channels(),
            one_hot,
        })
    }

    /// Training rows for `mode`, encoded to the split's one-hot width.
    pub fn train(split: &'a Split, balanced: &'a BalancedSplit, mode: BalanceMode) -> Result<Self> {
        let one_hot = match mode {
            BalanceMode::Unbalanced => split.train_one_hot(),
            BalanceMode::Balanced => balanced.one_hot(split.one_hot_width),
        };
        Self::new(split.train_set(balanced, mode), one_hot)
    }

    pub fn test(split: &'a Split) -> Result<Self> {
        Self::new(&split.test, split.test_one_hot())
    }

    pub fn len(&self) -> usize {
        self.partition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partition.is_empty()
    }

    /// Columns of the one-hot targets.
    pub fn width(&self) -> usize {
        self.one_hot.ncols()
    }

    pub fn label_indices(&self) -> Vec<usize> {
        self.partition.label_indices()
    }

    pub fn item(&self, draw: Draw) -> FaceItem {
        let image = self
            .images
            .index_axis_move(Axis(0), draw.index)
            .index_axis_move(Axis(0), 0);
        let pixels = if draw.flip {
            image
                .rows()
                .into_iter()
                .flat_map(|row| row.into_iter().rev().copied().collect::<Vec<_>>())
                .collect()
        } else {
            image.iter().copied().collect()
        };
        FaceItem {
            pixels,
            label: self.partition.labels[draw.index].index(),
            one_hot: self.one_hot.row(draw.index).to_vec(),
        }
    }

    pub fn items(&self, draws: &[Draw]) -> Vec<FaceItem> {
        draws.iter().map(|&draw| self.item(draw)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct FaceBatch<B: Backend> {
    /// `[batch, 1, 48, 48]`, preprocessed.
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    /// `[batch, num_classes]`.
    pub one_hot: Tensor<B, 2>,
}

#[derive(Debug, Clone)]
pub struct FaceBatcher {
    num_classes: usize,
}

impl FaceBatcher {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl<B: Backend> Batcher<B, FaceItem, FaceBatch<B>> for FaceBatcher {
    fn batch(&self, items: Vec<FaceItem>, device: &B::Device) -> FaceBatch<B> {
        let batch_size = items.len();
        let mut images = Vec::with_capacity(batch_size * PIXELS);
        let mut targets = Vec::with_capacity(batch_size);
        let mut one_hot = Vec::with_capacity(batch_size * self.num_classes);

        for item in &items {
            images.extend(item.pixels.iter().map(|&v| preprocess_input(v)));
            targets.push(item.label as i64);
            one_hot.extend(
                (0..self.num_classes).map(|c| item.one_hot.get(c).copied().unwrap_or(0.0)),
            );
        }

        FaceBatch {
            images: Tensor::from_data(
                TensorData::new(images, Shape::new([batch_size, 1, SIDE, SIDE])),
                device,
            ),
            targets: Tensor::from_data(TensorData::new(targets, Shape::new([batch_size])), device),
            one_hot: Tensor::from_data(
                TensorData::new(one_hot, Shape::new([batch_size, self.num_classes])),
                device,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use burn::backend::NdArray;

    use super::*;
    use crate::data::{fixtures, Emotion};

    fn balance_of(split: &Split) -> BalancedSplit {
        BalancedSplit::new(&split.train, 99).unwrap()
    }

    #[test]
    fn preprocessing_spans_unit_interval() {
        assert_eq!(preprocess_input(0), -1.0);
        assert_eq!(preprocess_input(255), 1.0);
        assert!(preprocess_input(128).abs() < 0.01);
    }

    #[test]
    fn each_pass_covers_every_index_once() {
        let mut generator = FaceGenerator::new(10, 4, 99, false).unwrap();
        assert_eq!(generator.batches_per_pass(), 3);
        for _ in 0..2 {
            let sizes: Vec<usize> = (0..3).map(|_| generator.next_batch().len()).collect();
            assert_eq!(sizes, vec![4, 4, 2]);
        }

        let mut generator = FaceGenerator::new(10, 4, 99, false).unwrap();
        let seen: Vec<usize> = (0..3)
            .flat_map(|_| generator.next_batch())
            .map(|d| d.index)
            .collect();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 10);
        assert!(seen.iter().all(|&i| i < 10));
    }

    #[test]
    fn shuffle_depends_only_on_seed() {
        let mut a = FaceGenerator::new(50, 50, 7, true).unwrap();
        let mut b = FaceGenerator::new(50, 50, 7, true).unwrap();
        assert_eq!(a.next_batch(), b.next_batch());
        assert_eq!(a.next_batch(), b.next_batch());
    }

    #[test]
    fn rejects_degenerate_generators() {
        assert!(FaceGenerator::new(0, 4, 0, false).is_err());
        assert!(FaceGenerator::new(4, 0, 0, false).is_err());
    }

    #[test]
    fn sequential_batches_cover_range() {
        let ranges: Vec<_> = sequential_batches(5, 2).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 4), (4, 5)]);
        assert_eq!(sequential_batches(0, 3).count(), 0);
    }

    #[test]
    fn flip_mirrors_rows() {
        let split = Split::new(&fixtures::dataset([2; Emotion::COUNT], [1; Emotion::COUNT])).unwrap();
        let source = FaceSource::test(&split).unwrap();
        let plain = source.item(Draw { index: 0, flip: false });
        let flipped = source.item(Draw { index: 0, flip: true });
        assert_eq!(plain.label, flipped.label);
        assert_eq!(plain.one_hot, flipped.one_hot);
        for row in 0..SIDE {
            for col in 0..SIDE {
                assert_eq!(
                    plain.pixels[row * SIDE + col],
                    flipped.pixels[row * SIDE + SIDE - 1 - col]
                );
            }
        }
    }

    #[test]
    fn batcher_builds_tensors() {
        let split = Split::new(&fixtures::dataset([3; Emotion::COUNT], [1; Emotion::COUNT])).unwrap();
        let draws: Vec<Draw> = (0..5).map(|index| Draw { index, flip: false }).collect();
        let items = FaceSource::train(&split, &balance_of(&split), BalanceMode::Unbalanced)
            .unwrap()
            .items(&draws);
        let labels: Vec<usize> = items.iter().map(|i| i.label).collect();

        let device = Default::default();
        let batch: FaceBatch<NdArray> = FaceBatcher::new(7).batch(items, &device);
        assert_eq!(batch.images.dims(), [5, 1, SIDE, SIDE]);
        assert_eq!(batch.one_hot.dims(), [5, 7]);

        let targets: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(targets, labels.iter().map(|&l| l as i64).collect::<Vec<_>>());

        let row_sums: Vec<f32> = batch.one_hot.sum_dim(1).into_data().to_vec().unwrap();
        assert!(row_sums.iter().all(|&s| (s - 1.0).abs() < 1e-6));

        let max: f32 = batch.images.max().into_scalar();
        assert!(max <= 1.0);
    }

    #[test]
    fn items_follow_partition_views() {
        let mut counts = [3; Emotion::COUNT];
        counts[Emotion::Happy.index()] = 6;
        let split = Split::new(&fixtures::dataset(counts, [1; Emotion::COUNT])).unwrap();
        let balanced = balance_of(&split);

        let source = FaceSource::train(&split, &balanced, BalanceMode::Balanced).unwrap();
        assert_eq!(source.len(), balanced.train.len());
        assert_eq!(source.width(), split.one_hot_width);
        assert_eq!(source.label_indices(), balanced.train.label_indices());

        let one_hot = balanced.one_hot(split.one_hot_width);
        for index in [0, source.len() - 1] {
            let item = source.item(Draw { index, flip: false });
            let expected: Vec<u8> = balanced
                .train
                .channels()
                .index_axis(Axis(0), index)
                .iter()
                .copied()
                .collect();
            assert_eq!(item.pixels, expected);
            assert_eq!(item.one_hot, one_hot.row(index).to_vec());
            assert_eq!(item.one_hot[item.label], 1.0);
        }
    }

    #[test]
    fn source_rejects_mismatched_targets() {
        let split = Split::new(&fixtures::dataset([2; Emotion::COUNT], [1; Emotion::COUNT])).unwrap();
        let err = FaceSource::new(&split.test, split.train_one_hot()).unwrap_err();
        assert!(matches!(err, FerError::InvalidConfig(_)));
    }
}
