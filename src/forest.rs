use log::debug;
use ndarray::{Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    error::{FerError, Result},
    naive_bayes::argmax,
};

#[derive(Debug, Clone)]
pub struct ForestConfig {
    pub n_trees: usize,
    /// Candidate features per split; `None` means `sqrt(n_features)`.
    pub max_features: Option<usize>,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub bootstrap: bool,
    pub seed: u64,
}

impl ForestConfig {
    pub fn new(n_trees: usize, seed: u64) -> Self {
        Self {
            n_trees,
            max_features: None,
            max_depth: None,
            min_samples_split: 2,
            bootstrap: true,
            seed,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        distribution: Vec<f64>,
    },
    Split {
        feature: usize,
        /// Samples with `x <= threshold` go left.
        threshold: u8,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn leaf_for(&self, sample: ndarray::ArrayView1<'_, u8>) -> &[f64] {
        let mut id = 0;
        loop {
            match &self.nodes[id] {
                Node::Leaf { distribution } => return distribution,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    id = if sample[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

/// Gini random forest over 8-bit features.
#[derive(Debug, Clone)]
pub struct RandomForest {
    trees: Vec<Tree>,
    n_classes: usize,
}

struct Grower<'a> {
    x: ArrayView2<'a, u8>,
    y: &'a [usize],
    n_classes: usize,
    max_features: usize,
    max_depth: Option<usize>,
    min_samples_split: usize,
}

impl RandomForest {
    pub fn fit<'a>(x: ArrayView2<'a, u8>, y: &'a [usize], config: &ForestConfig) -> Result<Self> {
        let (n, d) = x.dim();
        if n == 0 {
            return Err(FerError::Empty("random forest needs training samples"));
        }
        if n != y.len() {
            return Err(FerError::InvalidConfig(format!("{n} samples but {} labels", y.len())));
        }
        if config.n_trees == 0 {
            return Err(FerError::InvalidConfig("n_trees must be positive".into()));
        }

        let n_classes = y.iter().copied().max().unwrap_or(0) + 1;
        let max_features = config
            .max_features
            .unwrap_or_else(|| (d as f64).sqrt() as usize)
            .clamp(1, d.max(1));
        let grower = Grower {
            x,
            y,
            n_classes,
            max_features,
            max_depth: config.max_depth,
            min_samples_split: config.min_samples_split.max(2),
        };

        let trees: Vec<Tree> = (0..config.n_trees)
            .into_par_iter()
            .map(|t| {
                let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
                rng.set_stream(t as u64);
                let samples = if config.bootstrap {
                    (0..n).map(|_| rng.random_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                grower.grow(samples, &mut rng)
            })
            .collect();

        debug!(
            "Grew {} trees, {} nodes in total",
            trees.len(),
            trees.iter().map(|t| t.nodes.len()).sum::<usize>()
        );
        Ok(Self { trees, n_classes })
    }

    /// Mean leaf class distribution over all trees, `samples × classes`.
    pub fn predict_proba(&self, x: ArrayView2<'_, u8>) -> Array2<f64> {
        let n = x.nrows();
        let rows: Vec<Vec<f64>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let sample = x.row(i);
                let mut acc = vec![0.0; self.n_classes];
                for tree in &self.trees {
                    for (a, p) in acc.iter_mut().zip(tree.leaf_for(sample)) {
                        *a += p;
                    }
                }
                acc
            })
            .collect();

        let mut out = Array2::zeros((n, self.n_classes));
        let scale = (self.trees.len() as f64).recip();
        for (mut dst, src) in out.axis_iter_mut(Axis(0)).zip(rows) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s * scale;
            }
        }
        out
    }

    pub fn predict(&self, x: ArrayView2<'_, u8>) -> Vec<usize> {
        self.predict_proba(x)
            .axis_iter(Axis(0))
            .map(|row| argmax(row.iter().copied()))
            .collect()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

impl Grower<'_> {
    fn grow(&self, samples: Vec<usize>, rng: &mut ChaCha8Rng) -> Tree {
        let mut nodes: Vec<Node> = Vec::new();
        // (parent, goes left, samples, depth)
        let mut stack = vec![(None::<(usize, bool)>, samples, 0usize)];

        while let Some((parent, samples, depth)) = stack.pop() {
            let id = nodes.len();
            if let Some((p, is_left)) = parent {
                if let Node::Split { left, right, .. } = &mut nodes[p] {
                    if is_left {
                        *left = id;
                    } else {
                        *right = id;
                    }
                }
            }

            let counts = self.class_counts(&samples);
            let pure = counts.iter().filter(|&&c| c > 0).count() <= 1;
            let too_deep = self.max_depth.is_some_and(|m| depth >= m);
            let split = if pure || too_deep || samples.len() < self.min_samples_split {
                None
            } else {
                self.best_split(&samples, rng)
            };

            match split {
                None => {
                    let total = samples.len().max(1) as f64;
                    nodes.push(Node::Leaf {
                        distribution: counts.iter().map(|&c| c as f64 / total).collect(),
                    });
                }
                Some((feature, threshold)) => {
                    nodes.push(Node::Split {
                        feature,
                        threshold,
                        left: 0,
                        right: 0,
                    });
                    let (left, right): (Vec<usize>, Vec<usize>) = samples
                        .into_iter()
                        .partition(|&s| self.x[[s, feature]] <= threshold);
                    stack.push((Some((id, false)), right, depth + 1));
                    stack.push((Some((id, true)), left, depth + 1));
                }
            }
        }

        Tree { nodes }
    }

    fn class_counts(&self, samples: &[usize]) -> Vec<usize> {
        let mut counts = vec![0; self.n_classes];
        for &s in samples {
            counts[self.y[s]] += 1;
        }
        counts
    }

    /// Best Gini split over a random feature subset, or `None` when every
    /// candidate feature is constant on `samples`.
    fn best_split(&self, samples: &[usize], rng: &mut ChaCha8Rng) -> Option<(usize, u8)> {
        let n = samples.len();
        let total = self.class_counts(samples);
        let total_sumsq: f64 = total.iter().map(|&c| (c * c) as f64).sum();

        let mut best: Option<(f64, usize, u8)> = None;
        let mut pairs: Vec<(u8, usize)> = Vec::with_capacity(n);
        let mut left = vec![0usize; self.n_classes];

        for feature in rand::seq::index::sample(rng, self.x.ncols(), self.max_features) {
            pairs.clear();
            pairs.extend(samples.iter().map(|&s| (self.x[[s, feature]], self.y[s])));
            pairs.sort_unstable_by_key(|&(v, _)| v);
            if pairs[0].0 == pairs[n - 1].0 {
                continue;
            }

            left.iter_mut().for_each(|c| *c = 0);
            let mut left_sumsq = 0.0;
            let mut right_sumsq = total_sumsq;

            for i in 0..n - 1 {
                let (value, class) = pairs[i];
                let l = left[class] as f64;
                let r = (total[class] - left[class]) as f64;
                left_sumsq += 2.0 * l + 1.0;
                right_sumsq -= 2.0 * r - 1.0;
                left[class] += 1;

                if value == pairs[i + 1].0 {
                    continue;
                }
                let n_left = (i + 1) as f64;
                let n_right = (n - i - 1) as f64;
                // Maximizing this minimizes the weighted Gini impurity.
                let score = left_sumsq / n_left + right_sumsq / n_right;
                if best.map_or(true, |(b, _, _)| score > b) {
                    best = Some((score, feature, value));
                }
            }
        }

        best.map(|(_, feature, threshold)| (feature, threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{fixtures, Emotion};
    use crate::split::Split;
    use ndarray::array;

    #[test]
    fn fits_separable_faces() {
        let ds = fixtures::dataset([6; Emotion::COUNT], [2; Emotion::COUNT]);
        let split = Split::new(&ds).unwrap();
        let forest = RandomForest::fit(
            split.train.flat(),
            &split.train.label_indices(),
            &ForestConfig::new(15, 99),
        )
        .unwrap();

        assert_eq!(forest.n_trees(), 15);
        assert_eq!(
            forest.predict(split.test.flat()),
            split.test.label_indices()
        );
    }

    #[test]
    fn same_seed_same_forest() {
        let x = array![[0u8, 10], [5, 200], [250, 30], [255, 220], [3, 3], [240, 100]];
        let y = [0, 1, 2, 3, 0, 2];
        let config = ForestConfig::new(8, 4);
        let a = RandomForest::fit(x.view(), &y, &config).unwrap();
        let b = RandomForest::fit(x.view(), &y, &config).unwrap();
        assert_eq!(a.predict_proba(x.view()), b.predict_proba(x.view()));
    }

    #[test]
    fn probabilities_sum_to_one() {
        let x = array![[1u8, 2], [1, 2], [9, 9], [9, 8]];
        let forest = RandomForest::fit(x.view(), &[0, 1, 1, 1], &ForestConfig::new(5, 1)).unwrap();
        for row in forest.predict_proba(x.view()).axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn constant_features_make_a_single_leaf() {
        let x = array![[7u8, 7], [7, 7], [7, 7]];
        let grower = Grower {
            x: x.view(),
            y: &[0, 1, 1],
            n_classes: 2,
            max_features: 2,
            max_depth: None,
            min_samples_split: 2,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let tree = grower.grow(vec![0, 1, 2], &mut rng);
        assert_eq!(tree.nodes.len(), 1);
        match &tree.nodes[0] {
            Node::Leaf { distribution } => {
                assert!((distribution[1] - 2.0 / 3.0).abs() < 1e-12);
            }
            Node::Split { .. } => panic!("constant input must not split"),
        }
    }

    #[test]
    fn rejects_mismatched_labels() {
        let x = array![[1u8], [2]];
        assert!(RandomForest::fit(x.view(), &[0], &ForestConfig::new(1, 0)).is_err());
    }
}
