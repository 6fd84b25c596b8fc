use log::{debug, info};

use crate::{
    config::BalanceMode,
    error::Result,
    forest::{ForestConfig, RandomForest},
    metrics::ClassificationMetrics,
    naive_bayes::MultinomialNb,
    report::Reporter,
    split::{BalancedSplit, Split},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassicalModel {
    NaiveBayes,
    RandomForest,
}

impl ClassicalModel {
    pub fn stem(self) -> &'static str {
        match self {
            ClassicalModel::NaiveBayes => "MNB",
            ClassicalModel::RandomForest => "random_forest",
        }
    }

    pub fn report_name(self, balance: BalanceMode) -> String {
        format!("{}{}", self.stem(), balance.suffix())
    }
}

/// Fits on flattened pixels and scores the held-out partition.
pub struct ClassicalTrainer<'a> {
    split: &'a Split,
    balanced: &'a BalancedSplit,
    n_trees: usize,
    seed: u64,
}

impl<'a> ClassicalTrainer<'a> {
    pub fn new(split: &'a Split, balanced: &'a BalancedSplit, n_trees: usize, seed: u64) -> Self {
        Self {
            split,
            balanced,
            n_trees,
            seed,
        }
    }

    /// Test-set predictions of `model` trained on the `balance` training set.
    pub fn predict(&self, model: ClassicalModel, balance: BalanceMode) -> Result<Vec<usize>> {
        let train = self.split.train_set(self.balanced, balance);
        let labels = train.label_indices();
        info!(
            "Fitting {} on {} rows",
            model.report_name(balance),
            train.len()
        );

        let test = self.split.test.flat();
        Ok(match model {
            ClassicalModel::NaiveBayes => {
                let nb = MultinomialNb::fit(train.flat(), &labels, 1.0)?;
                debug!("MNB: alpha {}, {} classes", nb.alpha, nb.classes.len());
                nb.predict(test)
            }
            ClassicalModel::RandomForest => {
                let forest =
                    RandomForest::fit(train.flat(), &labels, &ForestConfig::new(self.n_trees, self.seed))?;
                debug!("Random forest: {} trees", forest.n_trees());
                forest.predict(test)
            }
        })
    }

    pub fn run(
        &self,
        model: ClassicalModel,
        balance: BalanceMode,
        reporter: &mut Reporter,
    ) -> Result<ClassificationMetrics> {
        let predictions = self.predict(model, balance)?;
        reporter.confusion_report(
            &model.report_name(balance),
            &self.split.test.label_indices(),
            &predictions,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{fixtures, Emotion};

    #[test]
    fn report_names() {
        assert_eq!(ClassicalModel::NaiveBayes.report_name(BalanceMode::Unbalanced), "MNB");
        assert_eq!(
            ClassicalModel::RandomForest.report_name(BalanceMode::Balanced),
            "random_forest_bal"
        );
    }

    #[test]
    fn both_models_separate_synthetic_faces() {
        let dir = fixtures::temp_dir("classical");
        let mut counts = [6; Emotion::COUNT];
        counts[Emotion::Happy.index()] = 12;
        let ds = fixtures::dataset(counts, [2; Emotion::COUNT]);
        let split = Split::new(&ds).unwrap();
        let balanced = BalancedSplit::new(&split.train, 99).unwrap();
        let trainer = ClassicalTrainer::new(&split, &balanced, 10, 99);
        let mut reporter = Reporter::new(&dir).unwrap();

        for model in [ClassicalModel::NaiveBayes, ClassicalModel::RandomForest] {
            for balance in [BalanceMode::Unbalanced, BalanceMode::Balanced] {
                let metrics = trainer.run(model, balance, &mut reporter).unwrap();
                assert_eq!(metrics.accuracy, 1.0, "{}", model.report_name(balance));
                assert!(reporter
                    .path(&format!("{}.png", model.report_name(balance)))
                    .is_file());
            }
        }
        assert_eq!(reporter.summary().len(), 4);
    }
}
