use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::data::Emotion;

/// Counts of (true, predicted) label pairs over the 7 emotions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    /// Rows are true labels, columns predictions.
    pub counts: Array2<u64>,
}

impl ConfusionMatrix {
    /// Pairs with a label outside the emotion vocabulary are skipped.
    pub fn from_labels(targets: &[usize], predictions: &[usize]) -> Self {
        let mut counts = Array2::zeros((Emotion::COUNT, Emotion::COUNT));
        for (&t, &p) in targets.iter().zip(predictions) {
            if t < Emotion::COUNT && p < Emotion::COUNT {
                counts[[t, p]] += 1;
            }
        }
        Self { counts }
    }

    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    /// Each non-empty row divided by its sum; empty rows stay zero.
    pub fn normalized(&self) -> Array2<f64> {
        let mut out = self.counts.mapv(|c| c as f64);
        for mut row in out.rows_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub per_class_recall: Vec<f64>,
}

impl ClassificationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accuracy plus macro-averaged precision, recall and F1 over classes
    /// that occur in either targets or predictions.
    pub fn calculate(&mut self, matrix: &ConfusionMatrix) {
        let counts = &matrix.counts;
        let total = matrix.total();
        let correct: u64 = counts.diag().sum();
        self.accuracy = if total > 0 {
            correct as f64 / total as f64
        } else {
            0.0
        };

        let mut precisions = Vec::new();
        let mut recalls = Vec::new();
        let mut f1s = Vec::new();
        self.per_class_recall = vec![0.0; Emotion::COUNT];

        for c in 0..Emotion::COUNT {
            let tp = counts[[c, c]] as f64;
            let actual = counts.row(c).sum() as f64;
            let predicted = counts.column(c).sum() as f64;
            if actual == 0.0 && predicted == 0.0 {
                continue;
            }
            let precision = if predicted > 0.0 { tp / predicted } else { 0.0 };
            let recall = if actual > 0.0 { tp / actual } else { 0.0 };
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            self.per_class_recall[c] = recall;
            precisions.push(precision);
            recalls.push(recall);
            f1s.push(f1);
        }

        let mean = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };
        self.precision = mean(&precisions);
        self.recall = mean(&recalls);
        self.f1_score = mean(&f1s);
    }

    pub fn print_summary(&self, name: &str) {
        info!("=== {name} ===");
        info!("Accuracy:  {:.4}", self.accuracy);
        info!("Precision: {:.4} (macro)", self.precision);
        info!("Recall:    {:.4} (macro)", self.recall);
        info!("F1-Score:  {:.4} (macro)", self.f1_score);
        for (emotion, recall) in Emotion::ALL.iter().zip(&self.per_class_recall) {
            info!("  {:<8} recall {:.4}", emotion.name(), recall);
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
    pub checkpointed: bool,
}

#[derive(Debug)]
pub struct MetricsTracker {
    history: VecDeque<TrainingMetrics>,
    max_history: usize,
}

impl MetricsTracker {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_history),
            max_history,
        }
    }

    pub fn add(&mut self, metrics: TrainingMetrics) {
        if self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(metrics);
    }

    pub fn last(&self) -> Option<&TrainingMetrics> {
        self.history.back()
    }

    /// Most recent epoch that wrote a checkpoint.
    pub fn checkpointed_epoch(&self) -> Option<&TrainingMetrics> {
        self.history.iter().rev().find(|m| m.checkpointed)
    }

    pub fn print_history(&self) {
        info!("┌─────────┬────────────┬────────────┬──────────────┬──────────────┬──────┐");
        info!("│ Epoch   │ Train Loss │ Val Loss   │ Train Acc    │ Val Acc      │ Best │");
        info!("├─────────┼────────────┼────────────┼──────────────┼──────────────┼──────┤");
        for m in &self.history {
            info!(
                "│ {:7} │ {:10.4} │ {:10.4} │ {:12.4} │ {:12.4} │ {:>4} │",
                m.epoch,
                m.train_loss,
                m.val_loss,
                m.train_accuracy,
                m.val_accuracy,
                if m.checkpointed { "*" } else { "" }
            );
        }
        info!("└─────────┴────────────┴────────────┴──────────────┴──────────────┴──────┘");

        if let Some(best) = self.checkpointed_epoch() {
            info!(
                "Checkpointed epoch: {} (train acc {:.2}%, val acc {:.2}%)",
                best.epoch,
                best.train_accuracy * 100.0,
                best.val_accuracy * 100.0
            );
        }
    }
}
