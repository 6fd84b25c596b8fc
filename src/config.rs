use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    data::Emotion,
    error::{FerError, Result},
};

pub const DATASET_STEM: &str = "stims/fer2013/fer2013";
pub const IMAGES_DIR: &str = "images";
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Seed shared by balancing, forest construction and generator shuffling.
pub const SEED: u64 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceMode {
    Unbalanced,
    Balanced,
}

impl BalanceMode {
    pub fn suffix(self) -> &'static str {
        match self {
            BalanceMode::Unbalanced => "",
            BalanceMode::Balanced => "_bal",
        }
    }
}

/// How CNN targets are fed to the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelEncoding {
    /// One-hot rows.
    Categorical,
    /// Integer class indices.
    Ordinal,
}

impl LabelEncoding {
    pub fn report_stem(self) -> &'static str {
        match self {
            LabelEncoding::Categorical => "Categorical_CNN",
            LabelEncoding::Ordinal => "Continuous_CNN",
        }
    }

    pub fn checkpoint_stem(self) -> &'static str {
        match self {
            LabelEncoding::Categorical => "bestmodel_cat",
            LabelEncoding::Ordinal => "bestmodel_cont",
        }
    }
}

/// Metric that decides which epoch gets checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Monitor {
    TrainingAccuracy,
    ValidationAccuracy,
}

/// Per-class loss multipliers, one per emotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights([f32; Emotion::COUNT]);

impl ClassWeights {
    pub fn new(weights: [f32; Emotion::COUNT]) -> Result<Self> {
        if let Some((i, w)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w <= 0.0)
        {
            return Err(FerError::InvalidConfig(format!(
                "class weight for {} must be finite and positive, got {w}",
                Emotion::ALL[i].name()
            )));
        }
        Ok(Self(weights))
    }

    pub fn uniform() -> Self {
        Self([1.0; Emotion::COUNT])
    }

    /// Fixed correction for the skew of the unbalanced training set:
    /// Disgust ×999, Happy ×0.01, Neutral ×99.
    pub fn frequency_correction() -> Self {
        let mut w = [1.0; Emotion::COUNT];
        w[Emotion::Disgust.index()] = 999.0;
        w[Emotion::Happy.index()] = 0.01;
        w[Emotion::Neutral.index()] = 99.0;
        Self(w)
    }

    /// `n / (k * count_c)` over the classes present in `labels`; absent classes get 1.
    pub fn inverse_frequency(labels: &[Emotion]) -> Result<Self> {
        let mut counts = [0usize; Emotion::COUNT];
        for label in labels {
            counts[label.index()] += 1;
        }
        let present = counts.iter().filter(|&&c| c > 0).count();
        if present == 0 {
            return Err(FerError::Empty("class weights need at least one label"));
        }
        let n = labels.len() as f32;
        let weights = counts.map(|c| {
            if c == 0 {
                1.0
            } else {
                n / (present as f32 * c as f32)
            }
        });
        Self::new(weights)
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.0[emotion.index()]
    }

    /// Weights for the first `width` output classes.
    pub fn to_vec(&self, width: usize) -> Vec<f32> {
        (0..width)
            .map(|i| self.0.get(i).copied().unwrap_or(1.0))
            .collect()
    }
}

/// Tunables for the non-neural stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dataset_stem: PathBuf,
    pub images_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub seed: u64,
    pub n_components: usize,
    pub nmf_sweep: Vec<usize>,
    pub n_trees: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset_stem: PathBuf::from(DATASET_STEM),
            images_dir: PathBuf::from(IMAGES_DIR),
            checkpoint_dir: PathBuf::from(CHECKPOINT_DIR),
            seed: SEED,
            n_components: 10,
            nmf_sweep: vec![1, 5, 10, 50],
            n_trees: 300,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_components == 0 {
            return Err(FerError::InvalidConfig("n_components must be positive".into()));
        }
        if self.nmf_sweep.iter().any(|&k| k == 0) {
            return Err(FerError::InvalidConfig(
                "NMF sweep counts must be positive".into(),
            ));
        }
        if self.n_trees == 0 {
            return Err(FerError::InvalidConfig("n_trees must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_correction_values() {
        let w = ClassWeights::frequency_correction();
        assert_eq!(w.get(Emotion::Disgust), 999.0);
        assert_eq!(w.get(Emotion::Happy), 0.01);
        assert_eq!(w.get(Emotion::Neutral), 99.0);
        for e in [Emotion::Angry, Emotion::Fear, Emotion::Sad, Emotion::Surprise] {
            assert_eq!(w.get(e), 1.0);
        }
    }

    #[test]
    fn rejects_non_positive_weights() {
        let mut w = [1.0; Emotion::COUNT];
        w[2] = 0.0;
        assert!(matches!(ClassWeights::new(w), Err(FerError::InvalidConfig(_))));
        w[2] = f32::NAN;
        assert!(ClassWeights::new(w).is_err());
    }

    #[test]
    fn inverse_frequency_favours_rare_classes() {
        let labels = [
            Emotion::Happy,
            Emotion::Happy,
            Emotion::Happy,
            Emotion::Disgust,
        ];
        let w = ClassWeights::inverse_frequency(&labels).unwrap();
        assert!((w.get(Emotion::Happy) - 4.0 / 6.0).abs() < 1e-6);
        assert!((w.get(Emotion::Disgust) - 2.0).abs() < 1e-6);
        assert_eq!(w.get(Emotion::Angry), 1.0);
        assert!(ClassWeights::inverse_frequency(&[]).is_err());
    }

    #[test]
    fn to_vec_pads_extra_outputs() {
        let w = ClassWeights::frequency_correction().to_vec(9);
        assert_eq!(w.len(), 9);
        assert_eq!(w[1], 999.0);
        assert_eq!(w[8], 1.0);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
        let bad = PipelineConfig {
            nmf_sweep: vec![1, 0],
            ..PipelineConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
