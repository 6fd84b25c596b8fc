mod analysis;
mod batch;
mod classical;
mod config;
mod data;
mod decomposition;
mod error;
mod forest;
mod metrics;
mod model;
mod naive_bayes;
mod report;
mod split;
mod trainer;

use anyhow::{Context, Result};
use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use env_logger::Env;
use log::{debug, info};

use crate::{
    analysis::Analyzer,
    classical::{ClassicalModel, ClassicalTrainer},
    batch::FaceSource,
    config::{BalanceMode, ClassWeights, LabelEncoding, PipelineConfig},
    data::{Dataset, DatasetPaths, Emotion},
    model::NeuralTrainingConfig,
    report::Reporter,
    split::{BalancedSplit, Split},
    trainer::{NeuralRun, NeuralTrainer},
};

type Backend = Autodiff<NdArray>;

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("=== Facial emotion classification ===");
    let config = PipelineConfig::default();
    config.validate()?;

    let paths = DatasetPaths::from_stem(&config.dataset_stem);
    let dataset = Dataset::load(&paths)
        .with_context(|| format!("loading {}", paths.source_csv.display()))?;
    info!("Loaded {} faces", dataset.len());
    for (emotion, count) in Emotion::ALL.iter().zip(dataset.class_counts()) {
        info!("  {:<8} {count}", emotion.name());
    }

    let mut reporter = Reporter::new(&config.images_dir)
        .with_context(|| format!("creating {}", config.images_dir.display()))?;
    std::fs::create_dir_all(&config.checkpoint_dir)
        .with_context(|| format!("creating {}", config.checkpoint_dir.display()))?;

    let split = Split::new(&dataset)?;
    let balanced = BalancedSplit::new(&split.train, config.seed)?;
    info!(
        "{} classes in train, {} rows per class after balancing",
        split.num_classes, balanced.per_class
    );

    let analyzer = Analyzer::new(&dataset, &split.train, config.n_components, config.seed);
    analyzer.example_images(&reporter)?;
    analyzer.pca_means(&reporter)?;

    let classical = ClassicalTrainer::new(&split, &balanced, config.n_trees, config.seed);
    classical.run(ClassicalModel::NaiveBayes, BalanceMode::Unbalanced, &mut reporter)?;
    classical.run(ClassicalModel::NaiveBayes, BalanceMode::Balanced, &mut reporter)?;

    analyzer.nmf_means(&reporter)?;
    analyzer.nmf_sweep(&config.nmf_sweep, &reporter)?;

    classical.run(ClassicalModel::RandomForest, BalanceMode::Unbalanced, &mut reporter)?;
    classical.run(ClassicalModel::RandomForest, BalanceMode::Balanced, &mut reporter)?;

    let fixed = ClassWeights::frequency_correction();
    let computed = ClassWeights::inverse_frequency(&split.train.labels)?;
    info!("Unbalanced CNN class weights (inverse frequency for comparison):");
    for emotion in Emotion::ALL {
        info!(
            "  {:<8} ×{:<8} ({:.3})",
            emotion.name(),
            fixed.get(emotion),
            computed.get(emotion)
        );
    }

    let test = FaceSource::test(&split)?;
    let neural = NeuralTrainer::<Backend>::new(
        NeuralTrainingConfig::new().with_seed(config.seed),
        &config.checkpoint_dir,
        split.one_hot_width,
        NdArrayDevice::Cpu,
    )?;
    for (encoding, balance) in [
        (LabelEncoding::Categorical, BalanceMode::Balanced),
        (LabelEncoding::Ordinal, BalanceMode::Balanced),
        (LabelEncoding::Categorical, BalanceMode::Unbalanced),
        (LabelEncoding::Ordinal, BalanceMode::Unbalanced),
    ] {
        let run = NeuralRun::new(encoding, balance);
        let train = FaceSource::train(&split, &balanced, balance)?;
        let outcome = neural
            .run(run, &train, &test, &mut reporter)
            .with_context(|| format!("training {run}"))?;
        info!(
            "{}: {} epochs ({:?}), best epoch {:?}, eval loss {:.4} acc {:.2}%, test accuracy {:.2}% over {} faces",
            outcome.run,
            outcome.epochs_run,
            outcome.stop,
            outcome.best_epoch,
            outcome.eval_loss,
            outcome.eval_accuracy * 100.0,
            outcome.metrics.accuracy * 100.0,
            outcome.predictions.len()
        );
        debug!("{}: phases {:?}", outcome.run, outcome.phases);
    }

    let summary = reporter.write_summary()?;
    info!("=== Done, summary in {} ===", summary.display());
    for entry in reporter.summary() {
        info!(
            "  {:<22} accuracy {:.4}  macro F1 {:.4}",
            entry.name, entry.metrics.accuracy, entry.metrics.f1_score
        );
    }

    Ok(())
}
