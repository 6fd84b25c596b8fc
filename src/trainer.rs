use std::{
    fmt,
    path::{Path, PathBuf},
};

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer, RmsPropConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::{activation::log_softmax, backend::AutodiffBackend, ElementConversion},
};
use log::{debug, info};

use crate::{
    batch::{sequential_batches, Draw, FaceBatch, FaceBatcher, FaceGenerator, FaceSource},
    config::{BalanceMode, ClassWeights, LabelEncoding, Monitor},
    error::{FerError, Result},
    metrics::{ClassificationMetrics, MetricsTracker, TrainingMetrics},
    model::{EmotionCnn, EmotionCnnConfig, NeuralTrainingConfig},
    report::Reporter,
};

/// One of the four CNN configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeuralRun {
    pub encoding: LabelEncoding,
    pub balance: BalanceMode,
}

impl NeuralRun {
    pub fn new(encoding: LabelEncoding, balance: BalanceMode) -> Self {
        Self { encoding, balance }
    }

    pub fn report_name(self) -> String {
        format!("{}{}", self.encoding.report_stem(), self.balance.suffix())
    }

    pub fn checkpoint_name(self) -> String {
        match self.balance {
            BalanceMode::Unbalanced => self.encoding.checkpoint_stem().to_string(),
            BalanceMode::Balanced => format!("bal_{}", self.encoding.checkpoint_stem()),
        }
    }

    /// Resampled runs train unweighted; the skewed ones get the fixed correction.
    pub fn class_weights(self) -> ClassWeights {
        match self.balance {
            BalanceMode::Unbalanced => ClassWeights::frequency_correction(),
            BalanceMode::Balanced => ClassWeights::uniform(),
        }
    }
}

impl fmt::Display for NeuralRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.report_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Configured,
    Compiling,
    Fitting,
    Stopped,
    BestModelReloaded,
    Evaluated,
    Reported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Patience,
    EpochBudget,
}

/// Stops once the training loss has failed to improve by more than
/// `min_delta` for `patience` consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta: min_delta.abs(),
            best: None,
            wait: 0,
        }
    }

    /// Records one epoch's loss; `true` means stop now.
    pub fn update(&mut self, loss: f64) -> bool {
        let improved = self.best.map_or(true, |best| loss < best - self.min_delta);
        if improved {
            self.best = Some(loss);
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        self.wait >= self.patience
    }
}

/// Strict-improvement tracker for the checkpointed metric.
#[derive(Debug, Clone, Default)]
pub struct CheckpointMonitor {
    best: Option<f64>,
}

impl CheckpointMonitor {
    pub fn improved(&mut self, value: f64) -> bool {
        if self.best.map_or(true, |best| value > best) {
            self.best = Some(value);
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}

#[derive(Debug)]
pub struct FitOutcome {
    pub tracker: MetricsTracker,
    pub epochs_run: usize,
    pub stop: StopReason,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: NeuralRun,
    pub epochs_run: usize,
    pub stop: StopReason,
    pub best_epoch: Option<usize>,
    pub eval_loss: f64,
    pub eval_accuracy: f64,
    pub predictions: Vec<usize>,
    pub metrics: ClassificationMetrics,
    pub phases: Vec<RunPhase>,
}

/// Class-weighted cross entropy, normalized by the summed sample weights.
fn batch_loss<B: Backend>(
    encoding: LabelEncoding,
    logits: Tensor<B, 2>,
    batch: &FaceBatch<B>,
    weights: &[f32],
) -> Tensor<B, 1> {
    let device = logits.device();
    match encoding {
        LabelEncoding::Categorical => {
            let w = Tensor::<B, 1>::from_data(
                TensorData::new(weights.to_vec(), [weights.len()]),
                &device,
            )
            .unsqueeze::<2>();
            let per_sample = (log_softmax(logits, 1) * batch.one_hot.clone())
                .sum_dim(1)
                .neg();
            let sample_weight = (batch.one_hot.clone() * w).sum_dim(1);
            let total = (per_sample * sample_weight.clone()).sum();
            total / sample_weight.sum()
        }
        LabelEncoding::Ordinal => CrossEntropyLossConfig::new()
            .with_weights(Some(weights.to_vec()))
            .init(&device)
            .forward(logits, batch.targets.clone()),
    }
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = logits.dims();
    logits
        .argmax(1)
        .reshape([batch_size])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

fn predicted_labels<B: Backend>(logits: Tensor<B, 2>) -> Result<Vec<usize>> {
    let [batch_size, _] = logits.dims();
    let data = logits.argmax(1).reshape([batch_size]).into_data();
    let values = data
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| FerError::Tensor(format!("{e:?}")))?;
    Ok(values.into_iter().map(|v| v as usize).collect())
}

pub struct NeuralTrainer<B: AutodiffBackend> {
    pub device: B::Device,
    pub config: NeuralTrainingConfig,
    pub checkpoint_dir: PathBuf,
    pub num_classes: usize,
    batcher: FaceBatcher,
}

impl<B: AutodiffBackend> NeuralTrainer<B> {
    pub fn new(
        config: NeuralTrainingConfig,
        checkpoint_dir: &Path,
        num_classes: usize,
        device: B::Device,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(FerError::InvalidConfig("CNN needs at least one class".into()));
        }
        if config.epochs == 0 {
            return Err(FerError::InvalidConfig("epochs must be positive".into()));
        }
        if config.steps_per_epoch == 0 || config.validation_steps == 0 || config.eval_steps == 0 {
            return Err(FerError::InvalidConfig("step counts must be positive".into()));
        }
        Ok(Self {
            device,
            config,
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            num_classes,
            batcher: FaceBatcher::new(num_classes),
        })
    }

    /// Recorder base path; the file on disk carries an extra `.mpk`.
    pub fn checkpoint_path(&self, run: NeuralRun) -> PathBuf {
        self.checkpoint_dir.join(run.checkpoint_name())
    }

    fn phase(&self, run: NeuralRun, phases: &mut Vec<RunPhase>, phase: RunPhase) {
        info!("[{run}] {phase:?}");
        phases.push(phase);
    }

    /// Configures, fits, reloads the best epoch, evaluates and reports one run.
    pub fn run<'a>(
        &self,
        run: NeuralRun,
        train: &FaceSource<'a>,
        validation: &FaceSource<'a>,
        reporter: &mut Reporter,
    ) -> Result<RunOutcome> {
        for source in [train, validation] {
            if source.is_empty() {
                return Err(FerError::Empty("CNN runs need training and validation rows"));
            }
            if source.width() != self.num_classes {
                return Err(FerError::InvalidConfig(format!(
                    "{}-wide targets for a {}-class CNN",
                    source.width(),
                    self.num_classes
                )));
            }
        }

        let mut phases = Vec::new();
        self.phase(run, &mut phases, RunPhase::Configured);
        info!(
            "[{run}] {} train / {} validation rows, {} classes, weights {:?}",
            train.len(),
            validation.len(),
            self.num_classes,
            run.class_weights().to_vec(self.num_classes)
        );

        let fit = self.fit(run, train, validation, &mut phases)?;
        self.phase(run, &mut phases, RunPhase::Stopped);
        fit.tracker.print_history();
        if let Some(last) = fit.tracker.last() {
            info!(
                "[{run}] final epoch {}: loss {:.4}, val acc {:.2}%",
                last.epoch,
                last.train_loss,
                last.val_accuracy * 100.0
            );
        }

        let mut outcome = self.finish(run, validation, reporter, &mut phases)?;
        outcome.epochs_run = fit.epochs_run;
        outcome.stop = fit.stop;
        outcome.best_epoch = fit.tracker.checkpointed_epoch().map(|m| m.epoch);
        Ok(outcome)
    }

    pub fn fit(
        &self,
        run: NeuralRun,
        train: &FaceSource<'_>,
        validation: &FaceSource<'_>,
        phases: &mut Vec<RunPhase>,
    ) -> Result<FitOutcome> {
        self.phase(run, phases, RunPhase::Compiling);
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        let mut model: EmotionCnn<B> = EmotionCnnConfig::new(self.num_classes).init(&self.device);
        let mut optimizer = RmsPropConfig::new().init();
        let weights = run.class_weights().to_vec(self.num_classes);

        let cfg = &self.config;
        let mut train_gen = FaceGenerator::new(train.len(), cfg.batch_size, cfg.seed, cfg.horizontal_flip)?;
        let mut val_gen = FaceGenerator::new(validation.len(), cfg.batch_size, cfg.seed, false)?;
        debug!(
            "[{run}] {} train batches per pass, {} steps per epoch",
            train_gen.batches_per_pass(),
            cfg.steps_per_epoch
        );

        let mut tracker = MetricsTracker::new(cfg.epochs.max(1));
        let mut early = EarlyStopping::new(cfg.patience, cfg.min_delta);
        let mut monitor = CheckpointMonitor::default();
        let mut stop = StopReason::EpochBudget;
        let mut epochs_run = 0;

        self.phase(run, phases, RunPhase::Fitting);
        for epoch in 1..=cfg.epochs {
            let mut loss_sum = 0.0;
            let mut correct = 0;
            let mut seen = 0;
            for _ in 0..cfg.steps_per_epoch {
                let draws = train_gen.next_batch();
                let batch: FaceBatch<B> = self.batcher.batch(train.items(&draws), &self.device);
                let logits = model.forward(batch.images.clone());
                let loss = batch_loss(run.encoding, logits.clone(), &batch, &weights);

                loss_sum += loss.clone().into_scalar().elem::<f64>();
                correct += count_correct(logits, batch.targets.clone());
                seen += draws.len();

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(cfg.learning_rate, model, grads);
            }
            let train_loss = loss_sum / cfg.steps_per_epoch as f64;
            let train_accuracy = correct as f64 / seen.max(1) as f64;

            let (val_loss, val_accuracy) = self.score(
                &model.clone().valid(),
                run.encoding,
                validation,
                &mut val_gen,
                cfg.validation_steps,
                &weights,
            );

            let monitored = match cfg.monitor {
                Monitor::TrainingAccuracy => train_accuracy,
                Monitor::ValidationAccuracy => val_accuracy,
            };
            let checkpointed = monitor.improved(monitored);
            if checkpointed {
                self.save_checkpoint(run, &model)?;
            }

            info!(
                "[{run}] epoch {epoch}/{}: loss {train_loss:.4} acc {:.2}% | val loss {val_loss:.4} val acc {:.2}%{}",
                cfg.epochs,
                train_accuracy * 100.0,
                val_accuracy * 100.0,
                if checkpointed { " (saved)" } else { "" }
            );
            tracker.add(TrainingMetrics {
                epoch,
                train_loss,
                val_loss,
                train_accuracy,
                val_accuracy,
                checkpointed,
            });
            epochs_run = epoch;

            if early.update(train_loss) {
                info!("[{run}] early stop after epoch {epoch}: training loss stalled");
                stop = StopReason::Patience;
                break;
            }
        }

        info!(
            "[{run}] best {:?}: {:.4}",
            cfg.monitor,
            monitor.best().unwrap_or(f64::NAN)
        );
        Ok(FitOutcome {
            tracker,
            epochs_run,
            stop,
        })
    }

    /// Mean loss and accuracy over `steps` generator batches.
    fn score(
        &self,
        model: &EmotionCnn<B::InnerBackend>,
        encoding: LabelEncoding,
        source: &FaceSource<'_>,
        generator: &mut FaceGenerator,
        steps: usize,
        weights: &[f32],
    ) -> (f64, f64) {
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut seen = 0;
        for _ in 0..steps {
            let draws: Vec<Draw> = generator.next_batch();
            let batch: FaceBatch<B::InnerBackend> =
                self.batcher.batch(source.items(&draws), &self.device);
            let logits = model.forward(batch.images.clone());
            loss_sum += batch_loss(encoding, logits.clone(), &batch, weights)
                .into_scalar()
                .elem::<f64>();
            correct += count_correct(logits, batch.targets);
            seen += draws.len();
        }
        (loss_sum / steps.max(1) as f64, correct as f64 / seen.max(1) as f64)
    }

    pub fn save_checkpoint(&self, run: NeuralRun, model: &EmotionCnn<B>) -> Result<()> {
        let path = self.checkpoint_path(run);
        model
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .map_err(|e| FerError::Recorder(format!("{e:?}")))?;
        self.config.save(path.with_extension("json"))?;
        debug!("Checkpoint written to {}", path.display());
        Ok(())
    }

    /// Weights of the best checkpointed epoch; never falls back to the
    /// in-memory model.
    pub fn load_checkpoint(&self, run: NeuralRun) -> Result<EmotionCnn<B::InnerBackend>> {
        let path = self.checkpoint_path(run);
        let file = path.with_extension("mpk");
        if !file.is_file() {
            return Err(FerError::MissingCheckpoint { path: file });
        }
        let model: EmotionCnn<B::InnerBackend> =
            EmotionCnnConfig::new(self.num_classes).init(&self.device);
        model
            .load_file(path, &CompactRecorder::new(), &self.device)
            .map_err(|e| FerError::Recorder(format!("{e:?}")))
    }

    /// Reloads the checkpoint, scores `eval_steps` validation batches,
    /// predicts every row of `test` and writes the confusion-matrix report.
    pub fn finish(
        &self,
        run: NeuralRun,
        test: &FaceSource<'_>,
        reporter: &mut Reporter,
        phases: &mut Vec<RunPhase>,
    ) -> Result<RunOutcome> {
        let model = self.load_checkpoint(run)?;
        self.phase(run, phases, RunPhase::BestModelReloaded);

        let weights = run.class_weights().to_vec(self.num_classes);
        let mut eval_gen = FaceGenerator::new(test.len(), self.config.batch_size, self.config.seed, false)?;
        let (eval_loss, eval_accuracy) = self.score(
            &model,
            run.encoding,
            test,
            &mut eval_gen,
            self.config.eval_steps,
            &weights,
        );
        info!(
            "[{run}] evaluation over {} steps: loss {eval_loss:.4}, accuracy {:.2}%",
            self.config.eval_steps,
            eval_accuracy * 100.0
        );

        let predictions = self.predict(&model, test)?;
        self.phase(run, phases, RunPhase::Evaluated);

        let metrics = reporter.confusion_report(&run.report_name(), &test.label_indices(), &predictions)?;
        self.phase(run, phases, RunPhase::Reported);

        Ok(RunOutcome {
            run,
            epochs_run: 0,
            stop: StopReason::EpochBudget,
            best_epoch: None,
            eval_loss,
            eval_accuracy,
            predictions,
            metrics,
            phases: phases.clone(),
        })
    }

    /// Hard labels for every row of `source`, in order.
    pub fn predict(&self, model: &EmotionCnn<B::InnerBackend>, source: &FaceSource<'_>) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(source.len());
        for (start, end) in sequential_batches(source.len(), self.config.batch_size) {
            let draws: Vec<Draw> = (start..end).map(|index| Draw { index, flip: false }).collect();
            let batch: FaceBatch<B::InnerBackend> = self.batcher.batch(source.items(&draws), &self.device);
            out.extend(predicted_labels(model.forward(batch.images))?);
        }
        Ok(out)
    }
}
