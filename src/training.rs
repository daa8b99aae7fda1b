use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::AutodiffModule,
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{AdamWConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::{
    augment::{AugmentationConfig, AugmentationPipeline},
    checkpoint::CheckpointController,
    data::{ImageBatch, ImageBatcher, ImageItem, ImageStore, Partition, SampleIndex, TensorItem},
    error::{self, PipelineError},
    export::{ExportArtifacts, Exporter},
    model::{ImageClassifier, TransferModel, TransferModelConfig},
    optim::{self, OptimizationPolicy, PlateauConfig},
};

pub const CONFIG_FILE: &str = "config.json";
pub const CHECKPOINT: &str = "checkpoint";

#[derive(Config)]
pub struct TrainingConfig {
    /// Root holding one subdirectory per class.
    pub dataset_dir: String,

    pub artifact_dir: String,

    pub model: TransferModelConfig,

    pub optimizer: AdamWConfig,

    pub augmentation: AugmentationConfig,

    pub plateau: PlateauConfig,

    #[config(default = 100)]
    pub epoch_count: usize,

    #[config(default = 16)]
    pub batch_size: usize,

    #[config(default = 1.0e-4)]
    pub learning_rate: f64,

    #[config(default = 15)]
    pub early_stopping_patience: usize,

    #[config(default = 0.8)]
    pub train_fraction: f64,

    #[config(default = 42)]
    pub seed: u64,

    /// Prefer a GPU when one is available.
    #[config(default = true)]
    pub accelerate: bool,
}

impl TrainingConfig {
    pub fn validate(&self) -> error::Result<()> {
        let invalid = |message: &str| Err(PipelineError::Config(message.to_owned()));

        if self.epoch_count == 0 {
            return invalid("epoch_count must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return invalid("train_fraction must lie strictly between 0 and 1");
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive");
        }

        self.augmentation.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    EarlyStopped,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseMetrics {
    /// Sample-weighted mean loss.
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: PhaseMetrics,
    pub valid: PhaseMetrics,
    pub learning_rate: f64,
}

#[derive(Debug, Default)]
struct PhaseTotals {
    loss: f64,
    correct: usize,
    samples: usize,
}

impl PhaseTotals {
    fn record<B: Backend>(
        &mut self,
        loss: f64,
        logits: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) {
        let [batch, _] = logits.dims();
        let correct: i64 = logits
            .argmax(1)
            .squeeze::<1>(1)
            .equal(targets)
            .int()
            .sum()
            .into_scalar()
            .elem();

        self.loss += loss * batch as f64;
        self.correct += correct as usize;
        self.samples += batch;
    }

    fn metrics(&self) -> PhaseMetrics {
        if self.samples == 0 {
            return PhaseMetrics {
                loss: 0.0,
                accuracy: 0.0,
                samples: 0,
            };
        }

        PhaseMetrics {
            loss: self.loss / self.samples as f64,
            accuracy: self.correct as f64 / self.samples as f64,
            samples: self.samples,
        }
    }
}

pub struct TrainingOutcome<M> {
    pub model: M,
    pub state: LoopState,
    pub history: Vec<EpochMetrics>,
    pub best_valid_loss: Option<f64>,
}

/// Epoch loop over a fixed train/validation partition.
pub struct Learner<B, M, O>
where
    B: AutodiffBackend,
{
    model: M,
    policy: OptimizationPolicy<O>,
    checkpoint: CheckpointController,
    train_loss: CrossEntropyLoss<B>,
    valid_loss: CrossEntropyLoss<B::InnerBackend>,
    train_batcher: ImageBatcher<B>,
    valid_batcher: ImageBatcher<B::InnerBackend>,
    train_pipeline: AugmentationPipeline,
    valid_pipeline: AugmentationPipeline,
    batch_size: usize,
    epoch_count: usize,
    seed: u64,
    completed: usize,
    state: LoopState,
    history: Vec<EpochMetrics>,
}

impl<B, M, O> Learner<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(
        model: M,
        policy: OptimizationPolicy<O>,
        checkpoint: CheckpointController,
        config: &TrainingConfig,
        device: &B::Device,
    ) -> Self {
        Self {
            model,
            policy,
            checkpoint,
            train_loss: CrossEntropyLossConfig::new().init(device),
            valid_loss: CrossEntropyLossConfig::new().init(device),
            train_batcher: ImageBatcher::new(device.clone()),
            valid_batcher: ImageBatcher::new(device.clone()),
            train_pipeline: AugmentationPipeline::train(config.augmentation.clone()),
            valid_pipeline: AugmentationPipeline::eval(config.augmentation.clone()),
            batch_size: config.batch_size,
            epoch_count: config.epoch_count,
            seed: config.seed,
            completed: 0,
            state: LoopState::Running,
            history: Vec::new(),
        }
    }

    pub fn fit<D: Dataset<ImageItem>>(
        mut self,
        dataset: &D,
        partition: &Partition,
    ) -> error::Result<TrainingOutcome<M>> {
        while self.state == LoopState::Running {
            let train = self.train_epoch(dataset, &partition.train)?;
            let valid = self.valid_epoch(dataset, &partition.valid)?;
            self.conclude_epoch(train, valid)?;
        }

        Ok(TrainingOutcome {
            model: self.model,
            state: self.state,
            history: self.history,
            best_valid_loss: self.checkpoint.best_loss(),
        })
    }

    /// One pass over `indices` in an order reshuffled for every epoch.
    pub fn train_epoch<D: Dataset<ImageItem>>(
        &mut self,
        dataset: &D,
        indices: &[usize],
    ) -> error::Result<PhaseMetrics> {
        let epoch = self.completed + 1;
        let mut order = indices.to_vec();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(
            self.seed.wrapping_add(epoch as u64),
        ));

        let progress = progress_bar(order.len() as u64, epoch, self.epoch_count);
        let mut totals = PhaseTotals::default();

        for chunk in order.chunks(self.batch_size) {
            let items = prepare(&mut self.train_pipeline, dataset, chunk)?;
            let batch: ImageBatch<B> = self.train_batcher.batch(items);

            let logits = self.model.forward(batch.images);
            let loss = self
                .train_loss
                .forward(logits.clone(), batch.targets.clone());
            let value: f64 = loss.clone().into_scalar().elem();
            if !value.is_finite() {
                progress.abandon();
                return Err(PipelineError::NonFiniteLoss {
                    epoch,
                    phase: "train",
                    loss: value,
                });
            }
            totals.record(value, logits.detach(), batch.targets);

            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self.policy.step::<B, M>(self.model.clone(), grads);

            progress.inc(chunk.len() as u64);
            progress.set_message(format!("loss {value:.4}"));
        }
        progress.finish_and_clear();

        Ok(totals.metrics())
    }

    /// Scores `indices` in partition order with gradients disabled.
    pub fn valid_epoch<D: Dataset<ImageItem>>(
        &mut self,
        dataset: &D,
        indices: &[usize],
    ) -> error::Result<PhaseMetrics> {
        let epoch = self.completed + 1;
        let model = self.model.valid();
        let mut totals = PhaseTotals::default();

        for chunk in indices.chunks(self.batch_size) {
            let items = prepare(&mut self.valid_pipeline, dataset, chunk)?;
            let batch: ImageBatch<B::InnerBackend> = self.valid_batcher.batch(items);

            let logits = model.forward(batch.images);
            let loss = self
                .valid_loss
                .forward(logits.clone(), batch.targets.clone());
            let value: f64 = loss.into_scalar().elem();
            totals.record(value, logits, batch.targets);
        }

        let metrics = totals.metrics();
        if !metrics.loss.is_finite() {
            return Err(PipelineError::NonFiniteLoss {
                epoch,
                phase: "valid",
                loss: metrics.loss,
            });
        }

        Ok(metrics)
    }

    /// Records the epoch, then lets the scheduler and the checkpoint
    /// controller observe the validation loss, in that order.
    pub fn conclude_epoch(
        &mut self,
        train: PhaseMetrics,
        valid: PhaseMetrics,
    ) -> error::Result<LoopState> {
        self.completed += 1;
        let metrics = EpochMetrics {
            epoch: self.completed,
            train,
            valid,
            learning_rate: self.policy.learning_rate(),
        };
        info!(
            "Epoch {}/{} | Train Loss: {:.4} | Train Acc: {:.4} | Val Loss: {:.4} | Val Acc: {:.4} | LR: {:.2e}",
            metrics.epoch,
            self.epoch_count,
            train.loss,
            train.accuracy,
            valid.loss,
            valid.accuracy,
            metrics.learning_rate
        );
        self.history.push(metrics);

        if let Some(learning_rate) = self.policy.observe(valid.loss) {
            info!("Reducing learning rate to {learning_rate:.2e}");
        }

        self.checkpoint
            .observe::<B::InnerBackend, _>(valid.loss, &self.model.valid())?;

        self.state = if self.checkpoint.should_stop() {
            info!("Early stopping triggered after {} epochs", self.completed);
            LoopState::EarlyStopped
        } else if self.completed >= self.epoch_count {
            LoopState::Exhausted
        } else {
            LoopState::Running
        };

        Ok(self.state)
    }
}

fn prepare<D: Dataset<ImageItem>>(
    pipeline: &mut AugmentationPipeline,
    dataset: &D,
    indices: &[usize],
) -> error::Result<Vec<TensorItem>> {
    indices
        .iter()
        .map(|&index| {
            let item = dataset.get(index).ok_or_else(|| {
                PipelineError::Data(format!("sample {index} is out of range"))
            })?;

            Ok(TensorItem {
                pixels: pipeline.apply(&item.image),
                label: item.label,
            })
        })
        .collect()
}

fn progress_bar(len: u64, epoch: usize, epoch_count: usize) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{prefix} [{bar:30.cyan/blue}] {pos}/{len} {msg} ({elapsed})",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_prefix(format!("Epoch {epoch}/{epoch_count}"));

    bar
}

#[derive(Debug)]
pub struct TrainingSummary {
    pub state: LoopState,
    pub epochs: usize,
    pub best_valid_loss: Option<f64>,
    pub class_names: Vec<String>,
    pub artifacts: ExportArtifacts,
}

pub fn checkpoint_path(artifact_dir: &Path) -> PathBuf {
    artifact_dir.join(CHECKPOINT)
}

/// Full run: index, split, fine-tune, then export the best checkpoint.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> error::Result<TrainingSummary> {
    config.validate()?;

    let artifact_dir = Path::new(&config.artifact_dir);
    fs::create_dir_all(artifact_dir)?;
    config.save(artifact_dir.join(CONFIG_FILE))?;

    B::seed(config.seed);

    let index = SampleIndex::scan(Path::new(&config.dataset_dir))?;
    let partition = Partition::draw(index.len(), config.train_fraction, config.seed);
    if partition.train.is_empty() || partition.valid.is_empty() {
        return Err(PipelineError::Data(format!(
            "{} images cannot be split into non-empty training and validation sets",
            index.len()
        )));
    }
    info!(
        "Training samples: {}, validation samples: {}",
        partition.train.len(),
        partition.valid.len()
    );

    let store = ImageStore::load(&index, 2 * config.augmentation.image_size as u32)?;

    let model = config.model.init_pretrained::<B>(device)?;
    let plan = config.model.freeze_plan(model.backbone().block_count());
    let (frozen, trainable) = model.parameter_split(&plan);
    info!(
        frozen,
        trainable,
        groups = ?plan.trainable_groups(),
        "fine-tuning trainable layer groups"
    );

    let policy = optim::adamw::<B, TransferModel<B>>(
        &config.optimizer,
        &config.plateau,
        config.learning_rate,
    );
    let checkpoint = CheckpointController::new(
        checkpoint_path(artifact_dir),
        config.early_stopping_patience,
    );

    let outcome = Learner::new(model, policy, checkpoint, config, device).fit(&store, &partition)?;
    if outcome.state == LoopState::Exhausted {
        warn!(
            "Reached the epoch cap of {} without early stopping",
            config.epoch_count
        );
    }

    let exporter = Exporter::new(
        artifact_dir,
        &config.augmentation,
        index.class_names.clone(),
    );
    let (_, artifacts) = exporter.export::<B::InnerBackend, _>(
        config.model.init::<B::InnerBackend>(device),
        &checkpoint_path(artifact_dir),
        device,
    )?;

    Ok(TrainingSummary {
        state: outcome.state,
        epochs: outcome.history.len(),
        best_valid_loss: outcome.best_valid_loss,
        class_names: index.class_names,
        artifacts,
    })
}
